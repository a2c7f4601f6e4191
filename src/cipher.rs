//! Handshake tag computation and the per-connection RC4 framing cipher
//! (spec.md §4.1, §8 P1-P3).
//!
//! The handshake tag is the only structured field on the wire: an 8-byte
//! big-endian CRC-64/ECMA-182 over `secret || u64be(t)`. Once a tag is
//! accepted it doubles as key material, perturbing the agent's raw secret
//! into a per-connection RC4 key. There is no framing after that: the
//! socket carries one RC4 keystream per direction for the life of the
//! connection.

use crate::model::AgentId;
use chrono::Utc;
use crc::{Crc, CRC_64_ECMA_182};
use std::collections::HashMap;
use thiserror::Error;

/// Symmetric clock-skew tolerance for handshake timestamps (spec.md §4.1, §8).
pub const SKEW_WINDOW_SECS: i64 = 30;

const TAG_SIZE: usize = 8;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// The 8-byte handshake tag, also usable as key-mangling material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTag(pub [u8; TAG_SIZE]);

impl HandshakeTag {
    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }
}

/// Compute the handshake tag for `secret` at unix time `t`.
///
/// `t` may be negative in principle (pre-1970); CRC input only cares about
/// the bit pattern of the big-endian 64-bit encoding, so callers are free
/// to pass any `i64`.
pub fn compute_tag(secret: &[u8], t: i64) -> HandshakeTag {
    let mut digest = CRC64.digest();
    digest.update(secret);
    digest.update(&(t as u64).to_be_bytes());
    HandshakeTag(digest.finalize().to_be_bytes())
}

/// Derive the per-connection RC4 key by XORing `secret` against `tag`,
/// cycled over the tag's 8 bytes (spec.md §4.1 "Key mangling").
pub fn mangle_key(secret: &[u8], tag: &HandshakeTag) -> Vec<u8> {
    secret
        .iter()
        .enumerate()
        .map(|(i, &b)| b ^ tag.0[i % TAG_SIZE])
        .collect()
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Fewer than 8 bytes arrived before the peer went quiet or erred.
    #[error("short read during handshake")]
    ShortRead,
    /// No `(secret, t)` pair in the snapshot reproduces the observed tag
    /// within the skew window. Deliberately does not distinguish "unknown
    /// agent" from "clock skew" (spec.md §4.1 step 5).
    #[error("handshake tag does not match any known agent")]
    NoMatch,
}

/// Result of a successful handshake: the identified agent and the cipher
/// pair ready to decrypt/encrypt the rest of the connection.
pub struct Accepted {
    pub agent_id: AgentId,
    pub tag: HandshakeTag,
    pub cipher: FramingCipher,
}

/// Validate an 8-byte handshake tag against the keystore snapshot.
///
/// Iterates secrets outer, timestamps inner, across `[t0-W, t0+W]`, and
/// returns the first match (spec.md §4.1 step 3-4, §9 Open Questions: the
/// source's opportunistic first-match behavior is preserved deliberately).
pub fn accept(
    tag_bytes: &[u8],
    keys: &HashMap<AgentId, String>,
    window_secs: i64,
) -> Result<Accepted, HandshakeError> {
    if tag_bytes.len() != TAG_SIZE {
        return Err(HandshakeError::ShortRead);
    }
    let t0 = Utc::now().timestamp();
    for (agent_id, secret) in keys.iter() {
        let secret_bytes = secret.as_bytes();
        for t in (t0 - window_secs)..=(t0 + window_secs) {
            let candidate = compute_tag(secret_bytes, t);
            if candidate.0 == tag_bytes {
                let mangled = mangle_key(secret_bytes, &candidate);
                return Ok(Accepted {
                    agent_id: *agent_id,
                    tag: candidate,
                    cipher: FramingCipher::new(&mangled),
                });
            }
        }
    }
    Err(HandshakeError::NoMatch)
}

/// One direction of the post-handshake RC4 stream. Never reset, never
/// reseeded: each call consumes the next slice of the single keystream
/// for its direction (spec.md §4.1, §8 P3).
pub struct FramingCipher {
    decryptor: Rc4Stream,
    encryptor: Rc4Stream,
}

/// RC4 key-scheduling and keystream generation over a runtime-length key.
///
/// The `rc4` crate's cipher type is generic over a compile-time key size,
/// which can't express "secrets need not be length 32" (spec.md §3); this
/// is the same KSA/PRGA the reference deployment's `cryptography.hazmat`
/// `ARC4` runs, just without the fixed-size type parameter.
struct Rc4Stream {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4Stream {
    fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (idx, slot) in state.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j: u8 = 0;
        if !key.is_empty() {
            for i in 0..256usize {
                j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
                state.swap(i, j as usize);
            }
        }
        Rc4Stream { state, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state
                [(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize];
            *byte ^= k;
        }
    }
}

impl FramingCipher {
    /// Build a cipher pair from an already-mangled key. Both directions
    /// start from identical initial state and diverge only by what each
    /// side feeds through it (spec.md §4.1).
    pub fn new(mangled_key: &[u8]) -> Self {
        FramingCipher {
            decryptor: Rc4Stream::new(mangled_key),
            encryptor: Rc4Stream::new(mangled_key),
        }
    }

    /// Decrypt `data` in place, consuming the next slice of the inbound
    /// keystream.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.decryptor.apply(data);
    }

    /// Encrypt `data` in place, consuming the next slice of the outbound
    /// keystream.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.encryptor.apply(data);
    }
}
