//! Runtime configuration for the control server (SPEC_FULL.md §9
//! "Configuration").
//!
//! Settings loading from a file or environment beyond CLI flags is the
//! external, out-of-scope "settings loading" collaborator named in
//! spec.md §1; `ServerConfig` is exactly the typed value that collaborator
//! would hand the core, mirroring the teacher's `NetConfig` runtime struct.

use crate::cipher::SKEW_WINDOW_SECS;

/// Runtime-held configuration for one control server instance. Pipe
/// capacity is not duplicated here: it's a wire-level constant
/// (`connections::PIPE_CAPACITY`), not an operator-tunable knob.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub skew_window_secs: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 4444,
            skew_window_secs: SKEW_WINDOW_SECS,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}
