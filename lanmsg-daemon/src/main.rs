// LanMsg: discover peers on the LAN and exchange one-shot messages.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lanmsg_core::TransferEnvelope;
use lanmsg_daemon::{config, Communicator, SendOutcome};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lanmsg", version, about = "LAN peer discovery and one-shot messaging")]
struct Cli {
    /// Config file (default: $LANMSG_CONFIG, ~/.config/lanmsg/config.toml, /etc/lanmsg/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Host listener port.
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every incoming message until Ctrl+C.
    Listen,
    /// Send one message to every discovered peer.
    Send {
        #[arg(long, default_value_t = 200)]
        code: i32,
        #[arg(long)]
        payload: Option<String>,
        /// How long to wait for the first peer.
        #[arg(long, default_value_t = 5000)]
        wait_ms: u64,
    },
    /// List discovered peers.
    Peers {
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(port) = cli.port {
        cfg.host_port = port;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let comm = Communicator::from_config(cfg);
        comm.start().await.context("starting communicator")?;
        let res = run(&comm, cli.command).await;
        comm.stop().await;
        res
    })
}

async fn run(comm: &Communicator, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Listen => {
            let mut incoming = comm
                .incoming()
                .context("incoming stream already taken")?;
            if let Some(addr) = comm.local_addr() {
                println!("listening on {addr}");
            }
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    res = &mut shutdown => return res,
                    env = incoming.recv() => match env {
                        Some(env) => print_envelope(&env),
                        None => return Ok(()),
                    },
                }
            }
        }
        Command::Send {
            code,
            payload,
            wait_ms,
        } => {
            wait_for_peers(comm, wait_ms).await;
            match comm.send_to_all(code, payload).await {
                SendOutcome::NotStarted => anyhow::bail!("communicator not started"),
                SendOutcome::NoPeers => println!("no peers found"),
                SendOutcome::Sent { delivered, failed } => {
                    for peer in &delivered {
                        println!("{peer}: delivered");
                    }
                    for e in &failed {
                        println!("{}: failed ({})", e.peer, e.reason);
                    }
                }
            }
            Ok(())
        }
        Command::Peers { wait_ms } => {
            wait_for_peers(comm, wait_ms).await;
            for peer in comm.peers() {
                let state = if peer.connected { "connected" } else { "seen" };
                println!("{}\t{}\t{state}", peer.identity, peer.addr());
            }
            Ok(())
        }
    }
}

async fn wait_for_peers(comm: &Communicator, wait_ms: u64) {
    let _ = tokio::time::timeout(Duration::from_millis(wait_ms), comm.wait_for_peers()).await;
}

fn print_envelope(env: &TransferEnvelope) {
    match &env.error {
        Some(err) => println!("[{}] error: {err}", env.code),
        None => println!("[{}] {}", env.code, env.payload.as_deref().unwrap_or("")),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
