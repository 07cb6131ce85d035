use clap::Parser;
use tracing::{error, info, warn};
use ttyrelay_core::config::RelayConfig;
use ttyrelay_gateway::{shell, SessionEvent, SessionRegistry};

#[derive(Debug, Parser)]
#[command(name = "ttyrelay", version, about = "Relay PTY shells to local display clients")]
struct Cli {
    /// Config file (default: ~/.ttyrelay/ttyrelay.toml)
    #[arg(long, env = "TTYRELAY_CONFIG")]
    config: Option<String>,

    /// Primary session port; secondaries start two above it.
    #[arg(long)]
    port: Option<u16>,

    /// Number of secondary session slots.
    #[arg(long)]
    slots: Option<u16>,

    /// Start this many secondary sessions next to the primary.
    #[arg(long, default_value_t = 0)]
    secondaries: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ttyrelay_gateway=info,ttyrelay_terminal=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > TTYRELAY_CONFIG > ~/.ttyrelay/ttyrelay.toml
    let mut config = RelayConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "config not loaded, falling back to defaults");
        RelayConfig::default()
    });
    if let Some(port) = cli.port {
        config.bridge.base_port = port;
    }
    if let Some(slots) = cli.slots {
        config.bridge.secondary_slots = slots;
    }

    let (registry, mut events) = SessionRegistry::new(&config)?;

    // No primary terminal means nothing to display: fatal.
    let primary_shell = shell::shell_config(&config.shell, None)?;
    let primary = registry.spawn_primary(primary_shell).await.map_err(|e| {
        error!(port = registry.primary_port(), error = %e, "primary session failed to start");
        e
    })?;
    info!(
        port = primary.port(),
        pid = ?primary.pid(),
        bind = %config.bridge.bind,
        "Terminal relay ready"
    );

    for _ in 0..cli.secondaries {
        let cwd = registry.primary_cwd().await;
        let shell = shell::shell_config(&config.shell, cwd.as_deref())?;
        match registry.spawn_secondary(shell).await {
            Ok(port) => info!(port, "secondary session ready"),
            Err(e) => {
                warn!(code = e.code(), error = %e, "secondary session not started");
                break;
            }
        }
    }

    let primary_port = registry.primary_port();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(ev) = event else { break };
                match &ev.event {
                    SessionEvent::Opened { pid } => info!(port = ev.port, ?pid, "client opened"),
                    SessionEvent::Resized { cols, rows } => info!(port = ev.port, cols, rows, "resized"),
                    SessionEvent::Disconnected { code, reason } => {
                        info!(port = ev.port, ?code, %reason, "client disconnected")
                    }
                    SessionEvent::Closed { exit_code, signal } => {
                        info!(port = ev.port, exit_code, ?signal, "session closed");
                        if ev.port == primary_port {
                            info!("primary shell exited, shutting down");
                            break;
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }

    registry.close_all().await;
    Ok(())
}
