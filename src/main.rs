use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use clawgate::config::{default_state_dir, BindMode, Config};
use clawgate::gateway::{Gateway, GatewayConfig};
use clawgate::logging::{init_logging, LogConfig};
use clawgate::pairing;

#[derive(Parser)]
#[command(name = "clawgate", version, about = "Gateway for paired node devices")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server.
    Start(StartArgs),
}

#[derive(Parser)]
struct StartArgs {
    /// WebSocket server port.
    #[arg(long, env = "CLAWGATE_PORT", default_value_t = 18789)]
    port: u16,
    /// Bind mode: loopback or lan.
    #[arg(long, env = "CLAWGATE_BIND", default_value = "loopback")]
    bind: String,
    /// Auth token for node connections.
    #[arg(long, env = "CLAWGATE_TOKEN")]
    token: Option<String>,
    /// State directory for pairing data and logs.
    #[arg(long, env = "CLAWGATE_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match Cli::parse().command {
        Some(Command::Start(args)) => args,
        // No subcommand launches the server with flag defaults + env.
        None => StartArgs::parse_from(["clawgate"]),
    };
    run_server(args).await
}

async fn run_server(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config {
        port: args.port,
        bind: args.bind.parse::<BindMode>()?,
        auth_token: args.token,
        state_dir: args.state_dir.unwrap_or_else(default_state_dir),
        tick_interval: Duration::from_secs(15),
    };
    config.validate()?;

    init_logging(LogConfig::default())?;

    let store = Arc::new(pairing::Store::new(config.state_dir.join("pairing"))?);
    let pairing_svc = Arc::new(pairing::Service::new(store));

    let gateway = Gateway::new(GatewayConfig {
        port: config.port,
        bind: config.bind,
        auth_token: config.auth_token.clone(),
        tick_interval: config.tick_interval,
        pairing: Some(pairing_svc),
    });

    let ctx = CancellationToken::new();
    tokio::spawn({
        let gateway = gateway.clone();
        let ctx = ctx.clone();
        async move {
            if let Err(err) = shutdown_signal().await {
                error!(target: "gateway", error = %err, "signal handler failed");
                return;
            }
            info!(target: "gateway", "shutting down");
            gateway.shutdown().await;
            ctx.cancel();
        }
    });

    print_banner(&config);
    gateway.run(ctx).await?;
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn print_banner(config: &Config) {
    let bind_addr = match config.bind {
        BindMode::Loopback => "127.0.0.1",
        BindMode::Lan => "0.0.0.0",
    };
    let auth_mode = if config.auth_token.as_deref().unwrap_or_default().is_empty() {
        "none"
    } else {
        "token"
    };
    info!(
        target: "gateway",
        version = env!("CARGO_PKG_VERSION"),
        url = %format!("ws://{bind_addr}:{}/ws", config.port),
        health = %format!("http://{bind_addr}:{}/health", config.port),
        auth = auth_mode,
        bind = %config.bind,
        state_dir = %config.state_dir.display(),
        "clawgate listening"
    );
}
