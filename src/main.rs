//! gatewatch - operator CLI for an agent gateway
//!
//! This is the binary entry point. Connection logic lives in `gatewatch-client`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use gatewatch_client::{
    ClientConfig, ConnectionState, DeviceIdentity, GatewayClient, HANDSHAKE_TIMEOUT,
};
use gatewatch_core::logging::LogConfig;
use serde_json::Value;

/// gatewatch - talk to and supervise an agent gateway
#[derive(Parser, Debug)]
#[command(name = "gatewatch")]
#[command(about = "RPC client and connection supervisor for an agent gateway", long_about = None)]
struct Args {
    /// Client config file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Gateway host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Gateway port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Bearer token (overrides the config file and auto-discovery)
    #[arg(long)]
    token: Option<String>,

    /// Mirror log output to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Directory for log files
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, issue one request and print its payload
    Call {
        /// RPC method, e.g. `health` or `sessions.list`
        method: String,

        /// Request params as a JSON object
        #[arg(value_name = "PARAMS_JSON")]
        params: Option<String>,

        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print pushed events and connection changes until Ctrl-C
    Watch {
        /// Enable the health monitor and print restart notices
        #[arg(long)]
        health: bool,

        /// Shell command run when the gateway fails its health checks
        #[arg(long, value_name = "CMD", requires = "health")]
        restart_command: Option<String>,
    },

    /// Load or create the device identity and print it
    Identity {
        /// Identity file (defaults to the state directory)
        #[arg(long, value_name = "PATH")]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    gatewatch_core::logging::init(&LogConfig {
        directory: args.log_dir.clone(),
        stderr: args.verbose,
    })?;

    let config = load_config(&args)?;

    match args.command {
        Command::Call {
            method,
            params,
            timeout_ms,
        } => run_call(config, &method, params.as_deref(), timeout_ms).await,
        Command::Watch {
            health,
            restart_command,
        } => run_watch(config, health, restart_command).await,
        Command::Identity { path } => run_identity(path.unwrap_or_else(|| config.identity_path())),
    }
}

/// Config file (explicit or default location) with command-line overrides.
fn load_config(args: &Args) -> Result<ClientConfig> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = ClientConfig::load(&path)
        .wrap_err_with(|| format!("loading config from {}", path.display()))?;

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(token) = &args.token {
        config.token = Some(token.clone());
    }
    Ok(config)
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gatewatch")
        .join("config.toml")
}

/// Start the client and wait until it authenticates.
async fn connect(config: ClientConfig) -> Result<GatewayClient> {
    let url = config.ws_url();
    let client = GatewayClient::new(config)?;
    let mut states = client.subscribe_state();
    client.start();

    let wait = tokio::time::timeout(
        HANDSHAKE_TIMEOUT + Duration::from_secs(5),
        states.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await;
    match wait {
        Ok(Ok(_)) => Ok(client),
        _ => {
            client.stop().await;
            Err(eyre!("could not connect to gateway at {url}"))
        }
    }
}

async fn run_call(
    config: ClientConfig,
    method: &str,
    params: Option<&str>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let params: Value = match params {
        Some(raw) => serde_json::from_str(raw).wrap_err("params must be valid JSON")?,
        None => Value::Object(Default::default()),
    };

    let client = connect(config).await?;
    let result = match timeout_ms {
        Some(ms) => {
            client
                .request_with_timeout(method, params, Duration::from_millis(ms))
                .await
        }
        None => client.request(method, params).await,
    };
    client.stop().await;

    let payload = result?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn run_watch(
    config: ClientConfig,
    health: bool,
    restart_command: Option<String>,
) -> Result<()> {
    let client = GatewayClient::new(config)?;
    client.set_event_handler(|event| match serde_json::to_string(&event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!("Failed to encode event {}: {}", event.event, e),
    });

    if health {
        if let Some(command) = restart_command {
            client.set_restart_callback(move || run_restart_command(command.clone()));
        }
        client.set_notify_callback(|notice| eprintln!("[health] {notice}"));
        client.set_health_check_enabled(true);
    }

    let mut states = client.subscribe_state();
    client.start();
    eprintln!("[state] {}", *states.borrow());

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                eprintln!("[state] {state}");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.stop().await;
    Ok(())
}

async fn run_restart_command(command: String) -> gatewatch_core::Result<()> {
    tracing::info!("Running restart command: {}", command);
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(gatewatch_core::Error::restart(format!(
            "`{command}` exited with {status}"
        )))
    }
}

fn run_identity(path: PathBuf) -> Result<()> {
    let identity = DeviceIdentity::load_or_create(&path)
        .wrap_err_with(|| format!("loading identity from {}", path.display()))?;

    println!("path:       {}", path.display());
    println!("device id:  {}", identity.device_id());
    println!("public key: {}", identity.public_key_base64url());
    println!("created at: {}", identity.created_at_ms());
    print!("{}", identity.public_key_pem()?);
    Ok(())
}
