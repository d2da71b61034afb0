//! Binary entrypoint for the zbgateway CLI.
//!
//! Commands:
//! - `start [--port <path>]` - open the coordinator port and run the gateway until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `encode --id <id> [--key <key>] <verb>` - print the framed wire line for a command
//! - `decode <line>` - verify and decode a wire line, printing it as JSON
//!
//! See the library crate docs for module-level details: `zbgateway::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::info;

use zbgateway::config::Config;
use zbgateway::gateway::{frame, Command};
use zbgateway::validation::{validate_device_id, validate_secret_key, validate_verb};

#[derive(Parser)]
#[command(name = "zbgateway")]
#[command(about = "Serial gateway for wireless end-devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Start {
        /// Coordinator serial port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Frame a command for the wire
    Encode {
        /// Target device id
        #[arg(long)]
        id: String,
        /// Secret key (defaults to the configured key)
        #[arg(long)]
        key: Option<String>,
        /// Command verb, e.g. CHECK or led_status:1
        verb: String,
    },
    /// Verify and decode a wire line
    Decode {
        line: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { port } => {
            let config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            start(config, port).await?;
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Wrote default configuration to {}", cli.config);
        }
        Commands::Encode { id, key, verb } => {
            validate_device_id(&id)?;
            validate_verb(&verb)?;
            let default_key = pre_config
                .as_ref()
                .map(|c| c.gateway.default_secret_key.clone())
                .unwrap_or_else(|| frame::DEFAULT_SECRET_KEY.to_string());
            let mut command = Command::new(id, verb);
            if let Some(key) = key {
                validate_secret_key(&key)?;
                command = command.with_key(key);
            }
            print!("{}", command.encode(&default_key));
        }
        Commands::Decode { line } => match frame::decode(&line) {
            Ok(decoded) => println!("{}", serde_json::to_string_pretty(&decoded)?),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

#[cfg(feature = "serial")]
async fn start(config: Config, port: Option<String>) -> Result<()> {
    use std::sync::Arc;
    use tokio::sync::watch;
    use zbgateway::gateway::{Gateway, SerialTransport};
    use zbgateway::telemetry::{forward_metrics, LogUplink, Outbox, Uplink, DEVICES_TOPIC};

    info!("Starting zbgateway v{}", env!("CARGO_PKG_VERSION"));
    let port = port.unwrap_or_else(|| config.serial.port.clone());
    let link = SerialTransport::open(&port, config.serial.baud_rate).await?;
    info!("Connected to coordinator on {}", port);

    let mut gateway = Gateway::new(link, &config.gateway);
    let outbox = Arc::new(Outbox::new(config.uplink.metric_queue_capacity));
    {
        let outbox = Arc::clone(&outbox);
        gateway.on_device_data(move |id, payload| {
            outbox.collect(id, payload);
        });
    }
    {
        let outbox = Arc::clone(&outbox);
        gateway.on_registry_changed(move || outbox.mark_attributes_dirty());
    }
    {
        let outbox = Arc::clone(&outbox);
        gateway.on_pending_changed(move || outbox.mark_attributes_dirty());
    }
    gateway.on_command_finished(|outcome| {
        info!(
            "Command '{}' to {}: {:?} after {} attempt(s)",
            outcome.command.verb, outcome.command.target, outcome.status, outcome.attempts
        );
    });

    let handle = gateway.handle();
    let mut uplink = LogUplink::new();
    uplink.subscribe(DEVICES_TOPIC)?;
    if config.gateway.discover_on_start {
        // outcome is reported through on_command_finished
        let _ = handle.broadcast_discovery();
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let gateway_task = {
        let stop_rx = stop_rx.clone();
        tokio::spawn(async move { gateway.run(stop_rx).await })
    };
    let forward_task = tokio::spawn(forward_metrics(
        outbox,
        handle.clone(),
        uplink,
        config.uplink.flush_interval(),
        stop_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = stop_tx.send(true);
    gateway_task
        .await
        .map_err(|e| anyhow!("gateway task failed: {}", e))?;
    forward_task
        .await
        .map_err(|e| anyhow!("telemetry task failed: {}", e))?;

    info!("Link statistics: {}", serde_json::to_string(&handle.metrics())?);
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn start(_config: Config, _port: Option<String>) -> Result<()> {
    Err(anyhow!(
        "zbgateway was built without the `serial` feature; rebuild with it enabled to run the gateway"
    ))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    match log_file {
        Some(f) => {
            let file = std::sync::Mutex::new(f);
            // Foreground runs also echo to the console
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
