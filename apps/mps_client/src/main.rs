use std::env;
use std::path::Path;

use clap::{Parser, Subcommand};
use tokio::task::LocalSet;
use tracing::{debug, error, info};

use mps_log::{LogConfig, init_logging};

mod commands;
use commands::{Client, parse_arg};

mod config;
use config::{ClientConfig, Validatable};

mod natives;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get default config path based on executable location
fn default_config_path() -> String {
    env::current_exe()
        .ok()
        .and_then(|exe_path| {
            let stem = exe_path.file_stem()?;
            let parent = exe_path.parent()?;
            Some(parent.join(stem).with_extension("json"))
        })
        .and_then(|path| path.to_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "./mps_client.json".to_string())
}

/// Headless client for the multiplayer scripting core
#[derive(Parser, Debug)]
#[command(name = "mps_client")]
#[command(version = VERSION)]
#[command(about = "Connects the client scripting core to a game server", long_about = None)]
struct Args {
    /// Path to configuration file (JSON); defaults apply when the default file is missing
    #[arg(short, long)]
    config: Option<String>,

    /// Server address (host:port), overrides the configuration
    #[arg(short, long, env = "MPS_SERVER")]
    server: Option<String>,

    /// Enable logging to file (mps_client.log in current directory)
    #[arg(long, env = "MPS_LOG_FILE")]
    log_file: bool,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    print_schema: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve built-in procedures and log events until disconnected
    Listen,

    /// Call a remote procedure and print its result as JSON
    Call {
        proc_name: String,
        /// Arguments as JSON; anything else is sent as a string
        args: Vec<String>,
    },

    /// Send a one-way remote event
    Emit {
        event: String,
        args: Vec<String>,
        /// Send on the unreliable channel
        #[arg(long)]
        unreliable: bool,
    },
}

fn load_config(args: &Args) -> config::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => {
            let path = default_config_path();
            if Path::new(&path).exists() {
                ClientConfig::from_json_file(&path)?
            } else {
                ClientConfig::default()
            }
        }
    };

    if let Some(server) = &args.server {
        config.server_addr = server.clone();
    }
    Ok(config)
}

async fn run(command: Command, config: ClientConfig) -> commands::Result<()> {
    let client = Client::connect(&config).await?;
    match command {
        Command::Listen => client.listen().await,
        Command::Call { proc_name, args } => {
            let args = args.iter().map(|raw| parse_arg(raw)).collect();
            let result = client.call(&proc_name, args).await?;
            println!("{}", result);
            Ok(())
        }
        Command::Emit {
            event,
            args,
            unreliable,
        } => {
            let args = args.iter().map(|raw| parse_arg(raw)).collect();
            client.emit(&event, args, unreliable).await
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    if args.print_schema {
        match ClientConfig::schema_json() {
            Ok(schema) => println!("{}", schema),
            Err(e) => {
                eprintln!("Failed to generate schema: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // We can't log errors yet, so we use eprintln! for early failures
    let config = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let log_config = if args.log_file {
        match std::fs::File::create("mps_client.log") {
            Ok(file) => LogConfig::new("mps_client::")
                .with_level(config.level())
                .with_log_file(file),
            Err(e) => {
                eprintln!("Unable to create mps_client.log: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        LogConfig::<std::fs::File>::new("mps_client::").with_level(config.level())
    };

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("Scripting client v{}", VERSION);
    debug!("Settings:");
    debug!("  Server: {}", config.server_addr);
    debug!("  RPC timeout: {} ms, retries: {}", config.rpc.timeout_ms, config.rpc.max_retries);
    debug!("  Max frame size: {}", config.session.max_frame_size);
    debug!("  Log Level: {}", config.log_level);

    let command = args.command.unwrap_or(Command::Listen);
    let outcome = LocalSet::new().run_until(run(command, config)).await;

    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
    info!("Shutdown complete");
}
