use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cncstream::{
    init_json_logging, init_logging, list_ports, prepare_job, Config, Controller, ControllerEvent,
    ControllerState, ControllerType, GcodeStreamReader, MessageType, SerialConnection,
    BUILD_DATE, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "cncstream", version, long_version = LONG_VERSION, about)]
struct Cli {
    /// Config file (.toml or .json); defaults to the platform config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log as JSON lines instead of pretty text
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports that look like CNC controllers
    Ports,
    /// Stream a G-code file to the controller
    Stream {
        #[command(flatten)]
        port: PortArgs,
        /// G-code file to send
        file: PathBuf,
    },
    /// Print the controller's firmware settings
    Settings {
        #[command(flatten)]
        port: PortArgs,
    },
}

#[derive(Args, Debug)]
struct PortArgs {
    /// Serial port, or "Auto" for the first CNC-like port
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    baud: Option<u32>,
    /// grbl or tinyg
    #[arg(long)]
    firmware: Option<ControllerType>,
}

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built ",
    env!("BUILD_DATE"),
    ")"
);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.log_json {
        init_json_logging()?;
    } else {
        init_logging()?;
    }
    tracing::debug!("cncstream {} built {}", VERSION, BUILD_DATE);

    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Command::Ports => {
            let ports = list_ports()?;
            if ports.is_empty() {
                println!("No CNC serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
        }
        Command::Stream { port, file } => {
            let config = apply_port_args(config, port)?;
            stream_file(&config, file).await?;
        }
        Command::Settings { port } => {
            let config = apply_port_args(config, port)?;
            print_settings(&config).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let path = match path {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    Config::load_or_default(&path)
        .with_context(|| format!("loading config from {}", path.display()))
}

fn apply_port_args(mut config: Config, args: PortArgs) -> Result<Config> {
    if let Some(port) = args.port {
        config.connection.port = port;
    }
    if let Some(baud) = args.baud {
        config.connection.baud_rate = baud;
    }
    if let Some(firmware) = args.firmware {
        config.connection.firmware = firmware;
    }
    config.validate()?;
    Ok(config)
}

/// Open the configured port and wait for the firmware to answer
async fn connect(config: &Config) -> Result<Controller> {
    let port = if config.connection.is_auto_port() {
        list_ports()?
            .into_iter()
            .next()
            .map(|info| info.port_name)
            .ok_or_else(|| anyhow!("no CNC serial port found, pass --port"))?
    } else {
        config.connection.port.clone()
    };

    let connection = SerialConnection::open(&config.connection.params(&port))?;
    let controller = Controller::new(
        config.connection.firmware.adapter(),
        config.streaming.controller_options(),
    );
    controller.connect(Arc::new(connection))?;
    controller
        .wait_until_ready(config.connection.timeout())
        .await
        .with_context(|| format!("no answer from {} on {}", config.connection.firmware, port))?;
    Ok(controller)
}

async fn print_settings(config: &Config) -> Result<()> {
    let controller = connect(config).await?;
    let settings = controller.settings().await?;
    for setting in settings {
        println!("{}", setting);
    }
    controller.disconnect()?;
    Ok(())
}

async fn stream_file(config: &Config, file: PathBuf) -> Result<()> {
    let workdir = tempfile::tempdir()?;
    let stream_path = workdir.path().join("job.stream");
    let adapter = config.connection.firmware.adapter();
    let rows = prepare_job(
        &file,
        &stream_path,
        adapter.as_ref(),
        config.streaming.header_width,
    )
    .with_context(|| format!("preparing {}", file.display()))?;
    if rows == 0 {
        bail!("{} is empty", file.display());
    }

    let controller = connect(config).await?;
    let mut events = controller.events().receiver();
    controller.queue_stream(GcodeStreamReader::open(&stream_path)?);
    controller.start_streaming()?;

    let mut failure: Option<String> = None;
    let result = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, canceling stream");
                failure.get_or_insert_with(|| "interrupted".to_string());
                controller.cancel_stream().await?;
                continue;
            }
        };

        match event {
            Ok(ControllerEvent::PausedOnError(command)) => {
                let line = command
                    .line_number()
                    .map_or_else(|| "?".to_string(), |n| n.to_string());
                let reason = format!(
                    "line {} ({}) failed: {}",
                    line,
                    command.original_command(),
                    command.error_message().unwrap_or("error")
                );
                eprintln!("{}", reason);
                failure.get_or_insert(reason);
                controller.cancel_stream().await?;
            }
            Ok(ControllerEvent::StateChanged {
                to: ControllerState::Alarm,
                ..
            }) => {
                failure.get_or_insert_with(|| "controller alarm".to_string());
                controller.cancel_stream().await?;
            }
            Ok(ControllerEvent::ConsoleMessage(MessageType::Error, text)) => {
                eprintln!("{}", text);
            }
            Ok(ControllerEvent::StreamComplete { sent, total, success }) => {
                println!("Sent {} of {} rows", sent, total);
                break if success {
                    Ok(())
                } else {
                    Err(anyhow!(failure.unwrap_or_else(|| "stream had errors".to_string())))
                };
            }
            Ok(ControllerEvent::StreamCanceled { sent, total }) => {
                println!("Canceled after {} of {} rows", sent, total);
                break Err(anyhow!(failure.unwrap_or_else(|| "stream canceled".to_string())));
            }
            Ok(ControllerEvent::Disconnected { reason, discarded }) => {
                break Err(anyhow!(
                    "connection lost: {} ({} commands discarded)",
                    reason,
                    discarded
                ));
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Event receiver skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break Err(anyhow!("controller stopped")),
        }
    };

    controller.disconnect()?;
    result
}
