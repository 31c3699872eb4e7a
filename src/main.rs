use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::Result;
use std::sync::Arc;
use timer_bridge::codec::{frame_color, frame_timer};
use timer_bridge::transport::SerialOptions;
use timer_bridge::*;
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port path; the first matching port is used when omitted
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, global = true, default_value_t = 9600)]
    baud: u32,

    /// USB vendor id filter (hex)
    #[arg(long, global = true, value_parser = parse_hex)]
    vid: Option<u16>,

    /// USB product id filter (hex)
    #[arg(long, global = true, value_parser = parse_hex)]
    pid: Option<u16>,

    /// Message format
    #[arg(short, long, global = true, value_enum, default_value_t = Mode::Color)]
    mode: Mode,

    /// Command response timeout in milliseconds
    #[arg(short, long, global = true, default_value_t = 5000)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Debug)]
enum Mode {
    /// `R,G,B` lines from a CSS color
    Color,
    /// `TIMER:<value>` lines
    Timer,
}

impl From<Mode> for WireMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Color => WireMode::Color,
            Mode::Timer => WireMode::Timer,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports with their USB metadata
    Ports,
    /// Send one framed message
    Send {
        /// CSS color (color mode) or timer text (timer mode)
        value: String,
    },
    /// Send a raw command line and print the response
    Command {
        /// Command text; a newline is appended
        command: String,
        /// Expected response length in bytes
        #[arg(short, long, default_value_t = 64)]
        length: usize,
    },
    /// Print lines from the device until Ctrl-C
    Monitor,
}

fn parse_hex(value: &str) -> std::result::Result<u16, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{value}': {e}"))
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("timer_bridge=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let platform = match &cli.port {
        Some(path) => NativeSerial::with_path(path.clone()),
        None => NativeSerial::new(),
    };
    let config = SerialConfig {
        vendor_id: cli.vid,
        product_id: cli.pid,
        options: SerialOptions {
            baud_rate: cli.baud,
            ..SerialOptions::default()
        },
        timeout: Duration::from_millis(cli.timeout),
        ..SerialConfig::default()
    };
    let transport = Arc::new(TransportManager::serial(Arc::new(platform), config));

    if let Commands::Ports = cli.command {
        return list_ports(&transport).await;
    }

    if let Err(e) = transport.connect().await {
        error!("Failed to connect: {}", e);
        return Err(e.into());
    }

    let result = match cli.command {
        Commands::Ports => Ok(()),
        Commands::Send { value } => {
            let line = match WireMode::from(cli.mode) {
                WireMode::Color => frame_color(Some(&value)),
                WireMode::Timer => frame_timer(&value),
            };
            info!("Sending {:?}", line.trim_end());
            transport.write(line).await.map_err(Into::into)
        }
        Commands::Command { command, length } => run_command(&transport, &command, length).await,
        Commands::Monitor => run_monitor(&transport).await,
    };

    if let Err(e) = transport.disconnect().await {
        warn!("{}", e);
    }
    result
}

async fn list_ports(transport: &TransportManager) -> Result<()> {
    let ports = transport.paired_devices().await?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
        if let Some(serial) = port.serial_number {
            println!("    serial number: {}", serial);
        }
    }
    Ok(())
}

#[instrument(skip(transport))]
async fn run_command(transport: &TransportManager, command: &str, length: usize) -> Result<()> {
    let line = format!("{}\n", command.trim_end());
    match transport.send_command(line, length, None).await {
        Ok(response) => {
            println!("{}", codec::decode_text(&response));
            Ok(())
        }
        Err(e) if e.is_timeout() => {
            println!("No response ({})", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Stream device output with local timestamps until interrupted
async fn run_monitor(transport: &TransportManager) -> Result<()> {
    transport.start_read_loop(|line| {
        println!("[{}] {}", Local::now().format("%H:%M:%S%.3f"), line);
    })?;
    info!("Listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Stopping");
    transport.stop_read_loop().await;
    Ok(())
}
