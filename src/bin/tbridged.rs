//! Line-protocol daemon: hosts a headless timer page and bridges it to a
//! serial device. Each stdin line is one command, answered with `OK` or
//! `ERR <reason>`.

use clap::Parser;
use color_eyre::eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use timer_bridge::monitor::MonitorPhase;
use timer_bridge::transport::SerialOptions;
use timer_bridge::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Timer bridge daemon", long_about = None)]
struct Args {
    /// Serial port path
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long, default_value_t = 9600)]
    baud: u32,

    /// Send `TIMER:<value>` lines instead of colors
    #[arg(long)]
    timer: bool,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u64).range(1..))]
    poll_ms: u64,
}

/// The timer layout the monitor looks for: `#timergrid > #timeDiv`
struct TimerPage {
    doc: Arc<MemoryDocument>,
    nodes: Option<(NodeId, NodeId)>,
    value: String,
    color: String,
}

impl TimerPage {
    fn new(value: &str, color: &str) -> Self {
        let mut page = Self {
            doc: Arc::new(MemoryDocument::new()),
            nodes: None,
            value: value.to_string(),
            color: color.to_string(),
        };
        page.restore();
        page
    }

    fn set(&mut self, value: &str, color: &str) {
        self.value = value.trim().to_string();
        self.color = color.trim().to_string();
        if let Some((grid, time)) = self.nodes {
            self.doc
                .set_attribute(grid, "style", &format!("background: {}", self.color));
            self.doc.set_text(time, &self.value);
        }
    }

    /// Detaches the timer, as a page re-render would
    fn remove(&mut self) -> bool {
        match self.nodes.take() {
            Some((grid, _)) => {
                self.doc.remove(grid);
                true
            }
            None => false,
        }
    }

    /// Renders a fresh timer with the last values
    fn restore(&mut self) -> bool {
        if self.nodes.is_some() {
            return false;
        }
        let style = format!("background: {}", self.color);
        let grid = self.doc.append_element(
            self.doc.body_node(),
            "div",
            &[("id", "timergrid"), ("style", &style)],
        );
        let time = self.doc.append_element(grid, "div", &[("id", "timeDiv")]);
        self.doc.set_text(time, &self.value);
        self.nodes = Some((grid, time));
        true
    }
}

fn describe(session: &Session<MemoryDocument>) -> String {
    let status = session.status();
    let phase = match status.phase {
        MonitorPhase::Searching => "searching".to_string(),
        MonitorPhase::Watching => "watching".to_string(),
        MonitorPhase::Bound(target) => format!("bound:{:?}", target.origin).to_lowercase(),
        MonitorPhase::Stopped => "stopped".to_string(),
    };
    let last = status
        .last
        .map(|s| format!("{}|{}", s.value, s.color))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {} {}",
        phase,
        last,
        if session.is_connected() { "connected" } else { "disconnected" }
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("timer_bridge=info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
    color_eyre::install()?;

    let args = Args::parse();

    let mut page = TimerPage::new("00:00", "transparent");
    let monitor = TimerMonitor::start(
        page.doc.clone(),
        MonitorConfig {
            poll_interval: Duration::from_millis(args.poll_ms),
            ..MonitorConfig::default()
        },
    );
    let platform = match args.port {
        Some(path) => NativeSerial::with_path(path),
        None => NativeSerial::new(),
    };
    let transport = TransportManager::serial(
        Arc::new(platform),
        SerialConfig {
            options: SerialOptions {
                baud_rate: args.baud,
                ..SerialOptions::default()
            },
            ..SerialConfig::default()
        },
    );
    let options = BridgeOptions {
        mode: if args.timer { WireMode::Timer } else { WireMode::Color },
        ..BridgeOptions::default()
    };
    let mut session = Session::new(monitor, transport, options);

    // Ready for commands
    println!("OK");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(input) = lines.next_line().await? {
        let input = input.trim();
        debug!("Command: {}", input);
        let (cmd, arg) = match input.split_once(':') {
            Some((cmd, arg)) => (cmd, Some(arg)),
            None => (input, None),
        };
        match cmd {
            "connect" => match session.connect().await {
                Ok(info) => println!("OK {}", info),
                Err(e) => eprintln!("ERR {e}"),
            },
            "disconnect" => match session.disconnect().await {
                Ok(()) => println!("OK"),
                Err(e) => eprintln!("ERR {e}"),
            },
            "status" => println!("OK {}", describe(&session)),
            "set" => match arg.and_then(|a| a.split_once('|')) {
                Some((value, color)) => {
                    page.set(value, color);
                    println!("OK");
                }
                None => eprintln!("ERR Invalid format. Use set:<value>|<color> (e.g., set:01:07|rgb(0,128,0))"),
            },
            "remove" => {
                if page.remove() {
                    println!("OK");
                } else {
                    eprintln!("ERR Timer already removed");
                }
            }
            "restore" => {
                if page.restore() {
                    println!("OK");
                } else {
                    eprintln!("ERR Timer already present");
                }
            }
            "quit" | "exit" => break,
            "" => eprintln!("ERR No command given"),
            other => eprintln!("ERR Unknown command: {other}"),
        }
    }

    info!("Shutting down");
    session.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_must_be_positive() {
        assert!(Args::try_parse_from(["tbridged", "--poll-ms", "0"]).is_err());
        let args = Args::try_parse_from(["tbridged", "--poll-ms", "50"]).unwrap();
        assert_eq!(args.poll_ms, 50);
    }
}
