/*!
 # Countdown Timer to Device Bridge

 A Rust library that follows a countdown timer rendered inside a web page and
 streams its state to an external device over a serial or USB link.

 ## Features

 * Multi-tier timer discovery (known id, selector sweep, text walk, document watcher)
 * Mutation observers plus a polling backstop, with self-healing when the page
   replaces or detaches the timer element
 * Background color resolution through ancestor elements
 * Serial and USB-style transports with framed reads, writes and commands
 * Background read loop splitting device output into lines
 * Bridge wiring timer changes into `R,G,B\n` or `TIMER:<value>\n` lines

 ## Example

 ```rust,no_run
 use std::sync::Arc;
 use timer_bridge::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     tracing_subscriber::fmt::init();

     // Headless page with the timer layout
     let page = Arc::new(MemoryDocument::new());
     let grid = page.append_element(page.body_node(), "div", &[("id", "timergrid")]);
     let time = page.append_element(grid, "div", &[("id", "timeDiv")]);
     page.set_text(time, "01:07");

     let monitor = TimerMonitor::start(page.clone(), MonitorConfig::default());
     let transport = Arc::new(TransportManager::serial(
         Arc::new(NativeSerial::new()),
         SerialConfig::default(),
     ));

     let bridge = Bridge::connect(&monitor, transport, BridgeOptions::default()).await?;
     page.set_attribute(grid, "style", "background: rgb(0, 128, 0)");

     bridge.disconnect(&monitor).await?;
     monitor.destroy();
     Ok(())
 }
 ```
*/

use std::time::Duration;
use thiserror::Error;

/// Custom error types for the timer bridge library
#[derive(Error, Debug)]
pub enum Error {
    /// Selector syntax the document cannot evaluate
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// The platform has no transport of the requested kind
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    /// Device access refused by the platform or the user
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No device matched the selection filters
    #[error("No device selected")]
    NoDeviceSelected,

    /// Opening or configuring the device failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// `connect` called while a connection is open or opening
    #[error("Device already connected")]
    AlreadyConnected,

    /// I/O attempted without an open connection
    #[error("Device not connected")]
    NotConnected,

    /// Another reader currently owns the input stream
    #[error("Input stream is busy with another reader")]
    ReaderBusy,

    /// A read loop is already running
    #[error("Read loop already active")]
    ReadLoopActive,

    /// No response arrived before the deadline
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// Closing the device failed; the connection was dropped anyway
    #[error("Failed to disconnect: {0}")]
    DisconnectFailed(String),

    /// General error
    #[error("Error: {0}")]
    General(String),

    /// I/O error from the underlying stream
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Error from tokio-serial
    #[error(transparent)]
    Serial(#[from] tokio_serial::Error),
}

impl Error {
    /// Whether this error is a lost race against a command deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::CommandTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod bridge;
pub mod codec;
pub mod color;
pub mod discovery;
pub mod dom;
pub mod monitor;
pub mod transport;

// Re-export key types
pub use bridge::{Bridge, BridgeOptions, Session};
pub use codec::{LineFramer, WireMode};
pub use color::ColorValue;
pub use dom::{Document, MemoryDocument, NodeId};
pub use monitor::{ChangeCallback, ChangeSource, MonitorConfig, TimerMonitor, TimerSnapshot};
pub use transport::{
    ConnectionState, DeviceFilter, DeviceInfo, NativeSerial, SerialConfig, TransportManager,
    UsbConfig,
};
