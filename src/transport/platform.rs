/*!
 # Platform primitives

 The permission-gated device pickers and raw port operations the transport
 manager drives. Serial ports open into a pair of byte stream halves; USB
 devices expose endpoint transfers.
*/

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
}

/// Line settings applied when a serial port is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialOptions {
    pub baud_rate: u32,
    /// 5 to 8
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// Read chunk size in bytes
    pub buffer_size: usize,
    pub flow_control: FlowControl,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: StopBits::One,
            parity: Parity::None,
            buffer_size: 255,
            flow_control: FlowControl::None,
        }
    }
}

/// Vendor/product filter for device selection; `None` fields match anything
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        self.vendor_id.map_or(true, |id| info.vendor_id == Some(id))
            && self.product_id.map_or(true, |id| info.product_id == Some(id))
    }
}

/// Device metadata, as much as the platform reveals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Port path or platform name
    pub name: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product_name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub serial_number: Option<String>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or("<unnamed>"))?;
        if let (Some(vid), Some(pid)) = (self.vendor_id, self.product_id) {
            write!(f, " [{:04x}:{:04x}]", vid, pid)?;
        }
        match (&self.manufacturer_name, &self.product_name) {
            (Some(m), Some(p)) => write!(f, " {} {}", m, p),
            (None, Some(p)) => write!(f, " {}", p),
            (Some(m), None) => write!(f, " {}", m),
            (None, None) => Ok(()),
        }
    }
}

/// Readable and writable halves of an open serial port
pub struct PortStreams {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Serial port picker
#[async_trait]
pub trait SerialPlatform: Send + Sync {
    /// Whether this platform can open ports at all
    fn is_supported(&self) -> bool;

    /// Asks for a port matching any of the filters (all ports when empty).
    ///
    /// Fails with `PermissionDenied` or `NoDeviceSelected` when the grant is
    /// refused or nothing matches.
    async fn request_port(&self, filters: &[DeviceFilter]) -> Result<Box<dyn SerialPort>>;

    /// Ports already available without a new grant
    async fn paired_ports(&self) -> Result<Vec<DeviceInfo>>;
}

#[async_trait]
pub trait SerialPort: Send {
    fn info(&self) -> DeviceInfo;

    async fn open(&mut self, options: &SerialOptions) -> Result<PortStreams>;

    /// Called after both stream halves have been dropped
    async fn close(&mut self) -> Result<()>;
}

/// USB device picker
#[async_trait]
pub trait UsbPlatform: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn request_device(&self, filters: &[DeviceFilter]) -> Result<Arc<dyn UsbDevice>>;

    async fn paired_devices(&self) -> Result<Vec<DeviceInfo>>;
}

#[async_trait]
pub trait UsbDevice: Send + Sync {
    fn info(&self) -> DeviceInfo;

    /// Active configuration value, if one is selected
    fn configuration(&self) -> Option<u8>;

    async fn open(&self) -> Result<()>;

    async fn select_configuration(&self, value: u8) -> Result<()>;

    async fn claim_interface(&self, interface: u8) -> Result<()>;

    async fn release_interface(&self, interface: u8) -> Result<()>;

    /// Bulk/interrupt IN transfer of up to `length` bytes
    async fn transfer_in(&self, endpoint: u8, length: usize) -> Result<Vec<u8>>;

    /// OUT transfer; returns bytes written
    async fn transfer_out(&self, endpoint: u8, data: &[u8]) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let info = DeviceInfo {
            vendor_id: Some(0x2e8a),
            product_id: Some(0x0005),
            ..DeviceInfo::default()
        };
        assert!(DeviceFilter::default().matches(&info));
        assert!(DeviceFilter {
            vendor_id: Some(0x2e8a),
            product_id: None
        }
        .matches(&info));
        assert!(!DeviceFilter {
            vendor_id: Some(0x2341),
            product_id: None
        }
        .matches(&info));
        assert!(!DeviceFilter {
            vendor_id: Some(0x2e8a),
            product_id: Some(0x000a)
        }
        .matches(&DeviceInfo::default()));
    }

    #[test]
    fn test_display() {
        let info = DeviceInfo {
            name: Some("/dev/ttyACM0".into()),
            vendor_id: Some(0x2e8a),
            product_id: Some(0x0005),
            product_name: Some("Board CDC".into()),
            manufacturer_name: Some("MicroPython".into()),
            serial_number: None,
        };
        assert_eq!(
            info.to_string(),
            "/dev/ttyACM0 [2e8a:0005] MicroPython Board CDC"
        );
    }
}
