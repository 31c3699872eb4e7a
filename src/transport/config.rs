use std::time::Duration;

use super::platform::{DeviceFilter, SerialOptions};

/// Settings for a serial transport
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Explicit selection filters; when empty, built from the ids below
    pub filters: Vec<DeviceFilter>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub options: SerialOptions,
    /// Default `send_command` deadline
    pub timeout: Duration,
    /// Minimum gap between consecutive writes
    pub write_interval: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            vendor_id: None,
            product_id: None,
            options: SerialOptions::default(),
            timeout: Duration::from_millis(5000),
            write_interval: Duration::ZERO,
        }
    }
}

/// Settings for a USB-style transport
#[derive(Debug, Clone)]
pub struct UsbConfig {
    pub filters: Vec<DeviceFilter>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// Selected on connect if the device has no active configuration
    pub configuration: u8,
    /// Claimed on connect, released on disconnect
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    /// IN transfer size used by the read loop
    pub transfer_size: usize,
    pub timeout: Duration,
    pub write_interval: Duration,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            vendor_id: None,
            product_id: None,
            configuration: 1,
            interface: 0,
            endpoint_in: 1,
            endpoint_out: 2,
            transfer_size: 64,
            timeout: Duration::from_millis(5000),
            write_interval: Duration::ZERO,
        }
    }
}

/// Explicit filters, or one filter from the vendor/product shorthand
pub(crate) fn selection_filters(
    filters: &[DeviceFilter],
    vendor_id: Option<u16>,
    product_id: Option<u16>,
) -> Vec<DeviceFilter> {
    if filters.is_empty() && (vendor_id.is_some() || product_id.is_some()) {
        return vec![DeviceFilter {
            vendor_id,
            product_id,
        }];
    }
    filters.to_vec()
}

impl SerialConfig {
    pub fn device_filters(&self) -> Vec<DeviceFilter> {
        selection_filters(&self.filters, self.vendor_id, self.product_id)
    }
}

impl UsbConfig {
    pub fn device_filters(&self) -> Vec<DeviceFilter> {
        selection_filters(&self.filters, self.vendor_id, self.product_id)
    }
}
