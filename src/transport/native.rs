//! `SerialPlatform` backed by the operating system's serial ports.

use async_trait::async_trait;
use std::io;
use tokio_serial::{SerialPortBuilderExt, SerialPortInfo, SerialPortType};
use tracing::debug;

use super::platform::{
    DeviceFilter, DeviceInfo, FlowControl, Parity, PortStreams, SerialOptions, SerialPlatform,
    SerialPort, StopBits,
};
use crate::{Error, Result};

/// Native serial ports via `tokio-serial`.
///
/// With a fixed path the filters are ignored; otherwise the first
/// enumerated port matching any filter is used.
#[derive(Debug, Clone, Default)]
pub struct NativeSerial {
    path: Option<String>,
}

impl NativeSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

fn port_info(port: &SerialPortInfo) -> DeviceInfo {
    let mut info = DeviceInfo {
        name: Some(port.port_name.clone()),
        ..DeviceInfo::default()
    };
    if let SerialPortType::UsbPort(usb) = &port.port_type {
        info.vendor_id = Some(usb.vid);
        info.product_id = Some(usb.pid);
        info.product_name = usb.product.clone();
        info.manufacturer_name = usb.manufacturer.clone();
        info.serial_number = usb.serial_number.clone();
    }
    info
}

/// A port the OS refuses to open is reported as `PermissionDenied`
fn open_error(path: &str, error: tokio_serial::Error) -> Error {
    match error.kind {
        tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            Error::PermissionDenied(format!("{path}: {}", error.description))
        }
        _ => Error::Serial(error),
    }
}

#[async_trait]
impl SerialPlatform for NativeSerial {
    fn is_supported(&self) -> bool {
        true
    }

    async fn request_port(&self, filters: &[DeviceFilter]) -> Result<Box<dyn SerialPort>> {
        if let Some(path) = &self.path {
            let info = self
                .paired_ports()
                .await?
                .into_iter()
                .find(|info| info.name.as_deref() == Some(path.as_str()))
                .unwrap_or_else(|| DeviceInfo {
                    name: Some(path.clone()),
                    ..DeviceInfo::default()
                });
            return Ok(Box::new(NativeSerialPort {
                path: path.clone(),
                info,
            }));
        }

        let ports = self.paired_ports().await?;
        debug!("{} serial port(s) available", ports.len());
        let info = ports
            .into_iter()
            .find(|info| filters.is_empty() || filters.iter().any(|f| f.matches(info)))
            .ok_or(Error::NoDeviceSelected)?;
        let path = info.name.clone().ok_or(Error::NoDeviceSelected)?;
        Ok(Box::new(NativeSerialPort { path, info }))
    }

    async fn paired_ports(&self) -> Result<Vec<DeviceInfo>> {
        let ports = tokio_serial::available_ports()?;
        Ok(ports.iter().map(port_info).collect())
    }
}

struct NativeSerialPort {
    path: String,
    info: DeviceInfo,
}

#[async_trait]
impl SerialPort for NativeSerialPort {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    async fn open(&mut self, options: &SerialOptions) -> Result<PortStreams> {
        let data_bits = match options.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(Error::ConnectionFailed(format!(
                    "unsupported data bits: {other}"
                )))
            }
        };
        let stop_bits = match options.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        };
        let parity = match options.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let flow_control = match options.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        debug!("Opening {} at {} baud", self.path, options.baud_rate);
        let stream = tokio_serial::new(&self.path, options.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| open_error(&self.path, e))?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(PortStreams {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn close(&mut self) -> Result<()> {
        // The OS handle closes once both stream halves are dropped
        Ok(())
    }
}
