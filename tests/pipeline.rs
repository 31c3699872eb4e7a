use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use timer_bridge::transport::{PortStreams, SerialOptions, SerialPlatform, SerialPort};
use timer_bridge::*;
use tokio::io::{duplex, AsyncReadExt, DuplexStream};

/// Hands out the host side of an in-memory pipe as the only serial port
struct PipePlatform {
    end: Mutex<Option<DuplexStream>>,
}

struct PipePort {
    stream: Option<DuplexStream>,
}

fn pipe_info() -> DeviceInfo {
    DeviceInfo {
        name: Some("pipe0".into()),
        vendor_id: Some(0x1a86),
        product_id: Some(0x7523),
        ..DeviceInfo::default()
    }
}

#[async_trait]
impl SerialPlatform for PipePlatform {
    fn is_supported(&self) -> bool {
        true
    }

    async fn request_port(&self, filters: &[DeviceFilter]) -> Result<Box<dyn SerialPort>> {
        if !filters.iter().all(|f| f.matches(&pipe_info())) {
            return Err(Error::NoDeviceSelected);
        }
        let stream = self.end.lock().take().ok_or(Error::NoDeviceSelected)?;
        Ok(Box::new(PipePort {
            stream: Some(stream),
        }))
    }

    async fn paired_ports(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![pipe_info()])
    }
}

#[async_trait]
impl SerialPort for PipePort {
    fn info(&self) -> DeviceInfo {
        pipe_info()
    }

    async fn open(&mut self, _options: &SerialOptions) -> Result<PortStreams> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| Error::ConnectionFailed("already open".into()))?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(PortStreams {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn pipe_transport(config: SerialConfig) -> (TransportManager, DuplexStream) {
    let (host, device) = duplex(4096);
    let platform = PipePlatform {
        end: Mutex::new(Some(host)),
    };
    (TransportManager::serial(Arc::new(platform), config), device)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

async fn read_line(device: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    loop {
        let byte = device.read_u8().await.expect("device pipe closed");
        line.push(byte);
        if byte == b'\n' {
            return String::from_utf8(line).expect("ascii line");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_page_colors_reach_the_wire() {
    let page = Arc::new(MemoryDocument::new());
    let card = page.append_element(
        page.body_node(),
        "div",
        &[("style", "background-color: rgb(0, 128, 0)")],
    );
    let clock = page.append_element(card, "span", &[("class", "countdown")]);
    page.set_text(clock, "05:00");

    let monitor = TimerMonitor::start(page.clone(), MonitorConfig::default());
    let (transport, mut device) = pipe_transport(SerialConfig {
        vendor_id: Some(0x1a86),
        ..SerialConfig::default()
    });
    let mut session = Session::new(monitor, transport, BridgeOptions::default());
    settle().await;

    let info = session.connect().await.unwrap();
    assert_eq!(info.name.as_deref(), Some("pipe0"));
    assert_eq!(read_line(&mut device).await, "0,128,0\n");

    // Container turns red; seen by the poll backstop
    page.set_attribute(card, "style", "background-color: rgb(255, 0, 0)");
    settle().await;
    assert_eq!(read_line(&mut device).await, "255,0,0\n");

    // The page re-renders the whole card
    page.remove(card);
    let card = page.append_element(
        page.body_node(),
        "div",
        &[("style", "background: rgb(255, 165, 0)")],
    );
    let clock = page.append_element(card, "span", &[("class", "countdown")]);
    page.set_text(clock, "00:10");
    settle().await;
    settle().await;
    assert_eq!(read_line(&mut device).await, "255,165,0\n");

    // Every snapshot is framed, even when only the value moved
    page.set_text(clock, "00:09");
    settle().await;
    assert_eq!(session.status().last.unwrap().value, "00:09");
    assert_eq!(read_line(&mut device).await, "255,165,0\n");

    session.disconnect().await.unwrap();
    page.set_attribute(card, "style", "background: rgb(1, 2, 3)");
    settle().await;

    let mut rest = Vec::new();
    device.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty(), "unexpected bytes after disconnect: {rest:?}");
    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_values_on_the_wire() {
    let page = Arc::new(MemoryDocument::new());
    let cell = page.append_element(page.body_node(), "td", &[]);
    page.set_text(cell, "2:00");

    let monitor = TimerMonitor::start(page.clone(), MonitorConfig::default());
    let (transport, mut device) = pipe_transport(SerialConfig::default());
    let options = BridgeOptions {
        mode: WireMode::Timer,
        forward_device_log: false,
        ..BridgeOptions::default()
    };
    let mut session = Session::new(monitor, transport, options);
    settle().await;
    session.connect().await.unwrap();

    for value in ["1:59", "1:58", "1:57"] {
        page.set_text(cell, value);
        settle().await;
    }

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(read_line(&mut device).await);
    }
    assert_eq!(
        received,
        vec!["TIMER:2:00\n", "TIMER:1:59\n", "TIMER:1:58\n", "TIMER:1:57\n"]
    );
    session.shutdown().await.unwrap();
}
