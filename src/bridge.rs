/*!
 # Bridge

 Connects a [`ChangeSource`] to a [`TransportManager`]: every emitted
 snapshot is framed and written to the device. Messages go through a
bounded FIFO drained by a single writer task, so they reach the device in
emission order and a slow write never stalls the monitor. When the device
falls behind, the oldest queued messages are shed first. Write failures are
logged and dropped; the subscription stays in place.
*/

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::codec::WireMode;
use crate::dom::Document;
use crate::monitor::{ChangeSource, MonitorStatus, TimerMonitor, TimerSnapshot};
use crate::transport::{DeviceInfo, TransportManager};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    pub mode: WireMode,
    /// Log lines printed by the device under the `timer_bridge::device` target
    pub forward_device_log: bool,
    /// Messages held for the device before the oldest are shed
    pub queue_capacity: usize,
    /// How long `disconnect` waits for queued messages to go out
    pub drain_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            mode: WireMode::Color,
            forward_device_log: true,
            queue_capacity: 32,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

/// Bounded message queue between the change callback and the writer task
struct Outbox {
    frames: Mutex<VecDeque<String>>,
    capacity: usize,
    ready: Notify,
    closed: AtomicBool,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queues a message, shedding the oldest when full. False once closed.
    fn push(&self, frame: String) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut frames = self.frames.lock();
            if frames.len() >= self.capacity {
                if let Some(shed) = frames.pop_front() {
                    debug!("Device falling behind, dropping {:?}", shed.trim_end());
                }
            }
            frames.push_back(frame);
        }
        self.ready.notify_one();
        true
    }

    /// Refuses new messages; `next` ends once the queue is empty
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    async fn next(&self) -> Option<String> {
        loop {
            let frame = self.frames.lock().pop_front();
            if frame.is_some() {
                return frame;
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.ready.notified().await;
        }
    }
}

/// An active monitor-to-device registration
pub struct Bridge {
    transport: Arc<TransportManager>,
    outbox: Arc<Outbox>,
    writer: JoinHandle<()>,
    drain_timeout: Duration,
    info: DeviceInfo,
}

impl Bridge {
    /// Connects the transport, then subscribes to `source`.
    ///
    /// The last known snapshot, if any, is sent right away.
    #[instrument(skip_all, fields(mode = ?options.mode))]
    pub async fn connect(
        source: &impl ChangeSource,
        transport: Arc<TransportManager>,
        options: BridgeOptions,
    ) -> Result<Self> {
        let info = transport.connect().await?;
        info!("Device: {}", info);
        if let Some(serial) = &info.serial_number {
            debug!("Serial number: {}", serial);
        }

        if options.forward_device_log {
            let started = transport.start_read_loop(|line| {
                info!(target: "timer_bridge::device", "{}", line);
            });
            if let Err(e) = started {
                warn!("Could not start device log reader: {}", e);
                if let Err(close_err) = transport.disconnect().await {
                    debug!("Disconnect after failed start: {}", close_err);
                }
                return Err(e);
            }
        }

        let outbox = Arc::new(Outbox::new(options.queue_capacity));
        let writer = tokio::spawn(drain(transport.clone(), outbox.clone()));

        let mode = options.mode;
        let queue = outbox.clone();
        source.set_change_callback(Some(Box::new(move |snapshot: &TimerSnapshot| {
            if !queue.push(mode.frame(snapshot)) {
                trace!("Writer gone, dropping update");
            }
        })));

        Ok(Self {
            transport,
            outbox,
            writer,
            drain_timeout: options.drain_timeout,
            info,
        })
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    /// Unsubscribes, stops the device log, flushes queued messages and
    /// closes the transport.
    ///
    /// Messages still queued after `drain_timeout` are dropped.
    #[instrument(skip_all)]
    pub async fn disconnect(mut self, source: &impl ChangeSource) -> Result<()> {
        source.set_change_callback(None);
        self.outbox.close();
        self.transport.stop_read_loop().await;
        match tokio::time::timeout(self.drain_timeout, &mut self.writer).await {
            Ok(Err(e)) if e.is_panic() => warn!("Writer task panicked: {}", e),
            Ok(_) => {}
            Err(_) => {
                warn!(
                    "Device not accepting data after {:?}, dropping queued messages",
                    self.drain_timeout
                );
                self.writer.abort();
            }
        }
        self.transport.disconnect().await
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.outbox.close();
    }
}

/// Writes queued lines in order until the outbox is closed and empty
async fn drain(transport: Arc<TransportManager>, outbox: Arc<Outbox>) {
    while let Some(line) = outbox.next().await {
        if !transport.is_connected() {
            trace!("Not connected, dropping {:?}", line.trim_end());
            continue;
        }
        match transport.write(&line).await {
            Ok(()) => trace!("Sent {:?}", line.trim_end()),
            Err(e) => warn!("Failed to send {:?}: {}", line.trim_end(), e),
        }
    }
    debug!("Writer queue drained");
}

/// Monitor, transport and the bridge between them, for one page
pub struct Session<D: Document> {
    monitor: TimerMonitor<D>,
    transport: Arc<TransportManager>,
    options: BridgeOptions,
    bridge: Option<Bridge>,
}

impl<D: Document> Session<D> {
    pub fn new(monitor: TimerMonitor<D>, transport: TransportManager, options: BridgeOptions) -> Self {
        Self {
            monitor,
            transport: Arc::new(transport),
            options,
            bridge: None,
        }
    }

    pub async fn connect(&mut self) -> Result<DeviceInfo> {
        if self.bridge.is_some() {
            return Err(Error::AlreadyConnected);
        }
        let bridge = Bridge::connect(&self.monitor, self.transport.clone(), self.options).await?;
        let info = bridge.device_info().clone();
        self.bridge = Some(bridge);
        Ok(info)
    }

    /// No-op when nothing is connected
    pub async fn disconnect(&mut self) -> Result<()> {
        match self.bridge.take() {
            Some(bridge) => bridge.disconnect(&self.monitor).await,
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.bridge.is_some() && self.transport.is_connected()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.bridge.as_ref().map(Bridge::device_info)
    }

    pub fn status(&self) -> MonitorStatus {
        self.monitor.status()
    }

    pub fn monitor(&self) -> &TimerMonitor<D> {
        &self.monitor
    }

    pub fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    /// Disconnects if needed and stops the monitor
    pub async fn shutdown(mut self) -> Result<()> {
        let result = self.disconnect().await;
        self.monitor.destroy();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{MemoryDocument, NodeId};
    use crate::monitor::MonitorConfig;
    use crate::transport::tests::serial_pair;
    use crate::transport::{ConnectionState, SerialConfig};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn timer_page(text: &str) -> (Arc<MemoryDocument>, NodeId, NodeId) {
        let doc = Arc::new(MemoryDocument::new());
        let grid = doc.append_element(doc.body_node(), "div", &[("id", "timergrid")]);
        let time = doc.append_element(grid, "div", &[("id", "timeDiv")]);
        doc.set_text(time, text);
        (doc, grid, time)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    async fn read_line(device: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        loop {
            let byte = device.read_u8().await.unwrap();
            line.push(byte);
            if byte == b'\n' {
                return String::from_utf8(line).unwrap();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_color_updates_reach_device() {
        let (doc, grid, _) = timer_page("01:07");
        let monitor = TimerMonitor::start(doc.clone(), MonitorConfig::default());
        settle().await;
        let (transport, mut device) = serial_pair(SerialConfig::default());

        let bridge = Bridge::connect(&monitor, transport.clone(), BridgeOptions::default())
            .await
            .unwrap();
        assert_eq!(bridge.device_info().product_name.as_deref(), Some("Timer Display"));
        assert_eq!(read_line(&mut device).await, "0,0,0\n");

        doc.set_attribute(grid, "style", "background: rgb(0, 128, 0)");
        assert_eq!(read_line(&mut device).await, "0,128,0\n");
        doc.set_attribute(grid, "style", "background: rgb(255, 0, 0)");
        assert_eq!(read_line(&mut device).await, "255,0,0\n");

        device.write_all(b"ACK\n").await.unwrap();
        bridge.disconnect(&monitor).await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!monitor.status().callback_set);
        assert!(!transport.read_loop_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_mode() {
        let (doc, _, time) = timer_page("01:07");
        let monitor = TimerMonitor::start(doc.clone(), MonitorConfig::default());
        settle().await;
        let (transport, mut device) = serial_pair(SerialConfig::default());
        let options = BridgeOptions {
            mode: WireMode::Timer,
            forward_device_log: false,
            ..BridgeOptions::default()
        };

        let bridge = Bridge::connect(&monitor, transport.clone(), options)
            .await
            .unwrap();
        assert!(!transport.read_loop_active());
        doc.set_text(time, "01:06");
        doc.set_text(time, "01:05");
        settle().await;

        assert_eq!(read_line(&mut device).await, "TIMER:01:07\n");
        assert_eq!(read_line(&mut device).await, "TIMER:01:05\n");
        bridge.disconnect(&monitor).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failures_keep_monitoring() {
        let (doc, grid, _) = timer_page("00:30");
        let monitor = TimerMonitor::start(doc.clone(), MonitorConfig::default());
        settle().await;
        let (transport, device) = serial_pair(SerialConfig::default());
        let options = BridgeOptions {
            forward_device_log: false,
            ..BridgeOptions::default()
        };
        let bridge = Bridge::connect(&monitor, transport.clone(), options)
            .await
            .unwrap();
        settle().await;

        drop(device);
        doc.set_attribute(grid, "style", "background: rgb(0, 0, 255)");
        settle().await;

        assert!(monitor.status().callback_set);
        assert_eq!(
            monitor.last_snapshot().unwrap().color.as_str(),
            "rgb(0, 0, 255)"
        );
        assert!(transport.is_connected());
        bridge.disconnect(&monitor).await.unwrap();
    }

    #[test]
    fn test_outbox_sheds_oldest() {
        let outbox = Outbox::new(2);
        for frame in ["1,1,1\n", "2,2,2\n", "3,3,3\n"] {
            assert!(outbox.push(frame.to_string()));
        }
        let queued: Vec<String> = outbox.frames.lock().iter().cloned().collect();
        assert_eq!(queued, vec!["2,2,2\n", "3,3,3\n"]);

        outbox.close();
        assert!(!outbox.push("4,4,4\n".to_string()));
        assert_eq!(outbox.frames.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_outbox_drains_before_closing() {
        let outbox = Arc::new(Outbox::new(4));
        let reader = tokio::spawn({
            let outbox = outbox.clone();
            async move {
                let mut seen = Vec::new();
                while let Some(frame) = outbox.next().await {
                    seen.push(frame);
                }
                seen
            }
        });
        tokio::task::yield_now().await;
        outbox.push("a\n".to_string());
        outbox.push("b\n".to_string());
        outbox.close();
        assert_eq!(reader.await.unwrap(), vec!["a\n", "b\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_stalled_device() {
        let (doc, grid, _) = timer_page("00:30");
        let monitor = TimerMonitor::start(doc.clone(), MonitorConfig::default());
        settle().await;
        let (transport, _device) = serial_pair(SerialConfig::default());
        let options = BridgeOptions {
            forward_device_log: false,
            ..BridgeOptions::default()
        };
        let bridge = Bridge::connect(&monitor, transport.clone(), options)
            .await
            .unwrap();
        settle().await;

        // The device stops reading; this write fills the pipe and blocks
        let filler = tokio::spawn({
            let transport = transport.clone();
            async move { transport.write(vec![b'x'; 2048]).await }
        });
        settle().await;
        doc.set_attribute(grid, "style", "background: rgb(0, 0, 255)");
        settle().await;

        tokio::time::timeout(Duration::from_secs(5), bridge.disconnect(&monitor))
            .await
            .expect("disconnect stalled behind the device")
            .unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!monitor.status().callback_set);
        assert!(matches!(filler.await.unwrap(), Err(Error::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lifecycle() {
        let (doc, _, _) = timer_page("10:00");
        let monitor = TimerMonitor::start(doc, MonitorConfig::default());
        let (transport, mut device) = serial_pair(SerialConfig::default());
        let transport = Arc::into_inner(transport).unwrap();
        let mut session = Session::new(monitor, transport, BridgeOptions::default());
        settle().await;

        assert!(!session.is_connected());
        session.connect().await.unwrap();
        assert!(session.is_connected());
        assert!(session.device_info().is_some());
        assert!(matches!(
            session.connect().await,
            Err(Error::AlreadyConnected)
        ));
        assert_eq!(read_line(&mut device).await, "0,0,0\n");

        session.disconnect().await.unwrap();
        assert!(!session.is_connected());
        session.disconnect().await.unwrap();
        assert!(!session.status().callback_set);
        session.shutdown().await.unwrap();
    }
}
