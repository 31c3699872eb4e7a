/*!
 # Transport manager

 Owns one physical connection to the display device and all byte-level I/O
 on it. The connection moves through
 `Disconnected -> Connecting -> Connected -> Closing -> Disconnected`.

 The input side has exactly one reader at a time: an ad hoc `read()` /
 `send_command()` call or the background read loop. Writes pass through a
 fair one-permit queue so they reach the device in submission order.
*/

mod config;
mod native;
pub mod platform;

pub use config::{SerialConfig, UsbConfig};
pub use native::NativeSerial;
pub use platform::{
    DeviceFilter, DeviceInfo, FlowControl, Parity, PortStreams, SerialOptions, SerialPlatform,
    SerialPort, StopBits, UsbDevice, UsbPlatform,
};

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::codec::{decode_text, LineFramer};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

enum Platform {
    Serial {
        platform: Arc<dyn SerialPlatform>,
        config: SerialConfig,
    },
    Usb {
        platform: Arc<dyn UsbPlatform>,
        config: UsbConfig,
    },
}

impl Platform {
    fn kind(&self) -> &'static str {
        match self {
            Platform::Serial { .. } => "Serial",
            Platform::Usb { .. } => "USB",
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            Platform::Serial { config, .. } => config.timeout,
            Platform::Usb { config, .. } => config.timeout,
        }
    }
}

/// Resource released on disconnect
enum Handle {
    Serial(Box<dyn SerialPort>),
    Usb {
        device: Arc<dyn UsbDevice>,
        interface: u8,
    },
}

enum Chunk {
    Data(Vec<u8>),
    /// Short transfer: the device has nothing more right now
    Final(Vec<u8>),
    End,
}

enum Input {
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        chunk_size: usize,
    },
    Usb {
        device: Arc<dyn UsbDevice>,
        endpoint: u8,
        chunk_size: usize,
    },
}

impl Input {
    fn chunk_size(&self) -> usize {
        match self {
            Input::Stream { chunk_size, .. } | Input::Usb { chunk_size, .. } => (*chunk_size).max(1),
        }
    }

    async fn next_chunk(&mut self, limit: usize) -> Result<Chunk> {
        match self {
            Input::Stream { reader, chunk_size } => {
                let mut buf = vec![0u8; limit.min(*chunk_size).max(1)];
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok(Chunk::End);
                }
                buf.truncate(n);
                trace!("Read {} byte(s)", n);
                Ok(Chunk::Data(buf))
            }
            Input::Usb {
                device,
                endpoint,
                chunk_size,
            } => {
                let requested = limit.min(*chunk_size).max(1);
                let data = device.transfer_in(*endpoint, requested).await?;
                trace!("Transfer in: {} of {} byte(s)", data.len(), requested);
                Ok(match data.len() {
                    0 => Chunk::End,
                    n if n < requested => Chunk::Final(data),
                    _ => Chunk::Data(data),
                })
            }
        }
    }
}

enum Output {
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
    Usb {
        device: Arc<dyn UsbDevice>,
        endpoint: u8,
    },
}

impl Output {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Output::Stream(writer) => {
                writer.write_all(data).await?;
                writer.flush().await?;
            }
            Output::Usb { device, endpoint } => {
                let mut sent = 0;
                while sent < data.len() {
                    let n = device.transfer_out(*endpoint, &data[sent..]).await?;
                    if n == 0 {
                        return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
                    }
                    sent += n;
                }
            }
        }
        Ok(())
    }
}

/// Serializes writes with an optional minimum gap between them
struct WriteQueue {
    /// One write at a time, handed out in FIFO order
    semaphore: Semaphore,
    min_delay: Duration,
    last_write: AsyncMutex<Option<Instant>>,
}

impl WriteQueue {
    fn new(min_delay: Duration) -> Self {
        Self {
            semaphore: Semaphore::new(1),
            min_delay,
            last_write: AsyncMutex::new(None),
        }
    }

    async fn execute<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::General("write queue closed".into()))?;

        let mut last = self.last_write.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                trace!("Rate limiting: waiting {:?} before next write", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        let result = future.await;
        *last = Some(Instant::now());
        result
    }
}

/// Open failures become `ConnectionFailed`; a refused grant stays distinct
fn open_failure(error: Error) -> Error {
    match error {
        Error::PermissionDenied(_) => error,
        other => Error::ConnectionFailed(other.to_string()),
    }
}

struct Link {
    handle: Handle,
    input: Input,
    output: Output,
    info: DeviceInfo,
}

struct ReadLoop {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Puts the state back to `Disconnected` if a connect attempt is abandoned
struct ConnectAttempt<'a> {
    state: &'a Mutex<ConnectionState>,
    armed: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock() = ConnectionState::Disconnected;
        }
    }
}

/// Lifecycle and I/O for a single serial or USB-style connection
pub struct TransportManager {
    platform: Platform,
    state: Mutex<ConnectionState>,
    handle: Mutex<Option<Handle>>,
    info: Mutex<Option<DeviceInfo>>,
    input: Arc<AsyncMutex<Option<Input>>>,
    output: AsyncMutex<Option<Output>>,
    write_queue: WriteQueue,
    read_loop: Mutex<Option<ReadLoop>>,
    /// Flips to `true` when the connection starts closing
    shutdown: watch::Sender<bool>,
}

impl TransportManager {
    fn with_platform(platform: Platform, write_interval: Duration) -> Self {
        Self {
            platform,
            state: Mutex::new(ConnectionState::Disconnected),
            handle: Mutex::new(None),
            info: Mutex::new(None),
            input: Arc::new(AsyncMutex::new(None)),
            output: AsyncMutex::new(None),
            write_queue: WriteQueue::new(write_interval),
            read_loop: Mutex::new(None),
            shutdown: watch::Sender::new(true),
        }
    }

    pub fn serial(platform: Arc<dyn SerialPlatform>, config: SerialConfig) -> Self {
        let interval = config.write_interval;
        Self::with_platform(Platform::Serial { platform, config }, interval)
    }

    pub fn usb(platform: Arc<dyn UsbPlatform>, config: UsbConfig) -> Self {
        let interval = config.write_interval;
        Self::with_platform(Platform::Usb { platform, config }, interval)
    }

    /// Whether the platform offers this kind of transport at all
    pub fn is_supported(&self) -> bool {
        match &self.platform {
            Platform::Serial { platform, .. } => platform.is_supported(),
            Platform::Usb { platform, .. } => platform.is_supported(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Metadata of the connected device
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.info.lock().clone()
    }

    /// Devices already granted on this platform
    pub async fn paired_devices(&self) -> Result<Vec<DeviceInfo>> {
        match &self.platform {
            Platform::Serial { platform, .. } => platform.paired_ports().await,
            Platform::Usb { platform, .. } => platform.paired_devices().await,
        }
    }

    /// Requests a device, opens it and moves to `Connected`.
    ///
    /// Any failure leaves the manager `Disconnected`.
    #[instrument(skip(self), fields(kind = self.platform.kind()))]
    pub async fn connect(&self) -> Result<DeviceInfo> {
        if !self.is_supported() {
            return Err(Error::Unsupported(self.platform.kind()));
        }
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(Error::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }
        let mut attempt = ConnectAttempt {
            state: &self.state,
            armed: true,
        };

        let link = match self.open().await {
            Ok(link) => link,
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                return Err(e);
            }
        };

        let info = link.info.clone();
        *self.input.lock().await = Some(link.input);
        *self.output.lock().await = Some(link.output);
        *self.handle.lock() = Some(link.handle);
        *self.info.lock() = Some(info.clone());
        self.shutdown.send_replace(false);

        attempt.armed = false;
        *self.state.lock() = ConnectionState::Connected;
        info!("Connected to {}", info);
        Ok(info)
    }

    async fn open(&self) -> Result<Link> {
        match &self.platform {
            Platform::Serial { platform, config } => {
                let filters = config.device_filters();
                debug!("Requesting serial port with {} filter(s)", filters.len());
                let mut port = platform.request_port(&filters).await?;
                let info = port.info();
                let streams = port.open(&config.options).await.map_err(open_failure)?;
                debug!("Opened port at {} baud", config.options.baud_rate);
                Ok(Link {
                    handle: Handle::Serial(port),
                    input: Input::Stream {
                        reader: streams.reader,
                        chunk_size: config.options.buffer_size,
                    },
                    output: Output::Stream(streams.writer),
                    info,
                })
            }
            Platform::Usb { platform, config } => {
                let filters = config.device_filters();
                debug!("Requesting USB device with {} filter(s)", filters.len());
                let device = platform.request_device(&filters).await?;
                let info = device.info();
                if let Err(e) = Self::open_usb(device.as_ref(), config).await {
                    if let Err(close_err) = device.close().await {
                        debug!("Close after failed open also failed: {}", close_err);
                    }
                    return Err(open_failure(e));
                }
                Ok(Link {
                    handle: Handle::Usb {
                        device: device.clone(),
                        interface: config.interface,
                    },
                    input: Input::Usb {
                        device: device.clone(),
                        endpoint: config.endpoint_in,
                        chunk_size: config.transfer_size,
                    },
                    output: Output::Usb {
                        device,
                        endpoint: config.endpoint_out,
                    },
                    info,
                })
            }
        }
    }

    async fn open_usb(device: &dyn UsbDevice, config: &UsbConfig) -> Result<()> {
        device.open().await?;
        if device.configuration().is_none() {
            debug!("Selecting configuration {}", config.configuration);
            device.select_configuration(config.configuration).await?;
        }
        device.claim_interface(config.interface).await?;
        debug!("Claimed interface {}", config.interface);
        Ok(())
    }

    /// Closes the connection.
    ///
    /// Always ends `Disconnected`; a failing close is still reported as
    /// `DisconnectFailed`.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Disconnected | ConnectionState::Closing => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(Error::General("connection attempt in progress".into()))
                }
                ConnectionState::Connected => *state = ConnectionState::Closing,
            }
        }
        self.shutdown.send_replace(true);
        self.stop_read_loop().await;

        self.input.lock().await.take();
        self.output.lock().await.take();
        let handle = self.handle.lock().take();
        self.info.lock().take();

        let result = match handle {
            Some(Handle::Serial(mut port)) => port.close().await,
            Some(Handle::Usb { device, interface }) => {
                let released = device.release_interface(interface).await;
                if let Err(e) = &released {
                    warn!("Failed to release interface {}: {}", interface, e);
                }
                let closed = device.close().await;
                released.and(closed)
            }
            None => Ok(()),
        };

        *self.state.lock() = ConnectionState::Disconnected;
        match result {
            Ok(()) => {
                info!("Disconnected");
                Ok(())
            }
            Err(e) => {
                warn!("Disconnected with close error: {}", e);
                Err(Error::DisconnectFailed(e.to_string()))
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Sends text or raw bytes.
    ///
    /// A write still pending when the connection starts closing is abandoned
    /// with `NotConnected`.
    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        self.ensure_connected()?;
        let mut closed = self.shutdown.subscribe();
        let queued = self.write_queue.execute(async {
            let mut output = self.output.lock().await;
            let output = output.as_mut().ok_or(Error::NotConnected)?;
            output.write_all(data).await?;
            trace!("Wrote {} byte(s)", data.len());
            Ok(())
        });
        tokio::select! {
            _ = closed.wait_for(|closing| *closing) => Err(Error::NotConnected),
            written = queued => written,
        }
    }

    /// Collects up to `max_length` bytes.
    ///
    /// Returns early, possibly empty, when the stream signals end of data.
    pub async fn read(&self, max_length: usize) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        if self.read_loop_active() {
            return Err(Error::ReadLoopActive);
        }
        let mut guard = self.input.try_lock().map_err(|_| Error::ReaderBusy)?;
        let input = guard.as_mut().ok_or(Error::NotConnected)?;

        let mut closed = self.shutdown.subscribe();
        tokio::select! {
            _ = closed.wait_for(|closing| *closing) => Err(Error::NotConnected),
            data = Self::collect(input, max_length) => data,
        }
    }

    async fn collect(input: &mut Input, max_length: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(max_length.min(input.chunk_size()));
        while data.len() < max_length {
            match input.next_chunk(max_length - data.len()).await? {
                Chunk::Data(bytes) => data.extend(bytes),
                Chunk::Final(bytes) => {
                    data.extend(bytes);
                    break;
                }
                Chunk::End => break,
            }
        }
        data.truncate(max_length);
        Ok(data)
    }

    /// `read()` decoded as UTF-8 with trailing NUL padding removed
    pub async fn read_as_text(&self, max_length: usize) -> Result<String> {
        let data = self.read(max_length).await?;
        Ok(decode_text(&data))
    }

    /// Writes `command` and waits for `response_length` bytes.
    ///
    /// Falls back to the configured timeout when `timeout` is `None`.
    #[instrument(skip(self, command), fields(len = command.as_ref().len()))]
    pub async fn send_command(
        &self,
        command: impl AsRef<[u8]>,
        response_length: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        if self.read_loop_active() {
            return Err(Error::ReadLoopActive);
        }
        let deadline = timeout.unwrap_or_else(|| self.platform.timeout());
        self.write(command).await?;
        match tokio::time::timeout(deadline, self.read(response_length)).await {
            Ok(response) => response,
            Err(_) => {
                debug!("No response within {:?}", deadline);
                Err(Error::CommandTimeout(deadline))
            }
        }
    }

    /// Starts the background reader, calling `on_line` for every non-empty line
    pub fn start_read_loop<F>(&self, mut on_line: F) -> Result<()>
    where
        F: FnMut(String) + Send + 'static,
    {
        self.ensure_connected()?;
        let mut slot = self.read_loop.lock();
        if slot.as_ref().is_some_and(|l| !l.task.is_finished()) {
            return Err(Error::ReadLoopActive);
        }
        let mut input = self
            .input
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::ReaderBusy)?;

        let (stop, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut framer = LineFramer::new();
            while let Some(stream) = input.as_mut() {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    chunk = stream.next_chunk(usize::MAX) => match chunk {
                        Ok(Chunk::Data(bytes) | Chunk::Final(bytes)) => {
                            for line in framer.push(&bytes) {
                                on_line(line);
                            }
                        }
                        Ok(Chunk::End) => {
                            debug!("Input stream ended; read loop exiting");
                            break;
                        }
                        Err(e) => {
                            warn!("Read loop stopped: {}", e);
                            break;
                        }
                    }
                }
            }
            if !framer.pending().is_empty() {
                trace!("Discarding {} unterminated byte(s)", framer.pending().len());
            }
        });

        *slot = Some(ReadLoop { stop, task });
        debug!("Read loop started");
        Ok(())
    }

    /// Stops the read loop; once this returns no further lines are delivered
    pub async fn stop_read_loop(&self) {
        let read_loop = self.read_loop.lock().take();
        let Some(read_loop) = read_loop else {
            return;
        };
        let _ = read_loop.stop.send(());
        if let Err(e) = read_loop.task.await {
            if e.is_panic() {
                warn!("Read loop panicked: {}", e);
            }
        }
        debug!("Read loop stopped");
    }

    pub fn read_loop_active(&self) -> bool {
        self.read_loop
            .lock()
            .as_ref()
            .is_some_and(|l| !l.task.is_finished())
    }
}
