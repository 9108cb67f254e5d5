//! Radio link transports
//!
//! A transport only knows how to open a byte stream to the radio. Closing
//! is dropping the stream: the supervisor abandons an in-flight read by
//! dropping it, never by awaiting it.

use std::fmt;
use std::future::Future;
use std::io::Read;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Inbound byte stream from the radio
pub type LinkStream = Box<dyn AsyncRead + Send + Unpin>;

/// Default bound on a connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default serial line speed for mesh radios
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Read timeout of the blocking serial pump; bounds shutdown latency
const SERIAL_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Buffer between the serial pump and the async reader
const SERIAL_PIPE_CAPACITY: usize = 16 * 1024;

/// Kind of transport; only the settle delay differs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Network-attached radio
    Tcp,
    /// USB/serial-attached radio
    Serial,
}

impl TransportKind {
    /// Delay between connect and treating the link as live
    ///
    /// A network radio's stack needs a few seconds before it streams.
    pub fn stabilization_delay(&self) -> Duration {
        match self {
            TransportKind::Tcp => Duration::from_secs(5),
            TransportKind::Serial => Duration::from_secs(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Serial => "serial",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport failure; always recoverable by reconnecting
#[derive(Debug)]
pub enum TransportError {
    /// Connect did not complete in time
    Timeout(Duration),
    /// I/O error on connect or read
    Io(std::io::Error),
    /// Serial port could not be opened
    Serial(String),
    /// Remote end closed the stream
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout(d) => write!(f, "connect timed out after {:?}", d),
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
            TransportError::Serial(msg) => write!(f, "serial error: {}", msg),
            TransportError::Closed => write!(f, "stream closed by remote"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Something that can open a stream to the radio
pub trait LinkTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Human readable endpoint for logs
    fn endpoint(&self) -> String;

    fn connect(&self) -> impl Future<Output = Result<LinkStream, TransportError>> + Send;
}

/// Radio reachable over TCP
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl LinkTransport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }

    async fn connect(&self) -> Result<LinkStream, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Box::new(stream))
    }
}

/// Radio on a serial port
///
/// The port is read on a blocking thread which pumps bytes into an
/// in-memory pipe; the async side reads the other end of the pipe.
#[derive(Debug, Clone)]
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    connect_timeout: Duration,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl LinkTransport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn endpoint(&self) -> String {
        format!("{}@{}", self.path, self.baud_rate)
    }

    async fn connect(&self) -> Result<LinkStream, TransportError> {
        let path = self.path.clone();
        let baud_rate = self.baud_rate;
        let open = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud_rate)
                .timeout(SERIAL_POLL_TIMEOUT)
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .open()
        });

        let port = tokio::time::timeout(self.connect_timeout, open)
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::Serial(format!("open task failed: {}", e)))?
            .map_err(|e| TransportError::Serial(format!("{}: {}", self.path, e)))?;

        let (reader, writer) = tokio::io::duplex(SERIAL_PIPE_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        let handle = tokio::runtime::Handle::current();
        let pump_alive = alive.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || pump_serial(port, writer, pump_alive, handle, path));

        Ok(Box::new(SerialStream {
            inner: reader,
            alive,
        }))
    }
}

/// Copy bytes from the port into the pipe until either side goes away
fn pump_serial(
    mut port: Box<dyn serialport::SerialPort>,
    mut writer: DuplexStream,
    alive: Arc<AtomicBool>,
    handle: tokio::runtime::Handle,
    path: String,
) {
    let mut buf = [0u8; 1024];
    while alive.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if handle.block_on(writer.write_all(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(port = %path, error = %e, "Serial read failed");
                break;
            }
        }
    }
    // Dropping the writer gives the reader EOF
    debug!(port = %path, "Serial pump stopped");
}

/// Async end of the serial pipe; dropping it stops the pump
struct SerialStream {
    inner: DuplexStream,
    alive: Arc<AtomicBool>,
}

impl AsyncRead for SerialStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for SerialStream {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// Either concrete transport, chosen from configuration
#[derive(Debug, Clone)]
pub enum AnyTransport {
    Tcp(TcpTransport),
    Serial(SerialTransport),
}

impl LinkTransport for AnyTransport {
    fn kind(&self) -> TransportKind {
        match self {
            AnyTransport::Tcp(t) => t.kind(),
            AnyTransport::Serial(t) => t.kind(),
        }
    }

    fn endpoint(&self) -> String {
        match self {
            AnyTransport::Tcp(t) => t.endpoint(),
            AnyTransport::Serial(t) => t.endpoint(),
        }
    }

    async fn connect(&self) -> Result<LinkStream, TransportError> {
        match self {
            AnyTransport::Tcp(t) => t.connect().await,
            AnyTransport::Serial(t) => t.connect().await,
        }
    }
}
