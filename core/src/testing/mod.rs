//! Testing utilities
//!
//! In-memory stand-ins for the radio so the supervisor and the bridge can
//! be driven end to end without hardware.
//!
//! # Example
//!
//! ```ignore
//! let (transport, handle) = ScriptedTransport::new();
//! // hand `transport` to a LinkSupervisor, then:
//! let mut link = handle.next_link().await;
//! link.send(b"{\"from\": \"!0000000a\"}\n").await;
//! drop(link); // supervisor sees EOF and reconnects
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex};

use crate::link::{LinkStream, LinkTransport, TransportError, TransportKind};

/// Buffer of each scripted connection
const LINK_CAPACITY: usize = 64 * 1024;

struct Shared {
    links: mpsc::UnboundedSender<ScriptedLink>,
    fail_remaining: AtomicU32,
    connects: AtomicU32,
}

/// Transport whose connections are created on demand in memory
#[derive(Clone)]
pub struct ScriptedTransport {
    shared: Arc<Shared>,
    kind: TransportKind,
}

/// Test side of a [`ScriptedTransport`]
pub struct ScriptedHandle {
    shared: Arc<Shared>,
    links: Mutex<mpsc::UnboundedReceiver<ScriptedLink>>,
}

/// Radio end of one connection; dropping it closes the stream
pub struct ScriptedLink {
    writer: DuplexStream,
}

impl ScriptedTransport {
    pub fn new() -> (Self, ScriptedHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            links: tx,
            fail_remaining: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        });
        (
            Self {
                shared: shared.clone(),
                kind: TransportKind::Serial,
            },
            ScriptedHandle {
                shared,
                links: Mutex::new(rx),
            },
        )
    }

    /// Pretend to be another transport kind (changes the settle delay)
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }
}

impl LinkTransport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> String {
        "scripted".to_string()
    }

    async fn connect(&self) -> Result<LinkStream, TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .shared
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "scripted failure",
            )));
        }

        let (client, server) = tokio::io::duplex(LINK_CAPACITY);
        self.shared
            .links
            .send(ScriptedLink { writer: server })
            .map_err(|_| TransportError::Closed)?;
        Ok(Box::new(client))
    }
}

impl ScriptedHandle {
    /// Next connection the supervisor opened
    pub async fn next_link(&self) -> ScriptedLink {
        self.links
            .lock()
            .await
            .recv()
            .await
            .expect("scripted transport dropped")
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next(&self, count: u32) {
        self.shared.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Connect attempts so far, failed ones included
    pub fn connects(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

impl ScriptedLink {
    /// Write bytes as if the radio sent them; ignored once the reader is gone
    pub async fn send(&mut self, bytes: &[u8]) {
        let _ = self.writer.write_all(bytes).await;
    }

    /// Send one JSON value as a line
    pub async fn send_json(&mut self, value: &serde_json::Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.send(line.as_bytes()).await;
    }
}
