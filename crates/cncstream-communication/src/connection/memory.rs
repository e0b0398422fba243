//! In-memory connection
//!
//! [`MemoryConnection::pair`] returns the engine side of the link and a
//! [`MemoryPeer`] that plays the firmware: it injects response lines and
//! records everything the engine wrote.

use super::Connection;
use cncstream_core::{ConnectionError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct Inbound {
    data: VecDeque<u8>,
    closed: bool,
    refuse_writes: bool,
}

struct Link {
    inbound: Mutex<Inbound>,
    readable: Condvar,
    writes: Mutex<Vec<Vec<u8>>>,
    write_count: watch::Sender<usize>,
}

impl Link {
    fn is_writable(&self) -> bool {
        let inbound = self.inbound.lock();
        !inbound.closed && !inbound.refuse_writes
    }

    fn shut(&self) {
        self.inbound.lock().closed = true;
        self.readable.notify_all();
        self.write_count.send_modify(|_| {});
    }
}

/// Engine half of an in-memory link
pub struct MemoryConnection {
    name: String,
    link: Arc<Link>,
    read_timeout: Duration,
}

/// Firmware half of an in-memory link
#[derive(Clone)]
pub struct MemoryPeer {
    link: Arc<Link>,
}

impl MemoryConnection {
    /// Create a connected pair
    pub fn pair() -> (MemoryConnection, MemoryPeer) {
        Self::named("memory")
    }

    /// Create a connected pair with the given connection name
    pub fn named(name: impl Into<String>) -> (MemoryConnection, MemoryPeer) {
        let (write_count, _) = watch::channel(0);
        let link = Arc::new(Link {
            inbound: Mutex::new(Inbound::default()),
            readable: Condvar::new(),
            writes: Mutex::new(Vec::new()),
            write_count,
        });
        (
            MemoryConnection {
                name: name.into(),
                link: link.clone(),
                read_timeout: Duration::from_millis(20),
            },
            MemoryPeer { link },
        )
    }
}

impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        if !self.link.is_writable() {
            return Err(ConnectionError::ConnectionLost {
                reason: "peer disconnected".to_string(),
            }
            .into());
        }
        self.link.writes.lock().push(data.to_vec());
        self.link.write_count.send_modify(|count| *count += 1);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = self.link.inbound.lock();
        if inbound.data.is_empty() && !inbound.closed {
            self.link
                .readable
                .wait_for(&mut inbound, self.read_timeout);
        }

        if !inbound.data.is_empty() {
            let n = buf.len().min(inbound.data.len());
            for (slot, byte) in buf.iter_mut().zip(inbound.data.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }

        if inbound.closed {
            return Err(ConnectionError::ConnectionLost {
                reason: "peer disconnected".to_string(),
            }
            .into());
        }
        Ok(0)
    }

    fn close(&self) -> Result<()> {
        self.link.shut();
        Ok(())
    }
}

impl MemoryPeer {
    /// Send one newline terminated line to the engine
    pub fn send_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.send_raw(&bytes);
    }

    /// Send raw bytes to the engine
    pub fn send_raw(&self, bytes: &[u8]) {
        self.link.inbound.lock().data.extend(bytes.iter().copied());
        self.link.readable.notify_all();
    }

    /// Drop the link; the engine's next read fails
    pub fn disconnect(&self) {
        self.link.shut();
    }

    /// Make every later engine write fail while reads keep working
    pub fn refuse_writes(&self) {
        self.link.inbound.lock().refuse_writes = true;
    }

    /// Every `write_all` call made by the engine, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.link.writes.lock().clone()
    }

    /// Newline terminated writes with the terminator removed
    pub fn written_lines(&self) -> Vec<String> {
        self.link
            .writes
            .lock()
            .iter()
            .filter_map(|w| w.strip_suffix(b"\n"))
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// True if the engine wrote exactly these bytes in one call
    pub fn wrote_bytes(&self, bytes: &[u8]) -> bool {
        self.link.writes.lock().iter().any(|w| w == bytes)
    }

    /// Wait until `predicate` holds for the written lines.
    ///
    /// Returns false on timeout.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&[String]) -> bool,
    {
        let mut changes = self.link.write_count.subscribe();
        let wait = async {
            loop {
                if predicate(&self.written_lines()) {
                    return true;
                }
                if changes.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Wait until at least `count` lines have been written
    pub async fn wait_for_lines(&self, count: usize, timeout: Duration) -> bool {
        self.wait_for(timeout, |lines| lines.len() >= count).await
    }
}
