//! Byte transports for the motion controller.
//!
//! The controller closes idle sockets, so [`TcpTransport`] opens a fresh
//! connection for every exchange: connect, write the command, read the reply
//! until the expected number of `:` acknowledgements has arrived, close.

use super::protocol::{Command, ReplyShape};
use crate::error::{AppResult, BenchError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// One request/reply exchange with the controller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `command` and return the raw reply text.
    async fn exchange(&self, command: &Command) -> AppResult<String>;
}

/// Connection-per-exchange TCP link.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    io_timeout: Duration,
}

impl TcpTransport {
    /// Link to `address` (host:port); each connect, write and read is
    /// bounded by `io_timeout`.
    pub fn new(address: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            io_timeout,
        }
    }

    /// host:port this link connects to.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn read_reply(&self, stream: &mut TcpStream, shape: ReplyShape) -> AppResult<String> {
        let mut reply = Vec::with_capacity(32);
        let mut chunk = [0u8; 256];
        let mut colons = 0;
        while colons < shape.acks() {
            // Ack-only replies are read byte-exact so nothing of the next
            // reply is consumed.
            let want = match shape {
                ReplyShape::Acks(n) => (n - colons).min(chunk.len()),
                ReplyShape::Data { .. } => chunk.len(),
            };
            let n = timeout(self.io_timeout, stream.read(&mut chunk[..want]))
                .await
                .map_err(|_| {
                    BenchError::Connection(format!(
                        "no reply from {} within {:?}",
                        self.address, self.io_timeout
                    ))
                })??;
            if n == 0 {
                return Err(BenchError::Connection(format!(
                    "{} closed the connection after {} reply bytes",
                    self.address,
                    reply.len()
                )));
            }
            let received = &chunk[..n];
            colons += received.iter().filter(|b| **b == b':').count();
            reply.extend_from_slice(received);
            if received.contains(&b'?') {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(&self, command: &Command) -> AppResult<String> {
        let mut stream = timeout(self.io_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                BenchError::Connection(format!("connect to {} timed out", self.address))
            })?
            .map_err(|e| BenchError::Connection(format!("connect to {}: {}", self.address, e)))?;
        stream.set_nodelay(true)?;

        let bytes = command.text.as_bytes();
        let written = timeout(self.io_timeout, stream.write(bytes))
            .await
            .map_err(|_| BenchError::Connection(format!("write to {} timed out", self.address)))??;
        if written == 0 {
            return Err(BenchError::Connection(format!(
                "nothing written to {}",
                self.address
            )));
        }
        if written < bytes.len() {
            timeout(self.io_timeout, stream.write_all(&bytes[written..]))
                .await
                .map_err(|_| {
                    BenchError::Connection(format!("write to {} timed out", self.address))
                })??;
        }
        trace!(command = %command.text, "sent");

        let reply = self.read_reply(&mut stream, command.reply).await?;
        debug!(command = %command.text, reply = %reply.trim(), "motion exchange");
        // Dropping the stream closes the connection.
        Ok(reply)
    }
}

/// Scripted transport for tests.
///
/// Ack-only commands are acknowledged automatically unless a reply was
/// scripted. Data commands need a scripted reply, either one-shot
/// ([`push_reply`](Self::push_reply), consumed in order) or sticky
/// ([`set_reply`](Self::set_reply)).
#[derive(Default)]
pub struct MockTransport {
    queued: Mutex<HashMap<String, VecDeque<String>>>,
    sticky: Mutex<HashMap<String, String>>,
    fail_next: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    /// No scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply once to `command`, after earlier pushes for it.
    pub fn push_reply(&self, command: &str, reply: &str) {
        self.queued
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    /// Reply to `command` whenever nothing is queued for it.
    pub fn set_reply(&self, command: &str, reply: &str) {
        self.sticky.lock().insert(command.to_string(), reply.to_string());
    }

    /// The next exchange fails with a connection error.
    pub fn fail_next(&self, reason: &str) {
        *self.fail_next.lock() = Some(reason.to_string());
    }

    /// Command texts in the order they were sent.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn exchange(&self, command: &Command) -> AppResult<String> {
        self.calls.lock().push(command.text.clone());
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(BenchError::Connection(reason));
        }
        if let Some(reply) = self
            .queued
            .lock()
            .get_mut(&command.text)
            .and_then(|q| q.pop_front())
        {
            return Ok(reply);
        }
        if let Some(reply) = self.sticky.lock().get(&command.text) {
            return Ok(reply.clone());
        }
        match command.reply {
            ReplyShape::Acks(n) => Ok(":".repeat(n)),
            ReplyShape::Data { .. } => Err(BenchError::Connection(format!(
                "no scripted reply for {:?}",
                command.text
            ))),
        }
    }
}
