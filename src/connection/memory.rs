//! In-process loopback connection
//!
//! Follows PostgreSQL's LISTEN/NOTIFY rules closely enough to drive the whole
//! multiplexer without a database: a NOTIFY is delivered back to this
//! connection only if it is LISTENing on the channel (including its own
//! NOTIFYs), in the order issued. The [`MemoryConnectionHandle`] stays with
//! the test and exposes the command log plus fault injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{ConnectionCommand, NotifyConnection};
use crate::error::{RelayError, Result};
use crate::events::RawNotification;

#[derive(Debug, Default)]
struct MemoryState {
    listening: HashSet<String>,
    inbox: VecDeque<RawNotification>,
    commands: Vec<ConnectionCommand>,
    fail_next_command: bool,
    severed: bool,
    closed: bool,
}

/// Observer and fault injector for a [`MemoryConnection`]
#[derive(Debug, Clone, Default)]
pub struct MemoryConnectionHandle {
    state: Arc<Mutex<MemoryState>>,
    readable: Arc<Notify>,
}

/// Loopback implementation of [`NotifyConnection`]
#[derive(Debug)]
pub struct MemoryConnection {
    handle: MemoryConnectionHandle,
    command_latency: Option<Duration>,
}

impl MemoryConnection {
    /// Create a connection and the handle observing it
    pub fn new() -> (Self, MemoryConnectionHandle) {
        let handle = MemoryConnectionHandle::default();
        (
            Self {
                handle: handle.clone(),
                command_latency: None,
            },
            handle,
        )
    }

    /// Make every command take at least `latency`, like a network round trip
    pub fn with_command_latency(mut self, latency: Duration) -> Self {
        self.command_latency = Some(latency);
        self
    }
}

#[async_trait]
impl NotifyConnection for MemoryConnection {
    async fn execute(&mut self, command: &ConnectionCommand) -> Result<()> {
        if let Some(latency) = self.command_latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.handle.state.lock();
        if state.closed {
            return Err(RelayError::ConnectionClosed);
        }
        if state.severed {
            return Err(RelayError::connection_failure("broken pipe"));
        }
        if std::mem::take(&mut state.fail_next_command) {
            return Err(RelayError::connection_failure(
                "server closed the connection unexpectedly",
            ));
        }

        state.commands.push(command.clone());
        match command {
            ConnectionCommand::Listen { channel } => {
                state.listening.insert(channel.clone());
            }
            ConnectionCommand::Unlisten { channel } => {
                state.listening.remove(channel);
            }
            ConnectionCommand::Notify { channel, payload } => {
                if state.listening.contains(channel) {
                    state
                        .inbox
                        .push_back(RawNotification::new(channel.clone(), payload.clone()));
                    self.handle.readable.notify_one();
                }
            }
        }
        Ok(())
    }

    async fn wait_readable(&mut self) -> Result<()> {
        loop {
            let readable = self.handle.readable.notified();
            {
                let state = self.handle.state.lock();
                if state.severed {
                    return Err(RelayError::connection_failure("connection reset by peer"));
                }
                if !state.inbox.is_empty() {
                    return Ok(());
                }
            }
            readable.await;
        }
    }

    fn drain_available(&mut self, out: &mut VecDeque<RawNotification>) -> Result<usize> {
        let mut state = self.handle.state.lock();
        if state.severed {
            return Err(RelayError::connection_failure("connection reset by peer"));
        }
        let drained = state.inbox.len();
        out.extend(state.inbox.drain(..));
        Ok(drained)
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.handle.state.lock();
        state.closed = true;
        state.listening.clear();
        state.inbox.clear();
        Ok(())
    }
}

impl MemoryConnectionHandle {
    /// Deliver a notification as if another writer had issued NOTIFY
    ///
    /// Returns `false` when the connection is not listening on `channel`,
    /// in which case the notification is discarded like PostgreSQL would.
    pub fn inject(&self, channel: &str, payload: &str) -> bool {
        let mut state = self.state.lock();
        if !state.listening.contains(channel) {
            return false;
        }
        state
            .inbox
            .push_back(RawNotification::new(channel, payload));
        self.readable.notify_one();
        true
    }

    /// Simulate a dropped socket: every later operation fails
    pub fn sever(&self) {
        self.state.lock().severed = true;
        self.readable.notify_one();
    }

    /// Make the next command fail with a connection-level error
    pub fn fail_next_command(&self) {
        self.state.lock().fail_next_command = true;
    }

    /// Every command executed successfully, in order
    pub fn commands(&self) -> Vec<ConnectionCommand> {
        self.state.lock().commands.clone()
    }

    pub fn listen_count(&self, channel: &str) -> usize {
        self.count(|c| matches!(c, ConnectionCommand::Listen { channel: ch } if ch == channel))
    }

    pub fn unlisten_count(&self, channel: &str) -> usize {
        self.count(|c| matches!(c, ConnectionCommand::Unlisten { channel: ch } if ch == channel))
    }

    pub fn notify_count(&self) -> usize {
        self.count(|c| matches!(c, ConnectionCommand::Notify { .. }))
    }

    fn count(&self, predicate: impl Fn(&ConnectionCommand) -> bool) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| predicate(c))
            .count()
    }

    pub fn is_listening(&self, channel: &str) -> bool {
        self.state.lock().listening.contains(channel)
    }

    pub fn listening_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.state.lock().listening.iter().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
