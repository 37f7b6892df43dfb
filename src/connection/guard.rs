//! # Connection guard
//!
//! Serializes every use of the shared connection. Two kinds of work compete
//! for it:
//!
//! - the pump, parked in [`ConnectionGuard::wait_readable`] waiting for the
//!   socket to become readable
//! - commands (LISTEN, UNLISTEN, NOTIFY) run through
//!   [`ConnectionGuard::with_exclusive_access`]
//!
//! A command announces itself before queueing on the lock. A parked pump
//! sees the announcement, abandons its wait and returns
//! [`Readiness::Suspended`], which releases the lock to the command. The lock
//! is FIFO, so the pump's next wait queues behind the command and resumes
//! once the command and its drain are done.
//!
//! Notifications that arrive while a command holds the connection are
//! drained into the guard's buffer right after the command, and the next
//! readiness wait reports them immediately.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, instrument};

use super::{ConnectionCommand, ConnectionState, DynConnection};
use crate::error::{RelayError, Result};
use crate::events::RawNotification;

/// Outcome of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Notifications are buffered and ready to take
    Ready,
    /// Nothing arrived within the timeout
    TimedOut,
    /// A command needs the connection; wait again
    Suspended,
}

/// Counters describing guard activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardStats {
    pub commands_executed: u64,
    pub command_failures: u64,
    pub readiness_waits: u64,
    pub timeouts: u64,
    pub suspensions: u64,
    pub notifications_drained: u64,
}

#[derive(Debug, Default)]
struct GuardCounters {
    commands_executed: AtomicU64,
    command_failures: AtomicU64,
    readiness_waits: AtomicU64,
    timeouts: AtomicU64,
    suspensions: AtomicU64,
    notifications_drained: AtomicU64,
}

/// Exclusive owner of the shared LISTEN/NOTIFY connection
pub struct ConnectionGuard {
    connection: Mutex<Box<DynConnection>>,
    state: watch::Sender<ConnectionState>,
    waiting_commands: AtomicUsize,
    suspend: Notify,
    buffered: parking_lot::Mutex<VecDeque<RawNotification>>,
    counters: GuardCounters,
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("state", &self.state())
            .field("waiting_commands", &self.waiting_commands.load(Ordering::Relaxed))
            .field("buffered", &self.buffered.lock().len())
            .finish()
    }
}

/// Registration of a command queued for the connection
struct WaitingCommand<'a> {
    guard: &'a ConnectionGuard,
}

impl<'a> WaitingCommand<'a> {
    fn register(guard: &'a ConnectionGuard) -> Self {
        guard.waiting_commands.fetch_add(1, Ordering::AcqRel);
        guard.suspend.notify_one();
        Self { guard }
    }
}

impl Drop for WaitingCommand<'_> {
    fn drop(&mut self) {
        self.guard.waiting_commands.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConnectionGuard {
    pub fn new(connection: Box<DynConnection>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            connection: Mutex::new(connection),
            state,
            waiting_commands: AtomicUsize::new(0),
            suspend: Notify::new(),
            buffered: parking_lot::Mutex::new(VecDeque::new()),
            counters: GuardCounters::default(),
        }
    }

    /// Run `op` with sole access to the connection
    ///
    /// A parked readiness wait is suspended first. Once `op` finishes, every
    /// notification the driver already holds is moved into the buffer. A
    /// connection-level failure closes the guard for good.
    ///
    /// ```rust,no_run
    /// # use notify_relay::connection::{ConnectionCommand, ConnectionGuard};
    /// # async fn example(guard: &ConnectionGuard) -> notify_relay::error::Result<()> {
    /// guard
    ///     .with_exclusive_access(|conn| {
    ///         Box::pin(async move { conn.execute(&ConnectionCommand::listen("orders")).await })
    ///     })
    ///     .await
    /// # }
    /// ```
    pub async fn with_exclusive_access<R, F>(&self, op: F) -> Result<R>
    where
        R: Send,
        F: for<'c> FnOnce(&'c mut DynConnection) -> BoxFuture<'c, Result<R>> + Send,
    {
        self.ensure_open()?;

        let waiting = WaitingCommand::register(self);
        let mut connection = self.connection.lock().await;
        drop(waiting);
        self.ensure_open()?;

        self.set_state(ConnectionState::CommandExecuting);
        let result = op(&mut **connection).await;

        match &result {
            Ok(_) => {
                self.counters
                    .commands_executed
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.command_failures.fetch_add(1, Ordering::Relaxed);
                if e.is_connection_fatal() {
                    self.mark_closed(e);
                    return result;
                }
            }
        }

        self.drain_into_buffer(&mut **connection)?;
        self.set_state(ConnectionState::IdleListening);
        result
    }

    /// Run one control command
    #[instrument(skip(self, command), fields(kind = command.kind(), channel = command.channel()))]
    pub async fn execute(&self, command: ConnectionCommand) -> Result<()> {
        self.with_exclusive_access(move |conn| Box::pin(async move { conn.execute(&command).await }))
            .await
    }

    /// Wait until notifications are buffered, the timeout expires, or a
    /// command asks for the connection
    pub async fn wait_readable(&self, timeout: Duration) -> Result<Readiness> {
        self.ensure_open()?;
        let mut connection = self.connection.lock().await;
        self.ensure_open()?;

        // Buffered notifications win over a queued command, or a steady
        // stream of commands would starve dispatch
        if !self.buffered.lock().is_empty() {
            return Ok(Readiness::Ready);
        }
        if self.waiting_commands.load(Ordering::Acquire) > 0 {
            return Ok(self.suspended());
        }

        self.set_state(ConnectionState::IdleListening);
        self.counters.readiness_waits.fetch_add(1, Ordering::Relaxed);

        let outcome = tokio::select! {
            biased;
            _ = self.suspend.notified() => return Ok(self.suspended()),
            outcome = tokio::time::timeout(timeout, connection.wait_readable()) => outcome,
        };

        match outcome {
            Err(_elapsed) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Ok(Readiness::TimedOut)
            }
            Ok(Err(e)) => {
                self.mark_closed(&e);
                Err(e)
            }
            Ok(Ok(())) => {
                self.drain_into_buffer(&mut **connection)?;
                Ok(Readiness::Ready)
            }
        }
    }

    /// Hand every buffered notification to the caller, oldest first
    pub fn take_buffered(&self) -> VecDeque<RawNotification> {
        std::mem::take(&mut *self.buffered.lock())
    }

    /// Take the connection just long enough to drain what the driver holds
    ///
    /// Returns the number of notifications now buffered.
    pub async fn check_for_notifications(&self) -> Result<usize> {
        self.ensure_open()?;
        let waiting = WaitingCommand::register(self);
        let mut connection = self.connection.lock().await;
        drop(waiting);
        self.ensure_open()?;

        self.drain_into_buffer(&mut **connection)?;
        Ok(self.buffered.lock().len())
    }

    /// Close the connection and mark the guard closed
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let waiting = WaitingCommand::register(self);
        let mut connection = self.connection.lock().await;
        drop(waiting);
        if self.is_closed() {
            return Ok(());
        }

        info!("Closing shared notification connection");
        let result = connection.close().await;
        self.set_state(ConnectionState::Closed);
        result
    }

    /// Resolve once the guard is closed, for whatever reason
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            commands_executed: self.counters.commands_executed.load(Ordering::Relaxed),
            command_failures: self.counters.command_failures.load(Ordering::Relaxed),
            readiness_waits: self.counters.readiness_waits.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            suspensions: self.counters.suspensions.load(Ordering::Relaxed),
            notifications_drained: self.counters.notifications_drained.load(Ordering::Relaxed),
        }
    }

    fn drain_into_buffer(&self, connection: &mut DynConnection) -> Result<()> {
        let drained = {
            let mut buffered = self.buffered.lock();
            connection.drain_available(&mut buffered)
        };
        match drained {
            Ok(count) => {
                if count > 0 {
                    debug!(count, "Drained notifications into buffer");
                    self.counters
                        .notifications_drained
                        .fetch_add(count as u64, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(e) => {
                if e.is_connection_fatal() {
                    self.mark_closed(&e);
                }
                Err(e)
            }
        }
    }

    fn suspended(&self) -> Readiness {
        self.counters.suspensions.fetch_add(1, Ordering::Relaxed);
        Readiness::Suspended
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(RelayError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            // Closed is terminal
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn mark_closed(&self, cause: &RelayError) {
        if !self.is_closed() {
            error!(error = %cause, "Shared connection failed; closing");
        }
        self.set_state(ConnectionState::Closed);
    }
}
