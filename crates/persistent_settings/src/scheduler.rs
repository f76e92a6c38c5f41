//! Deferred write-back.
//!
//! [`WriteBackState`] decides *when* pending settings are flushed;
//! [`DebouncedTask`] is the timer thread that drives it.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use crate::errors::Result;

/// Write-back progress of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteBackState {
    /// Nothing pending.
    #[default]
    Idle,
    /// Changes pending, waiting for a quiet period.
    Debouncing,
    /// Quiet period over; flush on the next idle tick.
    PendingFlush,
}

impl WriteBackState {
    /// A setting changed. A flush that is already due stays due.
    pub fn on_change(self) -> Self {
        match self {
            WriteBackState::Idle | WriteBackState::Debouncing => WriteBackState::Debouncing,
            WriteBackState::PendingFlush => WriteBackState::PendingFlush,
        }
    }

    /// The debounce timer elapsed. While a foreground operation runs the
    /// state is kept and the timer keeps ticking.
    pub fn on_timer_elapsed(self, busy: bool) -> Self {
        match self {
            WriteBackState::Debouncing if !busy => WriteBackState::PendingFlush,
            other => other,
        }
    }

    /// The host is idle. Returns the next state and whether to flush now.
    pub fn on_idle(self, busy: bool) -> (Self, bool) {
        match self {
            WriteBackState::PendingFlush if !busy => (WriteBackState::Idle, true),
            other => (other, false),
        }
    }

    /// Whether the timer should keep running in this state.
    pub fn timer_running(self) -> bool {
        self == WriteBackState::Debouncing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Fires after every quiet period until the handler says `Done`.
    Periodic,
    /// Fires once per trigger.
    OneShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Rearm,
    Done,
}

enum Command {
    Trigger,
    Cancel,
    Shutdown,
}

/// A named background thread that calls its handler once `delay` has passed
/// without a new [`trigger`](DebouncedTask::trigger).
pub struct DebouncedTask {
    name: String,
    sender: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl DebouncedTask {
    pub fn spawn<F>(name: impl Into<String>, delay: Duration, mode: TaskMode, on_fire: F) -> Result<Self>
    where
        F: FnMut() -> TaskOutcome + Send + 'static,
    {
        let name = name.into();
        let (sender, receiver) = channel::unbounded::<Command>();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut on_fire = on_fire;
                let mut armed = false;
                loop {
                    let command = if armed {
                        match receiver.recv_timeout(delay) {
                            Ok(command) => Some(command),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    } else {
                        match receiver.recv() {
                            Ok(command) => Some(command),
                            Err(_) => break,
                        }
                    };

                    match command {
                        Some(Command::Trigger) => armed = true,
                        Some(Command::Cancel) => armed = false,
                        Some(Command::Shutdown) => break,
                        None => {
                            trace!(task = %thread_name, "Debounced task fired");
                            armed = matches!(
                                (mode, on_fire()),
                                (TaskMode::Periodic, TaskOutcome::Rearm)
                            );
                        }
                    }
                }
                debug!(task = %thread_name, "Debounced task stopped");
            })?;

        Ok(Self {
            name,
            sender,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the countdown, or restarts it when already running.
    pub fn trigger(&self) {
        if self.sender.send(Command::Trigger).is_err() {
            warn!(task = %self.name, "Debounced task is no longer running");
        }
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(Command::Cancel);
    }
}

impl Drop for DebouncedTask {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            // Dropped from its own handler: the thread ends on its own.
            if handle.thread().id() != thread::current().id() {
                if handle.join().is_err() {
                    warn!(task = %self.name, "Debounced task panicked");
                }
            }
        }
    }
}
