//! Handles to launched nodes.
//!
//! Processes and function tasks look the same from above: `wait()` for the
//! exit, `kill(signal)` to stop them, `terminate(grace)` to escalate from a
//! polite stop to a forced one. The exit is published once through a
//! `watch` channel by a small waiter task, so any number of callers can wait
//! while another sends signals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use pipewright_types::BROKEN_PIPE_STATUS;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// How a node finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeExit {
    /// Raw status; 128 + signal for signal deaths.
    pub status: i32,
    pub signal: Option<i32>,
    /// Stopped because its consumer went away.
    pub broken_pipe: bool,
}

impl NodeExit {
    pub fn code(status: i32) -> Self {
        Self {
            status,
            signal: None,
            broken_pipe: false,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            status: 128 + signal,
            signal: Some(signal),
            broken_pipe: signal == Signal::SIGPIPE as i32,
        }
    }

    /// An in-process node whose write hit a closed consumer.
    pub fn broken_pipe() -> Self {
        Self {
            status: BROKEN_PIPE_STATUS,
            signal: None,
            broken_pipe: true,
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Receiver side of a node's exit slot.
pub(crate) type ExitSlot = watch::Receiver<Option<NodeExit>>;

pub(crate) fn exit_slot() -> (watch::Sender<Option<NodeExit>>, ExitSlot) {
    watch::channel(None)
}

async fn wait_slot(slot: &ExitSlot) -> NodeExit {
    let mut rx = slot.clone();
    match rx.wait_for(Option::is_some).await {
        Ok(exit) => exit.unwrap_or(NodeExit::code(1)),
        // Waiter vanished without reporting.
        Err(_) => NodeExit::code(1),
    }
}

/// Handle to an external process running in its own process group.
#[derive(Debug)]
pub struct ProcessHandle {
    identity: String,
    pid: Option<u32>,
    exit: ExitSlot,
    killed: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub(crate) fn new(identity: String, pid: Option<u32>, exit: ExitSlot) -> Self {
        Self {
            identity,
            pid,
            exit,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&self, signal: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        if self.exit.borrow().is_some() {
            return;
        }
        self.killed.store(true, Ordering::Release);
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(identity = %self.identity, signal = ?signal, "killpg failed: {}", e),
        }
    }
}

/// Handle to an in-process function task.
#[derive(Debug)]
pub struct FunctionHandle {
    identity: String,
    cancel: CancellationToken,
    abort: AbortHandle,
    exit: ExitSlot,
    killed: Arc<AtomicBool>,
}

impl FunctionHandle {
    pub(crate) fn new(
        identity: String,
        cancel: CancellationToken,
        abort: AbortHandle,
        exit: ExitSlot,
    ) -> Self {
        Self {
            identity,
            cancel,
            abort,
            exit,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `SIGKILL` aborts the task; anything else cancels it cooperatively.
    fn kill(&self, signal: Signal) {
        if self.exit.borrow().is_some() {
            return;
        }
        self.killed.store(true, Ordering::Release);
        if signal == Signal::SIGKILL {
            self.abort.abort();
        } else {
            self.cancel.cancel();
        }
    }
}

/// A launched node.
#[derive(Debug)]
pub enum Handle {
    Process(ProcessHandle),
    Function(FunctionHandle),
}

impl Handle {
    pub fn identity(&self) -> &str {
        match self {
            Handle::Process(h) => &h.identity,
            Handle::Function(h) => &h.identity,
        }
    }

    fn slot(&self) -> &ExitSlot {
        match self {
            Handle::Process(h) => &h.exit,
            Handle::Function(h) => &h.exit,
        }
    }

    /// Wait for the node to finish.
    pub async fn wait(&self) -> NodeExit {
        wait_slot(self.slot()).await
    }

    /// The exit, if the node already finished.
    pub fn try_exit(&self) -> Option<NodeExit> {
        *self.slot().borrow()
    }

    /// Send `signal` (processes: to the whole process group).
    pub fn kill(&self, signal: Signal) {
        match self {
            Handle::Process(h) => h.kill(signal),
            Handle::Function(h) => h.kill(signal),
        }
    }

    /// True if the engine ever signalled this node.
    pub fn was_killed(&self) -> bool {
        match self {
            Handle::Process(h) => h.killed.load(Ordering::Acquire),
            Handle::Function(h) => h.killed.load(Ordering::Acquire),
        }
    }

    /// `SIGTERM`, then `SIGKILL` if the node is still alive after `grace`.
    #[tracing::instrument(level = "debug", skip(self), fields(identity = %self.identity()))]
    pub async fn terminate(&self, grace: Duration) -> NodeExit {
        if let Some(exit) = self.try_exit() {
            return exit;
        }

        self.kill(Signal::SIGTERM);
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(
                    identity = %self.identity(),
                    grace_ms = grace.as_millis() as u64,
                    "still running after grace period, sending SIGKILL"
                );
                self.kill(Signal::SIGKILL);
                self.wait().await
            }
        }
    }
}
