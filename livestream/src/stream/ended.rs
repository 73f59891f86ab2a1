use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// `stop()` was called.
    Stopped,
    /// The upstream reached end of stream.
    UpstreamEnded,
    /// The upstream reader was closed or dropped.
    UpstreamClosed,
    UpstreamError(String),
    ProcessExited(Option<i32>),
    ProcessError(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::UpstreamEnded => f.write_str("upstream ended"),
            Self::UpstreamClosed => f.write_str("upstream closed"),
            Self::UpstreamError(e) => write!(f, "upstream error: {e}"),
            Self::ProcessExited(Some(code)) => write!(f, "process exited with code {code}"),
            Self::ProcessExited(None) => f.write_str("process terminated"),
            Self::ProcessError(e) => write!(f, "process error: {e}"),
        }
    }
}

/// Single-fire "ended" notification of a session.
///
/// Ending is two-phase: [`claim`](Self::claim) elects exactly one winner
/// among all competing end sources, the winner tears the session down and
/// then calls [`publish`](Self::publish). Observers only see the published
/// reason, so they are notified after teardown and exactly once.
pub struct EndedSignal {
    claimed: AtomicBool,
    reason: OnceLock<EndReason>,
    tx: broadcast::Sender<EndReason>,
}

impl EndedSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            claimed: AtomicBool::new(false),
            reason: OnceLock::new(),
            tx,
        }
    }

    /// Try to become the one source that ends the session.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Notify observers. Only the first call has any effect.
    pub fn publish(&self, reason: EndReason) {
        if self.reason.set(reason.clone()).is_ok() {
            // No subscribers is fine.
            let _ = self.tx.send(reason);
        }
    }

    pub fn reason(&self) -> Option<&EndReason> {
        self.reason.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndReason> {
        self.tx.subscribe()
    }

    /// Wait until the reason is published. Returns at once if it already was.
    pub async fn wait(&self) -> EndReason {
        let mut rx = self.subscribe();
        if let Some(reason) = self.reason() {
            return reason.clone();
        }
        match rx.recv().await {
            Ok(reason) => reason,
            // Lagged or closed: the value is set before anything is sent.
            Err(_) => self.reason().cloned().unwrap_or(EndReason::Stopped),
        }
    }
}

impl Default for EndedSignal {
    fn default() -> Self {
        Self::new()
    }
}
