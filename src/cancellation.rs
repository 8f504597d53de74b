//! Cancellation framework: CancellationToken + generation guard.
//! Each arming cycle gets a fresh generation so stale listeners, timers and
//! pipelines from an earlier cycle can recognise themselves and stand down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// One cancellation scope. Advancing it cancels everything handed out for
/// the previous generation and opens a fresh one.
pub struct TaskGeneration {
    root: RwLock<CancellationToken>,
    counter: Arc<AtomicU64>,
}

impl TaskGeneration {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(CancellationToken::new()),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cancel_and_advance(&self) -> GenerationGuard {
        let mut root = self.root.write();
        std::mem::replace(&mut *root, CancellationToken::new()).cancel();
        let generation = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        GenerationGuard::new(Arc::clone(&self.counter), generation, root.child_token())
    }

    /// Cancel the current generation but keep its number.
    pub fn cancel_all(&self) {
        self.root.read().cancel();
    }
}

impl Default for TaskGeneration {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to every task of one generation. A task whose guard is cancelled or
/// no longer current must drop its results.
#[derive(Clone)]
pub struct GenerationGuard {
    counter: Arc<AtomicU64>,
    generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    pub fn new(counter: Arc<AtomicU64>, generation: u64, token: CancellationToken) -> Self {
        Self {
            counter,
            generation,
            token,
        }
    }

    #[inline]
    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[inline]
    pub fn should_continue(&self) -> bool {
        self.is_current() && !self.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Per-alarm cancellation coordinator.
/// `listening` covers the trigger sources of an Armed session; `activation`
/// covers everything started by a trigger (voice alarm, evidence capture).
pub struct CancelCoordinator {
    pub listening: TaskGeneration,
    pub activation: TaskGeneration,
}

impl CancelCoordinator {
    pub fn new() -> Self {
        Self {
            listening: TaskGeneration::new(),
            activation: TaskGeneration::new(),
        }
    }

    /// Cancel both scopes. Used on disarm and auto-reset.
    pub fn cancel_all(&self) {
        self.listening.cancel_all();
        self.activation.cancel_all();
    }
}

impl Default for CancelCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
