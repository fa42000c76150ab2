use super::packet::Packet;
use super::step::{NextAction, StepRef};
use crate::util::Error;
use std::sync::Arc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Observable state of a [`Fiber`], surfaced via `snapshot()`.
#[derive(Debug, Clone, PartialEq)]
pub enum FiberStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed(String),
    Cancelled,
}

impl FiberStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, FiberStatus::Completed | FiberStatus::Failed(_) | FiberStatus::Cancelled)
    }
}

/// How a fiber's run loop ended. Distinct from [`FiberStatus`] so the terminal
/// callback gets a `Result`-shaped value instead of a string.
#[derive(Debug)]
pub enum FiberOutcome {
    Completed,
    Failed(Error),
    Cancelled,
}

struct Inner {
    status: FiberStatus,
    /// Invoked in LIFO order once `status` becomes terminal. Guarded by the
    /// same lock as `status` so a callback
    /// registered concurrently with termination is never lost: it either
    /// lands in the vec before the drain, or sees terminal status and runs
    /// immediately.
    exit_callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

/// A cooperative execution context that runs a step chain to completion,
/// mapped onto a native tokio task rather than a hand-rolled scheduler.
/// Suspension is expressed as awaiting inside the run loop;
/// cancellation is a [`CancellationToken`] raced against every suspend point.
pub struct Fiber {
    pub key: String,
    chain: StepRef,
    cancel_token: CancellationToken,
    inner: Mutex<Inner>,
}

enum Op {
    RunStep(StepRef),
    Resolved(NextAction),
}

impl Fiber {
    pub fn new(key: impl Into<String>, chain: StepRef) -> Arc<Fiber> {
        Arc::new(Fiber {
            key: key.into(),
            chain,
            cancel_token: CancellationToken::new(),
            inner: Mutex::new(Inner {
                status: FiberStatus::Pending,
                exit_callbacks: Vec::new(),
            }),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn status(&self) -> FiberStatus {
        self.inner.lock().expect("fiber lock poisoned").status.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Registers cleanup invoked once the fiber reaches a terminal state. If
    /// the fiber is already terminal, `cb` runs synchronously instead of being
    /// queued, so callers can never race a completion they missed.
    pub fn push_exit_callback(&self, cb: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().expect("fiber lock poisoned");
        if inner.status.is_terminal() {
            drop(inner);
            cb();
        } else {
            inner.exit_callbacks.push(Box::new(cb));
        }
    }

    /// Cancels the fiber and registers an exit callback. Returns `true` when `on_cancelled` was
    /// invoked synchronously here (the fiber was not mid-step); returns
    /// `false` when the fiber is running and the callback has instead been
    /// queued for the next step boundary via the exit-callback stack.
    pub fn cancel_and_exit_callback(&self, on_cancelled: impl FnOnce() + Send + 'static) -> bool {
        self.cancel_token.cancel();
        let mut inner = self.inner.lock().expect("fiber lock poisoned");
        match inner.status {
            FiberStatus::Suspended | FiberStatus::Pending => {
                drop(inner);
                on_cancelled();
                true
            }
            FiberStatus::Running => {
                inner.exit_callbacks.push(Box::new(on_cancelled));
                false
            }
            FiberStatus::Completed | FiberStatus::Failed(_) | FiberStatus::Cancelled => {
                drop(inner);
                on_cancelled();
                true
            }
        }
    }

    /// Runs the chain to completion or cancellation, then invokes `on_terminal`
    /// with the outcome exactly once. `permits` bounds concurrently *running*
    /// steps across the whole Engine; it is acquired fresh for each step and
    /// released before a suspend or delay, so a fiber parked on a slow watch
    /// event holds no worker slot.
    pub async fn run(
        self: Arc<Self>,
        mut packet: Packet,
        permits: Arc<tokio::sync::Semaphore>,
        on_terminal: impl FnOnce(FiberOutcome) + Send + 'static,
    ) {
        let outcome = self.clone().run_loop(&mut packet, &permits).await;

        let callbacks = {
            let mut inner = self.inner.lock().expect("fiber lock poisoned");
            inner.status = match &outcome {
                FiberOutcome::Completed => FiberStatus::Completed,
                FiberOutcome::Failed(e) => FiberStatus::Failed(e.to_string()),
                FiberOutcome::Cancelled => FiberStatus::Cancelled,
            };
            std::mem::take(&mut inner.exit_callbacks)
        };
        for cb in callbacks.into_iter().rev() {
            cb();
        }

        on_terminal(outcome);
    }

    async fn run_loop(self: Arc<Self>, packet: &mut Packet, permits: &Arc<tokio::sync::Semaphore>) -> FiberOutcome {
        let mut op = Op::RunStep(self.chain.clone());
        loop {
            if self.cancel_token.is_cancelled() {
                return FiberOutcome::Cancelled;
            }
            let action = match op {
                Op::RunStep(step) => {
                    self.inner.lock().expect("fiber lock poisoned").status = FiberStatus::Running;
                    let permit = permits.acquire().await.expect("engine semaphore closed");
                    let action = step.run(packet).await;
                    drop(permit);
                    action
                }
                Op::Resolved(action) => action,
            };
            match action {
                NextAction::Advance(next) => op = Op::RunStep(next),
                NextAction::Terminate => return FiberOutcome::Completed,
                NextAction::Throw(e) => return FiberOutcome::Failed(e),
                NextAction::Delay { step, after } => {
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => return FiberOutcome::Cancelled,
                        _ = tokio::time::sleep(after) => op = Op::RunStep(step),
                    }
                }
                NextAction::Suspend(fut) => {
                    self.inner.lock().expect("fiber lock poisoned").status = FiberStatus::Suspended;
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => return FiberOutcome::Cancelled,
                        resolved = fut => op = Op::Resolved(resolved),
                    }
                }
            }
        }
    }
}
