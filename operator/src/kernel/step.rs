use super::packet::Packet;
use crate::util::Error;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// A unit of work in a step chain. Stateless with respect to the fiber running
/// it — all mutable state lives in the [`Packet`].
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, packet: &mut Packet) -> NextAction;

    /// Human-readable name for logging and `snapshot()` observability.
    fn name(&self) -> &str;
}

pub type StepRef = Arc<dyn Step>;

/// What a [`Step`] asks the fiber to do next.
pub enum NextAction {
    /// Continue immediately with `next`.
    Advance(StepRef),
    /// Park until `resume` completes, then advance with whatever [`NextAction`]
    /// it yields. `resume` is raced against the fiber's cancellation token;
    /// losing that race invokes the fiber's cancellation callback instead of
    /// ever being polled to completion.
    Suspend(BoxFuture<'static, NextAction>),
    /// Reschedule `step` after `after` on the Engine's timer.
    Delay { step: StepRef, after: Duration },
    /// Normal completion of the fiber.
    Terminate,
    /// Propagate `cause` to the fiber's failure callback.
    Throw(Error),
}

impl NextAction {
    pub fn suspend_on(fut: impl std::future::Future<Output = NextAction> + Send + 'static) -> Self {
        NextAction::Suspend(Box::pin(fut))
    }
}

/// Drives `step` and whatever it chains to, to completion, without a [`Fiber`]
/// or engine of its own. Used by the Roll Coordinator to run a
/// deferred cycle to its end inside one of its own suspend points — the outer
/// fiber's cancellation token still governs that point, so this never needs
/// its own cancellation handling.
///
/// [`Fiber`]: super::fiber::Fiber
pub async fn run_chain(mut step: StepRef, packet: &mut Packet) -> Result<(), Error> {
    loop {
        let mut action = step.run(packet).await;
        loop {
            match action {
                NextAction::Advance(next) => {
                    step = next;
                    break;
                }
                NextAction::Terminate => return Ok(()),
                NextAction::Throw(e) => return Err(e),
                NextAction::Delay { step: next, after } => {
                    tokio::time::sleep(after).await;
                    step = next;
                    break;
                }
                NextAction::Suspend(fut) => action = fut.await,
            }
        }
    }
}
