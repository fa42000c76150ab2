use super::fiber::{Fiber, FiberOutcome};
use super::packet::Packet;
use super::step::StepRef;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded worker pool hosting fibers, plus timer facilities. Workers
/// are a counting [`Semaphore`](tokio::sync::Semaphore) rather than a fixed
/// thread pool: tokio's own scheduler already multiplexes tasks onto OS
/// threads, so the Engine only needs to cap *concurrently running* fibers.
pub struct Engine {
    permits: Arc<tokio::sync::Semaphore>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(workers: usize) -> Arc<Engine> {
        Arc::new(Engine {
            permits: Arc::new(tokio::sync::Semaphore::new(workers.max(1))),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_default_workers() -> Arc<Engine> {
        Self::new(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
    }

    pub fn create_fiber(self: &Arc<Self>, key: impl Into<String>, chain: StepRef) -> Arc<Fiber> {
        Fiber::new(key, chain)
    }

    /// Schedules `fiber` to run, invoking `on_terminal` exactly once when it
    /// finishes. The fiber acquires a worker permit itself for each step it
    /// runs and releases it across suspensions, so a fiber parked on a slow
    /// watch holds no slot here.
    pub fn submit(
        self: &Arc<Self>,
        fiber: Arc<Fiber>,
        packet: Packet,
        on_terminal: impl FnOnce(FiberOutcome) + Send + 'static,
    ) -> JoinHandle<()> {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            fiber.run(packet, permits, on_terminal).await;
        })
    }

    /// One-shot timer.
    pub fn schedule<F>(self: &Arc<Self>, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => { task.await; }
            }
        })
    }

    /// Repeating timer. `task` is invoked with the
    /// tick count starting at zero; the handle runs until the Engine shuts
    /// down.
    pub fn schedule_at_fixed_rate<Fut>(
        self: &Arc<Self>,
        initial_delay: Duration,
        period: Duration,
        mut task: impl FnMut(u64) -> Fut + Send + 'static,
    ) -> JoinHandle<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            let mut tick = 0u64;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        task(tick).await;
                        tick += 1;
                    }
                }
            }
        })
    }

    /// Cancels outstanding timers. Does not itself cancel in-flight fibers —
    /// that is `FiberGate`'s and the processor's responsibility.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
