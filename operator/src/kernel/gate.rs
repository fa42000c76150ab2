use super::engine::Engine;
use super::fiber::{Fiber, FiberOutcome};
use super::packet::Packet;
use super::step::{NextAction, Step, StepRef};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Observes the previously-installed fiber for a key (if any), cancels it,
/// and suspends until its terminal callback fires before resuming the new
/// chain. Guarantees the new fiber never touches shared remote state
/// until the old one's effects have settled.
struct WaitForOldFiber {
    old: Arc<Fiber>,
    next: StepRef,
}

#[async_trait]
impl Step for WaitForOldFiber {
    async fn run(&self, _packet: &mut Packet) -> NextAction {
        if self.old.is_terminal() {
            return NextAction::Advance(self.next.clone());
        }
        let old = self.old.clone();
        let next = self.next.clone();
        NextAction::suspend_on(async move {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let tx = Mutex::new(Some(tx));
            old.push_exit_callback(move || {
                if let Some(tx) = tx.lock().expect("oneshot guard poisoned").take() {
                    let _ = tx.send(());
                }
            });
            let _ = rx.await;
            NextAction::Advance(next)
        })
    }

    fn name(&self) -> &str {
        "wait-for-old-fiber"
    }
}

/// Keyed single-flight: at most one fiber per key runs at a time. All three entry points share
/// `start_common`; they differ only in the precondition checked while holding
/// the map lock, which keeps the check-then-install atomic.
pub struct FiberGate {
    engine: Arc<Engine>,
    current: Mutex<HashMap<String, Arc<Fiber>>>,
}

enum Precondition {
    Always,
    /// Spec's "sentinel placeholder fiber" for the idle case collapses to
    /// `expected: None` here — `Option` already models "nothing currently
    /// holds the key" without needing a dummy fiber object.
    Expect(Option<Arc<Fiber>>),
}

impl FiberGate {
    pub fn new(engine: Arc<Engine>) -> Arc<FiberGate> {
        Arc::new(FiberGate {
            engine,
            current: Mutex::new(HashMap::new()),
        })
    }

    /// Always start: cancels the previous fiber for `key` (if any) and
    /// installs the new one.
    pub fn start(
        self: &Arc<Self>,
        key: impl Into<String>,
        chain: StepRef,
        packet: Packet,
        on_terminal: impl FnOnce(FiberOutcome) + Send + 'static,
    ) -> Arc<Fiber> {
        self.start_common(key.into(), chain, packet, on_terminal, Precondition::Always)
            .expect("Precondition::Always never declines to start")
    }

    /// Start only if idle: no-op if another fiber currently owns `key`.
    pub fn start_if_no_current(
        self: &Arc<Self>,
        key: impl Into<String>,
        chain: StepRef,
        packet: Packet,
        on_terminal: impl FnOnce(FiberOutcome) + Send + 'static,
    ) -> Option<Arc<Fiber>> {
        self.start_common(key.into(), chain, packet, on_terminal, Precondition::Expect(None))
    }

    /// CAS variant: installs only if `key`'s current fiber is exactly `expected`.
    pub fn start_if_last_matches(
        self: &Arc<Self>,
        key: impl Into<String>,
        expected: Arc<Fiber>,
        chain: StepRef,
        packet: Packet,
        on_terminal: impl FnOnce(FiberOutcome) + Send + 'static,
    ) -> Option<Arc<Fiber>> {
        self.start_common(
            key.into(),
            chain,
            packet,
            on_terminal,
            Precondition::Expect(Some(expected)),
        )
    }

    fn start_common(
        self: &Arc<Self>,
        key: String,
        chain: StepRef,
        packet: Packet,
        on_terminal: impl FnOnce(FiberOutcome) + Send + 'static,
        precondition: Precondition,
    ) -> Option<Arc<Fiber>> {
        let mut guard = self.current.lock().expect("gate map lock poisoned");
        let predecessor = guard.get(&key).cloned();

        if let Precondition::Expect(expected) = &precondition {
            let matches = match (expected, &predecessor) {
                (None, None) => true,
                (Some(e), Some(p)) => Arc::ptr_eq(e, p),
                _ => false,
            };
            if !matches {
                return None;
            }
        }

        let wrapped: StepRef = match &predecessor {
            Some(old) => Arc::new(WaitForOldFiber { old: old.clone(), next: chain }),
            None => chain,
        };
        let fiber = Fiber::new(key.clone(), wrapped);
        guard.insert(key.clone(), fiber.clone());
        drop(guard);

        if let Some(old) = &predecessor {
            old.cancel_and_exit_callback(|| {});
        }

        let gate = self.clone();
        let fiber_for_removal = fiber.clone();
        self.engine.submit(fiber.clone(), packet, move |outcome| {
            gate.remove(&key, &fiber_for_removal);
            on_terminal(outcome);
        });

        Some(fiber)
    }

    /// Evicts `key` only if it still points at `fiber`, so a late-completing
    /// cancelled fiber can never clobber its successor's entry.
    fn remove(&self, key: &str, fiber: &Arc<Fiber>) {
        let mut guard = self.current.lock().expect("gate map lock poisoned");
        if let Some(current) = guard.get(key) {
            if Arc::ptr_eq(current, fiber) {
                guard.remove(key);
            }
        }
    }

    pub fn current(&self, key: &str) -> Option<Arc<Fiber>> {
        self.current.lock().expect("gate map lock poisoned").get(key).cloned()
    }

    /// `snapshot() → map[key → fiberStatus]`, minus the status itself —
    /// callers read `Fiber::status()` per entry.
    pub fn keys(&self) -> Vec<String> {
        self.current.lock().expect("gate map lock poisoned").keys().cloned().collect()
    }
}
