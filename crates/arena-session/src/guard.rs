//! Fault-safety guard.
//!
//! Once a fault is injected it is recovered exactly once, whether the
//! session finishes normally, is aborted, unwinds from a panic, or the
//! process receives SIGINT/SIGTERM. Interrupts that arrive while a
//! [`CriticalSection`] is open are held back and delivered when the
//! outermost section closes.

use crate::problem::Problem;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// Process-wide gate used by the session engine and the signal handler.
pub static INTERRUPT_GATE: InterruptGate = InterruptGate::new(terminate_on_interrupt);

/// Recovery actions armed by live fault guards.
pub static CLEANUPS: CleanupRegistry = CleanupRegistry::new();

fn terminate_on_interrupt() {
    let fired = CLEANUPS.run_all();
    warn!(recovered = fired, "interrupted; armed fault recoveries ran, exiting");
    std::process::exit(INTERRUPT_EXIT_CODE);
}

/// Routes SIGINT/SIGTERM through [`INTERRUPT_GATE`].
pub fn install_interrupt_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        if INTERRUPT_GATE.note_interrupt() == InterruptDisposition::Deferred {
            warn!("interrupt received inside a critical section; deferring");
        }
    })
    .map_err(|e| anyhow!("failed to install interrupt handler: {}", e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptDisposition {
    Deferred,
    Delivered,
}

pub struct InterruptGate {
    depth: AtomicUsize,
    pending: AtomicBool,
    on_deliver: fn(),
}

impl InterruptGate {
    pub const fn new(on_deliver: fn()) -> Self {
        Self {
            depth: AtomicUsize::new(0),
            pending: AtomicBool::new(false),
            on_deliver,
        }
    }

    pub fn enter(&self) -> CriticalSection<'_> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        CriticalSection { gate: self }
    }

    /// Records an interrupt and delivers it unless a section is open.
    pub fn note_interrupt(&self) -> InterruptDisposition {
        self.pending.store(true, Ordering::SeqCst);
        if self.depth.load(Ordering::SeqCst) > 0 {
            return InterruptDisposition::Deferred;
        }
        // Whoever clears `pending` first delivers; a closing section may win the race.
        if self.pending.swap(false, Ordering::SeqCst) {
            (self.on_deliver)();
        }
        InterruptDisposition::Delivered
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// Scope during which interrupts are deferred. Sections nest.
#[must_use = "the section closes as soon as it is dropped"]
pub struct CriticalSection<'g> {
    gate: &'g InterruptGate,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        let previous = self.gate.depth.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.gate.pending.swap(false, Ordering::SeqCst) {
            (self.gate.on_deliver)();
        }
    }
}

/// Latched recovery for one injected fault. Fires at most once.
pub struct RecoveryHandle {
    problem: Arc<dyn Problem>,
    fired: AtomicBool,
}

impl RecoveryHandle {
    pub fn new(problem: Arc<dyn Problem>) -> Self {
        Self {
            problem,
            fired: AtomicBool::new(false),
        }
    }

    /// Runs recovery on the first call; later calls return `None`.
    pub fn fire(&self) -> Option<Result<()>> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!(problem_id = self.problem.id(), "recovering fault");
        Some(self.problem.recover_fault())
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

pub struct CleanupRegistry {
    entries: Mutex<Vec<(u64, Arc<RecoveryHandle>)>>,
    next_id: AtomicU64,
}

impl CleanupRegistry {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Arc<RecoveryHandle>)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, handle: Arc<RecoveryHandle>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().push((id, handle));
        id
    }

    pub fn unregister(&self, id: u64) -> Option<Arc<RecoveryHandle>> {
        let mut entries = self.lock();
        let idx = entries.iter().position(|(entry_id, _)| *entry_id == id)?;
        Some(entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the table and fires every armed recovery. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let drained: Vec<_> = std::mem::take(&mut *self.lock());
        let mut fired = 0;
        for (_, handle) in drained {
            match handle.fire() {
                Some(Ok(())) => fired += 1,
                Some(Err(err)) => {
                    fired += 1;
                    error!(error = %err, "fault recovery failed during shutdown");
                }
                None => {}
            }
        }
        fired
    }
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the recovery obligation for an injected fault.
///
/// [`FaultGuard::release`] is the normal exit. Dropping an unreleased guard
/// recovers the fault and only logs a recovery failure.
pub struct FaultGuard {
    gate: &'static InterruptGate,
    registry: &'static CleanupRegistry,
    handle: Arc<RecoveryHandle>,
    registration: u64,
    released: bool,
}

impl FaultGuard {
    pub fn inject(problem: Arc<dyn Problem>) -> Result<Self> {
        Self::inject_with(&INTERRUPT_GATE, &CLEANUPS, problem)
    }

    /// Injects the fault inside a critical section. If injection fails the
    /// fault may be partially applied, so recovery still runs once.
    pub fn inject_with(
        gate: &'static InterruptGate,
        registry: &'static CleanupRegistry,
        problem: Arc<dyn Problem>,
    ) -> Result<Self> {
        let _section = gate.enter();
        let handle = Arc::new(RecoveryHandle::new(problem.clone()));
        let registration = registry.register(handle.clone());
        let guard = Self {
            gate,
            registry,
            handle,
            registration,
            released: false,
        };
        match problem.inject_fault() {
            Ok(()) => {
                info!(problem_id = problem.id(), "fault injected");
                Ok(guard)
            }
            Err(err) => {
                error!(problem_id = problem.id(), error = %err, "fault injection failed");
                drop(guard);
                Err(err)
            }
        }
    }

    pub fn release(mut self) -> Result<()> {
        let _section = self.gate.enter();
        self.released = true;
        self.registry.unregister(self.registration);
        self.handle.fire().unwrap_or(Ok(()))
    }

    pub fn has_recovered(&self) -> bool {
        self.handle.has_fired()
    }
}

impl Drop for FaultGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let _section = self.gate.enter();
        self.registry.unregister(self.registration);
        if let Some(Err(err)) = self.handle.fire() {
            error!(error = %err, "fault recovery failed while unwinding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{Application, OracleSet};
    use anyhow::anyhow;

    struct NullApp;

    impl Application for NullApp {
        fn name(&self) -> &str {
            "null"
        }
        fn deploy(&self) -> Result<()> {
            Ok(())
        }
        fn delete(&self) -> Result<()> {
            Ok(())
        }
        fn start_workload(&self) -> Result<()> {
            Ok(())
        }
        fn cleanup(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingProblem {
        injects: AtomicUsize,
        recovers: AtomicUsize,
        fail_inject: bool,
        fail_recover: bool,
        oracles: OracleSet,
    }

    impl Problem for CountingProblem {
        fn id(&self) -> &str {
            "counting"
        }
        fn app(&self) -> &dyn Application {
            &NullApp
        }
        fn faulty_service(&self) -> &[String] {
            &[]
        }
        fn oracles(&self) -> &OracleSet {
            &self.oracles
        }
        fn inject_fault(&self) -> Result<()> {
            self.injects.fetch_add(1, Ordering::SeqCst);
            if self.fail_inject {
                return Err(anyhow!("chaos tool rejected the experiment"));
            }
            Ok(())
        }
        fn recover_fault(&self) -> Result<()> {
            self.recovers.fetch_add(1, Ordering::SeqCst);
            if self.fail_recover {
                return Err(anyhow!("recover failed"));
            }
            Ok(())
        }
    }

    fn ignore_interrupt() {}

    fn recovers(problem: &Arc<CountingProblem>) -> usize {
        problem.recovers.load(Ordering::SeqCst)
    }

    #[test]
    fn release_recovers_once_and_disarms() {
        static GATE: InterruptGate = InterruptGate::new(ignore_interrupt);
        static REG: CleanupRegistry = CleanupRegistry::new();
        let problem = Arc::new(CountingProblem::default());
        let guard = FaultGuard::inject_with(&GATE, &REG, problem.clone()).expect("inject");
        assert_eq!(REG.len(), 1);
        guard.release().expect("release");
        assert_eq!(recovers(&problem), 1);
        assert!(REG.is_empty());
        assert_eq!(REG.run_all(), 0);
        assert_eq!(recovers(&problem), 1);
    }

    #[test]
    fn dropping_an_unreleased_guard_recovers_once() {
        static GATE: InterruptGate = InterruptGate::new(ignore_interrupt);
        static REG: CleanupRegistry = CleanupRegistry::new();
        let problem = Arc::new(CountingProblem::default());
        {
            let _guard = FaultGuard::inject_with(&GATE, &REG, problem.clone()).expect("inject");
        }
        assert_eq!(recovers(&problem), 1);
        assert!(REG.is_empty());
    }

    #[test]
    fn panic_unwind_recovers_once() {
        static GATE: InterruptGate = InterruptGate::new(ignore_interrupt);
        static REG: CleanupRegistry = CleanupRegistry::new();
        let problem = Arc::new(CountingProblem::default());
        let cloned = problem.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = FaultGuard::inject_with(&GATE, &REG, cloned).expect("inject");
            panic!("agent loop crashed");
        }));
        assert!(outcome.is_err());
        assert_eq!(recovers(&problem), 1);
        assert_eq!(GATE.depth(), 0);
    }

    #[test]
    fn failed_injection_still_recovers_once() {
        static GATE: InterruptGate = InterruptGate::new(ignore_interrupt);
        static REG: CleanupRegistry = CleanupRegistry::new();
        let problem = Arc::new(CountingProblem {
            fail_inject: true,
            ..CountingProblem::default()
        });
        let err = FaultGuard::inject_with(&GATE, &REG, problem.clone())
            .err()
            .expect("inject fails");
        assert!(err.to_string().contains("chaos tool"));
        assert_eq!(recovers(&problem), 1);
        assert!(REG.is_empty());
    }

    #[test]
    fn release_surfaces_recovery_errors() {
        static GATE: InterruptGate = InterruptGate::new(ignore_interrupt);
        static REG: CleanupRegistry = CleanupRegistry::new();
        let problem = Arc::new(CountingProblem {
            fail_recover: true,
            ..CountingProblem::default()
        });
        let guard = FaultGuard::inject_with(&GATE, &REG, problem.clone()).expect("inject");
        assert!(guard.release().is_err());
        assert_eq!(recovers(&problem), 1);
    }

    #[test]
    fn shutdown_drain_and_drop_do_not_double_recover() {
        static GATE: InterruptGate = InterruptGate::new(ignore_interrupt);
        static REG: CleanupRegistry = CleanupRegistry::new();
        let problem = Arc::new(CountingProblem::default());
        let guard = FaultGuard::inject_with(&GATE, &REG, problem.clone()).expect("inject");
        assert_eq!(REG.run_all(), 1);
        assert!(guard.has_recovered());
        drop(guard);
        assert_eq!(recovers(&problem), 1);
    }

    #[test]
    fn interrupt_inside_section_is_deferred_until_outermost_exit() {
        static DELIVERED: AtomicUsize = AtomicUsize::new(0);
        fn count() {
            DELIVERED.fetch_add(1, Ordering::SeqCst);
        }
        static GATE: InterruptGate = InterruptGate::new(count);

        let outer = GATE.enter();
        let inner = GATE.enter();
        assert_eq!(GATE.note_interrupt(), InterruptDisposition::Deferred);
        drop(inner);
        assert_eq!(DELIVERED.load(Ordering::SeqCst), 0);
        assert!(GATE.is_pending());
        drop(outer);
        assert_eq!(DELIVERED.load(Ordering::SeqCst), 1);
        assert!(!GATE.is_pending());

        assert_eq!(GATE.note_interrupt(), InterruptDisposition::Delivered);
        assert_eq!(DELIVERED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn interrupt_during_injection_recovers_through_the_registry() {
        static REG: CleanupRegistry = CleanupRegistry::new();
        static RAN: AtomicUsize = AtomicUsize::new(0);
        fn drain() {
            RAN.fetch_add(REG.run_all(), Ordering::SeqCst);
        }
        static GATE: InterruptGate = InterruptGate::new(drain);

        struct InterruptingProblem {
            inner: CountingProblem,
        }

        impl Problem for InterruptingProblem {
            fn id(&self) -> &str {
                "interrupting"
            }
            fn app(&self) -> &dyn Application {
                &NullApp
            }
            fn faulty_service(&self) -> &[String] {
                &[]
            }
            fn oracles(&self) -> &OracleSet {
                self.inner.oracles()
            }
            fn inject_fault(&self) -> Result<()> {
                assert_eq!(GATE.note_interrupt(), InterruptDisposition::Deferred);
                self.inner.inject_fault()
            }
            fn recover_fault(&self) -> Result<()> {
                self.inner.recover_fault()
            }
        }

        let problem = Arc::new(InterruptingProblem {
            inner: CountingProblem::default(),
        });
        let guard = FaultGuard::inject_with(&GATE, &REG, problem.clone()).expect("inject");
        assert_eq!(RAN.load(Ordering::SeqCst), 1);
        assert!(guard.has_recovered());
        drop(guard);
        assert_eq!(problem.inner.recovers.load(Ordering::SeqCst), 1);
    }
}
