#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use throttle_core::{SchedulerConfig, SchedulerError, SubstrateKind};

    use crate::scheduler::runner::Scheduler;
    use crate::scheduler::substrate::{ExecutionSubstrate, ManualSubstrate, Task};
    use crate::scheduler::unit::{UnitError, UnitStatus, WorkUnit};

    fn manual(degree: usize) -> (Scheduler, Arc<ManualSubstrate>) {
        let substrate = Arc::new(ManualSubstrate::new());
        let scheduler = Scheduler::new(degree, substrate.clone()).unwrap();
        (scheduler, substrate)
    }

    /// Substrate that can refuse tasks outright or accept and silently drop them.
    #[derive(Default)]
    struct FlakySubstrate {
        reject: AtomicBool,
        discard: AtomicBool,
        inner: ManualSubstrate,
    }

    impl ExecutionSubstrate for FlakySubstrate {
        fn run(&self, task: Task) -> Result<(), SchedulerError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(SchedulerError::Substrate("no capacity".into()));
            }
            if self.discard.load(Ordering::SeqCst) {
                drop(task);
                return Ok(());
            }
            self.inner.run(task)
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    /// Unit that appends its name to a shared log.
    fn logged(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<WorkUnit> {
        let log = Arc::clone(log);
        let entry = name.to_string();
        WorkUnit::new(name, move |_| {
            log.lock().push(entry);
            Ok(())
        })
    }

    #[test]
    fn construction_guard() {
        for degree in [0, 1] {
            let err = Scheduler::new(degree, Arc::new(ManualSubstrate::new())).unwrap_err();
            assert!(matches!(err, SchedulerError::InvalidConfiguration(_)));
        }

        let (scheduler, _) = manual(2);
        assert_eq!(scheduler.max_degree_of_parallelism(), 2);
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.substrate_name(), "manual");
    }

    #[test]
    fn submit_launches_at_most_degree_workers() {
        let (scheduler, substrate) = manual(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            scheduler.submit(logged(&format!("u{i}"), &log));
        }

        assert_eq!(substrate.pending(), 2, "one launch per free slot");
        assert_eq!(scheduler.active_workers(), 2);
        assert_eq!(scheduler.queue_len(), 5);
        assert!(log.lock().is_empty(), "submit never runs work itself");

        assert_eq!(substrate.run_all(), 2);
        assert_eq!(log.lock().len(), 5);
        assert!(scheduler.is_idle());

        let metrics = scheduler.metrics();
        assert_eq!(metrics.units_submitted, 5);
        assert_eq!(metrics.units_executed, 5);
        assert_eq!(metrics.workers_launched, 2);
        assert_eq!(metrics.peak_active_workers, 2);
        assert_eq!(metrics.active_workers, 0);
        assert_eq!(metrics.queue_depth, 0);
        assert!(metrics.last_idle_at.is_some());
    }

    #[test]
    fn single_worker_runs_queue_in_fifo_order() {
        let (scheduler, substrate) = manual(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b", "c", "d"] {
            scheduler.submit(logged(name, &log));
        }

        // The first loop drains everything; the second finds an empty queue.
        assert!(substrate.run_next());
        assert_eq!(*log.lock(), vec!["a", "b", "c", "d"]);
        assert_eq!(scheduler.active_workers(), 1);

        assert!(substrate.run_next());
        assert!(scheduler.is_idle());
    }

    #[test]
    fn scheduler_is_reusable_after_idle() {
        let (scheduler, substrate) = manual(3);
        let log = Arc::new(Mutex::new(Vec::new()));

        scheduler.submit(logged("first", &log));
        substrate.run_all();
        assert!(scheduler.is_idle());

        scheduler.submit(logged("second", &log));
        assert_eq!(scheduler.active_workers(), 1);
        assert_eq!(substrate.pending(), 1);
        substrate.run_all();

        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert_eq!(scheduler.metrics().workers_launched, 2);
    }

    #[test]
    fn dequeue_is_idempotent() {
        let (scheduler, substrate) = manual(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        let unit = logged("removed", &log);

        scheduler.submit(Arc::clone(&unit));
        assert!(scheduler.try_dequeue(&unit));
        assert!(!scheduler.try_dequeue(&unit));

        substrate.run_all();
        assert!(log.lock().is_empty());
        assert_eq!(unit.status(), UnitStatus::Pending);
        assert_eq!(scheduler.metrics().units_dequeued, 1);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn inline_runs_queued_child_on_current_worker() {
        let (scheduler, substrate) = manual(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        let parent_log = Arc::clone(&log);
        scheduler.spawn("parent", move |ctx| {
            parent_log.lock().push("parent:start".to_string());
            let child = logged("child", &parent_log);
            ctx.scheduler().submit(Arc::clone(&child));
            assert!(ctx.try_inline(&child, true));
            assert_eq!(child.status(), UnitStatus::Completed);
            parent_log.lock().push("parent:end".to_string());
            Ok(())
        });

        substrate.run_all();

        assert_eq!(*log.lock(), vec!["parent:start", "child", "parent:end"]);
        let metrics = scheduler.metrics();
        assert_eq!(metrics.units_inlined, 1);
        assert_eq!(metrics.units_executed, 1);
        assert_eq!(metrics.units_skipped, 0);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn inline_never_reruns_a_claimed_unit() {
        let (scheduler, substrate) = manual(2);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let child = WorkUnit::new("child", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // Child goes first, so the worker has already run it when the parent asks.
        scheduler.submit(Arc::clone(&child));
        let queued_child = Arc::clone(&child);
        let parent = scheduler.spawn("parent", move |ctx| {
            assert!(!ctx.try_inline(&queued_child, true));
            assert!(!ctx.try_inline(&queued_child, false));
            Ok(())
        });

        substrate.run_all();
        assert_eq!(parent.wait(), UnitStatus::Completed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.metrics().units_inlined, 0);
    }

    #[test]
    fn inline_of_never_queued_unit_runs_once() {
        let (scheduler, substrate) = manual(2);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let loose = WorkUnit::new("loose", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let unit = Arc::clone(&loose);
        let parent = scheduler.spawn("parent", move |ctx| {
            assert!(!ctx.try_inline(&unit, true), "never queued, so removal fails");
            assert!(ctx.try_inline(&unit, false));
            assert!(!ctx.try_inline(&unit, false));
            Ok(())
        });

        substrate.run_all();
        assert_eq!(parent.wait(), UnitStatus::Completed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(loose.status(), UnitStatus::Completed);
    }

    #[test]
    fn inline_rejects_context_of_another_scheduler() {
        let (scheduler, substrate) = manual(2);
        let (other, _other_substrate) = manual(2);
        let foreign = WorkUnit::new("foreign", |_| Ok(()));

        let unit = Arc::clone(&foreign);
        let this = scheduler.clone();
        let parent = scheduler.spawn("parent", move |ctx| {
            assert!(ctx.belongs_to(&this));
            assert!(!ctx.belongs_to(&other));
            assert!(!other.try_inline(ctx, &unit, false));
            Ok(())
        });

        substrate.run_all();
        assert_eq!(parent.wait(), UnitStatus::Completed);
        assert_eq!(foreign.status(), UnitStatus::Pending);
    }

    #[test]
    fn run_or_wait_inlines_still_queued_child() {
        let (scheduler, substrate) = manual(2);
        let parent = scheduler.spawn("parent", |ctx| {
            let child = ctx.scheduler().spawn("child", |_| Ok(()));
            assert_eq!(ctx.run_or_wait(&child), UnitStatus::Completed);
            Ok(())
        });

        // Only one loop runs; without inlining the parent would wait forever.
        assert!(substrate.run_next());
        assert_eq!(parent.status(), UnitStatus::Completed);
        assert_eq!(scheduler.metrics().units_inlined, 1);
        substrate.run_all();
        assert!(scheduler.is_idle());
    }

    #[test]
    fn failures_are_contained_in_worker_loop() {
        let (scheduler, substrate) = manual(2);
        let failing = scheduler.spawn("failing", |_| Err(anyhow::anyhow!("bad input")));
        let panicking = scheduler.spawn("panicking", |_| panic!("kaboom"));
        let fine = scheduler.spawn("fine", |_| Ok(()));

        // A single loop survives both failures and reaches the last unit.
        assert!(substrate.run_next());

        assert!(matches!(failing.status(), UnitStatus::Failed(UnitError::Failed(_))));
        assert_eq!(
            panicking.status(),
            UnitStatus::Failed(UnitError::Panicked("kaboom".into()))
        );
        assert_eq!(fine.status(), UnitStatus::Completed);

        substrate.run_all();
        let metrics = scheduler.metrics();
        assert_eq!(metrics.units_executed, 3);
        assert_eq!(metrics.units_failed, 2);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn snapshot_reflects_queue_order() {
        let (scheduler, substrate) = manual(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["x", "y", "z"] {
            scheduler.submit(logged(name, &log));
        }

        let names: Vec<String> = scheduler
            .snapshot_queue()
            .unwrap()
            .iter()
            .map(|u| u.name().to_string())
            .collect();
        assert_eq!(names, vec!["x", "y", "z"]);

        substrate.run_all();
        assert!(scheduler.snapshot_queue().unwrap().is_empty());
    }

    #[test]
    fn snapshot_fails_busy_while_lock_is_held() {
        let config = SchedulerConfig {
            max_degree_of_parallelism: 2,
            snapshot_timeout_ms: 5,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::with_config(&config, Arc::new(ManualSubstrate::new())).unwrap();

        let guard = scheduler.shared.state.lock();
        let err = scheduler.snapshot_queue().unwrap_err();
        drop(guard);

        assert!(matches!(err, SchedulerError::Busy(d) if d == Duration::from_millis(5)));
        assert!(err.is_retryable());
        assert!(scheduler.snapshot_queue().is_ok());
    }

    #[test]
    fn wait_idle_reports_timeout_until_drained() {
        let (scheduler, substrate) = manual(2);
        scheduler.spawn("pending", |_| Ok(()));

        assert!(!scheduler.wait_idle(Duration::from_millis(10)));
        substrate.run_all();
        assert!(scheduler.wait_idle(Duration::from_millis(10)));
    }

    #[test]
    fn wait_idle_accepts_unbounded_timeout() {
        let (scheduler, substrate) = manual(2);
        assert!(scheduler.wait_idle(Duration::MAX));

        scheduler.spawn("work", |_| Ok(()));
        substrate.run_all();
        assert!(scheduler.wait_idle(Duration::MAX));
    }

    fn assert_slot_released(substrate: &Arc<FlakySubstrate>) {
        let scheduler = Scheduler::new(2, substrate.clone()).unwrap();
        let stranded = scheduler.spawn("stranded", |_| Ok(()));

        assert_eq!(scheduler.active_workers(), 0, "failed launch must free its slot");
        assert_eq!(scheduler.queue_len(), 1);
        assert_eq!(stranded.status(), UnitStatus::Pending);
        assert!(!scheduler.wait_idle(Duration::from_millis(10)));
        assert_eq!(scheduler.metrics().worker_launch_failures, 1);

        // Once the substrate recovers, the next submit drains the backlog too.
        substrate.reject.store(false, Ordering::SeqCst);
        substrate.discard.store(false, Ordering::SeqCst);
        let next = scheduler.spawn("next", |_| Ok(()));
        assert_eq!(substrate.inner.run_all(), 1);

        assert_eq!(stranded.status(), UnitStatus::Completed);
        assert_eq!(next.status(), UnitStatus::Completed);
        assert!(scheduler.wait_idle(Duration::MAX));
        assert_eq!(scheduler.metrics().workers_launched, 2);
    }

    #[test]
    fn rejected_launch_frees_worker_slot() {
        let substrate = Arc::new(FlakySubstrate::default());
        substrate.reject.store(true, Ordering::SeqCst);
        assert_slot_released(&substrate);
    }

    #[test]
    fn discarded_launch_frees_worker_slot() {
        let substrate = Arc::new(FlakySubstrate::default());
        substrate.discard.store(true, Ordering::SeqCst);
        assert_slot_released(&substrate);
    }

    #[test]
    fn inline_without_queued_flag_clears_queue_entry() {
        let (scheduler, substrate) = manual(2);
        let parent = scheduler.spawn("parent", |ctx| {
            let child = ctx.scheduler().spawn("child", |_| Ok(()));
            assert!(ctx.try_inline(&child, false));
            let scheduler = ctx.scheduler();
            assert_eq!(scheduler.queue_len(), 0);
            assert!(scheduler.snapshot_queue()?.is_empty());
            assert_eq!(scheduler.metrics().queue_depth, 0);
            Ok(())
        });

        substrate.run_all();
        assert_eq!(parent.status(), UnitStatus::Completed);
        let metrics = scheduler.metrics();
        assert_eq!(metrics.units_inlined, 1);
        assert_eq!(metrics.units_skipped, 0);
    }

    #[test]
    fn from_config_builds_substrate() {
        let config = SchedulerConfig {
            max_degree_of_parallelism: 3,
            substrate: SubstrateKind::Thread,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::from_config(&config).unwrap();
        assert_eq!(scheduler.substrate_name(), "thread");
        assert_eq!(scheduler.max_degree_of_parallelism(), 3);

        let unit = scheduler.spawn("threaded", |_| Ok(()));
        assert_eq!(unit.wait_timeout(Duration::from_secs(5)), Some(UnitStatus::Completed));
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn from_config_rejects_low_degree() {
        let config = SchedulerConfig {
            max_degree_of_parallelism: 1,
            ..SchedulerConfig::default()
        };
        let err = Scheduler::from_config(&config).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfiguration(_)));
    }
}
