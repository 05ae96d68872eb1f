//! End-to-end tests for the job host over in-memory stores.
//!
//! Flow: enqueue / register → loops → handler factory → handler → store
//! updates.
//!
//! Verifies:
//! - Every message is completed exactly once under normal operation
//! - Failed, timed-out and panicking handlers leave messages for redelivery
//! - Poison messages are dead-lettered
//! - A scheduled task runs once per due time across several hosts
//! - Stuck `Running` tasks are recovered once their lease lapses

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    use jobhost_core::{Clock, ManualClock, SystemClock, TaskId, WorkerId};
    use jobhost_handlers::{
        HandlerFactory, JobContext, JobHandler, ServiceRegistry, ServiceResolver,
    };

    use crate::config::{HostConfig, QueueRegistration, TaskRegistration};
    use crate::host::{HostError, HostStats, HostStores, JobHost, JobHostHandle};
    use crate::schedule::{task_lease_name, NewScheduledTask, TaskRun, TaskStatus};

    // ---------------------------------------------------------------------
    // Handlers
    // ---------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Value>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<Value> {
            self.seen.lock().unwrap().clone()
        }
    }

    /// Records payloads; `"fail"` errors, `"boom"` panics, `"hang"` waits
    /// for cancellation and `"sleep"` ignores it.
    struct RecordingHandler {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        type WorkItem = Value;

        async fn process(&self, item: Value, ctx: &JobContext) -> anyhow::Result<()> {
            match item.as_str() {
                Some("fail") => anyhow::bail!("refused payload"),
                Some("boom") => panic!("handler exploded"),
                Some("hang") => {
                    ctx.cancelled().await;
                    anyhow::bail!("cancelled by host");
                }
                Some("sleep") => tokio::time::sleep(Duration::from_secs(30)).await,
                _ => {}
            }
            self.recorder.seen.lock().unwrap().push(item);
            Ok(())
        }
    }

    fn recording_factory() -> HandlerFactory<RecordingHandler> {
        HandlerFactory::from_services(|services| {
            Ok(RecordingHandler {
                recorder: services.require::<Recorder>()?,
            })
        })
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    /// Scheduled handler that increments its carried state.
    struct CountingTask {
        recorder: Arc<Recorder>,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for CountingTask {
        type WorkItem = Option<Counter>;

        async fn process(&self, state: Option<Counter>, ctx: &JobContext) -> anyhow::Result<()> {
            let count = state.unwrap_or_default().count + 1;
            self.recorder.seen.lock().unwrap().push(json!(count));
            anyhow::ensure!(!self.fail, "report generation failed");
            ctx.save_state(&Counter { count })?;
            ctx.report_progress(&json!({"percent": 100}))?;
            Ok(())
        }
    }

    fn counting_factory(fail: bool) -> HandlerFactory<CountingTask> {
        HandlerFactory::from_services(move |services| {
            Ok(CountingTask {
                recorder: services.require::<Recorder>()?,
                fail,
            })
        })
    }

    /// Tracks how many copies of a handler run at once; each run outlives
    /// the queue's visibility window unless stopped.
    #[derive(Default)]
    struct Overlap {
        running: AtomicUsize,
        max_running: AtomicUsize,
        invocations: AtomicUsize,
    }

    struct RunningGuard<'a>(&'a Overlap);

    impl Drop for RunningGuard<'_> {
        fn drop(&mut self) {
            self.0.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct SlowHandler {
        overlap: Arc<Overlap>,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        type WorkItem = Value;

        async fn process(&self, _item: Value, _ctx: &JobContext) -> anyhow::Result<()> {
            self.overlap.invocations.fetch_add(1, Ordering::SeqCst);
            let now = self.overlap.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.overlap.max_running.fetch_max(now, Ordering::SeqCst);
            let _guard = RunningGuard(&self.overlap);
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(())
        }
    }

    /// Scheduled handler that works until its run is cancelled.
    struct UntilCancelledTask {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl JobHandler for UntilCancelledTask {
        type WorkItem = Option<Value>;

        async fn process(&self, _state: Option<Value>, ctx: &JobContext) -> anyhow::Result<()> {
            self.recorder.seen.lock().unwrap().push(json!("started"));
            ctx.cancelled().await;
            self.recorder.seen.lock().unwrap().push(json!("cancelled"));
            anyhow::bail!("run cancelled")
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap()
    }

    fn config() -> HostConfig {
        HostConfig::default()
            .with_schedule_poll_interval(Duration::from_millis(10))
            .with_handler_timeout(Duration::from_secs(5))
            .with_shutdown_grace(Duration::from_secs(2))
    }

    fn services(recorder: &Arc<Recorder>) -> Arc<dyn ServiceResolver> {
        Arc::new(ServiceRegistry::new().with(recorder.clone()))
    }

    fn queue(name: &str) -> QueueRegistration {
        QueueRegistration::new(name).with_polling_interval(Duration::from_millis(10))
    }

    fn nightly() -> TaskRegistration {
        TaskRegistration::new(TaskId::new("nightly-report").unwrap(), "0 * * * * *")
            .with_group("reports")
            .with_description("roll up yesterday")
    }

    async fn start_queue_host(
        stores: &HostStores,
        clock: Arc<dyn Clock>,
        recorder: &Arc<Recorder>,
        registration: QueueRegistration,
        config: HostConfig,
    ) -> JobHostHandle {
        let mut host = JobHost::new(config, stores.clone(), services(recorder)).with_clock(clock);
        host.register_queue(registration, recording_factory()).unwrap();
        host.start().await.unwrap()
    }

    async fn start_task_host(
        stores: &HostStores,
        clock: Arc<dyn Clock>,
        recorder: &Arc<Recorder>,
        fail: bool,
    ) -> JobHostHandle {
        let mut host = JobHost::new(config(), stores.clone(), services(recorder)).with_clock(clock);
        host.register_task(nightly(), counting_factory(fail)).unwrap();
        host.start().await.unwrap()
    }

    /// Poll `check` until it holds or five seconds pass.
    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn eventually_stats(handle: &JobHostHandle, what: &str, check: impl Fn(&HostStats) -> bool) {
        eventually(what, || check(&handle.stats())).await;
    }

    // ---------------------------------------------------------------------
    // Queue work
    // ---------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn six_messages_are_each_completed_once() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        let payloads: Vec<Value> = (1..=6).map(|i| json!({"n": i})).collect();
        stores
            .queues
            .enqueue_batch("emails", payloads.clone(), Duration::ZERO)
            .await
            .unwrap();

        let handle = start_queue_host(&stores, clock, &recorder, queue("emails"), config()).await;
        eventually_stats(&handle, "six completions", |s| s.messages_completed == 6).await;
        let stats = handle.shutdown().await;

        assert_eq!(stores.queues.depth("emails").await.unwrap(), 0);
        assert_eq!(recorder.seen(), payloads);
        assert_eq!(stats.messages_processed, 6);
        assert_eq!(stats.messages_failed, 0);
        assert_eq!(stats.current_in_flight, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_instances_still_complete_each_message_once() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        let payloads: Vec<Value> = (0..40).map(|i| json!(i)).collect();
        stores.queues.enqueue_batch("jobs", payloads, Duration::ZERO).await.unwrap();

        // Two hosts, three instances each, one shared store.
        let a = start_queue_host(&stores, clock.clone(), &recorder, queue("jobs").with_instance_count(3), config()).await;
        let b = start_queue_host(&stores, clock, &recorder, queue("jobs").with_instance_count(3), config()).await;

        eventually("all messages", || recorder.seen().len() >= 40).await;
        let (sa, sb) = (a.shutdown().await, b.shutdown().await);

        let mut seen: Vec<i64> = recorder.seen().iter().map(|v| v.as_i64().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
        assert_eq!(sa.messages_completed + sb.messages_completed, 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_message_is_redelivered_after_the_window() {
        let clock = Arc::new(ManualClock::new(t0()));
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        let id = stores.queues.enqueue("emails", json!("fail"), Duration::ZERO).await.unwrap();

        let handle = start_queue_host(&stores, clock.clone(), &recorder, queue("emails"), config()).await;
        eventually_stats(&handle, "first failure", |s| s.messages_failed == 1).await;

        let message = stores.queues.get(id).await.unwrap().unwrap();
        assert_eq!(message.dequeue_count, 1);

        clock.advance(Duration::from_secs(61));
        eventually_stats(&handle, "second failure", |s| s.messages_failed == 2).await;
        handle.shutdown().await;

        let message = stores.queues.get(id).await.unwrap().unwrap();
        assert_eq!(message.dequeue_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_handler_does_not_stop_the_host() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        stores.queues.enqueue("emails", json!("boom"), Duration::ZERO).await.unwrap();

        let handle = start_queue_host(&stores, clock, &recorder, queue("emails"), config()).await;
        eventually_stats(&handle, "the panic", |s| s.messages_failed == 1).await;

        stores.queues.enqueue("emails", json!("after"), Duration::ZERO).await.unwrap();
        eventually_stats(&handle, "the next message", |s| s.messages_completed == 1).await;
        handle.shutdown().await;

        assert_eq!(recorder.seen(), vec![json!("after")]);
        // The panicked message is still stored, hidden until its window lapses.
        assert_eq!(stores.queues.depth("emails").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn poison_message_is_dead_lettered() {
        let clock = Arc::new(ManualClock::new(t0()));
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        let id = stores.queues.enqueue("emails", json!("fail"), Duration::ZERO).await.unwrap();

        let registration = queue("emails").with_max_dequeue_count(2);
        let handle = start_queue_host(&stores, clock.clone(), &recorder, registration, config()).await;

        eventually_stats(&handle, "first failure", |s| s.messages_failed == 1).await;
        clock.advance(Duration::from_secs(61));
        eventually_stats(&handle, "second failure", |s| s.messages_failed == 2).await;
        clock.advance(Duration::from_secs(61));
        eventually_stats(&handle, "dead letter", |s| s.messages_dead_lettered == 1).await;
        let stats = handle.shutdown().await;

        assert_eq!(stats.messages_failed, 2);
        assert_eq!(stores.queues.depth("emails").await.unwrap(), 0);
        let dead = stores.queues.list_dead_letters("emails", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.id, id);
        assert_eq!(dead[0].message.dequeue_count, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_handler_is_cut_off_by_the_timeout() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        stores.queues.enqueue("emails", json!("sleep"), Duration::ZERO).await.unwrap();

        let config = config().with_handler_timeout(Duration::from_millis(50));
        let handle = start_queue_host(&stores, clock, &recorder, queue("emails"), config).await;
        eventually_stats(&handle, "timeout", |s| s.messages_failed == 1).await;
        let stats = handle.shutdown().await;

        assert_eq!(stats.current_in_flight, 0);
        assert!(recorder.seen().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_cancels_in_flight_handlers() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        stores.queues.enqueue("emails", json!("hang"), Duration::ZERO).await.unwrap();

        let handle = start_queue_host(&stores, clock, &recorder, queue("emails"), config()).await;
        eventually_stats(&handle, "handler start", |s| s.current_in_flight == 1).await;
        let stats = handle.shutdown().await;

        assert_eq!(stats.messages_failed, 1);
        assert_eq!(stats.current_in_flight, 0);
        assert_eq!(stores.queues.depth("emails").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn handler_is_stopped_before_its_claim_lapses() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let stores = HostStores::in_memory(clock.clone());
        let overlap = Arc::new(Overlap::default());
        stores.queues.enqueue("exports", json!({"id": 1}), Duration::ZERO).await.unwrap();

        let registration = QueueRegistration::new("exports")
            .with_instance_count(2)
            .with_visibility_window(Duration::from_millis(100))
            .with_polling_interval(Duration::from_millis(150));
        let services: Arc<dyn ServiceResolver> = Arc::new(ServiceRegistry::new().with(overlap.clone()));
        let mut host = JobHost::new(config(), stores.clone(), services).with_clock(clock);
        host.register_queue(
            registration,
            HandlerFactory::from_services(|services| {
                Ok(SlowHandler {
                    overlap: services.require::<Overlap>()?,
                })
            }),
        )
        .unwrap();
        let handle = host.start().await.unwrap();

        eventually("a redelivery", || overlap.invocations.load(Ordering::SeqCst) >= 2).await;
        let stats = handle.shutdown().await;

        assert_eq!(overlap.max_running.load(Ordering::SeqCst), 1, "same message processed concurrently");
        assert!(stats.messages_failed >= 1);
        assert_eq!(stats.messages_completed, 0);
    }

    // ---------------------------------------------------------------------
    // Scheduled work
    // ---------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scheduled_task_runs_once_per_due_time_across_hosts() {
        let clock = Arc::new(ManualClock::new(t0()));
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());

        let a = start_task_host(&stores, clock.clone(), &recorder, false).await;
        let b = start_task_host(&stores, clock.clone(), &recorder, false).await;

        let id = TaskId::new("nightly-report").unwrap();
        let task = stores.tasks.get(&id).await.unwrap().unwrap();
        let first_due = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        assert_eq!(task.next_execution, Some(first_due));
        assert_eq!(task.group, "reports");

        clock.set(first_due);
        eventually("one run", || recorder.seen().len() == 1).await;
        // Give both loops many more ticks to misbehave.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (sa, sb) = (a.shutdown().await, b.shutdown().await);

        assert_eq!(recorder.seen(), vec![json!(1)]);
        assert_eq!(sa.task_runs_succeeded + sb.task_runs_succeeded, 1);

        let task = stores.tasks.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.execution_count, 1);
        assert_eq!(task.last_execution, Some(first_due));
        assert_eq!(
            task.next_execution,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap())
        );
        assert_eq!(task.state, Some(json!({"count": 1})));
        assert_eq!(task.progress, Some(json!({"percent": 100})));
        assert!(stores.leases.get(&task_lease_name(&id)).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_is_carried_into_the_next_run() {
        let clock = Arc::new(ManualClock::new(t0()));
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        let handle = start_task_host(&stores, clock.clone(), &recorder, false).await;

        clock.set(Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap());
        eventually_stats(&handle, "first run", |s| s.task_runs_succeeded == 1).await;
        clock.set(Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap());
        eventually_stats(&handle, "second run", |s| s.task_runs_succeeded == 2).await;
        handle.shutdown().await;

        assert_eq!(recorder.seen(), vec![json!(1), json!(2)]);
        let task = stores.tasks.get(&TaskId::new("nightly-report").unwrap()).await.unwrap().unwrap();
        assert_eq!(task.state, Some(json!({"count": 2})));
        assert_eq!(task.execution_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_run_is_faulted_and_rescheduled() {
        let clock = Arc::new(ManualClock::new(t0()));
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        let handle = start_task_host(&stores, clock.clone(), &recorder, true).await;

        clock.set(Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap());
        eventually_stats(&handle, "faulted run", |s| s.task_runs_faulted == 1).await;
        handle.shutdown().await;

        let task = stores.tasks.get(&TaskId::new("nightly-report").unwrap()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Faulted);
        assert_eq!(task.errors, 1);
        assert!(task.last_error.as_deref().unwrap().contains("report generation failed"));
        assert_eq!(task.last_error_date, Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap()));
        assert_eq!(
            task.next_execution,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap())
        );
        // Faulted runs do not overwrite the carried state.
        assert_eq!(task.state, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stuck_running_task_is_recovered_after_its_lease_lapses() {
        let clock = Arc::new(ManualClock::new(t0()));
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        let handle = start_task_host(&stores, clock.clone(), &recorder, false).await;
        let id = TaskId::new("nightly-report").unwrap();

        // A worker that claims the task and then dies.
        let dead = WorkerId::new();
        let task = stores.tasks.get(&id).await.unwrap().unwrap();
        assert!(stores.leases.try_acquire(&task_lease_name(&id), dead, Duration::from_secs(60)).await.unwrap());
        assert!(stores.tasks.mark_started(&id, task.version, dead, clock.now()).await.unwrap());

        clock.set(Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(recorder.seen().is_empty());

        clock.advance(Duration::from_secs(31));
        eventually_stats(&handle, "recovery run", |s| s.task_runs_succeeded == 1).await;
        handle.shutdown().await;

        let task = stores.tasks.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.execution_count, 2);
        assert_ne!(task.worker_id, Some(dead));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_that_loses_its_lease_is_cancelled_and_cannot_record() {
        let clock = Arc::new(ManualClock::new(t0()));
        let stores = HostStores::in_memory(clock.clone());
        let recorder = Arc::new(Recorder::default());
        let id = TaskId::new("nightly-report").unwrap();

        // Already due, so the host's first tick runs it; later ticks never come.
        stores
            .tasks
            .register(NewScheduledTask {
                id: id.clone(),
                group: "reports".into(),
                description: "roll up yesterday".into(),
                task_type: "UntilCancelledTask".into(),
                schedule: "0 * * * * *".into(),
                next_execution: Some(t0()),
                initial_state: None,
            })
            .await
            .unwrap();

        let config = config()
            .with_schedule_poll_interval(Duration::from_secs(3600))
            .with_task_lease(Duration::from_secs(3));
        let mut host = JobHost::new(config, stores.clone(), services(&recorder)).with_clock(clock.clone());
        host.register_task(
            nightly(),
            HandlerFactory::from_services(|services| {
                Ok(UntilCancelledTask {
                    recorder: services.require::<Recorder>()?,
                })
            }),
        )
        .unwrap();
        let handle = host.start().await.unwrap();
        eventually("run start", || recorder.seen() == vec![json!("started")]).await;

        // The lease lapses and another worker restarts the task.
        clock.advance(Duration::from_secs(10));
        let other = WorkerId::new();
        assert!(stores.leases.try_acquire(&task_lease_name(&id), other, Duration::from_secs(60)).await.unwrap());
        let snapshot = stores.tasks.get(&id).await.unwrap().unwrap();
        assert!(stores.tasks.mark_started(&id, snapshot.version, other, clock.now()).await.unwrap());

        eventually_stats(&handle, "superseded outcome", |s| s.task_runs_superseded == 1).await;
        let stats = handle.shutdown().await;

        assert_eq!(recorder.seen(), vec![json!("started"), json!("cancelled")]);
        assert_eq!(stats.task_runs_faulted, 0);

        let task = stores.tasks.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.worker_id, Some(other));
        assert_eq!(task.errors, 0);
        let lease = stores.leases.get(&task_lease_name(&id)).await.unwrap().unwrap();
        assert_eq!(lease.owner, other);

        let run = TaskRun::started_from(&snapshot, other);
        assert!(stores.tasks.mark_completed(&id, run, None, None, None).await.unwrap());
    }

    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    #[test]
    fn invalid_registrations_are_rejected() {
        let stores = HostStores::in_memory(Arc::new(SystemClock));
        let recorder = Arc::new(Recorder::default());
        let mut host = JobHost::new(config(), stores, services(&recorder));

        host.register_queue(queue("emails"), recording_factory()).unwrap();
        let err = host.register_queue(queue("emails"), recording_factory()).unwrap_err();
        assert!(matches!(err, HostError::Registry(_)));

        let bad = TaskRegistration::new(TaskId::new("broken").unwrap(), "whenever");
        let err = host.register_task(bad, counting_factory(false)).unwrap_err();
        assert!(matches!(err, HostError::Schedule { .. }));

        let err = host
            .register_queue(queue("sms").with_instance_count(0), recording_factory())
            .unwrap_err();
        assert!(matches!(err, HostError::Config(_)));
    }
}
