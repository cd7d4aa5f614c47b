// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manages execution of background tasks

use super::BackgroundTask;
use chrono::Utc;
use conductor_db_queries::context::OpContext;
use conductor_types::background::ActivationReason;
use conductor_types::background::CurrentStatus;
use conductor_types::background::CurrentStatusRunning;
use conductor_types::background::LastResult;
use conductor_types::background::LastResultCompleted;
use conductor_types::background::TaskStatus;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Identifies a background task registered with the [`Driver`]
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct TaskName(String);

impl TaskName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a background task's activations run
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskMode {
    /// each activation runs in its own tokio task, counted against the
    /// dispatcher-wide limit on concurrent activations
    Dedicated,
    /// activations run on the task's scheduling loop itself
    ///
    /// The loop does nothing else while an inline activation runs, so this is
    /// only suitable for tasks that are fast and rare.  Inline activations do
    /// not wait for a slot under the dispatcher-wide limit.
    Inline,
}

/// Everything needed to register a background task
pub struct TaskDefinition {
    pub name: String,
    /// what this task does (for developers)
    pub description: String,
    /// how often the task is activated when nobody asks for it explicitly
    pub period: Duration,
    pub mode: TaskMode,
    /// whether a periodic activation may start while an earlier one is still
    /// running
    ///
    /// If not, the periodic activation is skipped (and counted as such).
    pub allow_overlap: bool,
    pub task: Arc<dyn BackgroundTask>,
    /// passed through to the task when it is activated
    pub opctx: OpContext,
}

/// Drives the execution of background tasks
///
/// A conductor has one Driver.  All background tasks are registered with it
/// when the conductor starts.  Each task is scheduled by its own tokio task,
/// and the Driver provides interfaces for monitoring the state of each task
/// (e.g., when it last ran, whether it's currently running, how many
/// activations it skipped).
pub struct Driver {
    tasks: BTreeMap<TaskName, Task>,
    /// bounds the number of dedicated activations running at once
    slots: Arc<Semaphore>,
}

/// Driver-side state of a background task
struct Task {
    description: String,
    period: Duration,
    /// receives updates from the task's scheduling loop
    status: watch::Receiver<TaskStatus>,
    /// the task's scheduling loop
    tokio_task: tokio::task::JoinHandle<()>,
    /// wakes up the scheduling loop when somebody explicitly activates the
    /// task
    notify: Arc<Notify>,
}

impl Driver {
    /// Makes a Driver that runs at most `max_concurrent` dedicated
    /// activations at once
    pub fn new(max_concurrent: usize) -> Driver {
        Driver {
            tasks: BTreeMap::new(),
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Register a new background task
    ///
    /// The task is activated every `period`, and can be activated
    /// immediately by any caller using [`Driver::activate()`].
    ///
    /// This function panics if the name conflicts with that of a
    /// previously-registered task.
    pub fn register(&mut self, definition: TaskDefinition) -> TaskName {
        let TaskDefinition {
            name,
            description,
            period,
            mode,
            allow_overlap,
            task,
            opctx,
        } = definition;

        let (status_tx, status_rx) = watch::channel(TaskStatus {
            current: CurrentStatus::Idle,
            last: LastResult::NeverCompleted,
            skipped: 0,
        });
        let notify = Arc::new(Notify::new());

        let opctx = opctx.child(BTreeMap::from([(
            "background_task".to_string(),
            name.clone(),
        )]));
        let task_exec = TaskExec {
            period,
            mode,
            allow_overlap,
            imp: task,
            notify: Arc::clone(&notify),
            slots: Arc::clone(&self.slots),
            opctx,
            status_tx: Arc::new(status_tx),
            iteration: 0,
            signal_pending: false,
        };
        let tokio_task = tokio::task::spawn(task_exec.run());

        let task_name = TaskName(name);
        let task = Task {
            description,
            period,
            status: status_rx,
            tokio_task,
            notify,
        };
        if self.tasks.insert(task_name.clone(), task).is_some() {
            panic!("started two background tasks called {:?}", task_name.0);
        }
        task_name
    }

    /// Enumerate all registered background tasks
    pub fn tasks(&self) -> impl Iterator<Item = &TaskName> {
        self.tasks.keys()
    }

    fn task_required(&self, task: &TaskName) -> &Task {
        // A TaskName is only handed out by `register()`, so this can only
        // fail if it came from a different Driver.
        self.tasks.get(task).unwrap_or_else(|| {
            panic!("attempted to get non-existent background task: {:?}", task)
        })
    }

    /// Returns a summary of what this task does (for developers)
    pub fn task_description(&self, task: &TaskName) -> &str {
        &self.task_required(task).description
    }

    /// Returns the configured period of the task
    pub fn task_period(&self, task: &TaskName) -> Duration {
        self.task_required(task).period
    }

    /// Activate the specified background task
    ///
    /// If the task is currently running and does not allow overlapping
    /// activations, it will be activated again when it finishes.
    pub fn activate(&self, task: &TaskName) {
        self.task_required(task).notify.notify_one();
    }

    /// Returns the runtime status of the background task
    pub fn task_status(&self, task: &TaskName) -> TaskStatus {
        // Borrowing from a watch channel's receiver blocks the sender.  Clone
        // the status to avoid an errant caller gumming up the works by hanging
        // on to a reference.
        self.task_required(task).status.borrow().clone()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Stopping a scheduling loop also cancels its in-flight activations.
        for (_, t) in &self.tasks {
            t.tokio_task.abort();
        }
    }
}

/// Encapsulates state needed by the scheduling loop of one background task
struct TaskExec {
    period: Duration,
    mode: TaskMode,
    allow_overlap: bool,
    imp: Arc<dyn BackgroundTask>,
    notify: Arc<Notify>,
    slots: Arc<Semaphore>,
    opctx: OpContext,
    status_tx: Arc<watch::Sender<TaskStatus>>,
    /// counts activations of the task, for debuggability
    iteration: u64,
    /// an explicit activation arrived while an activation was in flight
    signal_pending: bool,
}

impl TaskExec {
    /// Body of the tokio task that schedules this background task
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.activate(ActivationReason::Timeout, &mut in_flight)
                        .await;
                },

                _ = self.notify.notified() => {
                    self.activate(ActivationReason::Signaled, &mut in_flight)
                        .await;
                }

                Some(result) = in_flight.join_next(),
                    if !in_flight.is_empty() =>
                {
                    if let Err(error) = result {
                        error!(
                            &self.opctx.log,
                            "background activation did not finish";
                            "error" => %error,
                        );
                    }
                    if self.signal_pending && in_flight.is_empty() {
                        self.signal_pending = false;
                        self.activate(
                            ActivationReason::Signaled,
                            &mut in_flight,
                        )
                        .await;
                    }
                }
            }
        }
    }

    fn is_running(&self) -> bool {
        !self.status_tx.borrow().current.is_idle()
    }

    /// "Activate" the background task
    ///
    /// This basically just invokes `activate()` on the underlying
    /// `BackgroundTask` impl, but provides a bunch of runtime observability
    /// around doing so.
    async fn activate(
        &mut self,
        reason: ActivationReason,
        in_flight: &mut JoinSet<()>,
    ) {
        if !self.allow_overlap && self.is_running() {
            match reason {
                ActivationReason::Timeout => {
                    self.status_tx.send_modify(|status| status.skipped += 1);
                    info!(
                        &self.opctx.log,
                        "skipped, still running";
                        "skipped" => self.status_tx.borrow().skipped,
                    );
                }
                ActivationReason::Signaled => {
                    debug!(
                        &self.opctx.log,
                        "activation requested while running, will run again \
                        when done"
                    );
                    self.signal_pending = true;
                }
            }
            return;
        }

        self.iteration += 1;
        let activation = Activation {
            imp: Arc::clone(&self.imp),
            opctx: self.opctx.clone(),
            status_tx: Arc::clone(&self.status_tx),
            reason,
            iteration: self.iteration,
            start_time: Utc::now(),
            start_instant: Instant::now(),
        };
        activation.mark_started();

        match self.mode {
            TaskMode::Inline => activation.run().await,
            TaskMode::Dedicated => {
                let slots = Arc::clone(&self.slots);
                in_flight.spawn(async move {
                    // The semaphore is never closed.
                    let _permit = slots.acquire_owned().await.ok();
                    activation.run().await
                });
            }
        }
    }
}

/// One activation of a background task
struct Activation {
    imp: Arc<dyn BackgroundTask>,
    opctx: OpContext,
    status_tx: Arc<watch::Sender<TaskStatus>>,
    reason: ActivationReason,
    iteration: u64,
    start_time: chrono::DateTime<Utc>,
    start_instant: Instant,
}

impl Activation {
    fn mark_started(&self) {
        self.status_tx.send_modify(|status| {
            if let CurrentStatus::Running(running) = &mut status.current {
                running.in_flight += 1;
            } else {
                status.current = CurrentStatus::Running(CurrentStatusRunning {
                    start_time: self.start_time,
                    start_instant: self.start_instant,
                    reason: self.reason,
                    iteration: self.iteration,
                    in_flight: 1,
                });
            }
        });
    }

    async fn run(self) {
        debug!(
            &self.opctx.log,
            "activating";
            "reason" => ?self.reason,
            "iteration" => self.iteration,
        );

        // A panicking activation must not take the scheduling loop (or, for
        // inline tasks, the loop's tokio task) down with it.
        let details = match AssertUnwindSafe(self.imp.activate(&self.opctx))
            .catch_unwind()
            .await
        {
            Ok(details) => details,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    &self.opctx.log,
                    "background task panicked";
                    "iteration" => self.iteration,
                    "panic" => &message,
                );
                serde_json::json!({ "error": format!("panicked: {}", message) })
            }
        };

        let elapsed = self.start_instant.elapsed();
        let iteration = self.iteration;
        self.status_tx.send_modify(|status| {
            let still_running = match &mut status.current {
                CurrentStatus::Running(running) if running.in_flight > 1 => {
                    running.in_flight -= 1;
                    true
                }
                _ => false,
            };
            if !still_running {
                status.current = CurrentStatus::Idle;
            }
            status.last = LastResult::Completed(LastResultCompleted {
                iteration,
                start_time: self.start_time,
                reason: self.reason,
                elapsed,
                details,
            });
        });

        debug!(
            &self.opctx.log,
            "activation complete";
            "elapsed" => ?elapsed,
            "iteration" => iteration,
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("(non-string panic payload)")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use conductor_test_utils::dev;
    use conductor_test_utils::dev::poll::wait_for_condition;
    use conductor_test_utils::dev::poll::CondCheckError;
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use tokio::sync::Semaphore as Gate;

    /// Background task that reports how many times it has run
    ///
    /// Each activation first waits for a permit from `gate` (if any), which
    /// lets a test hold an activation in flight.
    struct CountingTask {
        count: AtomicUsize,
        gate: Option<Arc<Gate>>,
    }

    impl CountingTask {
        fn new(gate: Option<Arc<Gate>>) -> Arc<CountingTask> {
            Arc::new(CountingTask { count: AtomicUsize::new(0), gate })
        }
    }

    impl BackgroundTask for CountingTask {
        fn activate<'a>(
            &'a self,
            _opctx: &'a OpContext,
        ) -> BoxFuture<'a, serde_json::Value> {
            async move {
                if let Some(gate) = &self.gate {
                    gate.acquire().await.unwrap().forget();
                }
                let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
                serde_json::json!(count)
            }
            .boxed()
        }
    }

    struct PanickingTask;

    impl BackgroundTask for PanickingTask {
        fn activate<'a>(
            &'a self,
            _opctx: &'a OpContext,
        ) -> BoxFuture<'a, serde_json::Value> {
            async { panic!("oops") }.boxed()
        }
    }

    fn definition(
        name: &str,
        period: Duration,
        mode: TaskMode,
        task: Arc<dyn BackgroundTask>,
        opctx: &OpContext,
    ) -> TaskDefinition {
        TaskDefinition {
            name: name.to_owned(),
            description: format!("test task {}", name),
            period,
            mode,
            allow_overlap: false,
            task,
            opctx: opctx.clone(),
        }
    }

    async fn wait_for_iteration(
        driver: &Driver,
        task: &TaskName,
        iteration: u64,
    ) -> TaskStatus {
        wait_for_condition::<_, (), _, _>(
            || async {
                let status = driver.task_status(task);
                match &status.last {
                    LastResult::Completed(last)
                        if last.iteration >= iteration =>
                    {
                        Ok(status)
                    }
                    _ => Err(CondCheckError::NotYet),
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_activate_on_demand() {
        let logctx = dev::test_setup_log("test_activate_on_demand");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let mut driver = Driver::new(2);
        let task = CountingTask::new(None);
        let name = driver.register(definition(
            "counter",
            Duration::from_secs(3600),
            TaskMode::Dedicated,
            task.clone(),
            &opctx,
        ));
        assert_eq!(driver.tasks().collect::<Vec<_>>(), [&name]);
        assert_eq!(driver.task_description(&name), "test task counter");

        // Every task is activated once when it starts.
        let status = wait_for_iteration(&driver, &name, 1).await;
        let last = status.last.completion().unwrap();
        assert_eq!(last.reason, ActivationReason::Timeout);
        assert_eq!(last.details, serde_json::json!(1));

        driver.activate(&name);
        let status = wait_for_iteration(&driver, &name, 2).await;
        let last = status.last.completion().unwrap();
        assert_eq!(last.reason, ActivationReason::Signaled);
        assert_eq!(last.details, serde_json::json!(2));
        assert_eq!(status.skipped, 0);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_skip_while_running() {
        let logctx = dev::test_setup_log("test_skip_while_running");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let mut driver = Driver::new(2);
        let gate = Arc::new(Gate::new(0));
        let task = CountingTask::new(Some(Arc::clone(&gate)));
        let name = driver.register(definition(
            "slow",
            Duration::from_millis(10),
            TaskMode::Dedicated,
            task.clone(),
            &opctx,
        ));

        // With the first activation stuck, periodic ticks are skipped.
        wait_for_condition::<_, (), _, _>(
            || async {
                if driver.task_status(&name).skipped >= 3 {
                    Ok(())
                } else {
                    Err(CondCheckError::NotYet)
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();
        let status = driver.task_status(&name);
        let running = status.current.running().unwrap();
        assert_eq!(running.iteration, 1);
        assert_eq!(running.in_flight, 1);
        assert!(!status.last.has_completed());

        gate.add_permits(1);
        wait_for_iteration(&driver, &name, 1).await;
        assert_eq!(task.count.load(Ordering::SeqCst), 1);

        // Let the rest through so the test winds down quickly.
        gate.add_permits(1000);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_panic_is_recorded() {
        let logctx = dev::test_setup_log("test_panic_is_recorded");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let mut driver = Driver::new(1);
        let panicking = driver.register(definition(
            "panicky",
            Duration::from_secs(3600),
            TaskMode::Dedicated,
            Arc::new(PanickingTask),
            &opctx,
        ));
        let inline = driver.register(definition(
            "panicky_inline",
            Duration::from_secs(3600),
            TaskMode::Inline,
            Arc::new(PanickingTask),
            &opctx,
        ));
        let healthy = CountingTask::new(None);
        let counter = driver.register(definition(
            "counter",
            Duration::from_secs(3600),
            TaskMode::Dedicated,
            healthy.clone(),
            &opctx,
        ));

        for name in [&panicking, &inline] {
            let status = wait_for_iteration(&driver, name, 1).await;
            assert!(status.current.is_idle());
            let details = status.last.completion().unwrap().details;
            assert_matches!(
                details["error"].as_str(),
                Some(message) if message.contains("oops")
            );
        }

        // Both panicking tasks keep being scheduled, and other tasks are
        // unaffected.
        driver.activate(&panicking);
        driver.activate(&inline);
        wait_for_iteration(&driver, &panicking, 2).await;
        wait_for_iteration(&driver, &inline, 2).await;
        driver.activate(&counter);
        let status = wait_for_iteration(&driver, &counter, 2).await;
        assert_eq!(status.last.completion().unwrap().details, 2);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_signal_while_running_runs_again() {
        let logctx =
            dev::test_setup_log("test_signal_while_running_runs_again");
        let opctx = OpContext::for_tests(logctx.log.clone());
        let mut driver = Driver::new(1);
        let gate = Arc::new(Gate::new(0));
        let task = CountingTask::new(Some(Arc::clone(&gate)));
        let name = driver.register(definition(
            "gated",
            Duration::from_secs(3600),
            TaskMode::Dedicated,
            task.clone(),
            &opctx,
        ));

        wait_for_condition::<_, (), _, _>(
            || async {
                if driver.task_status(&name).current.is_idle() {
                    Err(CondCheckError::NotYet)
                } else {
                    Ok(())
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();

        // An explicit activation while running is neither dropped nor run
        // concurrently.
        driver.activate(&name);
        gate.add_permits(2);
        let status = wait_for_iteration(&driver, &name, 2).await;
        let last = status.last.completion().unwrap();
        assert_eq!(last.reason, ActivationReason::Signaled);
        assert_eq!(task.count.load(Ordering::SeqCst), 2);

        logctx.cleanup_successful();
    }
}
