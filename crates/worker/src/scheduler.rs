//! Schedule pool for recurring background tasks.
//!
//! A task is a named function that runs on the pool when scheduled. At most
//! one execution of a task is in progress at a time; scheduling it while it
//! runs makes it run once more afterwards. Tasks are created deactivated and
//! ignore every schedule request until activated.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::trace;

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type TaskFunc = Box<dyn Fn() -> TaskFuture + Send + Sync + 'static>;

/// Executes background tasks, at most `size` at once.
#[derive(Clone)]
pub struct BackgroundSchedulePool {
    runtime: Handle,
    slots: Arc<Semaphore>,
    size: usize,
}

impl BackgroundSchedulePool {
    /// Creates a pool running on the current runtime.
    pub fn new(size: usize) -> Self {
        Self::with_handle(size, Handle::current())
    }

    pub fn with_handle(size: usize, runtime: Handle) -> Self {
        let size = size.max(1);
        Self {
            runtime,
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Creates a deactivated task.
    pub fn create_task<F, Fut>(&self, name: impl Into<String>, func: F) -> TaskHolder
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        TaskHolder(Arc::new(TaskInfo {
            name: name.into(),
            func: Box::new(move || Box::pin(func())),
            runtime: self.runtime.clone(),
            slots: self.slots.clone(),
            state: Mutex::new(TaskState {
                deactivated: true,
                ..Default::default()
            }),
            exec: tokio::sync::Mutex::new(()),
        }))
    }
}

#[derive(Default)]
struct TaskState {
    deactivated: bool,
    scheduled: bool,
    executing: bool,
    delayed: Option<JoinHandle<()>>,
}

struct TaskInfo {
    name: String,
    func: TaskFunc,
    runtime: Handle,
    slots: Arc<Semaphore>,
    state: Mutex<TaskState>,
    exec: tokio::sync::Mutex<()>,
}

impl TaskInfo {
    fn schedule(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if state.deactivated || state.scheduled {
            return false;
        }

        state.scheduled = true;
        if let Some(delayed) = state.delayed.take() {
            delayed.abort();
        }
        if !state.executing {
            self.runtime.spawn(self.clone().execute());
        }
        true
    }

    /// One run of the task, respawning itself if scheduled meanwhile.
    fn execute(self: Arc<Self>) -> TaskFuture {
        Box::pin(async move {
            let Ok(_slot) = self.slots.clone().acquire_owned().await else {
                return;
            };
            let exec = self.exec.lock().await;

            {
                let mut state = self.state.lock();
                if state.deactivated || !state.scheduled {
                    return;
                }
                state.scheduled = false;
                state.executing = true;
            }

            trace!(task = %self.name, "Executing background task");
            (self.func)().await;

            let run_again = {
                let mut state = self.state.lock();
                state.executing = false;
                state.scheduled && !state.deactivated
            };
            drop(exec);

            if run_again {
                self.runtime.spawn(self.clone().execute());
            }
        })
    }
}

/// Handle to a task of a [`BackgroundSchedulePool`]. Cheap to clone.
#[derive(Clone)]
pub struct TaskHolder(Arc<TaskInfo>);

impl TaskHolder {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Allows the task to be scheduled. Returns false if it already was active.
    pub fn activate(&self) -> bool {
        let mut state = self.0.state.lock();
        let was_deactivated = state.deactivated;
        state.deactivated = false;
        was_deactivated
    }

    pub fn activate_and_schedule(&self) -> bool {
        self.activate();
        self.schedule()
    }

    /// Schedules an immediate run. Returns false if the task is deactivated
    /// or already scheduled.
    pub fn schedule(&self) -> bool {
        self.0.schedule()
    }

    /// Schedules a run after `delay`, replacing a pending delayed run.
    pub fn schedule_after(&self, delay: Duration) -> bool {
        let mut state = self.0.state.lock();
        if state.deactivated || state.scheduled {
            return false;
        }

        if let Some(previous) = state.delayed.take() {
            previous.abort();
        }

        let task: Weak<TaskInfo> = Arc::downgrade(&self.0);
        state.delayed = Some(self.0.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(task) = task.upgrade() {
                task.state.lock().delayed = None;
                task.schedule();
            }
        }));
        true
    }

    /// Prevents further runs and waits for a running execution to finish.
    pub async fn deactivate(&self) {
        {
            let mut state = self.0.state.lock();
            state.deactivated = true;
        }

        let _exec = self.0.exec.lock().await;
        let mut state = self.0.state.lock();
        state.deactivated = true;
        state.scheduled = false;
        if let Some(delayed) = state.delayed.take() {
            delayed.abort();
        }
    }

    pub fn is_deactivated(&self) -> bool {
        self.0.state.lock().deactivated
    }

    pub fn is_scheduled(&self) -> bool {
        let state = self.0.state.lock();
        state.scheduled || state.delayed.is_some()
    }

    pub fn is_executing(&self) -> bool {
        self.0.state.lock().executing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(
        pool: &BackgroundSchedulePool,
        runs: Arc<AtomicUsize>,
        work: Duration,
    ) -> TaskHolder {
        pool.create_task("counting", move || {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(work).await;
            }
        })
    }

    #[tokio::test]
    async fn test_deactivated_task_never_runs() {
        let pool = BackgroundSchedulePool::new(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, runs.clone(), Duration::ZERO);

        assert!(!task.schedule());
        assert!(!task.schedule_after(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_activate_and_schedule_runs_once() {
        let pool = BackgroundSchedulePool::new(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, runs.clone(), Duration::ZERO);

        assert!(task.activate_and_schedule());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!task.is_scheduled());
    }

    #[tokio::test]
    async fn test_schedule_while_executing_runs_again() {
        let pool = BackgroundSchedulePool::new(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, runs.clone(), Duration::from_millis(30));

        task.activate_and_schedule();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task.is_executing());
        assert!(task.schedule());
        assert!(!task.schedule());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_schedule_after_delay() {
        let pool = BackgroundSchedulePool::new(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, runs.clone(), Duration::ZERO);
        task.activate();

        assert!(task.schedule_after(Duration::from_millis(40)));
        assert!(task.is_scheduled());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deactivate_cancels_delayed_run() {
        let pool = BackgroundSchedulePool::new(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, runs.clone(), Duration::ZERO);
        task.activate();

        task.schedule_after(Duration::from_millis(20));
        task.deactivate().await;
        assert!(task.is_deactivated());
        assert!(!task.is_scheduled());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deactivate_waits_for_execution() {
        let pool = BackgroundSchedulePool::new(1);
        let finished = Arc::new(AtomicUsize::new(0));
        let task = {
            let finished = finished.clone();
            pool.create_task("slow", move || {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        task.activate_and_schedule();
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.deactivate().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_size_bounds_concurrency() {
        let pool = BackgroundSchedulePool::new(1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<TaskHolder> = (0..3)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();
                pool.create_task(format!("task-{}", i), move || {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for task in &tasks {
            task.activate_and_schedule();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
