use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::Result;
use crate::Error;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Runs registered tasks on fixed intervals until shut down.
///
/// The first run of a task happens one full interval after registration.
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task. Must be called within a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        tracing::info!(task = task.name(), interval = ?task.interval(), "Registering task");
        let handle = self.spawn_timer_loop(task);
        self.tasks
            .lock()
            .map_err(|_| Error::MutexPoisoned)?
            .push(handle);
        Ok(self)
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                run = run_id,
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), runs = run_id, "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown_tx.send(()).ok();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map_err(|_| Error::MutexPoisoned)?
            .drain(..)
            .collect();

        for task in tasks {
            task.await
                .map_err(|e| Error::InvalidOperation(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        interval: Duration,
        counter: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting-task"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, ctx: Context) -> Result<()> {
            assert_eq!(ctx.task_name, "counting-task");
            self.counter.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::InvalidOperation("sweep failed".into()));
            }
            Ok(())
        }
    }

    fn counting(interval: Duration, fail: bool) -> (Arc<CountingTask>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(CountingTask {
            interval,
            counter: counter.clone(),
            fail,
        });
        (task, counter)
    }

    #[tokio::test]
    async fn test_task_runs_periodically() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, counter) = counting(Duration::from_millis(10), false);

        scheduler.register(task)?;
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_first_run_waits_one_interval() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, counter) = counting(Duration::from_secs(3600), false);

        scheduler.register(task)?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_task_keeps_running() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, counter) = counting(Duration::from_millis(10), true);

        scheduler.register(task)?;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_graceful_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, counter) = counting(Duration::from_millis(10), false);

        scheduler.register(task)?;
        tokio::time::sleep(Duration::from_millis(25)).await;

        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        assert!(start.elapsed() < Duration::from_millis(100));

        let count_after_shutdown = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(counter.load(Ordering::SeqCst), count_after_shutdown);

        Ok(())
    }
}
