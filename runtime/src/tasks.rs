//! Periodic background tasks with coordinated graceful shutdown.
//!
//! A [`Shutdown`] broadcasts one signal to every task spawned with
//! [`spawn_periodic`]. Each task finishes the tick it is running, then
//! exits; [`Shutdown::join`] waits for all of them with a per-task timeout.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Shutdown coordinator for background tasks.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create a coordinator with no tasks.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            handles: Vec::new(),
        }
    }

    /// A receiver that fires when shutdown is triggered.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Run `tick` every `interval` until shutdown.
    ///
    /// The first tick fires immediately. Ticks never overlap: a slow tick
    /// delays the next one instead of queueing a burst.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, interval: Duration, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = spawn_periodic(name, interval, self.subscribe(), tick);
        self.handles.push((name, handle));
    }

    /// Number of tasks registered.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal every task and wait up to `timeout` for each to stop.
    pub async fn join(self, timeout: Duration) {
        // No receivers just means no task is running.
        let _ = self.tx.send(());

        for (name, handle) in self.handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped gracefully"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
                Err(_) => warn!(task = name, "Task shutdown timed out"),
            }
        }
    }
}

/// Spawn a task that runs `tick` every `interval` until `shutdown` fires.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = name, interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "Periodic task started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(task = name, "Periodic task received shutdown signal");
                    break;
                }
                _ = ticker.tick() => tick().await,
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM.
///
/// If a handler cannot be installed it is logged and that signal is
/// ignored; the other one still works.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut shutdown = Shutdown::new();
        let counter = Arc::clone(&ticks);
        shutdown.spawn_periodic("counter", Duration::from_secs(10), move || {
            let c = Arc::clone(&counter);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(shutdown.task_count(), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.join(Duration::from_secs(1)).await;

        // Immediate first tick, then at 10s and 20s.
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn join_without_tasks_returns() {
        Shutdown::new().join(Duration::from_millis(10)).await;
    }
}
