use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct SupervisorState {
    running: AtomicU64,
    stop: CancellationToken,
    stopped: CancellationToken,
}

impl SupervisorState {
    fn finish_task(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stopped.cancel();
        }
    }
}

/// Owner of the background loops of one component (accept loop, connection loops, scanners).
///
/// Every loop is spawned through [`TaskSupervisor::spawn`] and races the stop token, so
/// `stop()` tears all of them down and `all_stopped()` resolves once the last one has exited.
/// Dropping the supervisor stops it.
///
/// ```rust,no_run
/// # use flarepc::TaskSupervisor;
/// # #[tokio::main]
/// # async fn main() {
/// let supervisor = TaskSupervisor::create();
/// supervisor.spawn("ticker", async {
///     loop {
///         tokio::time::sleep(std::time::Duration::from_secs(1)).await;
///     }
/// });
/// supervisor.stop();
/// supervisor.all_stopped().await;
/// # }
/// ```
#[derive(Debug)]
pub struct TaskSupervisor(Arc<SupervisorState>);

/// Keeps the supervisor's running count up while alive.
#[derive(Debug)]
pub struct TaskGuard(Arc<SupervisorState>);

impl TaskSupervisor {
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        // Holds the count above zero until stop is requested, so `all_stopped` cannot fire
        // before anything was spawned.
        let guard = supervisor.guard();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    /// A cloneable handle to the stop signal, for loops that outlive a borrow of `self`.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.0.stop.clone()
    }

    #[must_use]
    pub fn guard(&self) -> TaskGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskGuard(self.0.clone())
    }

    /// Spawns `task`, cancelling it when the supervisor stops.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.guard();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.stopped() => tracing::debug!("{name} stopped"),
                () = task => {}
            }
        })
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.finish_task();
    }
}
