//! The per-connection executors.
//!
//! Every connection runs on three executors: a dedicated single-threaded
//! I/O executor owning the transport and timers, an application worker
//! pool for user handlers and promise completions, and a small event
//! executor for connection-event listeners. User code never runs on the
//! I/O thread.

use std::future::Future;
use std::io;
use std::sync::Mutex;
use std::thread;

use tokio::runtime;
use tokio::sync::oneshot;
use tracing::debug;

pub(crate) const IO_THREAD: &str = "pipebus-io";
pub(crate) const APP_THREAD: &str = "pipebus-app";
pub(crate) const EVENT_THREAD: &str = "pipebus-event";

/// A current-thread runtime pinned to one named OS thread.
///
/// The thread parks in `block_on` until the shutdown signal fires, driving
/// every task spawned through the handle in the meantime.
pub(crate) struct IoExecutor {
    handle: runtime::Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl IoExecutor {
    fn new() -> io::Result<Self> {
        let rt = runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;

        let handle = rt.handle().clone();
        let (shutdown, signal) = oneshot::channel::<()>();

        thread::Builder::new().name(IO_THREAD.into()).spawn(move || {
            rt.block_on(async {
                let _ = signal.await;
            });

            debug!("i/o executor stopped");
        })?;

        Ok(Self {
            handle,
            shutdown: Mutex::new(Some(shutdown)),
        })
    }

    pub(crate) fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    fn shutdown(&self) {
        if let Some(shutdown) = self.shutdown.lock().expect("executor poisoned").take() {
            let _ = shutdown.send(());
        }
    }
}

/// A worker-pool runtime with named threads.
pub(crate) struct PoolExecutor {
    handle: runtime::Handle,
    runtime: Mutex<Option<runtime::Runtime>>,
}

impl PoolExecutor {
    fn new(name: &'static str, workers: usize) -> io::Result<Self> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(name)
            .enable_time()
            .build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    pub(crate) fn handle(&self) -> runtime::Handle {
        self.handle.clone()
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().expect("executor poisoned").take() {
            // Non-blocking so that shutting down from an async context is
            // fine; the bounded grace period is applied by the caller
            // before we get here.
            runtime.shutdown_background();
        }
    }
}

/// The executor trio of one connection.
pub(crate) struct Executors {
    pub(crate) io: IoExecutor,
    pub(crate) app: PoolExecutor,
    pub(crate) event: PoolExecutor,
}

impl Executors {
    pub(crate) fn new(app_workers: usize) -> io::Result<Self> {
        Ok(Self {
            io: IoExecutor::new()?,
            app: PoolExecutor::new(APP_THREAD, app_workers.max(1))?,
            event: PoolExecutor::new(EVENT_THREAD, 2)?,
        })
    }

    /// The default application worker count.
    pub(crate) fn default_app_workers() -> usize {
        thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(1)
            .max(1)
    }

    pub(crate) fn shutdown(&self) {
        self.io.shutdown();
        self.app.shutdown();
        self.event.shutdown();
    }
}

impl Drop for Executors {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn io_executor_runs_on_its_own_named_thread() {
        let executors = Executors::new(1).unwrap();
        let (tx, rx) = mpsc::channel();

        executors.io.spawn(async move {
            let name = thread::current().name().map(str::to_owned);
            tx.send(name).unwrap();
        });

        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some(IO_THREAD));
        executors.shutdown();
    }

    #[test]
    fn pool_threads_are_named() {
        let executors = Executors::new(2).unwrap();
        let (tx, rx) = mpsc::channel();

        executors.app.spawn(async move {
            let name = thread::current().name().map(str::to_owned);
            tx.send(name).unwrap();
        });

        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some(APP_THREAD));
    }

    #[test]
    fn default_workers_is_at_least_one() {
        assert!(Executors::default_app_workers() >= 1);
    }
}
