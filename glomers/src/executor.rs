//! Defines the [`Executor`] trait and a [thread-per-task implementation][StdThread].

use futures::FutureExt;

use crate::error::SpawnError;

/// Runs the background tasks of an engine, e.g. delivery retries and the
/// broadcast flush loop.
pub trait Executor: Clone + Send + Sync + 'static {
    /// Executes the given task to completion, detached from the caller.
    fn execute<F: std::future::Future<Output = ()> + Send + 'static>(
        &self,
        task: F,
    ) -> Result<(), SpawnError>;
}

impl<S: futures::task::Spawn + Clone + Send + Sync + 'static> Executor for S {
    fn execute<F: std::future::Future<Output = ()> + Send + 'static>(
        &self,
        task: F,
    ) -> Result<(), SpawnError> {
        self.spawn_obj(futures::task::FutureObj::from(task.boxed()))
            .map_err(|err| SpawnError::Rejected(Box::new(err)))
    }
}

/// Executor which spawns a new thread for each task.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdThread;

impl Executor for StdThread {
    fn execute<F: std::future::Future<Output = ()> + Send + 'static>(
        &self,
        task: F,
    ) -> Result<(), SpawnError> {
        let thread_builder = std::thread::Builder::new();

        thread_builder
            .spawn(|| {
                futures::executor::block_on(task);
            })
            .map(|_| ())
            .map_err(|err| SpawnError::Rejected(Box::new(err)))
    }
}
