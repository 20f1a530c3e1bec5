//! The tool-execution fabric: result cache with single-flight
//! reservations, bounded worker pool, progress broker and the
//! invocation dispatcher that ties them together. Everything hangs off
//! an injectable [`Core`] value; there are no process-wide mutables.
//!
//! The core is synchronous and thread-based. The workload is
//! subprocess-bound, so workers are dedicated OS threads and callers
//! block on condvars; only the broker's fan-out uses an async-aware
//! channel so an HTTP layer can stream it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arsenal_common::{CoreConfig, DescriptorRegistry, InvocationRequest, InvokeResult, Outcome};
use arsenal_runner::{ProcessRunner, Runner};
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod broker;
pub mod cache;
pub mod dispatcher;
pub mod invocation;
pub mod pool;
pub mod store;

pub use broker::{Phase, ProgressBroker, ProgressEvent};
pub use cache::{CacheStats, Flight, Lookup, Probe, ProducerHandle, ResultCache};
pub use dispatcher::{Dispatcher, SubmitReceipt};
pub use invocation::{ErrorView, InvocationRecord, StatusView};
pub use pool::{PoolStats, WorkerPool};
pub use store::DiskStore;

/// Mutex access that survives a poisoning panic; the guarded state
/// stays consistent because every critical section is short and
/// assignment-only.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The assembled fabric. Construct one per process and hand it to the
/// front end; drop it to drain the workers.
pub struct Core {
    dispatcher: Dispatcher,
}

impl Core {
    /// Builds the core from configuration, taking the `[tools.*]`
    /// tables as the descriptor registry.
    pub fn new(mut config: CoreConfig, runner: Arc<dyn Runner>) -> InvokeResult<Self> {
        let registry = DescriptorRegistry::new(config.take_tools())?;
        Ok(Core {
            dispatcher: Dispatcher::new(config, registry, runner)?,
        })
    }

    /// The usual production shape: subprocess execution.
    pub fn with_process_runner(config: CoreConfig) -> InvokeResult<Self> {
        Self::new(config, Arc::new(ProcessRunner))
    }

    pub fn submit(&self, request: InvocationRequest) -> InvokeResult<SubmitReceipt> {
        self.dispatcher.submit(request)
    }

    pub fn wait(
        &self,
        handle: Uuid,
        deadline: Option<Instant>,
    ) -> Option<InvokeResult<Arc<Outcome>>> {
        self.dispatcher.wait(handle, deadline)
    }

    pub fn status(&self, handle: Uuid) -> Option<StatusView> {
        self.dispatcher.status(handle)
    }

    pub fn cancel(&self, handle: Uuid) -> bool {
        self.dispatcher.cancel(handle)
    }

    pub fn subscribe(
        &self,
        handle: Uuid,
    ) -> Option<(Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>)> {
        self.dispatcher.subscribe(handle)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.dispatcher.tool_names()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.dispatcher.cache_stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.dispatcher.pool_stats()
    }
}
