use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use arsenal_common::{AdmissionPolicy, InvokeError};
use serde::Serialize;
use tracing::{debug, error};

use crate::lock;

pub type Job = Box<dyn FnOnce() + Send>;

struct QueuedJob {
    id: u64,
    class: String,
    run: Job,
}

struct PoolState {
    /// Per-class FIFO queues; a class disappears when its queue runs
    /// dry. BTreeMap gives the round-robin a stable class order.
    queues: BTreeMap<String, VecDeque<QueuedJob>>,
    queued: usize,
    running: usize,
    running_by_class: HashMap<String, usize>,
    /// Last class served, for fair-share rotation.
    cursor: Option<String>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work: Condvar,
    space: Condvar,
    queue_capacity: usize,
    admission: AdmissionPolicy,
    class_caps: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub queued: usize,
    pub running: usize,
}

/// Bounded parallel execution over dedicated OS threads. The worker
/// count is the global concurrency cap; per-class caps are enforced at
/// dequeue. Scheduling is fair-share round-robin across classes and
/// FIFO within a class.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        admission: AdmissionPolicy,
        class_caps: HashMap<String, usize>,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queues: BTreeMap::new(),
                queued: 0,
                running: 0,
                running_by_class: HashMap::new(),
                cursor: None,
                shutdown: false,
            }),
            work: Condvar::new(),
            space: Condvar::new(),
            queue_capacity: queue_capacity.max(1),
            admission,
            class_caps,
        });

        let mut handles = Vec::new();
        for index in 0..workers.max(1) {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("arsenal-worker-{}", index))
                .spawn(move || worker_loop(shared))?;
            handles.push(handle);
        }

        Ok(WorkerPool {
            shared,
            workers: handles,
        })
    }

    /// Admit a job into its class queue. At capacity, reject-policy
    /// refuses with `overloaded`; block-policy waits for space until
    /// the deadline.
    pub fn submit(
        &self,
        class: &str,
        id: u64,
        deadline: Option<Instant>,
        run: Job,
    ) -> Result<(), InvokeError> {
        let mut state = lock(&self.shared.state);
        while state.queued >= self.shared.queue_capacity {
            if state.shutdown {
                return Err(InvokeError::Overloaded("pool is shutting down".into()));
            }
            match self.shared.admission {
                AdmissionPolicy::Reject => {
                    return Err(InvokeError::Overloaded("queue at capacity".into()));
                }
                AdmissionPolicy::Block => match deadline {
                    None => {
                        state = self
                            .shared
                            .space
                            .wait(state)
                            .unwrap_or_else(|err| err.into_inner());
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(InvokeError::Overloaded(
                                "queue stayed full past the admission deadline".into(),
                            ));
                        }
                        let (guard, _) = self
                            .shared
                            .space
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(|err| err.into_inner());
                        state = guard;
                    }
                },
            }
        }
        if state.shutdown {
            return Err(InvokeError::Overloaded("pool is shutting down".into()));
        }

        state
            .queues
            .entry(class.to_string())
            .or_default()
            .push_back(QueuedJob {
                id,
                class: class.to_string(),
                run,
            });
        state.queued += 1;
        self.shared.work.notify_one();
        Ok(())
    }

    /// Remove a still-queued job. Returns false when the job already
    /// started or finished; the caller falls back to its cancel token.
    pub fn cancel(&self, id: u64) -> bool {
        let removed = {
            let mut state = lock(&self.shared.state);
            let state = &mut *state;
            let mut found = None;
            for (class, queue) in state.queues.iter_mut() {
                if let Some(position) = queue.iter().position(|job| job.id == id) {
                    found = queue.remove(position).map(|job| (class.clone(), job));
                    state.queued -= 1;
                    break;
                }
            }
            if let Some((class, _)) = &found {
                if state.queues.get(class).is_some_and(|queue| queue.is_empty()) {
                    state.queues.remove(class);
                }
            }
            found
        };
        let Some((class, job)) = removed else {
            return false;
        };
        self.shared.space.notify_all();
        debug!(id, class = class.as_str(), "dequeued cancelled job");
        // dropping the job outside the lock; its teardown may resolve
        // waiters
        drop(job);
        true
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.shared.state);
        PoolStats {
            queued: state.queued,
            running: state.running,
        }
    }

    /// Stop accepting work, wake everyone and join the workers. Jobs
    /// still queued are dropped; their reservations release on drop.
    pub fn shutdown(&mut self) {
        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
        }
        self.shared.work.notify_all();
        self.shared.space.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = lock(&shared.state);
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job) = take_next(&mut state, &shared.class_caps) {
                    break job;
                }
                state = shared.work.wait(state).unwrap_or_else(|err| err.into_inner());
            }
        };
        shared.space.notify_all();

        let QueuedJob { id, class, run } = job;
        if catch_unwind(AssertUnwindSafe(run)).is_err() {
            // the job wrapper resolves its own flight; the worker
            // just drains the next item
            error!(id, class = class.as_str(), "worker recovered from a panicking job");
        }

        {
            let mut state = lock(&shared.state);
            let state = &mut *state;
            state.running -= 1;
            if let Some(count) = state.running_by_class.get_mut(&class) {
                *count -= 1;
                if *count == 0 {
                    state.running_by_class.remove(&class);
                }
            }
        }
        shared.work.notify_all();
    }
}

fn take_next(state: &mut PoolState, caps: &HashMap<String, usize>) -> Option<QueuedJob> {
    let classes: Vec<String> = state.queues.keys().cloned().collect();
    if classes.is_empty() {
        return None;
    }
    let start = match &state.cursor {
        Some(cursor) => classes
            .iter()
            .position(|class| class > cursor)
            .unwrap_or(0),
        None => 0,
    };

    for offset in 0..classes.len() {
        let class = &classes[(start + offset) % classes.len()];
        let cap = caps.get(class).copied().unwrap_or(usize::MAX);
        if state.running_by_class.get(class).copied().unwrap_or(0) >= cap {
            continue;
        }
        let (job, emptied) = match state.queues.get_mut(class) {
            Some(queue) => match queue.pop_front() {
                Some(job) => {
                    let emptied = queue.is_empty();
                    (job, emptied)
                }
                None => continue,
            },
            None => continue,
        };
        if emptied {
            state.queues.remove(class);
        }
        state.queued -= 1;
        state.running += 1;
        *state.running_by_class.entry(class.clone()).or_insert(0) += 1;
        state.cursor = Some(class.clone());
        return Some(job);
    }
    None
}
