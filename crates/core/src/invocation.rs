use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use arsenal_common::{Fingerprint, InvocationState, InvokeError, Outcome};
use arsenal_runner::CancelToken;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::lock;

type RecordResult = Result<Arc<Outcome>, InvokeError>;

struct RecordState {
    state: InvocationState,
    result: Option<RecordResult>,
    finished: Option<Instant>,
}

/// One scheduled execution unit: the authority for its own state and
/// outcome. Identity is the fingerprint plus a monotone attempt
/// counter; the uuid is the caller-facing handle. Waiters block on the
/// condvar until a terminal resolution.
pub struct InvocationRecord {
    pub id: Uuid,
    pub attempt: u64,
    pub tool: String,
    pub fingerprint: Fingerprint,
    pub correlation_id: String,
    /// Served from a stored cache entry at submit time.
    pub cached: bool,
    pub submitted_at: DateTime<Utc>,
    pub cancel: CancelToken,
    state: Mutex<RecordState>,
    done: Condvar,
}

impl InvocationRecord {
    pub fn new(
        fingerprint: Fingerprint,
        tool: impl Into<String>,
        correlation_id: impl Into<String>,
        attempt: u64,
        cached: bool,
    ) -> Arc<Self> {
        Arc::new(InvocationRecord {
            id: Uuid::new_v4(),
            attempt,
            tool: tool.into(),
            fingerprint,
            correlation_id: correlation_id.into(),
            cached,
            submitted_at: Utc::now(),
            cancel: CancelToken::new(),
            state: Mutex::new(RecordState {
                state: InvocationState::Queued,
                result: None,
                finished: None,
            }),
            done: Condvar::new(),
        })
    }

    pub fn state(&self) -> InvocationState {
        lock(&self.state).state
    }

    pub fn mark_running(&self) {
        let mut state = lock(&self.state);
        if state.state == InvocationState::Queued {
            state.state = InvocationState::Running;
        }
    }

    /// First resolution wins; later ones are ignored.
    pub fn resolve(&self, result: RecordResult) {
        {
            let mut state = lock(&self.state);
            if state.result.is_some() {
                return;
            }
            state.state = match &result {
                Ok(outcome) => outcome.state(),
                Err(InvokeError::Cancelled) => InvocationState::Cancelled,
                Err(_) => InvocationState::Failed,
            };
            state.result = Some(result);
            state.finished = Some(Instant::now());
        }
        self.done.notify_all();
    }

    pub fn wait(&self, deadline: Option<Instant>) -> RecordResult {
        let mut state = lock(&self.state);
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            match deadline {
                None => {
                    state = self.done.wait(state).unwrap_or_else(|err| err.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(InvokeError::DeadlineExceeded);
                    }
                    let (guard, _) = self
                        .done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|err| err.into_inner());
                    state = guard;
                }
            }
        }
    }

    pub fn outcome(&self) -> Option<Arc<Outcome>> {
        match &lock(&self.state).result {
            Some(Ok(outcome)) => Some(outcome.clone()),
            _ => None,
        }
    }

    pub fn finished_at(&self) -> Option<Instant> {
        lock(&self.state).finished
    }

    pub fn snapshot(&self) -> StatusView {
        let state = lock(&self.state);
        let (outcome, error) = match &state.result {
            Some(Ok(outcome)) => (Some(outcome.as_ref().clone()), None),
            Some(Err(err)) => (
                None,
                Some(ErrorView {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                }),
            ),
            None => (None, None),
        };
        StatusView {
            handle: self.id,
            tool: self.tool.clone(),
            fingerprint: self.fingerprint.to_string(),
            state: state.state,
            cached: self.cached,
            correlation_id: self.correlation_id.clone(),
            submitted_at: self.submitted_at,
            outcome,
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorView {
    pub kind: String,
    pub message: String,
}

/// Point-in-time view served by `/status/{handle}`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub handle: Uuid,
    pub tool: String,
    pub fingerprint: String,
    pub state: InvocationState,
    pub cached: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorView>,
}
