use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canon::Fingerprint;

/// How a subprocess ended. A non-zero exit is still `exited`; the exit
/// code travels separately in the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    Exited,
    Timeout,
    Killed,
    Cancelled,
    SpawnError,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Exited => "exited",
            Termination::Timeout => "timeout",
            Termination::Killed => "killed",
            Termination::Cancelled => "cancelled",
            Termination::SpawnError => "spawn-error",
        }
    }
}

/// Lifecycle state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvocationState::Queued | InvocationState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationState::Queued => "queued",
            InvocationState::Running => "running",
            InvocationState::Succeeded => "succeeded",
            InvocationState::Failed => "failed",
            InvocationState::Cancelled => "cancelled",
            InvocationState::TimedOut => "timed-out",
        }
    }
}

impl From<Termination> for InvocationState {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Exited => InvocationState::Succeeded,
            Termination::Timeout | Termination::Killed => InvocationState::TimedOut,
            Termination::Cancelled => InvocationState::Cancelled,
            Termination::SpawnError => InvocationState::Failed,
        }
    }
}

/// A captured standard stream, bounded by the per-stream byte cap.
/// Raw bytes on the wire (base64 in JSON); callers decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCapture {
    #[serde(with = "b64")]
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl StreamCapture {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// The bit-stable record of one completed invocation. The unique
/// authority for its own result; cache entries snapshot it verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub fingerprint: Fingerprint,
    pub tool: String,
    pub exit_code: Option<i32>,
    pub termination: Termination,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signal: Option<i32>,
    pub stdout: StreamCapture,
    pub stderr: StreamCapture,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peak_rss_kb: Option<u64>,
}

impl Outcome {
    pub fn state(&self) -> InvocationState {
        self.termination.into()
    }

    /// Approximate in-memory footprint, used for the cache byte budget.
    pub fn size_bytes(&self) -> u64 {
        (self.stdout.bytes.len() + self.stderr.bytes.len() + self.tool.len() + 256) as u64
    }

    /// Synthesised record for work that never reached a subprocess,
    /// e.g. cancellation while still queued.
    pub fn without_process(
        fingerprint: Fingerprint,
        tool: impl Into<String>,
        termination: Termination,
    ) -> Self {
        let now = Utc::now();
        Outcome {
            fingerprint,
            tool: tool.into(),
            exit_code: None,
            termination,
            signal: None,
            stdout: StreamCapture::default(),
            stderr: StreamCapture::default(),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            peak_rss_kb: None,
        }
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_maps_to_state() {
        assert_eq!(
            InvocationState::from(Termination::Exited),
            InvocationState::Succeeded
        );
        assert_eq!(
            InvocationState::from(Termination::Killed),
            InvocationState::TimedOut
        );
        assert_eq!(
            InvocationState::from(Termination::SpawnError),
            InvocationState::Failed
        );
        assert!(InvocationState::Succeeded.is_terminal());
        assert!(!InvocationState::Running.is_terminal());
    }

    #[test]
    fn outcome_json_is_bit_stable() {
        let outcome = Outcome {
            fingerprint: Fingerprint::from_hex("ab12"),
            tool: "echo".into(),
            exit_code: Some(0),
            termination: Termination::Exited,
            signal: None,
            stdout: StreamCapture {
                bytes: b"hi\n".to_vec(),
                truncated: false,
            },
            stderr: StreamCapture::default(),
            started_at: DateTime::<Utc>::from_timestamp(10, 0).unwrap(),
            ended_at: DateTime::<Utc>::from_timestamp(11, 0).unwrap(),
            duration_ms: 1_000,
            peak_rss_kb: None,
        };

        let first = serde_json::to_string(&outcome).expect("serialize");
        let second = serde_json::to_string(&outcome).expect("serialize again");
        assert_eq!(first, second);

        let back: Outcome = serde_json::from_str(&first).expect("deserialize");
        assert_eq!(back, outcome);
        assert!(first.contains("\"termination\":\"exited\""));
    }

    #[test]
    fn stream_bytes_roundtrip_base64() {
        let capture = StreamCapture {
            bytes: vec![0, 159, 146, 150],
            truncated: true,
        };
        let json = serde_json::to_string(&capture).expect("serialize");
        let back: StreamCapture = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, capture);
    }
}
