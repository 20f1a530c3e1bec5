use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::lock;

/// Progress phases in per-invocation order: `queued`, `running`, any
/// number of `progress` markers, then exactly one `terminal`.
/// `dropped` is synthesised by a lagging subscriber's stream, never
/// written by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Queued,
    Running,
    Progress,
    Terminal,
    Dropped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Running => "running",
            Phase::Progress => "progress",
            Phase::Terminal => "terminal",
            Phase::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub phase: Phase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

struct Channel {
    log: Vec<ProgressEvent>,
    next_seq: u64,
    sender: broadcast::Sender<ProgressEvent>,
    terminal_at: Option<Instant>,
}

/// Per-invocation pub/sub. Events are sequence-numbered under the
/// channel lock, so the live feed and the replay log agree on order.
/// Records linger for a grace window past the terminal event so late
/// subscribers can still replay from the start; after that they are
/// retired lazily.
pub struct ProgressBroker {
    channels: Mutex<HashMap<Uuid, Channel>>,
    buffer: usize,
    grace: Duration,
}

impl ProgressBroker {
    pub fn new(buffer: usize, grace: Duration) -> Self {
        ProgressBroker {
            channels: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            grace,
        }
    }

    pub fn open(&self, id: Uuid) {
        let mut channels = lock(&self.channels);
        Self::retire_expired(&mut channels, self.grace);
        channels.entry(id).or_insert_with(|| Channel {
            log: Vec::new(),
            next_seq: 0,
            sender: broadcast::channel(self.buffer).0,
            terminal_at: None,
        });
    }

    pub fn emit(
        &self,
        id: Uuid,
        phase: Phase,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) {
        let mut channels = lock(&self.channels);
        let Some(channel) = channels.get_mut(&id) else {
            debug!(%id, phase = phase.as_str(), "progress event for unknown invocation dropped");
            return;
        };
        if channel.terminal_at.is_some() {
            debug!(%id, phase = phase.as_str(), "progress event after terminal dropped");
            return;
        }

        let event = ProgressEvent {
            seq: channel.next_seq,
            phase,
            message: message.into(),
            payload,
            at: Utc::now(),
        };
        channel.next_seq += 1;
        channel.log.push(event.clone());
        if phase == Phase::Terminal {
            channel.terminal_at = Some(Instant::now());
        }
        // best effort: no receivers is fine, the log keeps the replay
        let _ = channel.sender.send(event);
    }

    /// Replay-from-start snapshot plus a live receiver, taken under
    /// one lock so no event is missed or duplicated between them.
    pub fn subscribe(
        &self,
        id: Uuid,
    ) -> Option<(Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>)> {
        let mut channels = lock(&self.channels);
        Self::retire_expired(&mut channels, self.grace);
        let channel = channels.get(&id)?;
        Some((channel.log.clone(), channel.sender.subscribe()))
    }

    pub fn events(&self, id: Uuid) -> Option<Vec<ProgressEvent>> {
        lock(&self.channels).get(&id).map(|channel| channel.log.clone())
    }

    fn retire_expired(channels: &mut HashMap<Uuid, Channel>, grace: Duration) {
        channels.retain(|_, channel| match channel.terminal_at {
            Some(at) => at.elapsed() < grace,
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> ProgressBroker {
        ProgressBroker::new(64, Duration::from_secs(5))
    }

    #[test]
    fn events_are_sequenced_in_order() {
        let broker = broker();
        let id = Uuid::new_v4();
        broker.open(id);
        broker.emit(id, Phase::Queued, "queued", None);
        broker.emit(id, Phase::Running, "running", None);
        broker.emit(id, Phase::Progress, "host up", None);
        broker.emit(id, Phase::Terminal, "succeeded", None);

        let events = broker.events(id).expect("events");
        let seqs: Vec<u64> = events.iter().map(|event| event.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(events.last().map(|event| event.phase), Some(Phase::Terminal));
    }

    #[test]
    fn nothing_follows_the_terminal_event() {
        let broker = broker();
        let id = Uuid::new_v4();
        broker.open(id);
        broker.emit(id, Phase::Terminal, "cancelled", None);
        broker.emit(id, Phase::Progress, "late line", None);

        let events = broker.events(id).expect("events");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn late_subscriber_replays_from_start() {
        let broker = broker();
        let id = Uuid::new_v4();
        broker.open(id);
        broker.emit(id, Phase::Queued, "queued", None);
        broker.emit(id, Phase::Running, "running", None);

        let (replay, mut live) = broker.subscribe(id).expect("subscribe");
        assert_eq!(replay.len(), 2);

        broker.emit(id, Phase::Terminal, "succeeded", None);
        let next = live.try_recv().expect("live event");
        assert_eq!(next.seq, 2);
        assert_eq!(next.phase, Phase::Terminal);
    }

    #[test]
    fn terminal_records_retire_after_grace() {
        let broker = ProgressBroker::new(64, Duration::from_millis(20));
        let id = Uuid::new_v4();
        broker.open(id);
        broker.emit(id, Phase::Terminal, "succeeded", None);

        std::thread::sleep(Duration::from_millis(40));
        // retirement is lazy, triggered by the next open
        broker.open(Uuid::new_v4());
        assert!(broker.events(id).is_none());
    }

    #[test]
    fn subscribe_retires_expired_channels_itself() {
        let broker = ProgressBroker::new(64, Duration::from_millis(20));
        let id = Uuid::new_v4();
        broker.open(id);
        broker.emit(id, Phase::Terminal, "succeeded", None);

        std::thread::sleep(Duration::from_millis(40));
        // no intervening open; the subscribe sweeps on its own
        assert!(broker.subscribe(id).is_none());
    }

    #[test]
    fn unknown_invocation_has_no_events() {
        let broker = broker();
        assert!(broker.events(Uuid::new_v4()).is_none());
        assert!(broker.subscribe(Uuid::new_v4()).is_none());
    }
}
