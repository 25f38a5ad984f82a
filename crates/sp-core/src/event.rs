//! Typed presence events delivered by the external event source.
//!
//! The event source (a chat platform adapter, a replay file, a test
//! harness) is responsible for at-least-once delivery; duplicate joins
//! and leaves are tolerated by the tracker.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, EventRunId, ParticipantId};

/// A participant joined a tracked channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEvent {
    /// The event run the channel belongs to.
    pub event: EventRunId,
    /// The channel that was joined.
    pub channel: ChannelId,
    /// The joining participant.
    pub participant: ParticipantId,
    /// Display name at join time.
    pub display_name: String,
    /// Org-membership classification at join time. Informational only;
    /// must never affect the payroll rate.
    #[serde(default)]
    pub member: bool,
    /// When the join occurred.
    pub at: DateTime<Utc>,
}

/// A participant left a tracked channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveEvent {
    /// The event run the channel belongs to.
    pub event: EventRunId,
    /// The channel that was left.
    pub channel: ChannelId,
    /// The leaving participant.
    pub participant: ParticipantId,
    /// When the leave occurred.
    pub at: DateTime<Utc>,
}

/// Live channel membership at a point in time.
///
/// Carried on every tick so the tracker can cross-check open sessions
/// against who is actually present; leave events can be missed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roster(HashMap<ChannelId, HashSet<ParticipantId>>);

impl Roster {
    /// Creates an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a participant present in a channel.
    pub fn insert(&mut self, channel: ChannelId, participant: ParticipantId) {
        self.0.entry(channel).or_default().insert(participant);
    }

    /// Returns whether the participant is present in the channel.
    #[must_use]
    pub fn contains(&self, channel: &ChannelId, participant: &ParticipantId) -> bool {
        self.0
            .get(channel)
            .is_some_and(|members| members.contains(participant))
    }
}

impl FromIterator<(ChannelId, ParticipantId)> for Roster {
    fn from_iter<I: IntoIterator<Item = (ChannelId, ParticipantId)>>(iter: I) -> Self {
        let mut roster = Self::new();
        for (channel, participant) in iter {
            roster.insert(channel, participant);
        }
        roster
    }
}

/// The periodic checkpoint signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    /// When the tick fired.
    pub now: DateTime<Utc>,
    /// Live membership snapshot across tracked channels.
    pub roster: Roster,
}

/// A presence signal from the event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// A participant joined a channel.
    Join(JoinEvent),
    /// A participant left a channel.
    Leave(LeaveEvent),
    /// Periodic checkpoint with the live roster.
    Tick(TickEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str) -> ChannelId {
        ChannelId::new(id).unwrap()
    }

    fn participant(id: &str) -> ParticipantId {
        ParticipantId::new(id).unwrap()
    }

    #[test]
    fn join_event_serde_roundtrip() {
        let event = PresenceEvent::Join(JoinEvent {
            event: EventRunId::new("op-1").unwrap(),
            channel: channel("mining-alpha"),
            participant: participant("pilot-1"),
            display_name: "Pilot One".to_string(),
            member: true,
            at: Utc::now(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"join\""));
        let parsed: PresenceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn join_member_defaults_false() {
        let json = r#"{
            "type": "join",
            "event": "op-1",
            "channel": "mining-alpha",
            "participant": "pilot-1",
            "display_name": "Pilot One",
            "at": "2026-08-01T18:00:00Z"
        }"#;
        let parsed: PresenceEvent = serde_json::from_str(json).unwrap();
        let PresenceEvent::Join(join) = parsed else {
            panic!("expected join");
        };
        assert!(!join.member);
    }

    #[test]
    fn event_rejects_empty_ids() {
        let json = r#"{
            "type": "leave",
            "event": "",
            "channel": "mining-alpha",
            "participant": "pilot-1",
            "at": "2026-08-01T18:00:00Z"
        }"#;
        let result: Result<PresenceEvent, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn roster_membership() {
        let roster: Roster = [
            (channel("a"), participant("p1")),
            (channel("a"), participant("p2")),
            (channel("b"), participant("p1")),
        ]
        .into_iter()
        .collect();

        assert!(roster.contains(&channel("a"), &participant("p1")));
        assert!(roster.contains(&channel("b"), &participant("p1")));
        assert!(!roster.contains(&channel("b"), &participant("p2")));
        assert!(!roster.contains(&channel("c"), &participant("p1")));
    }

    #[test]
    fn tick_roster_serde_roundtrip() {
        let tick = TickEvent {
            now: Utc::now(),
            roster: [(channel("a"), participant("p1"))].into_iter().collect(),
        };
        let json = serde_json::to_string(&tick).unwrap();
        let parsed: TickEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tick);
    }
}
