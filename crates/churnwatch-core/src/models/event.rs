//! Member event data model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Kind of membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// User joined (or re-joined)
    Join,
    /// User left on their own
    Leave,
    /// User was removed by an admin
    Kick,
    /// User was banned
    Ban,
    /// Ban was lifted
    Unban,
    /// Any other status transition
    StatusChange,
}

impl EventType {
    /// All event types, in storage order
    pub const ALL: [EventType; 6] = [
        EventType::Join,
        EventType::Leave,
        EventType::Kick,
        EventType::Ban,
        EventType::Unban,
        EventType::StatusChange,
    ];

    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Join => "join",
            EventType::Leave => "leave",
            EventType::Kick => "kick",
            EventType::Ban => "ban",
            EventType::Unban => "unban",
            EventType::StatusChange => "status_change",
        }
    }

    /// Whether the user is no longer a member after this event
    pub fn is_departure(self) -> bool {
        matches!(self, EventType::Leave | EventType::Kick | EventType::Ban)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown event type: {s}")))
    }
}

/// Membership status of a user in a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Current member
    Member,
    /// Left voluntarily
    Left,
    /// Removed by an admin
    Kicked,
    /// Banned
    Banned,
}

impl MemberStatus {
    /// All statuses, in storage order
    pub const ALL: [MemberStatus; 4] = [
        MemberStatus::Member,
        MemberStatus::Left,
        MemberStatus::Kicked,
        MemberStatus::Banned,
    ];

    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Member => "member",
            MemberStatus::Left => "left",
            MemberStatus::Kicked => "kicked",
            MemberStatus::Banned => "banned",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MemberStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown member status: {s}")))
    }
}

/// An immutable membership fact, normalized before it reaches the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEvent {
    /// Store-assigned identifier (absent until appended)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Channel the event belongs to
    pub channel_id: i64,

    /// User whose membership changed
    pub user_id: i64,

    /// Kind of change
    pub event_type: EventType,

    /// Status before the change
    #[serde(default)]
    pub old_status: Option<MemberStatus>,

    /// Status after the change
    pub new_status: MemberStatus,

    /// User who invited the member (joins only)
    #[serde(default)]
    pub inviter_id: Option<i64>,

    /// When the change happened
    pub occurred_at: DateTime<Utc>,
}

impl MemberEvent {
    /// Build an event with the status implied by its type
    pub fn new(channel_id: i64, user_id: i64, event_type: EventType, occurred_at: DateTime<Utc>) -> Self {
        let (old_status, new_status) = match event_type {
            EventType::Join => (Some(MemberStatus::Left), MemberStatus::Member),
            EventType::Leave => (Some(MemberStatus::Member), MemberStatus::Left),
            EventType::Kick => (Some(MemberStatus::Member), MemberStatus::Kicked),
            EventType::Ban => (Some(MemberStatus::Member), MemberStatus::Banned),
            EventType::Unban => (Some(MemberStatus::Banned), MemberStatus::Left),
            EventType::StatusChange => (Some(MemberStatus::Member), MemberStatus::Member),
        };

        Self {
            id: None,
            channel_id,
            user_id,
            event_type,
            old_status,
            new_status,
            inviter_id: None,
            occurred_at,
        }
    }

    /// Attach the inviting user
    #[must_use]
    pub fn with_inviter(mut self, inviter_id: i64) -> Self {
        self.inviter_id = Some(inviter_id);
        self
    }
}
