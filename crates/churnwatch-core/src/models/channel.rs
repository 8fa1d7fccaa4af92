//! Channel data model

use serde::{Deserialize, Serialize};

/// A monitored community
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Platform identifier of the channel
    pub id: i64,

    /// Display title
    pub title: String,

    /// Operator who registered the channel
    pub admin_user_id: i64,

    /// Chat that receives alerts and digests
    pub notify_chat_id: Option<i64>,

    /// Whether the channel is still being tracked
    pub is_active: bool,
}

impl Channel {
    /// Create an active channel that notifies `notify_chat_id`
    pub fn new(id: i64, title: impl Into<String>, admin_user_id: i64, notify_chat_id: Option<i64>) -> Self {
        Self {
            id,
            title: title.into(),
            admin_user_id,
            notify_chat_id,
            is_active: true,
        }
    }

    /// Notification target, if the channel has one and is active
    pub fn notify_target(&self) -> Option<i64> {
        if self.is_active {
            self.notify_chat_id
        } else {
            None
        }
    }
}
