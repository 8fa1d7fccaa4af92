//! Persistence layer for churnwatch
//!
//! The engine talks to storage only through the traits defined here.
//! [`MemoryStore`] keeps everything in process; [`PgStore`] persists to
//! PostgreSQL.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PostgresPool};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::models::{
    AlertSettings, Channel, DailyFlow, DigestPeriod, EventType, HourlyActivity, InactiveMember,
    InviterCount, LeaverCount, MemberEvent, MemberStatus, Returnee,
};

/// Append-only store of member events
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event, returning its assigned id
    async fn append(&self, event: &MemberEvent) -> Result<i64>;

    /// Count events of a channel in `[since, until]`, optionally filtered by type.
    /// A missing bound leaves that side open.
    async fn count_events(
        &self,
        channel_id: i64,
        event_type: Option<EventType>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<i64>;

    /// Most recent events first
    async fn recent_events(
        &self,
        channel_id: i64,
        limit: usize,
        event_type: Option<EventType>,
    ) -> Result<Vec<MemberEvent>>;

    /// Joins and departures per UTC day, oldest first
    async fn daily_flow(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DailyFlow>>;

    /// Activity per weekday and hour, Sunday first
    async fn hourly_activity(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HourlyActivity>>;

    /// Inviters with the most joins
    async fn top_inviters(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<InviterCount>>;

    /// Users with the most leaves
    async fn top_leavers(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<LeaverCount>>;

    /// Users who both joined and left in the window
    async fn returnees(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Returnee>>;

    /// Members with no event after `cutoff`, oldest joiners first
    async fn inactive_members(
        &self,
        channel_id: i64,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InactiveMember>>;
}

/// Current membership per channel
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Members grouped by status
    async fn count_by_status(&self, channel_id: i64) -> Result<HashMap<MemberStatus, i64>>;

    /// Set a user's status, creating the member if needed
    async fn upsert_status(
        &self,
        channel_id: i64,
        user_id: i64,
        status: MemberStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Per-channel alert settings and watermarks
///
/// Every setter is an independent atomic mutation. Watermark setters never
/// move a stored value backwards.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Fetch settings, creating them from defaults on first access.
    /// Concurrent first accesses resolve to one row.
    async fn get_or_create(&self, channel_id: i64) -> Result<AlertSettings>;

    /// Persist the threshold and schedule fields of `settings`; watermarks
    /// and the VIP list are left alone
    async fn update_config(&self, settings: &AlertSettings) -> Result<AlertSettings>;

    /// Raise the milestone watermark
    async fn set_last_milestone(&self, channel_id: i64, milestone: i64) -> Result<()>;

    /// Raise the churn alert timestamp
    async fn set_last_churn_alert(&self, channel_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Raise the acknowledgement timestamp of a digest period
    async fn set_last_digest(
        &self,
        channel_id: i64,
        period: DigestPeriod,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Replace the VIP list
    async fn set_vip_ids(&self, channel_id: i64, vip_ids: &BTreeSet<i64>) -> Result<()>;
}

/// Registry of monitored channels
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Channel by id
    async fn get(&self, channel_id: i64) -> Result<Option<Channel>>;

    /// Active channels
    async fn list_active(&self) -> Result<Vec<Channel>>;

    /// Insert or replace a channel
    async fn upsert(&self, channel: &Channel) -> Result<()>;
}

/// Storage bundle handed to the engine
#[derive(Clone)]
pub struct Database {
    /// Channel registry
    pub channels: Arc<dyn ChannelStore>,
    /// Member events
    pub events: Arc<dyn EventStore>,
    /// Member statuses
    pub members: Arc<dyn MemberStore>,
    /// Alert settings
    pub settings: Arc<dyn SettingsStore>,
    postgres: Option<PostgresPool>,
}

impl Database {
    /// Open the store selected by `config.database.url`
    pub async fn new(config: &Config) -> Result<Self> {
        if config.database.is_memory() {
            info!("Using in-memory store");
            return Ok(Self::from_store(Arc::new(MemoryStore::new(
                config.defaults.clone(),
            ))));
        }

        let postgres = PostgresPool::new(&config.database).await?;
        let store = Arc::new(PgStore::new(&postgres, config.defaults.clone()));
        let mut db = Self::from_store(store);
        db.postgres = Some(postgres);
        Ok(db)
    }

    /// Use one backend for every store
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ChannelStore + EventStore + MemberStore + SettingsStore + 'static,
    {
        Self {
            channels: store.clone(),
            events: store.clone(),
            members: store.clone(),
            settings: store,
            postgres: None,
        }
    }

    /// Run database migrations (no-op for the in-memory store)
    pub async fn migrate(&self) -> Result<()> {
        match &self.postgres {
            Some(pg) => pg.migrate().await,
            None => Ok(()),
        }
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        match &self.postgres {
            Some(pg) => pg.health_check().await,
            None => Ok(()),
        }
    }

    /// Record a normalized event: append it and apply its status to the member.
    ///
    /// Returns the event with its store id filled in.
    pub async fn record_member_event(&self, event: &MemberEvent) -> Result<MemberEvent> {
        self.members
            .upsert_status(
                event.channel_id,
                event.user_id,
                event.new_status,
                event.occurred_at,
            )
            .await?;
        let id = self.events.append(event).await?;

        debug!(
            channel_id = event.channel_id,
            user_id = event.user_id,
            event_type = %event.event_type,
            event_id = id,
            "Recorded member event"
        );

        Ok(MemberEvent {
            id: Some(id),
            ..event.clone()
        })
    }
}
