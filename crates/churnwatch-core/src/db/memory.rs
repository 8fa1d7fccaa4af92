//! In-process store
//!
//! Implements every store trait over maps guarded by a single lock. Used by
//! tests, dry runs and `memory://` deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use parking_lot::RwLock;

use crate::config::AlertDefaults;
use crate::error::Result;
use crate::models::{
    AlertSettings, Channel, DailyFlow, DigestPeriod, EventType, HourlyActivity, InactiveMember,
    InviterCount, LeaverCount, MemberEvent, MemberStatus, Returnee,
};

use super::{ChannelStore, EventStore, MemberStore, SettingsStore};

#[derive(Debug, Clone)]
struct MemberRecord {
    status: MemberStatus,
    joined_at: Option<DateTime<Utc>>,
    left_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MemoryState {
    channels: HashMap<i64, Channel>,
    events: Vec<MemberEvent>,
    members: HashMap<(i64, i64), MemberRecord>,
    settings: HashMap<i64, AlertSettings>,
    next_event_id: i64,
}

impl MemoryState {
    fn events_since(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = &MemberEvent> {
        self.events.iter().filter(move |e| {
            e.channel_id == channel_id && since.map_or(true, |s| e.occurred_at >= s)
        })
    }

    fn settings_mut(&mut self, channel_id: i64, defaults: &AlertDefaults) -> &mut AlertSettings {
        self.settings
            .entry(channel_id)
            .or_insert_with(|| AlertSettings::new(channel_id, defaults))
    }
}

/// Store that keeps all state in memory
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    defaults: AlertDefaults,
}

impl MemoryStore {
    /// Create an empty store; new alert settings start from `defaults`
    pub fn new(defaults: AlertDefaults) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_event_id: 1,
                ..MemoryState::default()
            }),
            defaults,
        }
    }

    /// Number of stored events across all channels
    pub fn event_count(&self) -> usize {
        self.state.read().events.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(AlertDefaults::default())
    }
}

/// Sort grouped counts by count descending, then key ascending
fn rank<K: Ord + Copy>(counts: HashMap<K, i64>, limit: usize) -> Vec<(K, i64)> {
    let mut ranked: Vec<(K, i64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: &MemberEvent) -> Result<i64> {
        let mut state = self.state.write();
        let id = state.next_event_id;
        state.next_event_id += 1;
        state.events.push(MemberEvent {
            id: Some(id),
            ..event.clone()
        });
        Ok(id)
    }

    async fn count_events(
        &self,
        channel_id: i64,
        event_type: Option<EventType>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let state = self.state.read();
        let count = state
            .events_since(channel_id, since)
            .filter(|e| until.map_or(true, |u| e.occurred_at <= u))
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn recent_events(
        &self,
        channel_id: i64,
        limit: usize,
        event_type: Option<EventType>,
    ) -> Result<Vec<MemberEvent>> {
        let state = self.state.read();
        let mut events: Vec<MemberEvent> = state
            .events_since(channel_id, None)
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at).then(b.id.cmp(&a.id)));
        events.truncate(limit);
        Ok(events)
    }

    async fn daily_flow(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DailyFlow>> {
        let state = self.state.read();
        let mut by_day: BTreeMap<NaiveDate, DailyFlow> = BTreeMap::new();

        for event in state.events_since(channel_id, since) {
            let day = event.occurred_at.date_naive();
            let flow = by_day.entry(day).or_insert_with(|| DailyFlow {
                day,
                joins: 0,
                leaves: 0,
                kicks: 0,
                bans: 0,
                net: 0,
            });
            match event.event_type {
                EventType::Join => flow.joins += 1,
                EventType::Leave => flow.leaves += 1,
                EventType::Kick => flow.kicks += 1,
                EventType::Ban => flow.bans += 1,
                EventType::Unban | EventType::StatusChange => {}
            }
        }

        Ok(by_day
            .into_values()
            .map(|mut flow| {
                flow.net = flow.joins - flow.leaves - flow.kicks;
                flow
            })
            .collect())
    }

    async fn hourly_activity(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HourlyActivity>> {
        let state = self.state.read();
        let mut buckets: BTreeMap<(u32, u32), HourlyActivity> = BTreeMap::new();

        for event in state.events_since(channel_id, since) {
            let weekday = event.occurred_at.weekday();
            let hour = event.occurred_at.hour();
            let bucket = buckets
                .entry((weekday.num_days_from_sunday(), hour))
                .or_insert_with(|| HourlyActivity {
                    weekday,
                    hour,
                    events: 0,
                    joins: 0,
                    leaves: 0,
                    net: 0,
                });
            bucket.events += 1;
            if event.event_type == EventType::Join {
                bucket.joins += 1;
            } else if event.event_type.is_departure() {
                bucket.leaves += 1;
            }
        }

        Ok(buckets
            .into_values()
            .map(|mut bucket| {
                bucket.net = bucket.joins - bucket.leaves;
                bucket
            })
            .collect())
    }

    async fn top_inviters(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<InviterCount>> {
        let state = self.state.read();
        let mut counts = HashMap::new();
        for event in state.events_since(channel_id, since) {
            if event.event_type != EventType::Join {
                continue;
            }
            if let Some(inviter_id) = event.inviter_id {
                *counts.entry(inviter_id).or_insert(0) += 1;
            }
        }
        Ok(rank(counts, limit)
            .into_iter()
            .map(|(inviter_id, joins)| InviterCount { inviter_id, joins })
            .collect())
    }

    async fn top_leavers(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<LeaverCount>> {
        let state = self.state.read();
        let mut counts = HashMap::new();
        for event in state.events_since(channel_id, since) {
            if event.event_type == EventType::Leave {
                *counts.entry(event.user_id).or_insert(0) += 1;
            }
        }
        Ok(rank(counts, limit)
            .into_iter()
            .map(|(user_id, leaves)| LeaverCount { user_id, leaves })
            .collect())
    }

    async fn returnees(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Returnee>> {
        let state = self.state.read();
        let mut per_user: HashMap<i64, (i64, i64)> = HashMap::new();
        for event in state.events_since(channel_id, since) {
            let entry = per_user.entry(event.user_id).or_insert((0, 0));
            match event.event_type {
                EventType::Join => entry.0 += 1,
                EventType::Leave => entry.1 += 1,
                _ => {}
            }
        }

        let mut returnees: Vec<Returnee> = per_user
            .into_iter()
            .filter(|(_, (joins, leaves))| *joins > 0 && *leaves > 0)
            .map(|(user_id, (joins, leaves))| Returnee {
                user_id,
                joins,
                leaves,
            })
            .collect();
        returnees.sort_by(|a, b| b.joins.cmp(&a.joins).then(a.user_id.cmp(&b.user_id)));
        returnees.truncate(limit);
        Ok(returnees)
    }

    async fn inactive_members(
        &self,
        channel_id: i64,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InactiveMember>> {
        let state = self.state.read();

        let mut last_event: HashMap<i64, DateTime<Utc>> = HashMap::new();
        for event in state.events_since(channel_id, None) {
            last_event
                .entry(event.user_id)
                .and_modify(|t| *t = (*t).max(event.occurred_at))
                .or_insert(event.occurred_at);
        }

        let mut inactive: Vec<InactiveMember> = state
            .members
            .iter()
            .filter(|((cid, _), m)| *cid == channel_id && m.status == MemberStatus::Member)
            .filter_map(|((_, user_id), m)| {
                let joined_at = m.joined_at?;
                let last_event_at = last_event.get(user_id).copied();
                let last_seen = last_event_at.unwrap_or(joined_at);
                (joined_at <= cutoff && last_seen <= cutoff).then_some(InactiveMember {
                    user_id: *user_id,
                    joined_at: Some(joined_at),
                    last_event_at,
                })
            })
            .collect();
        inactive.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));
        inactive.truncate(limit);
        Ok(inactive)
    }
}

#[async_trait]
impl MemberStore for MemoryStore {
    async fn count_by_status(&self, channel_id: i64) -> Result<HashMap<MemberStatus, i64>> {
        let state = self.state.read();
        let mut counts = HashMap::new();
        for ((cid, _), member) in &state.members {
            if *cid == channel_id {
                *counts.entry(member.status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn upsert_status(
        &self,
        channel_id: i64,
        user_id: i64,
        status: MemberStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write();
        match state.members.get_mut(&(channel_id, user_id)) {
            Some(member) => {
                if status != MemberStatus::Member {
                    member.left_at = Some(at);
                } else if member.status != MemberStatus::Member {
                    member.joined_at = Some(at);
                }
                member.status = status;
            }
            None => {
                state.members.insert(
                    (channel_id, user_id),
                    MemberRecord {
                        status,
                        joined_at: Some(at),
                        left_at: (status != MemberStatus::Member).then_some(at),
                    },
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_or_create(&self, channel_id: i64) -> Result<AlertSettings> {
        let mut state = self.state.write();
        Ok(state.settings_mut(channel_id, &self.defaults).clone())
    }

    async fn update_config(&self, settings: &AlertSettings) -> Result<AlertSettings> {
        let mut state = self.state.write();
        let stored = state.settings_mut(settings.channel_id, &self.defaults);
        stored.mass_leave_threshold = settings.mass_leave_threshold;
        stored.mass_leave_window_minutes = settings.mass_leave_window_minutes;
        stored.anomaly_factor = settings.anomaly_factor;
        stored.milestone_step = settings.milestone_step;
        stored.digest_daily = settings.digest_daily;
        stored.digest_weekly = settings.digest_weekly;
        stored.digest_monthly = settings.digest_monthly;
        stored.quiet_hours_start = settings.quiet_hours_start;
        stored.quiet_hours_end = settings.quiet_hours_end;
        stored.churn_percent_threshold = settings.churn_percent_threshold;
        Ok(stored.clone())
    }

    async fn set_last_milestone(&self, channel_id: i64, milestone: i64) -> Result<()> {
        let mut state = self.state.write();
        state
            .settings_mut(channel_id, &self.defaults)
            .record_milestone(milestone);
        Ok(())
    }

    async fn set_last_churn_alert(&self, channel_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write();
        state
            .settings_mut(channel_id, &self.defaults)
            .record_churn_alert(at);
        Ok(())
    }

    async fn set_last_digest(
        &self,
        channel_id: i64,
        period: DigestPeriod,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write();
        state
            .settings_mut(channel_id, &self.defaults)
            .record_digest(period, at);
        Ok(())
    }

    async fn set_vip_ids(&self, channel_id: i64, vip_ids: &BTreeSet<i64>) -> Result<()> {
        let mut state = self.state.write();
        state.settings_mut(channel_id, &self.defaults).vip_ids = vip_ids.clone();
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn get(&self, channel_id: i64) -> Result<Option<Channel>> {
        Ok(self.state.read().channels.get(&channel_id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<Channel>> {
        let state = self.state.read();
        let mut channels: Vec<Channel> = state
            .channels
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        channels.sort_by_key(|c| c.id);
        Ok(channels)
    }

    async fn upsert(&self, channel: &Channel) -> Result<()> {
        self.state
            .write()
            .channels
            .insert(channel.id, channel.clone());
        Ok(())
    }
}
