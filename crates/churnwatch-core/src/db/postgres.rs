//! PostgreSQL connection and queries

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc, Weekday};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::{AlertDefaults, DatabaseConfig};
use crate::error::Result;
use crate::models::{
    format_vip_ids, parse_vip_ids, AlertSettings, Channel, DailyFlow, DigestPeriod, EventType,
    HourlyActivity, InactiveMember, InviterCount, LeaverCount, MemberEvent, MemberStatus, Returnee,
};

use super::{ChannelStore, EventStore, MemberStore, SettingsStore};

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Store backed by PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    defaults: AlertDefaults,
}

impl PgStore {
    /// Create a store on an existing pool; new alert settings start from `defaults`
    pub fn new(pool: &PostgresPool, defaults: AlertDefaults) -> Self {
        Self {
            pool: pool.pool.clone(),
            defaults,
        }
    }
}

const SETTINGS_COLUMNS: &str = r#"
    channel_id, mass_leave_threshold, mass_leave_window_minutes, anomaly_factor,
    milestone_step, last_milestone, digest_daily, digest_weekly, digest_monthly,
    quiet_hours_start, quiet_hours_end, churn_percent_threshold, vip_user_ids,
    last_churn_alert_at, last_daily_digest_at, last_weekly_digest_at, last_monthly_digest_at
"#;

const EVENT_COLUMNS: &str =
    "id, channel_id, user_id, event_type, old_status, new_status, inviter_id, occurred_at";

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn to_hour(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn from_hour(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Weekday from a Sunday-based index, as returned by `EXTRACT(DOW ...)`
fn weekday_from_sunday(dow: i32) -> Weekday {
    match dow.rem_euclid(7) {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        _ => Weekday::Sat,
    }
}

fn digest_column(period: DigestPeriod) -> &'static str {
    match period {
        DigestPeriod::Daily => "last_daily_digest_at",
        DigestPeriod::Weekly => "last_weekly_digest_at",
        DigestPeriod::Monthly => "last_monthly_digest_at",
    }
}

fn row_to_settings(row: &PgRow) -> Result<AlertSettings> {
    let vip_text: Option<String> = row.try_get("vip_user_ids")?;
    Ok(AlertSettings {
        channel_id: row.try_get("channel_id")?,
        mass_leave_threshold: row.try_get("mass_leave_threshold")?,
        mass_leave_window_minutes: row.try_get("mass_leave_window_minutes")?,
        anomaly_factor: row.try_get("anomaly_factor")?,
        milestone_step: row.try_get("milestone_step")?,
        last_milestone: row.try_get("last_milestone")?,
        digest_daily: row.try_get("digest_daily")?,
        digest_weekly: row.try_get("digest_weekly")?,
        digest_monthly: row.try_get("digest_monthly")?,
        quiet_hours_start: to_hour(row.try_get("quiet_hours_start")?),
        quiet_hours_end: to_hour(row.try_get("quiet_hours_end")?),
        churn_percent_threshold: row.try_get("churn_percent_threshold")?,
        vip_ids: parse_vip_ids(vip_text.as_deref()),
        last_churn_alert_at: row.try_get("last_churn_alert_at")?,
        last_daily_digest: row.try_get("last_daily_digest_at")?,
        last_weekly_digest: row.try_get("last_weekly_digest_at")?,
        last_monthly_digest: row.try_get("last_monthly_digest_at")?,
    })
}

fn row_to_event(row: &PgRow) -> Result<MemberEvent> {
    let event_type: String = row.try_get("event_type")?;
    let old_status: Option<String> = row.try_get("old_status")?;
    let new_status: String = row.try_get("new_status")?;

    Ok(MemberEvent {
        id: Some(row.try_get("id")?),
        channel_id: row.try_get("channel_id")?,
        user_id: row.try_get("user_id")?,
        event_type: EventType::from_str(&event_type)?,
        old_status: old_status
            .as_deref()
            .map(MemberStatus::from_str)
            .transpose()?,
        new_status: MemberStatus::from_str(&new_status)?,
        inviter_id: row.try_get("inviter_id")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

fn row_to_channel(row: &PgRow) -> Result<Channel> {
    Ok(Channel {
        id: row.try_get("channel_id")?,
        title: row.try_get("title")?,
        admin_user_id: row.try_get("admin_user_id")?,
        notify_chat_id: row.try_get("notify_chat_id")?,
        is_active: row.try_get("is_active")?,
    })
}

#[async_trait]
impl EventStore for PgStore {
    async fn append(&self, event: &MemberEvent) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO member_events (
                channel_id, user_id, event_type, old_status, new_status, inviter_id, occurred_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(event.channel_id)
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.old_status.map(MemberStatus::as_str))
        .bind(event.new_status.as_str())
        .bind(event.inviter_id)
        .bind(event.occurred_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn count_events(
        &self,
        channel_id: i64,
        event_type: Option<EventType>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM member_events
            WHERE channel_id = $1
              AND ($2::text IS NULL OR event_type = $2)
              AND ($3::timestamptz IS NULL OR occurred_at >= $3)
              AND ($4::timestamptz IS NULL OR occurred_at <= $4)
            "#,
        )
        .bind(channel_id)
        .bind(event_type.map(EventType::as_str))
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn recent_events(
        &self,
        channel_id: i64,
        limit: usize,
        event_type: Option<EventType>,
    ) -> Result<Vec<MemberEvent>> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM member_events
            WHERE channel_id = $1 AND ($2::text IS NULL OR event_type = $2)
            ORDER BY occurred_at DESC, id DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(channel_id)
            .bind(event_type.map(EventType::as_str))
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn daily_flow(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DailyFlow>> {
        let rows = sqlx::query(
            r#"
            SELECT
                (occurred_at AT TIME ZONE 'UTC')::date AS day,
                COUNT(*) FILTER (WHERE event_type = 'join') AS joins,
                COUNT(*) FILTER (WHERE event_type = 'leave') AS leaves,
                COUNT(*) FILTER (WHERE event_type = 'kick') AS kicks,
                COUNT(*) FILTER (WHERE event_type = 'ban') AS bans
            FROM member_events
            WHERE channel_id = $1 AND ($2::timestamptz IS NULL OR occurred_at >= $2)
            GROUP BY day
            ORDER BY day
            "#,
        )
        .bind(channel_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let day: NaiveDate = row.try_get("day")?;
                let joins: i64 = row.try_get("joins")?;
                let leaves: i64 = row.try_get("leaves")?;
                let kicks: i64 = row.try_get("kicks")?;
                Ok(DailyFlow {
                    day,
                    joins,
                    leaves,
                    kicks,
                    bans: row.try_get("bans")?,
                    net: joins - leaves - kicks,
                })
            })
            .collect()
    }

    async fn hourly_activity(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HourlyActivity>> {
        let rows = sqlx::query(
            r#"
            SELECT
                EXTRACT(DOW FROM occurred_at AT TIME ZONE 'UTC')::int AS dow,
                EXTRACT(HOUR FROM occurred_at AT TIME ZONE 'UTC')::int AS hour,
                COUNT(*) AS events,
                COUNT(*) FILTER (WHERE event_type = 'join') AS joins,
                COUNT(*) FILTER (WHERE event_type IN ('leave', 'kick', 'ban')) AS leaves
            FROM member_events
            WHERE channel_id = $1 AND ($2::timestamptz IS NULL OR occurred_at >= $2)
            GROUP BY dow, hour
            ORDER BY dow, hour
            "#,
        )
        .bind(channel_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let joins: i64 = row.try_get("joins")?;
                let leaves: i64 = row.try_get("leaves")?;
                Ok(HourlyActivity {
                    weekday: weekday_from_sunday(row.try_get("dow")?),
                    hour: to_hour(row.try_get("hour")?),
                    events: row.try_get("events")?,
                    joins,
                    leaves,
                    net: joins - leaves,
                })
            })
            .collect()
    }

    async fn top_inviters(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<InviterCount>> {
        let rows = sqlx::query(
            r#"
            SELECT inviter_id, COUNT(*) AS joins FROM member_events
            WHERE channel_id = $1 AND event_type = 'join' AND inviter_id IS NOT NULL
              AND ($2::timestamptz IS NULL OR occurred_at >= $2)
            GROUP BY inviter_id
            ORDER BY joins DESC, inviter_id ASC
            LIMIT $3
            "#,
        )
        .bind(channel_id)
        .bind(since)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(InviterCount {
                    inviter_id: row.try_get("inviter_id")?,
                    joins: row.try_get("joins")?,
                })
            })
            .collect()
    }

    async fn top_leavers(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<LeaverCount>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, COUNT(*) AS leaves FROM member_events
            WHERE channel_id = $1 AND event_type = 'leave'
              AND ($2::timestamptz IS NULL OR occurred_at >= $2)
            GROUP BY user_id
            ORDER BY leaves DESC, user_id ASC
            LIMIT $3
            "#,
        )
        .bind(channel_id)
        .bind(since)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(LeaverCount {
                    user_id: row.try_get("user_id")?,
                    leaves: row.try_get("leaves")?,
                })
            })
            .collect()
    }

    async fn returnees(
        &self,
        channel_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Returnee>> {
        let rows = sqlx::query(
            r#"
            SELECT
                user_id,
                COUNT(*) FILTER (WHERE event_type = 'join') AS joins,
                COUNT(*) FILTER (WHERE event_type = 'leave') AS leaves
            FROM member_events
            WHERE channel_id = $1 AND ($2::timestamptz IS NULL OR occurred_at >= $2)
            GROUP BY user_id
            HAVING COUNT(*) FILTER (WHERE event_type = 'join') > 0
               AND COUNT(*) FILTER (WHERE event_type = 'leave') > 0
            ORDER BY joins DESC, user_id ASC
            LIMIT $3
            "#,
        )
        .bind(channel_id)
        .bind(since)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Returnee {
                    user_id: row.try_get("user_id")?,
                    joins: row.try_get("joins")?,
                    leaves: row.try_get("leaves")?,
                })
            })
            .collect()
    }

    async fn inactive_members(
        &self,
        channel_id: i64,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InactiveMember>> {
        let rows = sqlx::query(
            r#"
            SELECT m.user_id, m.joined_at, last.last_event_at
            FROM members m
            LEFT JOIN (
                SELECT user_id, MAX(occurred_at) AS last_event_at
                FROM member_events
                WHERE channel_id = $1
                GROUP BY user_id
            ) last ON last.user_id = m.user_id
            WHERE m.channel_id = $1
              AND m.status = 'member'
              AND m.joined_at IS NOT NULL
              AND m.joined_at <= $2
              AND COALESCE(last.last_event_at, m.joined_at) <= $2
            ORDER BY m.joined_at ASC, m.user_id ASC
            LIMIT $3
            "#,
        )
        .bind(channel_id)
        .bind(cutoff)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(InactiveMember {
                    user_id: row.try_get("user_id")?,
                    joined_at: row.try_get("joined_at")?,
                    last_event_at: row.try_get("last_event_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MemberStore for PgStore {
    async fn count_by_status(&self, channel_id: i64) -> Result<HashMap<MemberStatus, i64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS cnt FROM members WHERE channel_id = $1 GROUP BY status",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            counts.insert(MemberStatus::from_str(&status)?, row.try_get("cnt")?);
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
        sqlx::query(
            r#"
            INSERT INTO members (channel_id, user_id, status, joined_at, left_at)
            VALUES ($1, $2, $3, $4, CASE WHEN $3 = 'member' THEN NULL ELSE $4 END)
            ON CONFLICT (channel_id, user_id) DO UPDATE SET
                joined_at = CASE
                    WHEN EXCLUDED.status = 'member' AND members.status <> 'member'
                    THEN EXCLUDED.joined_at
                    ELSE members.joined_at
                END,
                left_at = CASE
                    WHEN EXCLUDED.status <> 'member' THEN EXCLUDED.joined_at
                    ELSE members.left_at
                END,
                status = EXCLUDED.status
            "#,
        )
        .bind(channel_id)
        .bind(user_id)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get_or_create(&self, channel_id: i64) -> Result<AlertSettings> {
        let d = &self.defaults;
        sqlx::query(
            r#"
            INSERT INTO alert_settings (
                channel_id, mass_leave_threshold, mass_leave_window_minutes, anomaly_factor,
                milestone_step, digest_daily, digest_weekly, digest_monthly,
                quiet_hours_start, quiet_hours_end, churn_percent_threshold
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (channel_id) DO NOTHING
            "#,
        )
        .bind(channel_id)
        .bind(d.mass_leave_threshold)
        .bind(d.mass_leave_window_minutes)
        .bind(d.anomaly_factor)
        .bind(d.milestone_step)
        .bind(d.digest_daily)
        .bind(d.digest_weekly)
        .bind(d.digest_monthly)
        .bind(from_hour(d.quiet_hours_start))
        .bind(from_hour(d.quiet_hours_end))
        .bind(d.churn_percent_threshold)
        .execute(&self.pool)
        .await?;

        let sql = format!("SELECT {SETTINGS_COLUMNS} FROM alert_settings WHERE channel_id = $1");
        let row = sqlx::query(&sql)
            .bind(channel_id)
            .fetch_one(&self.pool)
            .await?;

        row_to_settings(&row)
    }

    async fn update_config(&self, settings: &AlertSettings) -> Result<AlertSettings> {
        self.get_or_create(settings.channel_id).await?;

        let sql = format!(
            r#"
            UPDATE alert_settings SET
                mass_leave_threshold = $2,
                mass_leave_window_minutes = $3,
                anomaly_factor = $4,
                milestone_step = $5,
                digest_daily = $6,
                digest_weekly = $7,
                digest_monthly = $8,
                quiet_hours_start = $9,
                quiet_hours_end = $10,
                churn_percent_threshold = $11,
                updated_at = NOW()
            WHERE channel_id = $1
            RETURNING {SETTINGS_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(settings.channel_id)
            .bind(settings.mass_leave_threshold)
            .bind(settings.mass_leave_window_minutes)
            .bind(settings.anomaly_factor)
            .bind(settings.milestone_step)
            .bind(settings.digest_daily)
            .bind(settings.digest_weekly)
            .bind(settings.digest_monthly)
            .bind(from_hour(settings.quiet_hours_start))
            .bind(from_hour(settings.quiet_hours_end))
            .bind(settings.churn_percent_threshold)
            .fetch_one(&self.pool)
            .await?;

        row_to_settings(&row)
    }

    async fn set_last_milestone(&self, channel_id: i64, milestone: i64) -> Result<()> {
        self.get_or_create(channel_id).await?;
        sqlx::query(
            r#"
            UPDATE alert_settings
            SET last_milestone = GREATEST(last_milestone, $2), updated_at = NOW()
            WHERE channel_id = $1
            "#,
        )
        .bind(channel_id)
        .bind(milestone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_last_churn_alert(&self, channel_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.get_or_create(channel_id).await?;
        sqlx::query(
            r#"
            UPDATE alert_settings
            SET last_churn_alert_at = GREATEST(last_churn_alert_at, $2), updated_at = NOW()
            WHERE channel_id = $1
            "#,
        )
        .bind(channel_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_last_digest(
        &self,
        channel_id: i64,
        period: DigestPeriod,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.get_or_create(channel_id).await?;
        let column = digest_column(period);
        let sql = format!(
            "UPDATE alert_settings SET {column} = GREATEST({column}, $2), updated_at = NOW() \
             WHERE channel_id = $1"
        );
        sqlx::query(&sql)
            .bind(channel_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_vip_ids(&self, channel_id: i64, vip_ids: &BTreeSet<i64>) -> Result<()> {
        self.get_or_create(channel_id).await?;
        sqlx::query(
            "UPDATE alert_settings SET vip_user_ids = $2, updated_at = NOW() WHERE channel_id = $1",
        )
        .bind(channel_id)
        .bind(format_vip_ids(vip_ids))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for PgStore {
    async fn get(&self, channel_id: i64) -> Result<Option<Channel>> {
        let row = sqlx::query(
            r#"
            SELECT channel_id, title, admin_user_id, notify_chat_id, is_active
            FROM channels WHERE channel_id = $1
            "#,
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_channel).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            r#"
            SELECT channel_id, title, admin_user_id, notify_chat_id, is_active
            FROM channels WHERE is_active ORDER BY channel_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_channel).collect()
    }

    async fn upsert(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (channel_id, title, admin_user_id, notify_chat_id, is_active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (channel_id) DO UPDATE SET
                title = EXCLUDED.title,
                admin_user_id = EXCLUDED.admin_user_id,
                notify_chat_id = EXCLUDED.notify_chat_id,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            "#,
        )
        .bind(channel.id)
        .bind(&channel.title)
        .bind(channel.admin_user_id)
        .bind(channel.notify_chat_id)
        .bind(channel.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weekday_from_sunday() {
        assert_eq!(weekday_from_sunday(0), Weekday::Sun);
        assert_eq!(weekday_from_sunday(1), Weekday::Mon);
        assert_eq!(weekday_from_sunday(6), Weekday::Sat);
        assert_eq!(weekday_from_sunday(7), Weekday::Sun);
    }

    #[test]
    fn test_digest_column_per_period() {
        assert_eq!(digest_column(DigestPeriod::Daily), "last_daily_digest_at");
        assert_eq!(digest_column(DigestPeriod::Weekly), "last_weekly_digest_at");
        assert_eq!(digest_column(DigestPeriod::Monthly), "last_monthly_digest_at");
    }

    #[test]
    fn test_hour_conversions_saturate() {
        assert_eq!(to_hour(7), 7);
        assert_eq!(to_hour(-1), u32::MAX);
        assert_eq!(from_hour(u32::MAX), i32::MAX);
    }
}
