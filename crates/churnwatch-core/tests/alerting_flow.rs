//! End-to-end alerting flows over the in-memory store

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use churnwatch::alerting::{AlertOrchestrator, Notifier};
use churnwatch::config::AlertingConfig;
use churnwatch::db::{ChannelStore, Database, MemoryStore, SettingsStore};
use churnwatch::models::{
    Alert, AlertDecision, AlertKind, AlertSettings, Channel, DigestJob, DigestPeriod, EventType,
    MemberEvent,
};
use churnwatch::{Error, Result};

#[derive(Default)]
struct Recorder {
    alerts: Mutex<Vec<(i64, AlertKind)>>,
    digests: Mutex<Vec<(i64, DigestPeriod)>>,
}

#[async_trait]
impl Notifier for Recorder {
    async fn send_alert(&self, chat_id: i64, decision: &AlertDecision) -> bool {
        self.alerts.lock().push((chat_id, decision.kind()));
        true
    }

    async fn send_digest(&self, chat_id: i64, job: &DigestJob, _content: &str) -> bool {
        self.digests.lock().push((chat_id, job.period));
        true
    }
}

/// Which settings operations fail for the broken channel
#[derive(Clone, Copy, PartialEq)]
enum Breakage {
    Everything,
    ChurnWrites,
}

/// Fails settings operations for one channel
struct BrokenSettings {
    inner: Arc<MemoryStore>,
    broken_channel: i64,
    breakage: Breakage,
}

impl BrokenSettings {
    fn check(&self, channel_id: i64) -> Result<()> {
        if channel_id == self.broken_channel && self.breakage == Breakage::Everything {
            return Err(Error::store("settings row unreadable"));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for BrokenSettings {
    async fn get_or_create(&self, channel_id: i64) -> Result<AlertSettings> {
        self.check(channel_id)?;
        self.inner.get_or_create(channel_id).await
    }

    async fn update_config(&self, settings: &AlertSettings) -> Result<AlertSettings> {
        self.check(settings.channel_id)?;
        self.inner.update_config(settings).await
    }

    async fn set_last_milestone(&self, channel_id: i64, milestone: i64) -> Result<()> {
        self.check(channel_id)?;
        self.inner.set_last_milestone(channel_id, milestone).await
    }

    async fn set_last_churn_alert(&self, channel_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.check(channel_id)?;
        if channel_id == self.broken_channel && self.breakage == Breakage::ChurnWrites {
            return Err(Error::store("churn watermark write rejected"));
        }
        self.inner.set_last_churn_alert(channel_id, at).await
    }

    async fn set_last_digest(
        &self,
        channel_id: i64,
        period: DigestPeriod,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check(channel_id)?;
        self.inner.set_last_digest(channel_id, period, at).await
    }

    async fn set_vip_ids(&self, channel_id: i64, vip_ids: &BTreeSet<i64>) -> Result<()> {
        self.check(channel_id)?;
        self.inner.set_vip_ids(channel_id, vip_ids).await
    }
}

async fn store_with_channels(ids: &[i64]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::default());
    for &id in ids {
        store
            .upsert(&Channel::new(id, format!("Channel {id}"), 10, Some(-id)))
            .await
            .unwrap();
    }
    store
}

fn orchestrator(db: Database) -> (Arc<Recorder>, AlertOrchestrator) {
    let recorder = Arc::new(Recorder::default());
    let orchestrator = AlertOrchestrator::new(db, &AlertingConfig::default(), recorder.clone());
    (recorder, orchestrator)
}

async fn ingest(
    orchestrator: &AlertOrchestrator,
    event: MemberEvent,
) -> Vec<AlertDecision> {
    let recorded = orchestrator
        .database()
        .record_member_event(&event)
        .await
        .unwrap();
    orchestrator.on_member_event(&recorded).await.unwrap()
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 9, 12, 0, 0).unwrap()
}

async fn configure_mass_leave(store: &MemoryStore, channel_id: i64) {
    let mut settings = store.get_or_create(channel_id).await.unwrap();
    settings.mass_leave_threshold = 3;
    settings.mass_leave_window_minutes = 30;
    settings.churn_percent_threshold = 0.0;
    store.update_config(&settings).await.unwrap();
}

#[tokio::test]
async fn mass_leave_fires_on_the_threshold_event() {
    let store = store_with_channels(&[1]).await;
    configure_mass_leave(&store, 1).await;
    let (recorder, orchestrator) = orchestrator(Database::from_store(store));

    let first = ingest(&orchestrator, MemberEvent::new(1, 100, EventType::Leave, noon())).await;
    let second = ingest(
        &orchestrator,
        MemberEvent::new(1, 101, EventType::Leave, noon() + Duration::minutes(4)),
    )
    .await;
    let third = ingest(
        &orchestrator,
        MemberEvent::new(1, 102, EventType::Leave, noon() + Duration::minutes(9)),
    )
    .await;

    assert!(first.is_empty());
    assert!(second.is_empty());
    assert_eq!(third.len(), 1);
    assert_eq!(
        third[0].alert,
        Alert::MassLeave {
            count: 3,
            minutes: 30
        }
    );
    assert_eq!(third[0].channel_title, "Channel 1");
    assert_eq!(recorder.alerts.lock().clone(), vec![(-1, AlertKind::MassLeave)]);
}

#[tokio::test]
async fn mass_leave_repeats_while_above_threshold() {
    let store = store_with_channels(&[1]).await;
    configure_mass_leave(&store, 1).await;
    let (recorder, orchestrator) = orchestrator(Database::from_store(store));

    for (i, user) in (200..204).enumerate() {
        let at = noon() + Duration::minutes(i64::try_from(i).unwrap());
        ingest(&orchestrator, MemberEvent::new(1, user, EventType::Leave, at)).await;
    }

    let kinds = recorder.alerts.lock().clone();
    assert_eq!(kinds, vec![(-1, AlertKind::MassLeave), (-1, AlertKind::MassLeave)]);
}

#[tokio::test]
async fn leaves_outside_the_window_do_not_accumulate() {
    let store = store_with_channels(&[1]).await;
    configure_mass_leave(&store, 1).await;
    let (recorder, orchestrator) = orchestrator(Database::from_store(store));

    for (i, user) in (300..303).enumerate() {
        let at = noon() + Duration::minutes(45 * i64::try_from(i).unwrap());
        ingest(&orchestrator, MemberEvent::new(1, user, EventType::Leave, at)).await;
    }

    assert!(recorder.alerts.lock().is_empty());
}

#[tokio::test]
async fn a_late_leave_is_counted_against_its_own_window() {
    let store = store_with_channels(&[1]).await;
    configure_mass_leave(&store, 1).await;
    let (recorder, orchestrator) = orchestrator(Database::from_store(store));

    for (user, minutes) in [(400, 0), (401, 5), (402, 10)] {
        let at = noon() + Duration::minutes(minutes);
        ingest(&orchestrator, MemberEvent::new(1, user, EventType::Leave, at)).await;
    }
    assert_eq!(recorder.alerts.lock().clone(), vec![(-1, AlertKind::MassLeave)]);

    // delivered after the others but stamped an hour earlier
    let late = ingest(
        &orchestrator,
        MemberEvent::new(1, 403, EventType::Leave, noon() - Duration::hours(1)),
    )
    .await;

    assert!(late.is_empty());
    assert_eq!(recorder.alerts.lock().clone(), vec![(-1, AlertKind::MassLeave)]);
}

#[tokio::test]
async fn a_milestone_is_delivered_when_the_churn_write_fails() {
    let store = store_with_channels(&[1]).await;
    let mut settings = store.get_or_create(1).await.unwrap();
    settings.milestone_step = 10;
    settings.churn_percent_threshold = 1.0;
    store.update_config(&settings).await.unwrap();

    let mut db = Database::from_store(store.clone());
    db.settings = Arc::new(BrokenSettings {
        inner: store.clone(),
        broken_channel: 1,
        breakage: Breakage::ChurnWrites,
    });
    let (recorder, orchestrator) = orchestrator(db);

    // members recorded days earlier without evaluation
    for user in 0..11 {
        let at = noon() - Duration::days(3) + Duration::minutes(user);
        orchestrator
            .database()
            .record_member_event(&MemberEvent::new(1, user, EventType::Join, at))
            .await
            .unwrap();
    }

    // 10 active of 11 crosses the milestone, then churn at 9% fails to persist
    let leave = orchestrator
        .database()
        .record_member_event(&MemberEvent::new(1, 0, EventType::Leave, noon()))
        .await
        .unwrap();
    let result = orchestrator.on_member_event(&leave).await;

    assert!(matches!(result, Err(Error::Store(_))));
    assert_eq!(recorder.alerts.lock().clone(), vec![(-1, AlertKind::Milestone)]);
    let saved = store.get_or_create(1).await.unwrap();
    assert_eq!(saved.last_milestone, 10);
    assert!(saved.last_churn_alert_at.is_none());

    // the watermark holds, so the next event does not announce it again
    let join = orchestrator
        .database()
        .record_member_event(&MemberEvent::new(
            1,
            50,
            EventType::Join,
            noon() + Duration::minutes(1),
        ))
        .await
        .unwrap();
    assert!(orchestrator.on_member_event(&join).await.is_err());
    assert_eq!(recorder.alerts.lock().clone(), vec![(-1, AlertKind::Milestone)]);
}

#[tokio::test]
async fn concurrent_joins_announce_a_milestone_once() {
    let store = store_with_channels(&[1]).await;
    let mut settings = store.get_or_create(1).await.unwrap();
    settings.milestone_step = 10;
    settings.churn_percent_threshold = 0.0;
    store.update_config(&settings).await.unwrap();

    let (_recorder, orchestrator) = orchestrator(Database::from_store(store.clone()));
    let orchestrator = Arc::new(orchestrator);

    // spread over a day so the hourly spike check stays quiet
    for user in 0..9 {
        let at = noon() - Duration::hours(20) + Duration::hours(user);
        ingest(&orchestrator, MemberEvent::new(1, user, EventType::Join, at)).await;
    }

    let mut recorded = Vec::new();
    for user in 9..12 {
        let event = MemberEvent::new(1, user, EventType::Join, noon());
        recorded.push(
            orchestrator
                .database()
                .record_member_event(&event)
                .await
                .unwrap(),
        );
    }

    let handles: Vec<_> = recorded
        .into_iter()
        .map(|event| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.on_member_event(&event).await.unwrap() })
        })
        .collect();

    let mut milestones = Vec::new();
    for handle in handles {
        for decision in handle.await.unwrap() {
            if let Alert::Milestone { milestone } = decision.alert {
                milestones.push(milestone);
            }
        }
    }

    assert_eq!(milestones, vec![10]);
    assert_eq!(store.get_or_create(1).await.unwrap().last_milestone, 10);
}

#[tokio::test]
async fn digests_are_sent_once_per_day() {
    let store = store_with_channels(&[1]).await;
    let (recorder, orchestrator) = orchestrator(Database::from_store(store));

    // Monday the 8th, after the weekly minute
    let monday = Utc.with_ymd_and_hms(2024, 7, 8, 9, 5, 0).unwrap();

    let report = orchestrator.run_digest_sweep(monday).await.unwrap();
    assert_eq!(report.jobs_due, 2);
    assert_eq!(report.delivered, 2);

    let again = orchestrator
        .run_digest_sweep(monday + Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(again.jobs_due, 0);

    let tuesday = orchestrator
        .run_digest_sweep(monday + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(tuesday.jobs_due, 1);

    assert_eq!(
        recorder.digests.lock().clone(),
        vec![
            (-1, DigestPeriod::Daily),
            (-1, DigestPeriod::Weekly),
            (-1, DigestPeriod::Daily),
        ]
    );
}

#[tokio::test]
async fn a_failing_channel_does_not_stop_the_sweep() {
    let store = store_with_channels(&[1, 2]).await;
    let mut db = Database::from_store(store.clone());
    db.settings = Arc::new(BrokenSettings {
        inner: store.clone(),
        broken_channel: 1,
        breakage: Breakage::Everything,
    });
    let (recorder, orchestrator) = orchestrator(db);

    let report = orchestrator
        .run_digest_sweep(Utc.with_ymd_and_hms(2024, 7, 9, 9, 0, 0).unwrap())
        .await
        .unwrap();

    assert_eq!(report.channels_checked, 2);
    assert_eq!(report.channel_errors, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(recorder.digests.lock().clone(), vec![(-2, DigestPeriod::Daily)]);
    assert!(store.get_or_create(2).await.unwrap().last_daily_digest.is_some());
}
