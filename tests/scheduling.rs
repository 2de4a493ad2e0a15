mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, TimeZone, Utc};
use tempfile::TempDir;
use trust_service::{
    dispatch::{DispatchMessage, FetchMode},
    model::{ClockDriftConfig, TimerInfo},
    revocation::MemoryRevocationStore,
    scheduler::{TimerState, TokioClock},
    service::{ClockDriftProbe, ProbeError, ServiceError},
};

use common::{Harness, ca_der};

mockall::mock! {
    pub Probe {}

    #[async_trait]
    impl ClockDriftProbe for Probe {
        async fn offset(&self, config: &ClockDriftConfig) -> Result<TimeDelta, ProbeError>;
    }
}

fn paused_clock() -> Arc<TokioClock> {
    Arc::new(TokioClock::starting_at(
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_running_scheduler_drives_harvests_until_disabled() {
    let mut harness = Harness::with_clock(paused_clock()).await;
    let tp = harness
        .service
        .add_trust_point(
            Some("*/10 * * * * ?"),
            &ca_der("Scheduled CA", Some("http://crl.example.com/s.crl")),
        )
        .await
        .unwrap();

    let scheduler = harness.service.scheduler().clone();
    let dispatcher = scheduler.start(Arc::new(harness.service.clone()));

    for _ in 0..2 {
        let envelope = tokio::time::timeout(Duration::from_secs(15), harness.queues.harvester.recv())
            .await
            .expect("harvest request within one period")
            .unwrap();
        assert_eq!(
            envelope.message,
            DispatchMessage::Harvest {
                issuer: tp.name.clone(),
                crl_location: "http://crl.example.com/s.crl".into(),
                mode: FetchMode::Full,
            }
        );
    }

    harness
        .service
        .save_trust_point(&tp.name, None, true)
        .await
        .unwrap();
    let quiet = tokio::time::timeout(Duration::from_secs(60), harness.queues.harvester.recv()).await;
    assert!(quiet.is_err());
    assert!(harness.service.counters().snapshot().timer_fires >= 2);

    scheduler.shutdown();
    dispatcher.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_clock_drift_timer_raises_alarm() {
    let harness = Harness::with_clock(paused_clock()).await;
    let mut probe = MockProbe::new();
    probe
        .expect_offset()
        .returning(|_| Ok(TimeDelta::minutes(10)));
    let service = harness.service.with_probe(Arc::new(probe));

    service
        .set_clock_drift(Some(ClockDriftConfig {
            cron: Some("0 * * * * ?".into()),
            ..ClockDriftConfig::default()
        }))
        .await
        .unwrap();

    let scheduler = service.scheduler().clone();
    let dispatcher = scheduler.start(Arc::new(service.clone()));

    let mut waited = 0;
    while service.counters().snapshot().clock_drift_alarms == 0 && waited < 120 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        waited += 1;
    }
    assert!(service.counters().snapshot().clock_drift_alarms >= 1);

    scheduler.shutdown();
    dispatcher.await.unwrap();
}

#[tokio::test]
async fn test_restart_rehydrates_registry_and_fire_times() {
    let dir = TempDir::new().unwrap();
    let store = MemoryRevocationStore::new();
    let der = ca_der("Restart CA", Some("http://crl.example.com/r.crl"));

    let (name, fire_at) = {
        let harness = Harness::persistent(dir.path(), store.clone()).await;
        let tp = harness
            .service
            .add_trust_point(Some("0 0 3 * * ?"), &der)
            .await
            .unwrap();
        harness.service.create_trust_domain("BE", false).await.unwrap();
        harness
            .service
            .add_trust_point_to_domain("BE", &tp.name)
            .await
            .unwrap();

        let Some(TimerState::Pending(fire_at)) = harness
            .service
            .scheduler()
            .state(&TimerInfo::trust_point(&tp.name))
            .await
        else {
            panic!("timer not armed");
        };
        (tp.name, fire_at)
    };

    let harness = Harness::persistent(dir.path(), store).await;
    assert_eq!(harness.service.rehydrate().await, 1);
    assert_eq!(
        harness
            .service
            .scheduler()
            .state(&TimerInfo::trust_point(&name))
            .await,
        Some(TimerState::Pending(fire_at))
    );

    let domain = harness
        .service
        .registry()
        .domains()
        .domain("BE")
        .await
        .unwrap();
    assert!(domain.trust_points.contains(&name));
    assert!(domain.is_default);

    let err = harness.service.add_trust_point(None, &der).await.unwrap_err();
    assert!(matches!(err, ServiceError::TrustPointAlreadyExists(_)));
}
