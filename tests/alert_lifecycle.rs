mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use safeguard::dispatch::Coordinates;
use safeguard::{AlarmState, AlertError, EngineEvent};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn first_alert_then_evidence_followup() {
    let mut rig = Rig::new();
    rig.positions = Arc::new(ScriptedPositions::new([Fix::Ok(sample(12.97, 77.59, 8.0, 0))]));
    rig.geocoder = Arc::new(FakeGeocoder {
        address: None,
        delay: Duration::from_millis(10),
    });
    let mut config = quiet_config();
    config.evidence.auto_start = true;
    let engine = rig.launch(config);

    engine.arm(None).await.expect("armed");
    assert!(engine.trigger_manual());
    wait_for_state(&engine, AlarmState::Activated).await;

    // the first alert does not wait for evidence
    tokio::time::sleep(Duration::from_secs(1)).await;
    let sent = rig.notifier.payloads();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject_id, "X");
    assert_eq!(
        sent[0].location,
        Some(Coordinates {
            latitude: 12.97,
            longitude: 77.59
        })
    );
    assert_eq!(sent[0].address, None);
    assert_eq!(sent[0].evidence_url, None);

    let report = engine.wait_for_pipeline().await.expect("pipeline ran");
    assert!(matches!(report.initial, Some(Ok(_))));
    assert!(matches!(report.followup, Some(Ok(_))));

    let sent = rig.notifier.payloads();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].subject_id, "X");
    assert_eq!(sent[1].location, sent[0].location);
    assert_eq!(
        sent[1].evidence_url.as_deref(),
        Some("http://localhost:3001/uploads/recording.mjpeg")
    );
    assert_eq!(rig.uploader.uploads.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn no_fix_still_alerts_with_null_location() {
    let mut rig = Rig::new();
    rig.positions = Arc::new(ScriptedPositions::new([
        Fix::Fail(safeguard::DeviceError::Unavailable("gps off".into())),
        Fix::Fail(safeguard::DeviceError::Unavailable("gps off".into())),
    ]));
    let engine = rig.launch(quiet_config());
    let mut events = engine.subscribe_events();

    engine.arm(None).await.expect("armed");
    engine.trigger_manual();
    let report = engine.wait_for_pipeline().await.expect("pipeline ran");

    assert!(report.location.is_none());
    assert!(report.enriched.is_none());
    let sent = rig.notifier.payloads();
    assert_eq!(sent.len(), 1);
    let json = serde_json::to_value(&sent[0]).unwrap();
    assert!(json["location"].is_null());
    assert!(json["address"].is_null());
    assert!(json["evidenceUrl"].is_null());
    assert_eq!(json["subjectId"], "X");

    let seen = drain(&mut events);
    assert!(seen.contains(&EngineEvent::LocationUnavailable));
    assert!(seen.iter().any(|e| matches!(e, EngineEvent::AlertSent { followup: false, .. })));
}

#[tokio::test(start_paused = true)]
async fn enrichment_results_are_published() {
    let mut rig = Rig::new();
    rig.positions = Arc::new(ScriptedPositions::new([Fix::Ok(sample(12.97, 77.59, 8.0, 0))]));
    let engine = rig.launch(quiet_config());
    let mut events = engine.subscribe_events();

    engine.arm(None).await.expect("armed");
    engine.trigger_manual();
    let report = engine.wait_for_pipeline().await.expect("pipeline ran");

    let enriched = report.enriched.expect("enriched");
    assert_eq!(enriched.address.as_deref(), Some("MG Road, Bengaluru"));
    let station = enriched.nearest_station.expect("station");
    assert_eq!(station.name, "Cubbon Park Police Station");
    assert_eq!(station.phone.as_deref(), Some("100"));

    let seen = drain(&mut events);
    assert!(seen.contains(&EngineEvent::AddressResolved("MG Road, Bengaluru".into())));
    assert!(seen.iter().any(|e| matches!(e, EngineEvent::StationFound(_))));
    // the initial alert never carries the address
    assert_eq!(rig.notifier.payloads()[0].address, None);
}

#[tokio::test(start_paused = true)]
async fn failed_dispatch_is_reported_and_lifecycle_completes() {
    let mut rig = Rig::new();
    rig.positions = Arc::new(ScriptedPositions::new([Fix::Ok(sample(12.97, 77.59, 8.0, 0))]));
    rig.notifier.fail.store(true, Ordering::SeqCst);
    let engine = rig.launch(quiet_config());
    let mut events = engine.subscribe_events();

    engine.arm(None).await.expect("armed");
    engine.trigger_manual();
    let report = engine.wait_for_pipeline().await.expect("pipeline ran");
    assert!(matches!(report.initial, Some(Err(AlertError::DispatchFailed(_)))));
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, EngineEvent::Failure(AlertError::DispatchFailed(_)))));

    wait_for_state(&engine, AlarmState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn auto_reset_fires_at_cooldown_regardless_of_pipeline() {
    let mut rig = Rig::new();
    rig.positions = Arc::new(ScriptedPositions::new([Fix::Ok(sample(12.97, 77.59, 8.0, 0))]));
    rig.geocoder = Arc::new(FakeGeocoder {
        address: Some("slow street".into()),
        delay: Duration::from_secs(60),
    });
    let mut config = quiet_config();
    config.alarm.voice_alert = true;
    config.evidence.auto_start = true;
    let engine = rig.launch(config);
    let mut events = engine.subscribe_events();

    engine.arm(None).await.expect("armed");
    engine.trigger_manual();
    let triggered = Instant::now();
    wait_for_state(&engine, AlarmState::Activated).await;

    wait_for_state(&engine, AlarmState::Idle).await;
    let elapsed = triggered.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(10_050), "{elapsed:?}");
    assert!(engine.session().is_none());
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, EngineEvent::AddressResolved(_))));

    // activation side effects wind down with the reset
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.camera.released(), 1);
    let spoken = rig.synth.spoken.load(Ordering::SeqCst);
    assert!(spoken >= 1);
    assert!(rig.synth.cancels.load(Ordering::SeqCst) >= 2);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.synth.spoken.load(Ordering::SeqCst), spoken);
}

#[tokio::test(start_paused = true)]
async fn stale_reset_timer_leaves_newer_session_alone() {
    let rig = Rig::new();
    let engine = rig.launch(quiet_config());

    let first = engine.arm(None).await.expect("armed");
    engine.trigger_manual();
    wait_for_state(&engine, AlarmState::Activated).await;
    let t0 = Instant::now();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(engine.disarm());
    let second = engine.arm(None).await.expect("re-armed");
    assert!(second.generation > first.generation);

    tokio::time::sleep_until(t0 + Duration::from_secs(5)).await;
    assert!(engine.trigger_manual());
    wait_for_state(&engine, AlarmState::Activated).await;

    // first cycle's timer fires here and must be ignored
    tokio::time::sleep_until(t0 + Duration::from_secs(12)).await;
    assert_eq!(engine.state(), AlarmState::Activated);
    assert_eq!(engine.session().map(|s| s.generation), Some(second.generation));

    wait_for_state(&engine, AlarmState::Idle).await;
    assert!(t0.elapsed() >= Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn arming_uses_cached_location_and_keeps_watch_running() {
    let mut rig = Rig::new();
    rig.positions = Arc::new(ScriptedPositions::new([Fix::Ok(sample(12.97, 77.59, 8.0, 0))]));
    let engine = rig.launch(quiet_config());

    let fix = engine.request_location_access().await.expect("granted");
    assert!(engine.is_watching_location());

    let session = engine.arm(None).await.expect("armed");
    assert_eq!(session.arm_location, Some(fix));

    assert!(engine.disarm());
    assert!(engine.is_watching_location());
    assert_eq!(rig.positions.watch_starts.load(Ordering::SeqCst), 1);

    engine.shutdown().await;
    assert!(!engine.is_watching_location());
}

#[tokio::test(start_paused = true)]
async fn refused_location_access_is_user_visible() {
    let mut rig = Rig::new();
    rig.positions = Arc::new(ScriptedPositions::new([Fix::Fail(
        safeguard::DeviceError::PermissionDenied(safeguard::device::Capability::Location),
    )]));
    let engine = rig.launch(quiet_config());
    let mut events = engine.subscribe_events();

    assert!(engine.request_location_access().await.is_err());
    assert!(drain(&mut events).contains(&EngineEvent::Failure(AlertError::PermissionDenied(
        safeguard::device::Capability::Location
    ))));
}

#[tokio::test(start_paused = true)]
async fn metrics_cover_the_activation() {
    let mut rig = Rig::new();
    rig.positions = Arc::new(ScriptedPositions::new([Fix::Ok(sample(12.97, 77.59, 8.0, 0))]));
    let engine = rig.launch(quiet_config());

    engine.arm(None).await.expect("armed");
    engine.trigger_manual();
    engine.wait_for_pipeline().await.expect("pipeline ran");

    let summary = engine.metrics().summary();
    for name in [
        "t_location_acquired",
        "t_alert_sent",
        "t_enrichment_done",
        "t_trigger_to_alert",
    ] {
        assert_eq!(summary.get(name).map(|m| m.count), Some(1), "{name}");
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_publishes_the_final_transition() {
    let rig = Rig::new();
    let engine = rig.launch(quiet_config());
    let mut events = engine.subscribe_events();

    let session = engine.arm(None).await.expect("armed");
    engine.shutdown().await;

    assert_eq!(engine.state(), AlarmState::Idle);
    assert!(drain(&mut events).contains(&EngineEvent::StateChanged {
        from: AlarmState::Armed,
        to: AlarmState::Idle,
        generation: session.generation,
    }));
}

#[tokio::test(start_paused = true)]
async fn disarm_closes_a_recording_started_by_hand() {
    let rig = Rig::new();
    let engine = rig.launch(quiet_config());

    engine.arm(None).await.expect("armed");
    engine.start_recording().await.unwrap().expect("new recording");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(engine.disarm());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.camera.released(), 1);
    assert_eq!(rig.uploader.uploads.lock().len(), 1);
    assert!(rig.notifier.payloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_station_lookup_only_omits_the_station() {
    let mut rig = Rig::new();
    rig.positions = Arc::new(ScriptedPositions::new([Fix::Ok(sample(12.97, 77.59, 8.0, 0))]));
    rig.places = Arc::new(FakePlaces {
        records: Vec::new(),
        fail: true,
    });
    let engine = rig.launch(quiet_config());
    let mut events = engine.subscribe_events();

    engine.arm(None).await.expect("armed");
    engine.trigger_manual();
    let report = engine.wait_for_pipeline().await.expect("pipeline ran");

    let enriched = report.enriched.expect("enriched");
    assert_eq!(enriched.address.as_deref(), Some("MG Road, Bengaluru"));
    assert!(enriched.nearest_station.is_none());
    assert!(matches!(
        enriched.failures.as_slice(),
        [AlertError::EnrichmentFailed(_)]
    ));
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, EngineEvent::Failure(AlertError::EnrichmentFailed(_)))));
    assert!(matches!(report.initial, Some(Ok(_))));
}
