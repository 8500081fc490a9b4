//! End-to-end fly scans through the plan layer.

use std::sync::Arc;
use std::time::Duration;

use beamline_daq::config::BeamlineConfig;
use beamline_daq::experiment::{Document, FlyScan};
use beamline_daq::hardware::capabilities::{FlyingDevice, Readable};
use beamline_daq::hardware::mock::{MockCommandChannel, MockFlyer, SimMotor, SimSignal};
use beamline_daq::instrument::{AerotechFlyer, FlyerState};
use beamline_daq::units::EngineeringUnit;
use serde_json::Value;
use tokio::sync::mpsc;

struct Beamline {
    flyer: Arc<AerotechFlyer>,
    motor: Arc<SimMotor>,
    channel: Arc<MockCommandChannel>,
}

fn beamline(time_scale: f64) -> Beamline {
    let config = BeamlineConfig::default();
    let flyer_config = &config.flyers[0];
    let motor = Arc::new(
        SimMotor::new(flyer_config.name.clone(), EngineeringUnit::Millimeter)
            .with_velocity(3.0)
            .with_time_scale(time_scale),
    );
    let channel = Arc::new(MockCommandChannel::new());
    let flyer = AerotechFlyer::from_config(
        flyer_config,
        &config.controller,
        motor.clone(),
        channel.clone(),
    )
    .unwrap();
    Beamline {
        flyer: Arc::new(flyer),
        motor,
        channel,
    }
}

async fn drain(mut rx: mpsc::Receiver<Document>) -> Vec<Document> {
    let mut docs = Vec::new();
    while let Some(doc) = rx.recv().await {
        docs.push(doc);
    }
    docs
}

fn stop_status(docs: &[Document]) -> String {
    match docs.last() {
        Some(Document::Stop(stop)) => stop.exit_status.clone(),
        other => panic!("run did not end with a stop document: {other:?}"),
    }
}

#[tokio::test]
async fn test_fly_scan_emits_full_run() {
    let bl = beamline(0.0);
    let readings: Vec<(f64, f64)> = (0..101).map(|i| (i as f64, i as f64 * 10.0)).collect();
    let detector = Arc::new(MockFlyer::with_readings("xspress", &readings));
    let ring: Arc<dyn Readable> = Arc::new(SimSignal::new("ring_current", 102.3));
    let plan = FlyScan::new(bl.flyer.clone(), 20.0, 10.0, 101, 0.01)
        .with_detector(detector.clone())
        .with_baseline(vec![ring]);

    let (tx, rx) = mpsc::channel(512);
    let summary = plan.run(&tx).await.unwrap();
    drop(tx);
    let docs = drain(rx).await;

    assert_eq!(summary.exit_status, "success");
    assert_eq!(summary.num_events, 101);
    assert_eq!(docs.len(), 1 + 1 + 101 + 1);

    let Document::Start(start) = &docs[0] else {
        panic!("first document must be a start document");
    };
    assert_eq!(start.plan_type, "fly_scan");
    assert_eq!(start.plan_args["num"], Value::from(101));

    let Document::Descriptor(descriptor) = &docs[1] else {
        panic!("second document must be a descriptor");
    };
    let keys: Vec<&String> = descriptor.data_keys.keys().collect();
    assert_eq!(keys, ["aerotech_horiz", "xspress", "ring_current"]);

    for (index, doc) in docs[2..103].iter().enumerate() {
        let Document::Event(event) = doc else {
            panic!("expected event at {index}");
        };
        assert_eq!(event.seq_num, index as u32 + 1);
        assert_eq!(event.descriptor_uid, descriptor.uid);
        assert_eq!(event.run_uid, start.uid);
        assert_eq!(event.data["xspress"], Value::from(index as f64 * 10.0));
    }
    assert_eq!(stop_status(&docs), "success");

    assert_eq!(bl.flyer.state(), FlyerState::Idle);
    assert_eq!(bl.motor.current_velocity(), 3.0);
    assert_eq!(
        detector.calls(),
        ["stage", "kickoff", "complete", "collect", "unstage"]
    );
}

#[tokio::test]
async fn test_flight_failure_ends_with_fail_stop_and_unstages() {
    let bl = beamline(0.0);
    bl.motor.inject_failure_at_move(2);
    let detector = Arc::new(MockFlyer::with_readings("xspress", &[]));
    let plan =
        FlyScan::new(bl.flyer.clone(), 20.0, 10.0, 101, 0.01).with_detector(detector.clone());

    let (tx, rx) = mpsc::channel(512);
    let err = plan.run(&tx).await.unwrap_err();
    drop(tx);
    let docs = drain(rx).await;

    assert!(err.to_string().contains("following error"));
    assert_eq!(docs.len(), 2);
    assert_eq!(stop_status(&docs), "fail");
    assert_eq!(bl.flyer.state(), FlyerState::Idle);
    assert_eq!(bl.motor.current_velocity(), 3.0);
    assert_eq!(detector.calls().last().map(String::as_str), Some("unstage"));
    assert_eq!(
        bl.channel.commands().last().map(String::as_str),
        Some("PSOCONTROL @0 OFF")
    );
}

#[tokio::test]
async fn test_ragged_detector_fails_collection() {
    let bl = beamline(0.0);
    let short = Arc::new(MockFlyer::with_readings("xspress", &[(0.0, 1.0)]));
    let plan = FlyScan::new(bl.flyer.clone(), 20.0, 10.0, 11, 0.01).with_detector(short);

    let (tx, rx) = mpsc::channel(64);
    let err = plan.run(&tx).await.unwrap_err();
    drop(tx);
    let docs = drain(rx).await;

    assert!(matches!(
        err,
        beamline_daq::DaqError::RaggedCollection { expected: 11, found: 1, .. }
    ));
    assert_eq!(stop_status(&docs), "fail");
}

#[tokio::test]
async fn test_abort_mid_flight_ends_with_abort_stop() {
    let bl = beamline(0.02);
    let plan = Arc::new(
        FlyScan::new(bl.flyer.clone(), 20.0, 10.0, 101, 0.01)
            .with_status_timeout(Duration::from_secs(10)),
    );

    let (tx, rx) = mpsc::channel(512);
    let runner = {
        let plan = plan.clone();
        tokio::spawn(async move { plan.run(&tx).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    plan.abort();

    let result = runner.await.unwrap();
    let docs = drain(rx).await;
    assert!(result.is_err());
    assert_eq!(stop_status(&docs), "abort");
    assert_eq!(bl.flyer.state(), FlyerState::Idle);
    assert_eq!(bl.motor.current_velocity(), 3.0);
}

#[tokio::test]
async fn test_dropped_run_still_unstages() {
    // Taxi ends around 0.8 s and the flight lands around 1.0 s
    let bl = beamline(0.1);
    let detector = Arc::new(MockFlyer::with_readings("xspress", &[]));
    let plan =
        FlyScan::new(bl.flyer.clone(), 20.0, 10.0, 101, 0.01).with_detector(detector.clone());

    let (tx, _rx) = mpsc::channel(512);
    let cancelled = tokio::time::timeout(Duration::from_millis(900), plan.run(&tx)).await;
    assert!(cancelled.is_err());
    assert_ne!(bl.flyer.state(), FlyerState::Idle);
    drop(plan);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(bl.flyer.state(), FlyerState::Idle);
    assert_eq!(bl.motor.current_velocity(), 3.0);
    assert_eq!(bl.motor.velocity_writes().last(), Some(&3.0));
    assert_eq!(
        bl.channel.commands().last().map(String::as_str),
        Some("PSOCONTROL @0 OFF")
    );
    assert_eq!(detector.calls().last().map(String::as_str), Some("unstage"));
}

#[tokio::test]
async fn test_detector_only_needs_flying_device() {
    let bl = beamline(0.0);
    let detectors: Vec<Arc<dyn FlyingDevice>> = vec![
        Arc::new(MockFlyer::with_readings("i0", &[(0.0, 1.0), (1.0, 2.0), (2.0, 3.0)])),
        Arc::new(MockFlyer::with_readings("it", &[(0.0, 4.0), (1.0, 5.0), (2.0, 6.0)])),
    ];
    let plan = detectors
        .into_iter()
        .fold(FlyScan::new(bl.flyer.clone(), 0.0, 1.0, 3, 0.1), FlyScan::with_detector);

    let (tx, rx) = mpsc::channel(16);
    let summary = plan.run(&tx).await.unwrap();
    drop(tx);
    let docs = drain(rx).await;

    assert_eq!(summary.num_events, 3);
    let Document::Event(last) = &docs[docs.len() - 2] else {
        panic!("expected the last event before stop");
    };
    assert_eq!(last.data["it"], Value::from(6.0));
}
