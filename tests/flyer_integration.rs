//! Flyer, PSO and collector behaviour against simulated hardware.

use std::sync::Arc;
use std::time::Duration;

use beamline_daq::error::DaqError;
use beamline_daq::experiment::FlyerCollector;
use beamline_daq::hardware::capabilities::{Flyer, FlyingDevice, Readable, Stageable};
use beamline_daq::hardware::mock::{MockCommandChannel, MockFlyer, SimMotor, SimSignal};
use beamline_daq::hardware::PsoController;
use beamline_daq::instrument::{AerotechFlyer, FlyerState};
use beamline_daq::trajectory::{ScanParameters, TrajectoryPlanner};
use beamline_daq::units::EngineeringUnit;
use serde_json::Value;

const TOLERANCE: f64 = 1e-9;

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < TOLERANCE,
        "expected {expected}, got {actual}"
    );
}

fn reverse_scan() -> ScanParameters {
    ScanParameters {
        start_position: 20.0,
        end_position: 10.0,
        step_size: 0.1,
        dwell_time: 0.1,
        acceleration_time: 0.5,
        encoder_resolution: 0.001,
        motor_direction: 1,
        encoder_direction: 1,
    }
}

fn flyer_with(motor: Arc<SimMotor>) -> (AerotechFlyer, Arc<MockCommandChannel>) {
    let channel = Arc::new(MockCommandChannel::new());
    let pso = PsoController::new("@0", 6, channel.clone());
    (AerotechFlyer::new("aerotech_horiz", motor, pso), channel)
}

#[tokio::test]
async fn test_pso_enable_sends_exact_sequence() {
    let mut trajectory = TrajectoryPlanner::default()
        .derive(&ScanParameters {
            start_position: 0.0,
            end_position: 10.0,
            step_size: 0.05,
            dwell_time: 0.5,
            acceleration_time: 0.5,
            encoder_resolution: 0.001,
            motor_direction: 1,
            encoder_direction: 1,
        })
        .unwrap();
    assert_eq!(trajectory.encoder_step_size, 50);
    assert!(trajectory.encoder_use_window);
    trajectory.encoder_window_start = -5;
    trajectory.encoder_window_end = 10000;

    let channel = Arc::new(MockCommandChannel::new());
    let pso = PsoController::new("@0", 6, channel.clone());
    pso.enable(&trajectory).await.unwrap();

    assert_eq!(
        channel.commands(),
        vec![
            "PSOCONTROL @0 RESET",
            "PSOOUTPUT @0 CONTROL 1",
            "PSOPULSE @0 TIME 20,10",
            "PSOOUTPUT @0 PULSE WINDOW MASK",
            "PSOTRACK @0 INPUT 6",
            "PSODISTANCE @0 FIXED 50",
            "PSOWINDOW @0 1 INPUT 6",
            "PSOWINDOW @0 1 RANGE -5,10000",
        ]
    );
}

#[tokio::test]
async fn test_kickoff_status_becomes_done_after_taxi() {
    let motor = Arc::new(SimMotor::new("horiz", EngineeringUnit::Millimeter).with_time_scale(0.005));
    let (flyer, channel) = flyer_with(motor.clone());
    flyer.set_scan(&reverse_scan()).unwrap();
    let trajectory = flyer.trajectory().unwrap();

    flyer.stage().await.unwrap();
    let status = flyer.kickoff().await.unwrap();
    assert!(!status.done());
    assert_eq!(flyer.state(), FlyerState::Taxiing);

    status
        .wait_timeout(Duration::from_secs(5), "taxi")
        .await
        .unwrap();
    assert!(status.success());
    assert_eq!(flyer.state(), FlyerState::ReadyToFly);
    assert_close(motor.current_position(), trajectory.taxi_start);
    assert_close(motor.current_velocity(), trajectory.slew_speed);
    assert_eq!(
        channel.commands().last().map(String::as_str),
        Some("PSOCONTROL @0 ARM")
    );

    // Stays done once resolved
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(status.success());

    flyer.unstage().await.unwrap();
}

#[tokio::test]
async fn test_second_kickoff_is_rejected_while_taxiing() {
    let motor = Arc::new(SimMotor::new("horiz", EngineeringUnit::Millimeter).with_time_scale(0.005));
    let (flyer, _) = flyer_with(motor);
    flyer.set_scan(&reverse_scan()).unwrap();
    flyer.stage().await.unwrap();

    let _status = flyer.kickoff().await.unwrap();
    let err = flyer.kickoff().await.unwrap_err();
    assert!(matches!(err, DaqError::InvalidTransition { .. }));

    flyer.unstage().await.unwrap();
    assert_eq!(flyer.state(), FlyerState::Idle);
}

#[tokio::test]
async fn test_abort_during_taxi_fails_status_and_restores() {
    let motor = Arc::new(
        SimMotor::new("horiz", EngineeringUnit::Millimeter)
            .with_velocity(2.0)
            .with_time_scale(0.05),
    );
    let (flyer, channel) = flyer_with(motor.clone());
    flyer.set_scan(&reverse_scan()).unwrap();
    flyer.stage().await.unwrap();

    let status = flyer.kickoff().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    flyer.abort();

    let err = status.wait().await.unwrap_err();
    assert!(matches!(err, DaqError::StatusFailed(msg) if msg.contains("aborted")));
    assert_eq!(flyer.state(), FlyerState::Armed);
    assert_eq!(
        channel.commands().last().map(String::as_str),
        Some("PSOCONTROL @0 OFF")
    );

    flyer.unstage().await.unwrap();
    assert_eq!(motor.current_velocity(), 2.0);
}

#[tokio::test]
async fn test_kickoff_again_after_abort() {
    let motor = Arc::new(SimMotor::new("horiz", EngineeringUnit::Millimeter).with_time_scale(0.05));
    let (flyer, _) = flyer_with(motor.clone());
    flyer.set_scan(&reverse_scan()).unwrap();
    flyer.stage().await.unwrap();

    let status = flyer.kickoff().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    flyer.abort();
    assert!(status.wait().await.is_err());
    assert_eq!(flyer.state(), FlyerState::Armed);

    let status = flyer.kickoff().await.unwrap();
    status
        .wait_timeout(Duration::from_secs(5), "taxi")
        .await
        .unwrap();
    assert_eq!(flyer.state(), FlyerState::ReadyToFly);
    assert_close(motor.current_position(), flyer.trajectory().unwrap().taxi_start);

    flyer.unstage().await.unwrap();
}

#[tokio::test]
async fn test_describe_collect_keeps_flyer_then_signal_order() {
    let motor = Arc::new(
        SimMotor::new("horiz", EngineeringUnit::Micrometer)
            .with_limits(-100.0, 100.0)
            .with_precision(3),
    );
    let (flyer, _) = flyer_with(motor);
    let flyers: Vec<Arc<dyn FlyingDevice>> = vec![
        Arc::new(flyer),
        Arc::new(MockFlyer::with_readings("xspress", &[]).with_units("counts")),
    ];
    let ring: Arc<dyn Readable> = Arc::new(SimSignal::new("ring_current", 102.0).with_units("mA"));
    let collector = FlyerCollector::new(flyers)
        .unwrap()
        .with_extra_signals(vec![ring]);

    let schema = collector.describe_collect().await.unwrap();
    let keys: Vec<&String> = schema["primary"].as_object().unwrap().keys().collect();
    assert_eq!(keys, ["aerotech_horiz", "xspress", "ring_current"]);

    let horiz = &schema["primary"]["aerotech_horiz"];
    assert_eq!(horiz["units"], "um");
    assert_eq!(horiz["lower_ctrl_limit"], -100.0);
    assert_eq!(horiz["precision"], 3);
}

#[tokio::test]
async fn test_collect_merges_by_index_using_reference_time() {
    let flyers: Vec<Arc<dyn Flyer>> = vec![
        Arc::new(MockFlyer::with_readings("horiz", &[(100.0, 1.0), (101.0, 2.0)])),
        Arc::new(MockFlyer::with_readings("vert", &[(100.4, 7.0), (101.4, 8.0)])),
    ];
    let ring: Arc<dyn Readable> = Arc::new(SimSignal::new("ring_current", 102.0));
    let collector = FlyerCollector::new(flyers)
        .unwrap()
        .with_extra_signals(vec![ring]);

    let events: Vec<_> = collector.collect().await.unwrap().collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].time, 100.0);
    assert_eq!(events[1].time, 101.0);
    assert_eq!(events[1].data["horiz"], Value::from(2.0));
    assert_eq!(events[1].data["vert"], Value::from(8.0));
    assert_eq!(events[1].timestamps["vert"], Value::from(101.4));
    assert_eq!(events[0].data["ring_current"], Value::from(102.0));

    let channels: Vec<&str> = events[0].channels().collect();
    assert_eq!(channels, ["horiz", "vert", "ring_current"]);
}
