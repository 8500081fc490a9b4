//! Fly-scan plan.
//!
//! A plan describes a run declaratively (type, arguments, movers, detectors)
//! and knows how to execute it against devices, emitting the run's documents
//! to a channel as it goes:
//!
//! ```text
//! Start ─ set scan parameters ─ stage all ─ kickoff all ─ complete all
//!       ─ Descriptor ─ Event × N ─ unstage all ─ Stop
//! ```
//!
//! Devices are always unstaged, and a Stop document is always emitted once the
//! Start document went out. If the `run` future itself is dropped mid-scan,
//! the staged devices are unstaged on a background task instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::{AppResult, DaqError};
use crate::experiment::collector::FlyerCollector;
use crate::experiment::document::{DescriptorDoc, Document, EventDoc, StartDoc, StopDoc};
use crate::hardware::capabilities::{Flyer, FlyingDevice, Readable};
use crate::instrument::aerotech::AerotechFlyer;
use crate::status::Status;

/// Declarative description of a run, used for its Start document.
pub trait Plan: Send + Sync {
    /// Plan type identifier (e.g., "fly_scan")
    fn plan_type(&self) -> &str;

    /// Human-readable plan name
    fn plan_name(&self) -> &str;

    fn plan_args(&self) -> Map<String, Value>;

    /// Devices that will be moved (for hints)
    fn movers(&self) -> Vec<String>;

    /// Devices that will be read
    fn detectors(&self) -> Vec<String>;

    /// Total number of points in the scan
    fn num_points(&self) -> usize;

    fn start_doc(&self) -> StartDoc {
        let mut doc = StartDoc::new(self.plan_type(), self.plan_name())
            .with_metadata("num_points", self.num_points())
            .with_metadata("detectors", self.detectors());
        doc.plan_args = self.plan_args();
        for mover in self.movers() {
            doc = doc.with_hint(&mover);
        }
        doc
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_uid: String,
    pub exit_status: String,
    pub num_events: u32,
}

/// Fly one stage across a range while flying detectors record alongside it.
///
/// `start` and `stop` are the centers of the first and last pixel; `num` is
/// the number of pixels, so `step = |start - stop| / (num - 1)`.
pub struct FlyScan {
    flyer: Arc<AerotechFlyer>,
    detectors: Vec<Arc<dyn FlyingDevice>>,
    baseline: Vec<Arc<dyn Readable>>,
    start: f64,
    stop: f64,
    num: usize,
    dwell_time: f64,
    status_timeout: Option<Duration>,
    metadata: Map<String, Value>,
    aborted: AtomicBool,
}

impl FlyScan {
    pub fn new(flyer: Arc<AerotechFlyer>, start: f64, stop: f64, num: usize, dwell_time: f64) -> Self {
        Self {
            flyer,
            detectors: Vec::new(),
            baseline: Vec::new(),
            start,
            stop,
            num,
            dwell_time,
            status_timeout: None,
            metadata: Map::new(),
            aborted: AtomicBool::new(false),
        }
    }

    /// Add a flying detector; collected events are merged by index.
    pub fn with_detector(mut self, detector: Arc<dyn FlyingDevice>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Signals read once at collection time and attached to every event.
    pub fn with_baseline(mut self, signals: Vec<Arc<dyn Readable>>) -> Self {
        self.baseline = signals;
        self
    }

    /// Fail the run if any kickoff or complete status takes longer than this.
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn step_size(&self) -> AppResult<f64> {
        if self.num < 2 {
            return Err(DaqError::InvalidScanParameters(format!(
                "a fly scan needs at least 2 points, got {}",
                self.num
            )));
        }
        let step = (self.start - self.stop).abs() / (self.num - 1) as f64;
        if step == 0.0 {
            return Err(DaqError::InvalidScanParameters(
                "start and stop are the same position".into(),
            ));
        }
        Ok(step)
    }

    /// Stop the flight at its next sub-step; the run ends with an "abort" Stop document.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.flyer.abort();
    }

    fn devices(&self) -> Vec<Arc<dyn FlyingDevice>> {
        let flyer: Arc<dyn FlyingDevice> = self.flyer.clone();
        std::iter::once(flyer)
            .chain(self.detectors.iter().cloned())
            .collect()
    }

    /// Execute the scan, sending every document to `sink`.
    pub async fn run(&self, sink: &mpsc::Sender<Document>) -> AppResult<RunSummary> {
        self.aborted.store(false, Ordering::SeqCst);
        let mut start = self.start_doc();
        for (key, value) in &self.metadata {
            start.metadata.insert(key.clone(), value.clone());
        }
        let run_uid = start.uid.clone();
        emit(sink, Document::Start(start)).await?;
        info!(run_uid = %run_uid, flyer = %self.flyer_name(), num = self.num, "Fly scan started");

        let devices = self.devices();
        let mut staged = StagedDevices::default();
        let mut num_events = 0;
        let outcome = self
            .execute(&run_uid, &devices, sink, &mut staged, &mut num_events)
            .await;
        let unstaged = staged.unstage().await;
        let outcome = outcome.and(unstaged);

        let stop = match &outcome {
            Ok(()) => StopDoc::success(&run_uid, num_events),
            Err(err) if self.aborted.load(Ordering::SeqCst) => {
                StopDoc::abort(&run_uid, &err.to_string(), num_events)
            }
            Err(err) => StopDoc::fail(&run_uid, &err.to_string(), num_events),
        };
        let exit_status = stop.exit_status.clone();
        if let Err(err) = emit(sink, Document::Stop(stop)).await {
            warn!(run_uid = %run_uid, error = %err, "Could not emit stop document");
        }

        match outcome {
            Ok(()) => {
                info!(run_uid = %run_uid, events = num_events, "Fly scan finished");
                Ok(RunSummary {
                    run_uid,
                    exit_status,
                    num_events,
                })
            }
            Err(err) => {
                error!(run_uid = %run_uid, error = %err, exit_status = %exit_status, "Fly scan failed");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        run_uid: &str,
        devices: &[Arc<dyn FlyingDevice>],
        sink: &mpsc::Sender<Document>,
        staged: &mut StagedDevices,
        num_events: &mut u32,
    ) -> AppResult<()> {
        let step_size = self.step_size()?;
        let mut params = self.flyer.scan_parameters();
        params.start_position = self.start;
        params.end_position = self.stop;
        params.step_size = step_size;
        params.dwell_time = self.dwell_time;
        self.flyer.set_scan(&params)?;
        let trajectory = self.flyer.trajectory()?;
        info!(
            flyer = %self.flyer_name(),
            pixels = trajectory.pixel_positions.len(),
            slew_speed = trajectory.slew_speed,
            taxi_start = trajectory.taxi_start,
            taxi_end = trajectory.taxi_end,
            "Fly-scan trajectory"
        );

        for device in devices {
            device.stage().await?;
            staged.push(device.clone());
        }
        for device in devices {
            self.check_aborted("kickoff")?;
            let status = device.kickoff().await?;
            self.wait(&status, device.name(), "kickoff").await?;
        }
        for device in devices {
            self.check_aborted("complete")?;
            let status = device.complete().await?;
            self.wait(&status, device.name(), "complete").await?;
        }

        let collector = FlyerCollector::new(devices.to_vec())?
            .with_extra_signals(self.baseline.clone());
        let schema = collector.describe_collect().await?;
        let data_keys = schema
            .get(collector.stream_name())
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let descriptor = DescriptorDoc::new(run_uid, collector.stream_name())
            .with_data_keys(data_keys)
            .with_config("flyer", self.flyer_name())
            .with_config("step_size", step_size);
        let descriptor_uid = descriptor.uid.clone();
        emit(sink, Document::Descriptor(descriptor)).await?;

        for (index, event) in collector.collect().await?.enumerate() {
            let seq_num = index as u32 + 1;
            emit(
                sink,
                Document::Event(EventDoc::from_proto(run_uid, &descriptor_uid, seq_num, event)),
            )
            .await?;
            *num_events = seq_num;
        }
        Ok(())
    }

    fn check_aborted(&self, before: &str) -> AppResult<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(DaqError::Aborted(format!("fly scan aborted before {before}")));
        }
        Ok(())
    }

    async fn wait(&self, status: &Status, device: &str, action: &str) -> AppResult<()> {
        match self.status_timeout {
            Some(timeout) => status.wait_timeout(timeout, &format!("{device} {action}")).await,
            None => status.wait().await,
        }
    }

    fn flyer_name(&self) -> &str {
        self.flyer.name()
    }
}

impl Plan for FlyScan {
    fn plan_type(&self) -> &str {
        "fly_scan"
    }

    fn plan_name(&self) -> &str {
        "Fly Scan"
    }

    fn plan_args(&self) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("flyer".into(), self.flyer_name().into());
        args.insert("detectors".into(), self.detectors().into());
        args.insert("start".into(), self.start.into());
        args.insert("stop".into(), self.stop.into());
        args.insert("num".into(), self.num.into());
        args.insert("dwell_time".into(), self.dwell_time.into());
        args
    }

    fn movers(&self) -> Vec<String> {
        vec![self.flyer_name().to_string()]
    }

    fn detectors(&self) -> Vec<String> {
        self.detectors
            .iter()
            .map(|detector| detector.name().to_string())
            .collect()
    }

    fn num_points(&self) -> usize {
        self.num
    }
}

/// Devices staged by a run, unstaged when the run ends or is dropped.
#[derive(Default)]
struct StagedDevices {
    devices: Vec<Arc<dyn FlyingDevice>>,
}

impl StagedDevices {
    fn push(&mut self, device: Arc<dyn FlyingDevice>) {
        self.devices.push(device);
    }

    async fn unstage(mut self) -> AppResult<()> {
        let devices = std::mem::take(&mut self.devices);
        unstage_all(&devices).await
    }
}

impl Drop for StagedDevices {
    fn drop(&mut self) {
        if self.devices.is_empty() {
            return;
        }
        let devices = std::mem::take(&mut self.devices);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(devices = devices.len(), "Fly scan dropped mid-run, unstaging in the background");
                runtime.spawn(async move {
                    if let Err(err) = unstage_all(&devices).await {
                        error!(error = %err, "Background unstage failed");
                    }
                });
            }
            Err(_) => error!(
                devices = devices.len(),
                "Fly scan dropped outside a runtime, devices left staged"
            ),
        }
    }
}

/// Unstage in reverse order, attempting every device even if one fails.
async fn unstage_all(devices: &[Arc<dyn FlyingDevice>]) -> AppResult<()> {
    let mut first_error = None;
    for device in devices.iter().rev() {
        if let Err(err) = device.unstage().await {
            error!(device = %device.name(), error = %err, "Unstage failed");
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn emit(sink: &mpsc::Sender<Document>, document: Document) -> AppResult<()> {
    sink.send(document)
        .await
        .map_err(|_| DaqError::Aborted("document consumer closed the channel".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCommandChannel, SimMotor};
    use crate::hardware::pso::PsoController;
    use crate::instrument::aerotech::ScanParameter;
    use crate::units::EngineeringUnit;

    fn flyer() -> Arc<AerotechFlyer> {
        let motor = Arc::new(SimMotor::new("horiz", EngineeringUnit::Micrometer));
        let pso = PsoController::new("@0", 6, Arc::new(MockCommandChannel::new()));
        let flyer = AerotechFlyer::new("aerotech_horiz", motor, pso);
        flyer
            .set_parameter(ScanParameter::EncoderResolution, 0.001)
            .unwrap();
        flyer
            .set_parameter(ScanParameter::AccelerationTime, 0.5)
            .unwrap();
        Arc::new(flyer)
    }

    #[test]
    fn test_step_size() {
        let plan = FlyScan::new(flyer(), 20.0, 10.0, 101, 1.0);
        assert!((plan.step_size().unwrap() - 0.1).abs() < 1e-12);

        let plan = FlyScan::new(flyer(), 20.0, 10.0, 1, 1.0);
        assert!(matches!(
            plan.step_size(),
            Err(DaqError::InvalidScanParameters(_))
        ));
    }

    #[test]
    fn test_start_doc_from_plan() {
        let plan = FlyScan::new(flyer(), 0.0, 1.0, 11, 0.5);
        let doc = plan.start_doc();
        assert_eq!(doc.plan_type, "fly_scan");
        assert_eq!(doc.plan_args["num"], Value::from(11));
        assert_eq!(doc.hints, vec!["aerotech_horiz"]);
    }

    #[tokio::test]
    async fn test_invalid_plan_emits_fail_stop() {
        let plan = FlyScan::new(flyer(), 5.0, 5.0, 3, 1.0);
        let (tx, mut rx) = mpsc::channel(16);

        assert!(plan.run(&tx).await.is_err());
        drop(tx);

        let mut docs = Vec::new();
        while let Some(doc) = rx.recv().await {
            docs.push(doc);
        }
        assert_eq!(docs.len(), 2);
        match &docs[1] {
            Document::Stop(stop) => assert_eq!(stop.exit_status, "fail"),
            other => panic!("expected stop document, got {other:?}"),
        }
    }
}
