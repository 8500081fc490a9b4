//! Document model for fly-scan runs.
//!
//! Bluesky-style documents decouple acquisition from storage:
//!
//! - **StartDoc**: plan intent and metadata
//! - **DescriptorDoc**: schema for one data stream
//! - **EventDoc**: one composite measurement
//! - **StopDoc**: exit status and summary
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1 per stream, e.g. "primary")
//!    │       │
//!    │       └── EventDoc (N, one per pixel)
//!    │
//! StopDoc (1)
//! ```
//!
//! Flyers hand the collector [`ProtoEvent`]s, the `{data, timestamps, time}`
//! records that become `EventDoc`s once a run and descriptor are attached.
//! Channel maps are `serde_json::Map`s built with `preserve_order`, so channel
//! order survives from the device through to the serialized event.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time in seconds since the Unix epoch
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    Start(StartDoc),
    Descriptor(DescriptorDoc),
    Event(EventDoc),
    Stop(StopDoc),
}

impl Document {
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid, // Start doc UID is the run UID
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    pub fn time(&self) -> f64 {
        match self {
            Document::Start(d) => d.time,
            Document::Descriptor(d) => d.time,
            Document::Event(d) => d.time,
            Document::Stop(d) => d.time,
        }
    }
}

/// Start document - emitted at the beginning of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    pub plan_type: String,
    pub plan_name: String,
    pub plan_args: Map<String, Value>,
    pub metadata: Map<String, Value>,
    /// Visualization hints (e.g., preferred plot axes)
    pub hints: Vec<String>,
    pub time: f64,
}

impl StartDoc {
    pub fn new(plan_type: &str, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            plan_args: Map::new(),
            metadata: Map::new(),
            hints: Vec::new(),
            time: now_secs(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.plan_args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hints.push(hint.to_string());
        self
    }
}

/// Descriptor document - defines the schema of one data stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name (e.g., "primary", "baseline")
    pub name: String,
    /// Channel name -> serialized [`DataKey`]
    pub data_keys: Map<String, Value>,
    pub configuration: Map<String, Value>,
    pub time: f64,
}

impl DescriptorDoc {
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: Map::new(),
            configuration: Map::new(),
            time: now_secs(),
        }
    }

    pub fn with_data_keys(mut self, data_keys: Map<String, Value>) -> Self {
        self.data_keys = data_keys;
        self
    }

    pub fn with_config(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.configuration.insert(key.to_string(), value.into());
        self
    }
}

/// Schema for a data field within events.
///
/// Field order matches the serialized layout consumers expect:
/// `source, dtype, shape, units, lower_ctrl_limit, upper_ctrl_limit, precision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Source device or record
    pub source: String,
    /// "number", "integer", "string" or "array"
    pub dtype: String,
    /// Empty for scalars
    pub shape: Vec<usize>,
    pub units: String,
    pub lower_ctrl_limit: Option<f64>,
    pub upper_ctrl_limit: Option<f64>,
    /// Display precision in decimal places
    pub precision: Option<u32>,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str, units: &str) -> Self {
        Self {
            source: source.to_string(),
            dtype: "number".to_string(),
            shape: vec![],
            units: units.to_string(),
            lower_ctrl_limit: None,
            upper_ctrl_limit: None,
            precision: None,
        }
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_limits(mut self, lower: f64, upper: f64) -> Self {
        self.lower_ctrl_limit = Some(lower);
        self.upper_ctrl_limit = Some(upper);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One flyer-produced record: `{"data": {...}, "timestamps": {...}, "time": t}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtoEvent {
    pub data: Map<String, Value>,
    pub timestamps: Map<String, Value>,
    pub time: f64,
}

impl ProtoEvent {
    pub fn new(time: f64) -> Self {
        Self {
            data: Map::new(),
            timestamps: Map::new(),
            time,
        }
    }

    pub fn with_reading(mut self, channel: &str, value: impl Into<Value>, timestamp: f64) -> Self {
        self.insert(channel, value.into(), timestamp);
        self
    }

    pub fn insert(&mut self, channel: &str, value: Value, timestamp: f64) {
        self.data.insert(channel.to_string(), value);
        self.timestamps
            .insert(channel.to_string(), Value::from(timestamp));
    }

    /// Copy every channel of `other` into this event, keeping `time`.
    pub fn merge(&mut self, other: &ProtoEvent) {
        for (channel, value) in &other.data {
            self.data.insert(channel.clone(), value.clone());
        }
        for (channel, ts) in &other.timestamps {
            self.timestamps.insert(channel.clone(), ts.clone());
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }
}

/// Event document - one composite measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    pub uid: String,
    pub run_uid: String,
    /// Links to DescriptorDoc that defines schema
    pub descriptor_uid: String,
    /// Sequence number within this descriptor stream, starting at 1
    pub seq_num: u32,
    pub time: f64,
    pub data: Map<String, Value>,
    pub timestamps: Map<String, Value>,
}

impl EventDoc {
    pub fn from_proto(run_uid: &str, descriptor_uid: &str, seq_num: u32, proto: ProtoEvent) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time: proto.time,
            data: proto.data,
            timestamps: proto.timestamps,
        }
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    pub uid: String,
    pub run_uid: String,
    /// Exit status: "success", "abort", "fail"
    pub exit_status: String,
    /// Reason for abort/failure
    pub reason: String,
    pub time: f64,
    pub num_events: u32,
}

impl StopDoc {
    fn with_status(run_uid: &str, exit_status: &str, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: exit_status.to_string(),
            reason: reason.to_string(),
            time: now_secs(),
            num_events,
        }
    }

    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "success", "", num_events)
    }

    pub fn abort(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "abort", reason, num_events)
    }

    pub fn fail(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "fail", reason, num_events)
    }
}
