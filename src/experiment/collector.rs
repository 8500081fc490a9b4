//! Multi-flyer collection.
//!
//! Flyers move independently and each reports its own proto-events. The
//! collector merges them into one stream, using the first flyer as the timing
//! reference: composite event *i* is the reference flyer's event *i* plus every
//! channel of each other flyer's event *i*, plus one reading of every extra
//! (baseline) signal taken when collection starts.

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::experiment::document::ProtoEvent;
use crate::hardware::capabilities::{Flyer, Readable};

/// Stream name used when none is configured
pub const PRIMARY_STREAM: &str = "primary";

/// Key each flyer's `describe_collect` nests its channels under
const FLYER_STREAM: &str = "positions";

pub struct FlyerCollector<F: ?Sized + Flyer = dyn Flyer> {
    stream_name: String,
    flyers: Vec<Arc<F>>,
    extra_signals: Vec<Arc<dyn Readable>>,
}

impl<F: ?Sized + Flyer> FlyerCollector<F> {
    /// The first flyer is the timing reference. At least one is required.
    pub fn new(flyers: Vec<Arc<F>>) -> AppResult<Self> {
        if flyers.is_empty() {
            return Err(DaqError::Configuration(
                "a flyer collector needs at least one flyer".into(),
            ));
        }
        Ok(Self {
            stream_name: PRIMARY_STREAM.to_string(),
            flyers,
            extra_signals: Vec::new(),
        })
    }

    pub fn with_stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = name.into();
        self
    }

    pub fn with_extra_signals(mut self, signals: Vec<Arc<dyn Readable>>) -> Self {
        self.extra_signals = signals;
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn reference(&self) -> &F {
        &self.flyers[0]
    }

    /// Schema of the merged stream: every flyer's position keys in flyer
    /// order, then every extra signal's keys.
    pub async fn describe_collect(&self) -> AppResult<Map<String, Value>> {
        let mut keys = Map::new();
        for flyer in &self.flyers {
            let described = flyer.describe_collect().await?;
            let positions = described
                .get(FLYER_STREAM)
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "flyer '{}' does not describe a '{FLYER_STREAM}' stream",
                        flyer.name()
                    ))
                })?;
            for (channel, key) in positions {
                keys.insert(channel.clone(), key.clone());
            }
        }
        for signal in &self.extra_signals {
            let described = signal
                .describe()
                .await
                .map_err(|e| DaqError::Command(format!("describe '{}': {e}", signal.name())))?;
            keys.extend(described);
        }

        let mut schema = Map::new();
        schema.insert(self.stream_name.clone(), Value::Object(keys));
        Ok(schema)
    }

    /// Gather every flyer's events concurrently and read the extra signals once.
    ///
    /// Fails with `RaggedCollection` if any flyer produced a different number
    /// of events than the reference flyer.
    pub async fn collect(&self) -> AppResult<Collection> {
        let per_flyer =
            try_join_all(self.flyers.iter().map(|flyer| flyer.collect())).await?;

        let expected = per_flyer[0].len();
        for (flyer, events) in self.flyers.iter().zip(&per_flyer).skip(1) {
            if events.len() != expected {
                return Err(DaqError::RaggedCollection {
                    reference: self.flyers[0].name().to_string(),
                    device: flyer.name().to_string(),
                    expected,
                    found: events.len(),
                });
            }
        }

        let mut extra = ProtoEvent::new(0.0);
        for signal in &self.extra_signals {
            let readings = signal
                .read()
                .await
                .map_err(|e| DaqError::Command(format!("read '{}': {e}", signal.name())))?;
            for (channel, reading) in readings {
                let value = reading.get("value").cloned().unwrap_or(Value::Null);
                let timestamp = reading.get("timestamp").cloned().unwrap_or(Value::Null);
                extra.data.insert(channel.clone(), value);
                extra.timestamps.insert(channel, timestamp);
            }
        }
        debug!(
            stream = %self.stream_name,
            extra_channels = extra.data.len(),
            "Read extra signals"
        );

        let mut flyers = per_flyer.into_iter();
        let reference = flyers.next().unwrap_or_default().into_iter();
        info!(
            stream = %self.stream_name,
            flyers = self.flyers.len(),
            events = expected,
            "Collected fly scan"
        );
        Ok(Collection {
            reference,
            others: flyers.map(Vec::into_iter).collect(),
            extra,
        })
    }
}

/// Composite events of one collection pass, in reference-flyer order.
///
/// Finite and one-shot: once exhausted it yields nothing more.
#[derive(Debug)]
pub struct Collection {
    reference: std::vec::IntoIter<ProtoEvent>,
    others: Vec<std::vec::IntoIter<ProtoEvent>>,
    extra: ProtoEvent,
}

impl Iterator for Collection {
    type Item = ProtoEvent;

    fn next(&mut self) -> Option<ProtoEvent> {
        let mut event = self.reference.next()?;
        for other in &mut self.others {
            if let Some(matching) = other.next() {
                event.merge(&matching);
            }
        }
        event.merge(&self.extra);
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.reference.size_hint()
    }
}

impl ExactSizeIterator for Collection {}
