//! Observable scan-parameter signals
//!
//! Reactive values built on `tokio::sync::watch` for multi-subscriber change
//! notification. The flyer keeps one `Observable<f64>` per scan input
//! (start, end, step, dwell, ...) and re-derives its trajectory whenever one of
//! them is written; GUI panels and loggers may subscribe independently.
//!
//! # Example
//!
//! ```rust,ignore
//! let dwell = Observable::new("dwell_time", 0.1)
//!     .with_units("s")
//!     .with_range(0.0, 60.0);
//!
//! let mut rx = dwell.subscribe();
//! dwell.set(0.25)?;
//! rx.changed().await?;
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

/// Metadata for an observable signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Signal name (unique within a device)
    pub name: String,
    /// Engineering units (e.g., "mm", "s")
    pub units: Option<String>,
    /// Whether writes are rejected
    pub read_only: bool,
}

/// A thread-safe, observable value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    metadata: ObservableMetadata,
    validator: Option<Arc<dyn Fn(&T) -> Result<()> + Send + Sync>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("metadata", &self.metadata)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            // Shares the same watch channel
            sender: self.sender.clone(),
            metadata: self.metadata.clone(),
            validator: self.validator.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            metadata: ObservableMetadata {
                name: name.into(),
                units: None,
                read_only: false,
            },
            validator: None,
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.metadata.read_only = true;
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &ObservableMetadata {
        &self.metadata
    }

    /// Set a new value, notifying all subscribers.
    ///
    /// Returns error if the signal is read-only or validation fails.
    pub fn set(&self, value: T) -> Result<()> {
        if self.metadata.read_only {
            return Err(anyhow!("Signal '{}' is read-only", self.metadata.name));
        }

        if let Some(validator) = &self.validator {
            validator(&value)?;
        }

        self.sender.send_replace(value);
        Ok(())
    }

    /// Owner-side write: validated, but allowed on read-only signals.
    pub(crate) fn update(&self, value: T) -> Result<()> {
        if let Some(validator) = &self.validator {
            validator(&value)?;
        }
        self.sender.send_replace(value);
        Ok(())
    }

    /// Set value without validation (device-side updates).
    pub(crate) fn set_unchecked(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + 'static,
{
    /// Add min/max range validation.
    pub fn with_range(mut self, min: T, max: T) -> Self {
        self.validator = Some(Arc::new(move |value: &T| {
            if value < &min || value > &max {
                Err(anyhow!(
                    "Value {:?} out of range [{:?}, {:?}]",
                    value,
                    min,
                    max
                ))
            } else {
                Ok(())
            }
        }));
        self
    }
}
