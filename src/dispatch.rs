//! Inbound reconciliation: schema lookup, conversion and staleness
//! suppression for decoded frames.

use crate::convert::TypedValue;
use crate::error::SchemaError;
use crate::protocol::DatapointFrame;
use crate::schema::DeviceDpSchema;
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

pub const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(200);

/// An accepted report, ready for the capability store.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityUpdate {
    pub field: String,
    pub value: TypedValue,
    pub source_dp: u8,
    pub observed_at: Instant,
}

/// Telemetry on a dp the schema does not map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnmappedDp {
    pub dp_id: u8,
    pub type_tag: u8,
    pub count: u64,
}

/// Outcome of dispatching one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Update(CapabilityUpdate),
    /// Same value inside the quiescence window
    Suppressed,
    Unmapped(SchemaError),
    /// Payload could not be converted for the mapped field
    Rejected { field: String, reason: String },
}

pub struct Dispatcher {
    schema: Arc<DeviceDpSchema>,
    quiescence: Duration,
    last: HashMap<String, (TypedValue, Instant)>,
    unmapped: BTreeMap<u8, UnmappedDp>,
}

impl Dispatcher {
    pub fn new(schema: Arc<DeviceDpSchema>) -> Self {
        Self {
            schema,
            quiescence: DEFAULT_QUIESCENCE,
            last: HashMap::new(),
            unmapped: BTreeMap::new(),
        }
    }

    pub fn with_quiescence(mut self, window: Duration) -> Self {
        self.quiescence = window;
        self
    }

    pub fn schema(&self) -> &Arc<DeviceDpSchema> {
        &self.schema
    }

    /// Accept or suppress one frame observed at `now`.
    pub fn on_frame(&mut self, frame: &DatapointFrame, now: Instant) -> Option<CapabilityUpdate> {
        match self.dispatch(frame, now) {
            Dispatch::Update(update) => Some(update),
            _ => None,
        }
    }

    /// Like [`on_frame`](Self::on_frame) but reports why nothing was emitted.
    pub fn dispatch(&mut self, frame: &DatapointFrame, now: Instant) -> Dispatch {
        let dp_id = frame.dp_id();
        let Some(entry) = self.schema.lookup(dp_id) else {
            let err = SchemaError::UnmappedDp {
                dp_id,
                type_tag: frame.dp_type().tag(),
            };
            let seen = self.unmapped.entry(dp_id).or_insert(UnmappedDp {
                dp_id,
                type_tag: frame.dp_type().tag(),
                count: 0,
            });
            seen.type_tag = frame.dp_type().tag();
            seen.count += 1;
            warn!(
                "{} on model {}: payload={}",
                err,
                self.schema.model(),
                hex::encode(frame.payload())
            );
            return Dispatch::Unmapped(err);
        };

        let value = match entry.decode(frame) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping dp {} ({}): {}", dp_id, entry.field, e);
                return Dispatch::Rejected {
                    field: entry.field.clone(),
                    reason: e.to_string(),
                };
            }
        };

        // The window slides: every report, suppressed or not, refreshes the timestamp
        let stale = match self.last.get_mut(&entry.field) {
            Some((previous, seen_at)) => {
                let duplicate = *previous == value
                    && now.saturating_duration_since(*seen_at) < self.quiescence;
                *seen_at = now;
                if !duplicate {
                    *previous = value.clone();
                }
                duplicate
            }
            None => {
                self.last.insert(entry.field.clone(), (value.clone(), now));
                false
            }
        };

        if stale {
            debug!("Suppressed duplicate {}={} (dp {})", entry.field, value, dp_id);
            return Dispatch::Suppressed;
        }

        debug!("dp {} -> {}={}", dp_id, entry.field, value);
        Dispatch::Update(CapabilityUpdate {
            field: entry.field.clone(),
            value,
            source_dp: dp_id,
            observed_at: now,
        })
    }

    /// Last accepted value for a field.
    pub fn last_value(&self, field: &str) -> Option<&TypedValue> {
        self.last.get(field).map(|(value, _)| value)
    }

    /// Unmapped dps seen so far, for future schema extension.
    pub fn unmapped(&self) -> Vec<UnmappedDp> {
        self.unmapped.values().copied().collect()
    }
}
