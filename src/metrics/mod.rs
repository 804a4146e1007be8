//! Counter metrics with attribute-keyed aggregation.
//!
//! A [`Meter`] creates named [`Counter`]s. Each counter aggregates its
//! increments per distinct attribute set, so
//! `checkout.orders{payment.method="card"}` and
//! `checkout.orders{payment.method="cash"}` accumulate independently.
//! [`Meter::collect`] snapshots every instrument, reporting either running
//! totals or the change since the previous collection depending on the
//! meter's [`Temporality`].

use crate::error::{TelemetryError, TelemetryResult};
use crate::resource::Resource;
use crate::{Key, KeyValue};
use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// How collected counter values relate to previous collections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Temporality {
    /// Report the running total since instrument creation.
    #[default]
    Cumulative,
    /// Report the change since the previous collection.
    Delta,
}

/// A unique set of attributes serving as an aggregation key.
///
/// Attributes are sorted by key with later duplicates winning, so
/// `[a=1, b=2]` and `[b=2, a=1]` address the same bucket. The hash is
/// precomputed once since every `add` call looks one of these up.
#[derive(Clone, Debug)]
struct AttributeSet(Vec<KeyValue>, u64);

impl AttributeSet {
    fn new(attributes: &[KeyValue]) -> Self {
        let mut values: Vec<KeyValue> = attributes.to_vec();
        // last write wins for duplicate keys
        values.reverse();
        values.sort_by(|a, b| a.key.cmp(&b.key));
        values.dedup_by(|a, b| a.key == b.key);

        let mut hasher = DefaultHasher::new();
        values.iter().for_each(|kv| kv.hash(&mut hasher));
        AttributeSet(values, hasher.finish())
    }

    fn into_vec(self) -> Vec<KeyValue> {
        self.0
    }
}

impl PartialEq for AttributeSet {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1 && self.0 == other.0
    }
}

// instruments reject non-finite values, so NaN never reaches a key and
// the PartialEq above is total in practice
impl Eq for AttributeSet {}

impl Hash for AttributeSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.1)
    }
}

/// One accumulation bucket of a counter.
#[derive(Debug, Default)]
struct Bucket {
    /// Running total since instrument creation.
    total: f64,
    /// Total as of the previous delta collection.
    exported: f64,
}

/// A single attribute-set/value pair in a [`CounterSnapshot`].
#[derive(Clone, Debug, PartialEq)]
pub struct DataPoint {
    /// The attributes addressing this bucket, sorted by key.
    pub attributes: Vec<KeyValue>,
    /// The collected value, per the meter's [`Temporality`].
    pub value: f64,
}

/// The collected state of one counter.
#[derive(Clone, Debug, PartialEq)]
pub struct CounterSnapshot {
    /// Instrument name.
    pub name: Cow<'static, str>,
    /// Instrument description, possibly empty.
    pub description: Cow<'static, str>,
    /// Temporality the values were collected under.
    pub temporality: Temporality,
    /// One point per attribute set that has received increments.
    pub data_points: Vec<DataPoint>,
}

impl CounterSnapshot {
    /// Convenience lookup of the value recorded for the given attributes.
    pub fn value(&self, attributes: &[KeyValue]) -> Option<f64> {
        let key = AttributeSet::new(attributes);
        self.data_points
            .iter()
            .find(|point| point.attributes == key.0)
            .map(|point| point.value)
    }
}

#[derive(Debug, Default)]
struct CounterState {
    buckets: Mutex<HashMap<AttributeSet, Bucket>>,
}

/// A monotonically increasing instrument.
///
/// Cheap to clone; clones share the same buckets. Increments never block
/// on export, they only take a short-lived map lock.
#[derive(Clone, Debug)]
pub struct Counter {
    name: Cow<'static, str>,
    description: Cow<'static, str>,
    state: Arc<CounterState>,
}

impl Counter {
    /// The instrument's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instrument's description, empty if none was given.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Record an increment with the given attributes.
    ///
    /// Counters are monotonic: negative and non-finite values are rejected
    /// with [`TelemetryError::InvalidArgument`] and leave every bucket
    /// untouched.
    pub fn add(&self, value: f64, attributes: &[KeyValue]) -> TelemetryResult<()> {
        if !value.is_finite() {
            return Err(TelemetryError::InvalidArgument(format!(
                "counter {} increment must be finite, got {value}",
                self.name
            )));
        }
        if value < 0.0 {
            return Err(TelemetryError::InvalidArgument(format!(
                "counter {} increment must be non-negative, got {value}",
                self.name
            )));
        }

        let mut buckets = self.state.buckets.lock()?;
        buckets.entry(AttributeSet::new(attributes)).or_default().total += value;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MeterInner {
    counters: Mutex<HashMap<Cow<'static, str>, Counter>>,
    temporality: Temporality,
}

/// Creates and collects [`Counter`] instruments.
#[derive(Clone, Debug, Default)]
pub struct Meter {
    inner: Arc<MeterInner>,
}

impl Meter {
    /// Create a meter collecting with the given [`Temporality`].
    pub fn new(temporality: Temporality) -> Self {
        Meter {
            inner: Arc::new(MeterInner {
                counters: Mutex::new(HashMap::new()),
                temporality,
            }),
        }
    }

    /// Create or look up the [`Counter`] with the given name.
    ///
    /// Creation is idempotent: asking twice for the same name returns
    /// handles onto the same instrument, so increments from both are
    /// aggregated together.
    pub fn create_counter(&self, name: impl Into<Cow<'static, str>>) -> TelemetryResult<Counter> {
        self.create_counter_with_description(name, "")
    }

    /// Like [`create_counter`](Self::create_counter), with a description.
    ///
    /// The first registration's description wins; asking again with a
    /// different, non-empty description logs a warning and returns the
    /// existing instrument unchanged.
    pub fn create_counter_with_description(
        &self,
        name: impl Into<Cow<'static, str>>,
        description: impl Into<Cow<'static, str>>,
    ) -> TelemetryResult<Counter> {
        let name = name.into();
        let description = description.into();
        let mut counters = self.inner.counters.lock()?;
        let counter = counters
            .entry(name.clone())
            .or_insert_with(|| Counter {
                name,
                description: description.clone(),
                state: Arc::new(CounterState::default()),
            })
            .clone();
        if !description.is_empty() && counter.description != description {
            warn!(
                name: "telemetry.meter.description_conflict",
                instrument = counter.name.as_ref(),
                "counter re-registered with a different description, keeping the first"
            );
        }
        Ok(counter)
    }

    /// Snapshot every registered counter.
    ///
    /// Under [`Temporality::Delta`], collecting also marks the returned
    /// values as exported, so the next collection reports only increments
    /// recorded after this one.
    pub fn collect(&self) -> TelemetryResult<Vec<CounterSnapshot>> {
        let counters = self.inner.counters.lock()?;
        let mut snapshots = Vec::with_capacity(counters.len());
        for counter in counters.values() {
            let mut buckets = counter.state.buckets.lock()?;
            let mut data_points = Vec::with_capacity(buckets.len());
            for (attrs, bucket) in buckets.iter_mut() {
                let value = match self.inner.temporality {
                    Temporality::Cumulative => bucket.total,
                    Temporality::Delta => {
                        let delta = bucket.total - bucket.exported;
                        bucket.exported = bucket.total;
                        delta
                    }
                };
                data_points.push(DataPoint {
                    attributes: attrs.clone().into_vec(),
                    value,
                });
            }
            data_points.sort_by(|a, b| {
                let a_keys: Vec<&Key> = a.attributes.iter().map(|kv| &kv.key).collect();
                let b_keys: Vec<&Key> = b.attributes.iter().map(|kv| &kv.key).collect();
                a_keys
                    .cmp(&b_keys)
                    .then_with(|| a.value.partial_cmp(&b.value).unwrap_or(std::cmp::Ordering::Equal))
            });
            snapshots.push(CounterSnapshot {
                name: counter.name.clone(),
                description: counter.description.clone(),
                temporality: self.inner.temporality,
                data_points,
            });
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }
}

/// Destination for collected metric snapshots.
///
/// Metrics are pulled: the pipeline collects the meter and hands the
/// snapshot over on `force_flush` and once more during shutdown. Unlike
/// span export there is no retry here; a dropped delta snapshot is lost,
/// a dropped cumulative one is recovered by the next collection.
pub trait MetricsExporter: Send + Debug {
    /// Export one collection's worth of counter snapshots.
    fn export(&mut self, snapshot: Vec<CounterSnapshot>) -> TelemetryResult<()>;

    /// Shut the exporter down. Called at most once, after the final export.
    fn shutdown(&mut self) {}

    /// Set the resource describing the producing entity.
    fn set_resource(&mut self, _resource: &Resource) {}
}

/// A [`MetricsExporter`] that stores snapshots in memory, for tests.
///
/// Clones share the same storage.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMetricsExporter {
    snapshots: Arc<Mutex<Vec<Vec<CounterSnapshot>>>>,
}

impl InMemoryMetricsExporter {
    /// Returns every exported collection, oldest first.
    pub fn get_snapshots(&self) -> TelemetryResult<Vec<Vec<CounterSnapshot>>> {
        Ok(self.snapshots.lock()?.clone())
    }

    /// Clears the stored snapshots.
    pub fn reset(&self) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.clear();
        }
    }
}

impl MetricsExporter for InMemoryMetricsExporter {
    fn export(&mut self, snapshot: Vec<CounterSnapshot>) -> TelemetryResult<()> {
        self.snapshots.lock()?.push(snapshot);
        Ok(())
    }
}
