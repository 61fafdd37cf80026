//! Meter value aggregation
//!
//! Samples of aligned measurands are averaged per (measurand, phase) over the
//! flush interval; every other sample is passed through unchanged.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use parking_lot::Mutex;

use crate::ocpp::{Measurand, MeterValue, Phase, ReadingContext, SampledValue, UnitOfMeasure};

type BucketKey = (Measurand, Option<Phase>);

/// Running sum of one (measurand, phase) since the last flush
#[derive(Debug, Clone, Default)]
struct AggregationBucket {
    sum: f64,
    count: u32,
    unit: Option<UnitOfMeasure>,
}

#[derive(Debug, Default)]
struct Pending {
    buckets: BTreeMap<BucketKey, AggregationBucket>,
    passthrough: Vec<SampledValue>,
}

pub struct MeterValueAggregator {
    averaged: BTreeSet<Measurand>,
    pending: Mutex<Pending>,
}

impl MeterValueAggregator {
    pub fn new(averaged: BTreeSet<Measurand>) -> Self {
        Self {
            averaged,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Ingest a raw meter value
    pub fn record(&self, meter_value: &MeterValue) {
        let mut pending = self.pending.lock();

        for sample in &meter_value.sampled_value {
            match sample.measurand {
                Some(measurand) if self.averaged.contains(&measurand) => {
                    let bucket = pending.buckets.entry((measurand, sample.phase)).or_default();
                    bucket.sum += sample.value;
                    bucket.count += 1;
                    if bucket.unit.is_none() {
                        bucket.unit = sample.unit_of_measure.clone();
                    }
                }
                _ => pending.passthrough.push(sample.clone()),
            }
        }
    }

    /// Averages of every bucket plus the passed-through samples, then reset.
    /// Empty when nothing was recorded since the last flush.
    pub fn flush(&self) -> MeterValue {
        let mut pending = self.pending.lock();
        let Pending {
            buckets,
            passthrough,
        } = std::mem::take(&mut *pending);
        drop(pending);

        let mut sampled_value: Vec<SampledValue> = buckets
            .into_iter()
            .filter(|(_, bucket)| bucket.count > 0)
            .map(|((measurand, phase), bucket)| SampledValue {
                value: bucket.sum / f64::from(bucket.count),
                context: Some(ReadingContext::SamplePeriodic),
                measurand: Some(measurand),
                phase,
                unit_of_measure: bucket.unit,
            })
            .collect();
        sampled_value.extend(passthrough);

        MeterValue::new(Utc::now(), sampled_value)
    }

    /// Discard everything recorded since the last flush
    pub fn clear(&self) {
        *self.pending.lock() = Pending::default();
    }

    pub fn is_empty(&self) -> bool {
        let pending = self.pending.lock();
        pending.buckets.is_empty() && pending.passthrough.is_empty()
    }
}
