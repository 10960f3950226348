use std::sync::Mutex;

use coarsetime::Duration;
use itertools::{
    Itertools,
    MinMaxResult::{MinMax, NoElements, OneElement},
};

/// Per-source latency aggregator. Shared by every strategy delivering messages of the same source
pub trait LatencyStats: Send + Sync {
    fn add(&self, latency: Duration);
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct LatencySnapshot {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub average: Duration,
}

#[derive(Default)]
pub struct LatencyTracker {
    samples: Mutex<Vec<Duration>>,
}

impl LatencyTracker {
    pub fn snapshot(&self) -> Option<LatencySnapshot> {
        let samples = self.samples.lock().ok()?;
        summarize(&samples)
    }

    pub fn snapshot_and_reset(&self) -> Option<LatencySnapshot> {
        let mut samples = self.samples.lock().ok()?;
        let res = summarize(&samples);
        samples.clear();
        res
    }

    pub fn count(&self) -> usize {
        self.samples.lock().map(|samples| samples.len()).unwrap_or_default()
    }
}

impl LatencyStats for LatencyTracker {
    fn add(&self, latency: Duration) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(latency);
        }
    }
}

pub(crate) fn summarize(samples: &[Duration]) -> Option<LatencySnapshot> {
    if samples.is_empty() {
        return None;
    }

    let (min, max) = match samples.iter().copied().minmax() {
        NoElements => (Duration::new(0, 0), Duration::new(0, 0)),
        OneElement(elem) => (elem, elem),
        MinMax(min, max) => (min, max),
    };

    let average = samples
        .iter()
        .fold(Duration::new(0, 0), |acc, e| acc + *e)
        / samples.len() as u32;

    Some(LatencySnapshot {
        count: samples.len(),
        min,
        max,
        average,
    })
}
