use std::{
    fmt::Display,
    future::{Future, IntoFuture},
    pin::Pin,
};

use byte_unit::{Byte, UnitType};
use coarsetime::Duration;
use derive_builder::Builder;
use derive_new::new;
use kanal::{AsyncReceiver, AsyncSender};
use log::{debug, info};
use nohash_hasher::IntSet;
use tokio::{select, time::interval_at};
use tokio_util::sync::CancellationToken;
use ustr::Ustr;

mod latency;

pub use latency::{LatencySnapshot, LatencyStats, LatencyTracker};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryEvent {
    Delivered {
        source: Ustr,
        size: usize,
        latency: Duration,
    },
    Dropped,
}

pub fn stats_channel(capacity: usize) -> (AsyncSender<DeliveryEvent>, AsyncReceiver<DeliveryEvent>) {
    kanal::bounded_async(capacity)
}

/// Best effort notification: a slow statistics task must never stall delivery
pub(crate) fn notify(stats_tx: Option<&AsyncSender<DeliveryEvent>>, event: DeliveryEvent) {
    if let Some(tx) = stats_tx {
        if !matches!(tx.try_send(event), Ok(true)) {
            debug!("Statistics channel full or closed, event discarded");
        }
    }
}

trait Stats {
    fn add_drop(&mut self);
    fn add_delivery(&mut self, latency: Duration, size: usize, source: Ustr);
    fn calculate_and_reset(&mut self) -> Option<StatSummary>;
    fn calculate(&self) -> Option<StatSummary>;
    fn reset(&mut self);
}

#[derive(Debug, PartialEq)]
struct StatSummary {
    delivered: usize,
    bandwidth: f32,
    min_latency: Duration,
    max_latency: Duration,
    average_latency: Duration,
    dropped_messages: usize,
    active_sources: usize,
}

impl Display for StatSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let min = self.min_latency.as_millis();
        let max = self.max_latency.as_millis();
        let average = self.average_latency.as_millis();

        let bandwidth = Byte::from_f32(self.bandwidth)
            .unwrap_or_default()
            .get_appropriate_unit(UnitType::Decimal)
            .to_string();

        writeln!(
            f,
            "\nDelivered messages: {}\nDropped messages: {}\nActive sources: {}\nBandwidth: {bandwidth}/s\nLatency: <min: {min}, max: {max}, average: {average}> ms",
            self.delivered, self.dropped_messages, self.active_sources
        )
    }
}

#[derive(Clone, new)]
pub struct StatsHolder {
    period: Duration,
    #[new(default)]
    stats_vec: Vec<StatElement>,
    #[new(default)]
    dropped_messages: usize,
    #[new(default)]
    active_sources: IntSet<u64>,
}

impl Default for StatsHolder {
    fn default() -> Self {
        StatsHolder::new(Duration::new(10, 0))
    }
}

impl Stats for StatsHolder {
    fn add_drop(&mut self) {
        self.dropped_messages += 1;
    }

    fn add_delivery(&mut self, latency: Duration, size: usize, source: Ustr) {
        self.stats_vec.push(StatElement { latency, size });

        self.active_sources.insert(source.precomputed_hash());
    }

    fn calculate_and_reset(&mut self) -> Option<StatSummary> {
        let res = self.calculate();
        self.reset();
        res
    }

    fn calculate(&self) -> Option<StatSummary> {
        if self.stats_vec.is_empty() && self.dropped_messages == 0 {
            return None;
        }

        let latencies = self.stats_vec.iter().map(|elem| elem.latency).collect::<Vec<_>>();
        let (min_latency, max_latency, average_latency) = match latency::summarize(&latencies) {
            Some(snapshot) => (snapshot.min, snapshot.max, snapshot.average),
            None => (Duration::new(0, 0), Duration::new(0, 0), Duration::new(0, 0)),
        };

        let mut bandwidth = self.stats_vec.iter().map(|elem| elem.size).sum::<usize>() as f32;

        bandwidth /= self.period.as_secs() as f32;

        Some(StatSummary {
            delivered: self.stats_vec.len(),
            bandwidth,
            min_latency,
            max_latency,
            average_latency,
            dropped_messages: self.dropped_messages,
            active_sources: self.active_sources.len(),
        })
    }

    fn reset(&mut self) {
        self.stats_vec.clear();
        self.dropped_messages = usize::default();
        self.active_sources.clear();
    }
}

#[derive(Copy, Clone)]
struct StatElement {
    latency: Duration,
    size: usize,
}


#[derive(Builder)]
pub struct StatisticsTask {
    shutdown_token: CancellationToken,
    stats_rx: AsyncReceiver<DeliveryEvent>,
    #[builder(setter(custom))]
    timeout: Duration,
    #[builder(private)]
    holder: StatsHolder,
}

impl StatisticsTaskBuilder {
    pub fn timeout(&mut self, stats_interval: u64) -> &mut Self {
        let timeout = Duration::new(stats_interval, 0);
        self.timeout = Some(timeout);
        self.holder = Some(StatsHolder::new(timeout));
        self
    }
}

impl StatisticsTask {
    async fn run(mut self) {
        //Arm the timer to produce statistics at regular intervals
        let start = tokio::time::Instant::now() + self.timeout.into();
        let mut timer = interval_at(start, self.timeout.into());

        loop {
            select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutting down statistics task");
                    break
                }
                _ = timer.tick() => {
                    match self.holder.calculate_and_reset() {
                        Some(summary) => info!("{}", summary),
                        None => info!("No messages delivered in the last {} seconds", self.timeout.as_secs()),
                    }
                }
                event = self.stats_rx.recv() => {
                    match event {
                        Ok(DeliveryEvent::Delivered { source, size, latency }) => self.holder.add_delivery(latency, size, source),
                        Ok(DeliveryEvent::Dropped) => self.holder.add_drop(),
                        //Every producer is gone: report what is left and park until shutdown
                        Err(_) => {
                            if let Some(summary) = self.holder.calculate_and_reset() {
                                info!("{}", summary);
                            }
                            self.shutdown_token.cancelled().await;
                            info!("Shutting down statistics task");
                            break
                        }
                    }
                }
            }
        }
    }
}

impl IntoFuture for StatisticsTask {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}
