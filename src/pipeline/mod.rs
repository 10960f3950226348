use std::{
    future::{Future, IntoFuture},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use anyhow::{Result, anyhow};
use derive_builder::Builder;
use kanal::{AsyncReceiver, AsyncSender};
use log::{error, info, warn};
use tokio::{task::JoinSet, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    delivery::DeliveryTaskBuilder,
    message::Message,
    sink::Sink,
    statistics::{DeliveryEvent, StatisticsTaskBuilder},
    strategies::{DeliveryReport, SendStrategy},
};

/// Handle to stop a single [`Pipeline`]. Owned by whoever assembled it, never global
pub struct PipelineShutdownHandle<T> {
    cancel_token: CancellationToken,
    strategy: Arc<T>,
}

impl<T> Clone for PipelineShutdownHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cancel_token: self.cancel_token.clone(),
            strategy: self.strategy.clone(),
        }
    }
}

impl<T: SendStrategy> PipelineShutdownHandle<T> {
    /// Stop the background tasks. The forwarding loop itself ends only when its input is closed
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Push buffered messages to the sink, giving up after `grace`, then shut down
    pub async fn flush_and_shutdown(&self, grace: Duration) {
        let flush_token = CancellationToken::new();
        if timeout(grace, self.strategy.flush(&flush_token)).await.is_err() {
            warn!("Flush did not complete within {:?}, buffered messages discarded", grace);
            flush_token.cancel();
        }
        self.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Wires a strategy, a sink and the statistics reporter together. Must be built using [`PipelineBuilder`]
#[derive(Builder)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct Pipeline<T, S>
where
    T: SendStrategy,
    S: Sink,
{
    #[builder(setter(custom))]
    strategy: Arc<T>,
    sink: S,
    input: AsyncReceiver<Message>,
    output: AsyncSender<Message>,
    #[builder(setter(strip_option), default)]
    stats_rx: Option<AsyncReceiver<DeliveryEvent>>,
    #[builder(default = "10")]
    stats_interval: u64,
    #[builder(private, default)]
    cancel_token: CancellationToken,
}

impl<T, S> PipelineBuilder<T, S>
where
    T: SendStrategy,
    S: Sink,
{
    pub fn strategy(mut self, strategy: T) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    fn validate(&self) -> Result<(), String> {
        match self.stats_interval {
            Some(0) => Err("stats_interval must be at least 1 second".to_owned()),
            _ => Ok(()),
        }
    }
}

impl<T, S> Pipeline<T, S>
where
    T: SendStrategy + 'static,
    S: Sink + 'static,
{
    async fn run(self) -> Result<DeliveryReport> {
        let handle = self.shutdown_handle();
        let mut task_set = JoinSet::new();

        if let Some(stats_rx) = self.stats_rx {
            let stat_task = StatisticsTaskBuilder::default()
                .shutdown_token(handle.cancel_token.clone())
                .stats_rx(stats_rx)
                .timeout(self.stats_interval)
                .build()?;
            task_set.spawn(async move {
                stat_task.await;
                None
            });
        }

        let delivery_task = DeliveryTaskBuilder::default()
            .strategy(self.strategy)
            .input(self.input)
            .output(self.output)
            .sink(self.sink)
            .build()?;
        task_set.spawn(async move { Some(delivery_task.await) });

        let mut report = None;
        //A failing statistics task must not abort delivery
        while let Some(res) = task_set.join_next().await {
            match res {
                Ok(Some(delivery_report)) => {
                    //Nothing left to measure
                    handle.shutdown();
                    report = Some(delivery_report);
                }
                Ok(None) => {}
                Err(err) => error!("Pipeline task failed: {}", err),
            }
        }

        info!("Pipeline stopped");
        report.ok_or(anyhow!("Delivery task did not report"))
    }

    pub fn shutdown_handle(&self) -> PipelineShutdownHandle<T> {
        PipelineShutdownHandle {
            cancel_token: self.cancel_token.clone(),
            strategy: self.strategy.clone(),
        }
    }
}

impl<T, S> IntoFuture for Pipeline<T, S>
where
    T: SendStrategy + 'static,
    S: Sink + 'static,
{
    type Output = Result<DeliveryReport>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}
