use std::{
    future::{Future, IntoFuture},
    pin::Pin,
};

use derive_builder::Builder;
use kanal::{AsyncReceiver, AsyncSender};
use log::{error, info, warn};

use crate::{
    message::Message,
    sink::Sink,
    strategies::{DeliveryReport, SendStrategy, StopReason},
};

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct DeliveryTask<T, S>
where
    T: SendStrategy,
    S: Sink,
{
    strategy: T,
    input: AsyncReceiver<Message>,
    output: AsyncSender<Message>,
    sink: S,
}

impl<T, S> DeliveryTask<T, S>
where
    T: SendStrategy,
    S: Sink,
{
    async fn run(self) -> DeliveryReport {
        info!("Starting delivery task");
        let report = self.strategy.send(self.input, &self.output, &self.sink).await;
        log_report(&report);
        report
    }
}

pub(crate) fn log_report(report: &DeliveryReport) {
    match &report.stop {
        StopReason::InputClosed => info!(
            "Input closed, delivery task done: {} delivered, {} dropped",
            report.delivered, report.dropped
        ),
        StopReason::OutputClosed => warn!(
            "Output closed, delivery task stopped: {} delivered, {} dropped",
            report.delivered, report.dropped
        ),
        StopReason::Fatal(err) => error!(
            "Delivery task stopped by fatal error ({}): {} delivered, {} dropped",
            err, report.delivered, report.dropped
        ),
        StopReason::AlreadyRunning => error!("Delivery task refused: strategy already in use"),
    }
}

impl<T, S> IntoFuture for DeliveryTask<T, S>
where
    T: SendStrategy + 'static,
    S: Sink + 'static,
{
    type Output = DeliveryReport;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}
