use std::{
    future::{Future, ready},
    sync::Arc,
};

use derive_builder::Builder;
use kanal::{AsyncReceiver, AsyncSender};
use log::{debug, error, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    classifier::{ErrorClassifier, ErrorClassifiers},
    message::{Message, anonymous_source},
    sink::Sink,
    statistics::{DeliveryEvent, notify},
    strategies::{DeliveryReport, SendStrategy, StopReason, delivered_event, record_latency},
};

/// Sends one message per sink call. Holds nothing between calls
#[derive(Builder, Clone)]
#[builder(pattern = "owned")]
pub struct StreamStrategy {
    #[builder(setter(custom), default = "Arc::new(ErrorClassifiers::default())")]
    classifier: Arc<dyn ErrorClassifier>,
    #[builder(setter(strip_option), default)]
    stats_tx: Option<AsyncSender<DeliveryEvent>>,
}

impl StreamStrategyBuilder {
    pub fn classifier(mut self, classifier: impl ErrorClassifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }
}

impl Default for StreamStrategy {
    fn default() -> Self {
        Self {
            classifier: Arc::new(ErrorClassifiers::default()),
            stats_tx: None,
        }
    }
}

impl StreamStrategy {
    async fn forward<S: Sink>(
        &self,
        input: AsyncReceiver<Message>,
        output: &AsyncSender<Message>,
        sink: &S,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        while let Ok(msg) = input.recv().await {
            let latency = record_latency(&msg);

            match sink.send(msg.content()).await {
                Ok(()) => {
                    let event = delivered_event(&msg, latency);
                    debug!("{} bytes delivered", msg.len());

                    //Backpressure point: wait for the downstream stage
                    if output.send(msg).await.is_err() {
                        error!("Output channel closed, stopping delivery");
                        report.dropped += 1;
                        notify(self.stats_tx.as_ref(), DeliveryEvent::Dropped);
                        return report.stop(StopReason::OutputClosed);
                    }
                    report.delivered += 1;
                    notify(self.stats_tx.as_ref(), event);
                }
                Err(err) if self.classifier.is_fatal(&err) => {
                    error!("Stopping delivery after fatal error: {}", err);
                    return report.stop(StopReason::Fatal(err));
                }
                Err(err) => {
                    warn!(
                        "Could not send payload ({} bytes) from {}: {}",
                        msg.len(),
                        msg.source_name().unwrap_or_else(anonymous_source),
                        err
                    );
                    report.dropped += 1;
                    notify(self.stats_tx.as_ref(), DeliveryEvent::Dropped);
                }
            }
        }

        report.stop(StopReason::InputClosed)
    }
}

impl SendStrategy for StreamStrategy {
    fn flush(&self, _token: &CancellationToken) -> impl Future<Output = ()> + Send {
        //Nothing is ever buffered
        ready(())
    }

    fn send<S: Sink>(
        &self,
        input: AsyncReceiver<Message>,
        output: &AsyncSender<Message>,
        sink: &S,
    ) -> impl Future<Output = DeliveryReport> + Send {
        self.forward(input, output, sink)
    }
}
