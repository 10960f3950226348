use std::{future::Future, sync::Arc};

use coarsetime::Duration;
use kanal::{AsyncReceiver, AsyncSender};
use tokio_util::sync::CancellationToken;

use crate::{
    classifier::DeliveryError,
    message::{Message, anonymous_source},
    sink::Sink,
    statistics::DeliveryEvent,
};

mod batch;
mod stream;

pub use batch::{BatchStrategy, BatchStrategyBuilder};
pub use stream::{StreamStrategy, StreamStrategyBuilder};

/// Delivery policy driving messages from an input channel through a [`Sink`] to an output channel.
///
/// `send` consumes `input` until it is closed, forwarding every successfully delivered message to
/// `output` in the order it was received. Transient sink failures drop the message and keep going,
/// fatal ones end the loop without draining `input`. `output` is never closed by the strategy.
///
/// `flush` pushes buffered messages to the sink, or discards them once `token` is cancelled.
/// It can be called from another task while `send` is running.
pub trait SendStrategy: Send + Sync {
    fn flush(&self, token: &CancellationToken) -> impl Future<Output = ()> + Send;

    fn send<S: Sink>(
        &self,
        input: AsyncReceiver<Message>,
        output: &AsyncSender<Message>,
        sink: &S,
    ) -> impl Future<Output = DeliveryReport> + Send;
}

#[derive(Debug, Default)]
pub enum StopReason {
    #[default]
    InputClosed,
    OutputClosed,
    Fatal(DeliveryError),
    /// `send` was invoked while another loop was running on the same instance
    AlreadyRunning,
}

/// `dropped` includes messages accepted by the sink that could not be forwarded to a closed output
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
    pub stop: StopReason,
}

impl DeliveryReport {
    fn stop(mut self, reason: StopReason) -> Self {
        self.stop = reason;
        self
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.stop, StopReason::InputClosed)
    }
}

pub enum SendStrategies {
    Stream(StreamStrategy),
    Batch(BatchStrategy),
}

impl SendStrategy for SendStrategies {
    fn flush(&self, token: &CancellationToken) -> impl Future<Output = ()> + Send {
        async move {
            match self {
                SendStrategies::Stream(strategy) => strategy.flush(token).await,
                SendStrategies::Batch(strategy) => strategy.flush(token).await,
            }
        }
    }

    fn send<S: Sink>(
        &self,
        input: AsyncReceiver<Message>,
        output: &AsyncSender<Message>,
        sink: &S,
    ) -> impl Future<Output = DeliveryReport> + Send {
        async move {
            match self {
                SendStrategies::Stream(strategy) => strategy.send(input, output, sink).await,
                SendStrategies::Batch(strategy) => strategy.send(input, output, sink).await,
            }
        }
    }
}

impl<T: SendStrategy> SendStrategy for Arc<T> {
    fn flush(&self, token: &CancellationToken) -> impl Future<Output = ()> + Send {
        self.as_ref().flush(token)
    }

    fn send<S: Sink>(
        &self,
        input: AsyncReceiver<Message>,
        output: &AsyncSender<Message>,
        sink: &S,
    ) -> impl Future<Output = DeliveryReport> + Send {
        self.as_ref().send(input, output, sink)
    }
}

impl From<StreamStrategy> for SendStrategies {
    fn from(value: StreamStrategy) -> Self {
        SendStrategies::Stream(value)
    }
}

impl From<BatchStrategy> for SendStrategies {
    fn from(value: BatchStrategy) -> Self {
        SendStrategies::Batch(value)
    }
}

#[inline]
fn record_latency(msg: &Message) -> Duration {
    let latency = msg.latency();
    if let Some(source) = msg.origin().and_then(|origin| origin.source()) {
        source.latency_stats().add(latency);
    }
    latency
}

#[inline]
fn delivered_event(msg: &Message, latency: Duration) -> DeliveryEvent {
    DeliveryEvent::Delivered {
        source: msg.source_name().unwrap_or_else(anonymous_source),
        size: msg.len(),
        latency,
    }
}
