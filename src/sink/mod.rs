use std::future::{Future, ready};

use crate::classifier::DeliveryError;

mod tcp;

pub use tcp::{TcpSink, TcpSinkBuilder};

pub type SinkResult = Result<(), DeliveryError>;

/// Transport primitive delivering one payload. Opaque to the strategies driving it
pub trait Sink: Send + Sync {
    fn send(&self, payload: &[u8]) -> impl Future<Output = SinkResult> + Send;
}

impl<F> Sink for F
where
    F: Fn(&[u8]) -> SinkResult + Send + Sync,
{
    fn send(&self, payload: &[u8]) -> impl Future<Output = SinkResult> + Send {
        ready(self(payload))
    }
}
