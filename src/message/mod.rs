use std::sync::{Arc, Weak};

use coarsetime::{Duration, Instant};
use derive_new::new;
use ustr::{Ustr, ustr};

use crate::statistics::LatencyStats;

/// Logical stream producing messages. Created once per configured source
#[derive(new)]
pub struct LogSource {
    #[new(into)]
    name: Ustr,
    latency_stats: Arc<dyn LatencyStats>,
}

impl LogSource {
    pub fn name(&self) -> Ustr {
        self.name
    }

    pub fn latency_stats(&self) -> &Arc<dyn LatencyStats> {
        &self.latency_stats
    }
}

/// Provenance of a [`Message`]. Holds the source weakly: a message never keeps its source alive
#[derive(Clone)]
pub struct Origin {
    source: Weak<LogSource>,
}

impl Origin {
    pub fn new(source: &Arc<LogSource>) -> Self {
        Self {
            source: Arc::downgrade(source),
        }
    }

    pub fn source(&self) -> Option<Arc<LogSource>> {
        self.source.upgrade()
    }
}

impl From<&Arc<LogSource>> for Origin {
    fn from(source: &Arc<LogSource>) -> Self {
        Origin::new(source)
    }
}

/// Unit of work flowing through the delivery stage
#[derive(Clone)]
pub struct Message {
    content: Vec<u8>,
    origin: Option<Origin>,
    enqueued_at: Instant,
}

impl Message {
    pub fn new(content: impl Into<Vec<u8>>, origin: Option<Origin>) -> Self {
        Self::with_timestamp(content, origin, Instant::now())
    }

    pub fn with_timestamp(content: impl Into<Vec<u8>>, origin: Option<Origin>, enqueued_at: Instant) -> Self {
        Self {
            content: content.into(),
            origin,
            enqueued_at,
        }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn latency(&self) -> Duration {
        Instant::now().duration_since(self.enqueued_at)
    }

    pub fn source_name(&self) -> Option<Ustr> {
        self.origin
            .as_ref()
            .and_then(Origin::source)
            .map(|source| source.name())
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::new(value.as_bytes(), None)
    }
}

pub(crate) fn anonymous_source() -> Ustr {
    ustr("<none>")
}

#[cfg(test)]
mod message_tests {
    use std::sync::Arc;

    use coarsetime::{Duration, Instant};

    use crate::{
        message::{LogSource, Message, Origin},
        statistics::LatencyTracker,
    };

    #[test]
    fn test_latency_is_measured_from_enqueue_time() {
        let enqueued = Instant::now() - Duration::from_secs(2);
        let msg = Message::with_timestamp("payload", None, enqueued);

        assert!(msg.latency() >= Duration::from_secs(2));
        assert_eq!(msg.content(), b"payload");
        assert_eq!(msg.len(), 7);
    }

    #[test]
    fn test_origin_does_not_own_source() {
        let source = Arc::new(LogSource::new("nginx", Arc::new(LatencyTracker::default())));
        let msg = Message::new("line", Some(Origin::new(&source)));

        assert_eq!(msg.source_name().unwrap().as_str(), "nginx");

        drop(source);
        assert!(msg.origin().unwrap().source().is_none());
        assert_eq!(msg.source_name(), None);
    }
}
