use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use coarsetime::Duration as Latency;
use derive_builder::Builder;
use kanal::{AsyncReceiver, AsyncSender};
use log::{debug, error, warn};
use tokio::{
    select,
    sync::{Notify, oneshot},
    time::{Instant, interval_at},
};
use tokio_util::sync::CancellationToken;

use crate::{
    classifier::{ErrorClassifier, ErrorClassifiers},
    message::Message,
    sink::Sink,
    statistics::{DeliveryEvent, notify},
    strategies::{DeliveryReport, SendStrategy, StopReason, delivered_event, record_latency},
};

struct FlushRequest {
    token: CancellationToken,
    done: oneshot::Sender<()>,
}

#[derive(Default)]
struct Batch {
    messages: Vec<(Message, Latency)>,
    bytes: usize,
}

impl Batch {
    fn push(&mut self, msg: Message, latency: Latency, delimiter_len: usize) {
        if !self.messages.is_empty() {
            self.bytes += delimiter_len;
        }
        self.bytes += msg.len();
        self.messages.push((msg, latency));
    }

    fn bytes_with(&self, msg: &Message, delimiter_len: usize) -> usize {
        if self.messages.is_empty() {
            msg.len()
        } else {
            self.bytes + delimiter_len + msg.len()
        }
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn take(&mut self) -> Vec<(Message, Latency)> {
        self.bytes = 0;
        std::mem::take(&mut self.messages)
    }
}

/// Groups messages into delimiter-joined payloads, one sink call per batch.
///
/// A batch is emitted when it reaches `max_messages` or `max_bytes`, when `flush_interval`
/// elapses, when [`SendStrategy::flush`] is called and when the input is closed.
/// A transient failure drops the whole batch.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct BatchStrategy {
    #[builder(default = "100")]
    max_messages: usize,
    #[builder(default = "1024 * 1024")]
    max_bytes: usize,
    #[builder(default = "Duration::from_secs(1)")]
    flush_interval: Duration,
    #[builder(setter(into), default = "b\"\\n\".to_vec()")]
    delimiter: Vec<u8>,
    #[builder(setter(custom), default = "Arc::new(ErrorClassifiers::default())")]
    classifier: Arc<dyn ErrorClassifier>,
    #[builder(setter(strip_option), default)]
    stats_tx: Option<AsyncSender<DeliveryEvent>>,
    #[builder(private, default = "kanal::unbounded_async()")]
    flush_requests: (AsyncSender<FlushRequest>, AsyncReceiver<FlushRequest>),
    #[builder(private, default)]
    running: Arc<AtomicBool>,
    #[builder(private, default)]
    stopped: Arc<Notify>,
}

impl BatchStrategyBuilder {
    pub fn classifier(mut self, classifier: impl ErrorClassifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }
}

struct RunningGuard<'a> {
    strategy: &'a BatchStrategy,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.strategy.running.store(false, Ordering::SeqCst);
        self.strategy.release_pending_requests();
        self.strategy.stopped.notify_waiters();
    }
}

impl BatchStrategy {
    fn release_pending_requests(&self) {
        //Dropping a request wakes up its flusher
        while let Ok(Some(_)) = self.flush_requests.1.try_recv() {}
    }

    async fn request_flush(&self, token: &CancellationToken) {
        let stopped = self.stopped.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let (done, done_rx) = oneshot::channel();
        let request = FlushRequest {
            token: token.clone(),
            done,
        };
        if self.flush_requests.0.send(request).await.is_err() {
            return;
        }

        select! {
            _ = token.cancelled() => debug!("Flush cancelled, pending batch will be discarded"),
            _ = done_rx => {}
            _ = stopped => {}
        }
    }

    async fn forward<S: Sink>(
        &self,
        input: AsyncReceiver<Message>,
        output: &AsyncSender<Message>,
        sink: &S,
    ) -> DeliveryReport {
        if self.running.swap(true, Ordering::SeqCst) {
            error!("Batch strategy already running, refusing a second forwarding loop");
            return DeliveryReport::default().stop(StopReason::AlreadyRunning);
        }
        let _guard = RunningGuard { strategy: self };
        self.release_pending_requests();

        let mut report = DeliveryReport::default();
        let mut batch = Batch::default();
        let period = self.flush_interval.max(Duration::from_millis(1));
        let mut timer = interval_at(Instant::now() + period, period);

        loop {
            select! {
                biased;

                request = self.flush_requests.1.recv() => {
                    let Ok(request) = request else { continue };
                    let res = if request.token.is_cancelled() {
                        self.discard(&mut batch, &mut report);
                        None
                    } else {
                        self.emit(&mut batch, output, sink, Some(&request.token), &mut report).await
                    };
                    let _ = request.done.send(());
                    if let Some(reason) = res {
                        return report.stop(reason);
                    }
                }

                _ = timer.tick() => {
                    if let Some(reason) = self.emit(&mut batch, output, sink, None, &mut report).await {
                        return report.stop(reason);
                    }
                }

                msg = input.recv() => {
                    let Ok(msg) = msg else {
                        let res = self.emit(&mut batch, output, sink, None, &mut report).await;
                        return report.stop(res.unwrap_or(StopReason::InputClosed));
                    };

                    let latency = record_latency(&msg);

                    //Never let a new message push the payload past the byte budget
                    if !batch.is_empty() && batch.bytes_with(&msg, self.delimiter.len()) > self.max_bytes {
                        if let Some(reason) = self.emit(&mut batch, output, sink, None, &mut report).await {
                            return report.stop(reason);
                        }
                    }
                    batch.push(msg, latency, self.delimiter.len());

                    if batch.len() >= self.max_messages || batch.bytes >= self.max_bytes {
                        if let Some(reason) = self.emit(&mut batch, output, sink, None, &mut report).await {
                            return report.stop(reason);
                        }
                        timer.reset();
                    }
                }
            }
        }
    }

    fn discard(&self, batch: &mut Batch, report: &mut DeliveryReport) {
        if batch.is_empty() {
            return;
        }
        let messages = batch.take();
        warn!("Flush cancelled, discarding {} buffered messages", messages.len());
        self.count_dropped(messages.len(), report);
    }

    fn count_dropped(&self, count: usize, report: &mut DeliveryReport) {
        report.dropped += count;
        (0..count).for_each(|_| notify(self.stats_tx.as_ref(), DeliveryEvent::Dropped));
    }

    async fn emit<S: Sink>(
        &self,
        batch: &mut Batch,
        output: &AsyncSender<Message>,
        sink: &S,
        token: Option<&CancellationToken>,
        report: &mut DeliveryReport,
    ) -> Option<StopReason> {
        if batch.is_empty() {
            return None;
        }

        let messages = batch.take();
        let payload = messages
            .iter()
            .map(|(msg, _)| msg.content())
            .collect::<Vec<_>>()
            .join(&self.delimiter[..]);

        let res = match token {
            Some(token) => select! {
                _ = token.cancelled() => {
                    warn!("Flush cancelled while sending, {} messages abandoned", messages.len());
                    self.count_dropped(messages.len(), report);
                    return None;
                }
                res = sink.send(&payload) => res,
            },
            None => sink.send(&payload).await,
        };

        match res {
            Ok(()) => {
                debug!("Batch of {} messages ({} bytes) delivered", messages.len(), payload.len());
                let total = messages.len();
                for (idx, (msg, latency)) in messages.into_iter().enumerate() {
                    let event = delivered_event(&msg, latency);
                    if output.send(msg).await.is_err() {
                        error!("Output channel closed, stopping delivery");
                        self.count_dropped(total - idx, report);
                        return Some(StopReason::OutputClosed);
                    }
                    report.delivered += 1;
                    notify(self.stats_tx.as_ref(), event);
                }
                None
            }
            Err(err) if self.classifier.is_fatal(&err) => {
                error!("Stopping delivery after fatal error, {} messages lost: {}", messages.len(), err);
                Some(StopReason::Fatal(err))
            }
            Err(err) => {
                warn!("Could not send batch of {} messages ({} bytes): {}", messages.len(), payload.len(), err);
                self.count_dropped(messages.len(), report);
                None
            }
        }
    }
}

impl SendStrategy for BatchStrategy {
    fn flush(&self, token: &CancellationToken) -> impl Future<Output = ()> + Send {
        self.request_flush(token)
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

#[cfg(test)]
mod batch_tests {
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use crate::{
        classifier::DeliveryError,
        message::Message,
        statistics::DeliveryEvent,
        strategies::{
            BatchStrategy, BatchStrategyBuilder, SendStrategy, StopReason,
            test_utils::{ScriptedSink, SlowSink, UnavailableIsFatal, drain, messages, source},
        },
    };

    fn strategy(max_messages: usize) -> BatchStrategy {
        BatchStrategyBuilder::default()
            .max_messages(max_messages)
            .flush_interval(Duration::from_secs(3600))
            .build()
            .unwrap()
    }

    async fn feed(contents: &[&str]) -> kanal::AsyncReceiver<Message> {
        let (tx, rx) = kanal::bounded_async(contents.len().max(1));
        for msg in messages(None, contents) {
            tx.send(msg).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn test_batches_by_count_and_drains_on_close() {
        let input = feed(&["a", "b", "c", "d", "e"]).await;
        let (output_tx, output_rx) = kanal::bounded_async(8);
        let sink = ScriptedSink::always_ok();

        let report = strategy(2).send(input, &output_tx, &sink).await;

        assert!(report.is_complete());
        assert_eq!(report.delivered, 5);
        assert_eq!(sink.payloads(), vec!["a\nb", "c\nd", "e"]);
        assert_eq!(drain(&output_rx), vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_batches_by_bytes() {
        let input = feed(&["aaaa", "bbbb", "cccc"]).await;
        let (output_tx, output_rx) = kanal::bounded_async(8);
        let sink = ScriptedSink::always_ok();

        let strategy = BatchStrategyBuilder::default()
            .max_bytes(9)
            .delimiter(b"|".to_vec())
            .flush_interval(Duration::from_secs(3600))
            .build()
            .unwrap();
        strategy.send(input, &output_tx, &sink).await;

        assert_eq!(sink.payloads(), vec!["aaaa|bbbb", "cccc"]);
        assert_eq!(drain(&output_rx).len(), 3);
    }

    #[tokio::test]
    async fn test_transient_error_drops_whole_batch() {
        let input = feed(&["a", "b", "c", "d"]).await;
        let (output_tx, output_rx) = kanal::bounded_async(8);
        let sink = ScriptedSink::new(|idx| (idx == 0).then_some(DeliveryError::RateLimited));

        let report = strategy(2).send(input, &output_tx, &sink).await;

        assert!(report.is_complete());
        assert_eq!((report.delivered, report.dropped), (2, 2));
        assert_eq!(drain(&output_rx), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_loop() {
        let input = feed(&["a", "b", "c", "d", "e"]).await;
        let (output_tx, output_rx) = kanal::bounded_async(8);
        let sink = ScriptedSink::new(|idx| (idx == 1).then_some(DeliveryError::DeadlineExceeded));

        let report = strategy(2).send(input.clone(), &output_tx, &sink).await;

        assert!(matches!(report.stop, StopReason::Fatal(DeliveryError::DeadlineExceeded)));
        assert_eq!(drain(&output_rx), vec!["a", "b"]);
        assert_eq!(input.len(), 1);
    }

    #[tokio::test]
    async fn test_latency_reported_at_admission() {
        let (nginx, stats) = source("nginx");
        let (tx, input) = kanal::bounded_async(4);
        for msg in messages(Some(&nginx), &["x", "y", "z"]) {
            tx.send(msg).await.unwrap();
        }
        drop(tx);

        let (output_tx, _output_rx) = kanal::bounded_async(4);
        strategy(10).send(input, &output_tx, &ScriptedSink::always_ok()).await;

        assert_eq!(stats.samples.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_interval_emits_partial_batch() {
        let (tx, input) = kanal::bounded_async(4);
        let (output_tx, output_rx) = kanal::bounded_async(4);
        let sink = ScriptedSink::always_ok();
        let strategy = BatchStrategyBuilder::default()
            .flush_interval(Duration::from_millis(50))
            .build()
            .unwrap();

        let running = strategy.send(input, &output_tx, &sink);
        tokio::pin!(running);

        tx.send(Message::from("lonely")).await.unwrap();
        let msg = tokio::select! {
            _ = &mut running => unreachable!("input still open"),
            msg = timeout(Duration::from_secs(5), output_rx.recv()) => msg.unwrap().unwrap(),
        };
        assert_eq!(msg.content(), b"lonely");

        drop(tx);
        assert!(running.await.is_complete());
    }

    #[tokio::test]
    async fn test_flush_emits_partial_batch() {
        let (tx, input) = kanal::bounded_async(4);
        let (output_tx, output_rx) = kanal::bounded_async(4);
        let sink = ScriptedSink::always_ok();
        let strategy = strategy(100);
        let token = CancellationToken::new();

        let running = strategy.send(input, &output_tx, &sink);
        tokio::pin!(running);

        tx.send(Message::from("one")).await.unwrap();
        tx.send(Message::from("two")).await.unwrap();

        //Let the loop buffer both messages before asking for a flush
        while !tx.is_empty() {
            tokio::select! {
                _ = &mut running => unreachable!("input still open"),
                _ = tokio::task::yield_now() => {}
            }
        }
        tokio::select! {
            _ = &mut running => unreachable!("input still open"),
            _ = strategy.flush(&token) => {}
        }

        assert_eq!(sink.payloads(), vec!["one\ntwo"]);
        assert_eq!(drain(&output_rx), vec!["one", "two"]);

        drop(tx);
        let report = running.await;
        assert_eq!(report.delivered, 2);
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_flush_discards_batch() {
        let (tx, input) = kanal::bounded_async(4);
        let (output_tx, output_rx) = kanal::bounded_async(4);
        let sink = ScriptedSink::always_ok();
        let strategy = strategy(100);
        let token = CancellationToken::new();
        token.cancel();

        let running = strategy.send(input, &output_tx, &sink);
        tokio::pin!(running);

        tx.send(Message::from("doomed")).await.unwrap();
        while !tx.is_empty() {
            tokio::select! {
                _ = &mut running => unreachable!("input still open"),
                _ = tokio::task::yield_now() => {}
            }
        }
        //Returns right away, the request is handled by the loop
        strategy.flush(&token).await;

        drop(tx);
        let report = running.await;
        assert_eq!(report.dropped, 1);
        assert_eq!(sink.calls(), 0);
        assert!(drain(&output_rx).is_empty());
    }

    #[tokio::test]
    async fn test_flush_without_running_loop_returns() {
        let strategy = strategy(10);
        let token = CancellationToken::new();

        timeout(Duration::from_secs(5), strategy.flush(&token))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_loop_is_refused() {
        let (_tx, input) = kanal::bounded_async::<Message>(1);
        let (output_tx, _output_rx) = kanal::bounded_async(1);
        let sink = ScriptedSink::always_ok();
        let strategy = strategy(10);

        let first = strategy.send(input.clone(), &output_tx, &sink);
        tokio::pin!(first);
        assert!(timeout(Duration::from_millis(20), &mut first).await.is_err());

        let second = strategy.send(input, &output_tx, &sink).await;
        assert!(matches!(second.stop, StopReason::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_user_defined_classifier() {
        let input = feed(&["a", "b", "c"]).await;
        let (output_tx, output_rx) = kanal::bounded_async(8);
        let sink = ScriptedSink::new(|idx| (idx == 0).then(|| DeliveryError::Unavailable("503".to_owned())));

        let strategy = BatchStrategyBuilder::default()
            .max_messages(2)
            .flush_interval(Duration::from_secs(3600))
            .classifier(UnavailableIsFatal)
            .build()
            .unwrap();
        let report = strategy.send(input.clone(), &output_tx, &sink).await;

        assert!(matches!(report.stop, StopReason::Fatal(DeliveryError::Unavailable(_))));
        assert!(drain(&output_rx).is_empty());
        assert_eq!(input.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_cancelled_during_send_counts_drops() {
        let (tx, input) = kanal::bounded_async(4);
        let (output_tx, output_rx) = kanal::bounded_async(4);
        let (stats_tx, stats_rx) = kanal::bounded_async(8);
        let sink = SlowSink::default();
        let strategy = BatchStrategyBuilder::default()
            .flush_interval(Duration::from_secs(3600))
            .stats_tx(stats_tx)
            .build()
            .unwrap();
        let token = CancellationToken::new();

        let running = strategy.send(input, &output_tx, &sink);
        tokio::pin!(running);
        tx.send(Message::from("one")).await.unwrap();
        tx.send(Message::from("two")).await.unwrap();
        while !tx.is_empty() {
            tokio::select! {
                _ = &mut running => unreachable!("input still open"),
                _ = tokio::task::yield_now() => {}
            }
        }

        let flush = strategy.flush(&token);
        tokio::pin!(flush);
        tokio::select! {
            _ = &mut running => unreachable!("input still open"),
            _ = &mut flush => unreachable!("sink call still in flight"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        assert_eq!(sink.started(), 1);

        token.cancel();
        flush.await;
        drop(tx);
        let report = running.await;

        assert_eq!((report.delivered, report.dropped), (0, 2));
        assert_eq!(sink.completed(), 0);
        assert!(drain(&output_rx).is_empty());
        let events = std::iter::from_fn(|| stats_rx.try_recv().ok().flatten()).collect::<Vec<_>>();
        assert_eq!(events, vec![DeliveryEvent::Dropped, DeliveryEvent::Dropped]);
    }

    #[tokio::test]
    async fn test_output_closed_counts_unforwarded_batch() {
        let input = feed(&["a", "b", "c", "d"]).await;
        let (output_tx, output_rx) = kanal::bounded_async(4);
        drop(output_rx);
        let sink = ScriptedSink::always_ok();

        let report = strategy(4).send(input, &output_tx, &sink).await;

        assert!(matches!(report.stop, StopReason::OutputClosed));
        assert_eq!(sink.calls(), 1);
        assert_eq!((report.delivered, report.dropped), (0, 4));
    }
}
