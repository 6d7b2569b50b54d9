use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{MonitorError, StoreError};
use crate::matcher;
use crate::notify::{self, NotificationPayload};
use crate::platform::{MessageEvent, NotificationSink, SendOptions};
use crate::rules::{ChannelKey, RuleSet};
use crate::store::ProcessedStore;

/// Terminal state of one handled event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The message was already recorded before this event arrived
    AlreadyProcessed,
    /// The chat has no rules
    UnknownChannel,
    /// No phrase group matched the text
    NoMatch,
    /// A concurrent handler recorded the message first
    ClaimedElsewhere,
    Notified,
}

/// Watches incoming messages and relays one alert per matching message.
pub struct Monitor {
    rules: RuleSet,
    store: ProcessedStore,
    sink: Arc<dyn NotificationSink>,
    recipient: i64,
    send_options: SendOptions,
    shutdown_grace: Duration,
}

impl Monitor {
    pub fn new(
        config: &Config,
        rules: RuleSet,
        store: ProcessedStore,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            rules,
            store,
            sink,
            recipient: config.telegram.notify_user_id,
            send_options: config.send_options(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    /// Run one event through dedup, matching, recording and delivery.
    ///
    /// The message is recorded before the sink is called, so concurrent
    /// duplicates are settled by the store's uniqueness constraint and a
    /// failed delivery is never retried.
    pub async fn handle_event(&self, event: &MessageEvent) -> Result<Outcome, MonitorError> {
        let message_id = event.message_id;

        if self.store.has_processed(message_id).await? {
            debug!("Message {} already processed, skipping", message_id);
            return Ok(Outcome::AlreadyProcessed);
        }

        let key = ChannelKey::for_chat(&event.chat);
        if !self.rules.contains(&key) {
            debug!("Message {} from unmonitored chat {}", message_id, key);
            return Ok(Outcome::UnknownChannel);
        }

        let text = event.text.as_deref().unwrap_or_default();
        let Some(phrase) = matcher::find_match(Some(text), &key, &self.rules) else {
            debug!("Message {} in {} matched no phrase", message_id, key);
            return Ok(Outcome::NoMatch);
        };

        info!("Matched [{}] in {} (message {})", phrase.join(", "), key, message_id);

        match self.store.mark_processed(message_id, event.chat.id, &key).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation(_)) => {
                debug!("Message {} was recorded by another handler", message_id);
                return Ok(Outcome::ClaimedElsewhere);
            }
            Err(e) => return Err(e.into()),
        }

        let payload = NotificationPayload::new(&event.chat, &key, phrase, message_id, text);
        let alert = notify::format(&payload, self.send_options.text_mode);

        self.sink
            .deliver(self.recipient, &alert, &self.send_options)
            .await
            .map_err(|source| MonitorError::Delivery { message_id, source })?;

        info!("Notification sent for message {} in {}", message_id, key);
        Ok(Outcome::Notified)
    }

    /// Error boundary around [`Monitor::handle_event`]: failures are logged
    /// and the event is abandoned.
    pub async fn process_event(&self, event: MessageEvent) -> Option<Outcome> {
        match self.handle_event(&event).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(
                    "Abandoned message {} from chat {}: {:#}",
                    event.message_id,
                    event.chat.id,
                    anyhow::Error::from(e)
                );
                None
            }
        }
    }

    /// Consume `events` until the stream ends or `shutdown` resolves.
    ///
    /// Each event is handled on its own task. On shutdown, `stop_intake` is
    /// awaited first so the source stops taking updates; events it buffered
    /// before stopping are still handled. In-flight handlers then get the
    /// configured grace period before they are aborted.
    pub async fn run<S, F, H, Fut>(self: Arc<Self>, mut events: S, shutdown: F, stop_intake: H)
    where
        S: Stream<Item = MessageEvent> + Unpin,
        F: Future<Output = ()>,
        H: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut in_flight = JoinSet::new();
        let mut stop_intake = Some(stop_intake);
        tokio::pin!(shutdown);

        info!("Monitoring {} channel(s)", self.rules.len());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting messages");
                    if let Some(stop) = stop_intake.take() {
                        stop().await;
                    }
                    // Only what the source already queued; never waits for more
                    while let Some(Some(event)) = events.next().now_or_never() {
                        self.spawn_handler(&mut in_flight, event);
                    }
                    break;
                }
                next = events.next() => match next {
                    Some(event) => self.spawn_handler(&mut in_flight, event),
                    None => {
                        info!("Event source disconnected");
                        break;
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Message handler task failed: {}", e);
                    }
                }
            }
        }

        if in_flight.is_empty() {
            return;
        }

        info!("Waiting for {} in-flight message(s)", in_flight.len());
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!("Message handler task failed: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Grace period elapsed, abandoning {} in-flight message(s)",
                in_flight.len()
            );
            in_flight.shutdown().await;
        }
    }

    fn spawn_handler(self: &Arc<Self>, in_flight: &mut JoinSet<()>, event: MessageEvent) {
        let monitor = Arc::clone(self);
        in_flight.spawn(async move {
            monitor.process_event(event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ChatInfo;
    use crate::rules::RuleSetBuilder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// Records every delivery; optionally fails or stalls
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(i64, String, SendOptions)>>,
        fail: AtomicBool,
        delay: Option<Duration>,
    }

    impl RecordingSink {
        async fn sent(&self) -> Vec<(i64, String, SendOptions)> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(
            &self,
            recipient: i64,
            text: &str,
            options: &SendOptions,
        ) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("network unreachable");
            }
            self.sent
                .lock()
                .await
                .push((recipient, text.to_string(), *options));
            Ok(())
        }
    }

    fn config() -> Config {
        Config::parse(
            r#"
            [telegram]
            bot_token = "t"
            notify_user_id = 4242

            [notify]
            text_mode = "plain"

            [monitor]
            shutdown_grace_secs = 1
            "#,
        )
        .unwrap()
    }

    fn setup(sink: Arc<RecordingSink>) -> (Arc<Monitor>, ProcessedStore) {
        let store = ProcessedStore::open_in_memory().unwrap();
        (monitor_with_store(sink, store.clone()), store)
    }

    fn monitor_with_store(sink: Arc<RecordingSink>, store: ProcessedStore) -> Arc<Monitor> {
        let mut builder = RuleSetBuilder::new();
        builder
            .add_entry("@news:bitcoin,price;bitcoin")
            .unwrap()
            .add_entry("id-1001234567890:launch")
            .unwrap();
        Arc::new(Monitor::new(&config(), builder.build(), store, sink))
    }

    fn no_intake() -> futures::future::Ready<()> {
        futures::future::ready(())
    }

    fn news_event(message_id: i64, text: &str) -> MessageEvent {
        MessageEvent {
            message_id,
            chat: ChatInfo {
                id: -1005550001,
                username: Some("news".into()),
                title: Some("Daily News".into()),
            },
            text: Some(text.to_string()),
        }
    }

    fn private_event(message_id: i64, text: &str) -> MessageEvent {
        MessageEvent {
            message_id,
            chat: ChatInfo {
                id: -1001234567890,
                username: None,
                title: None,
            },
            text: Some(text.to_string()),
        }
    }

    #[tokio::test]
    async fn test_match_notifies_and_records() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, store) = setup(sink.clone());

        let outcome = monitor
            .handle_event(&news_event(42, "Bitcoin PRICE jumps"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Notified);

        let sent = sink.sent().await;
        assert_eq!(sent.len(), 1);
        let (recipient, text, options) = &sent[0];
        assert_eq!(*recipient, 4242);
        assert!(text.contains("Match in Daily News"));
        assert!(text.contains("Phrase: bitcoin, price"));
        assert!(text.contains("https://t.me/news/42"));
        assert!(options.disable_link_preview);

        let record = store.get(42).await.unwrap().unwrap();
        assert_eq!(record.chat_id, -1005550001);
        assert_eq!(record.chat_key, "@news");
    }

    #[tokio::test]
    async fn test_first_group_reported() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, _store) = setup(sink.clone());

        monitor
            .handle_event(&news_event(1, "bitcoin price"))
            .await
            .unwrap();
        let sent = sink.sent().await;
        assert!(sent[0].1.contains("Phrase: bitcoin, price\n"));
    }

    #[tokio::test]
    async fn test_private_channel_link() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, store) = setup(sink.clone());

        let outcome = monitor
            .handle_event(&private_event(7, "Mainnet launch tomorrow"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Notified);

        let sent = sink.sent().await;
        assert!(sent[0].1.contains("Match in id-1001234567890"));
        assert!(sent[0].1.contains("https://t.me/c/1234567890/7"));
        assert_eq!(store.get(7).await.unwrap().unwrap().chat_key, "id-1001234567890");
    }

    #[tokio::test]
    async fn test_unknown_channel_ignored_without_write() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, store) = setup(sink.clone());

        let mut event = news_event(3, "bitcoin price");
        event.chat.username = Some("elsewhere".into());

        let outcome = monitor.handle_event(&event).await.unwrap();
        assert_eq!(outcome, Outcome::UnknownChannel);
        assert!(sink.sent().await.is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_match_leaves_store_untouched() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, store) = setup(sink.clone());

        assert_eq!(
            monitor.handle_event(&news_event(4, "ethereum")).await.unwrap(),
            Outcome::NoMatch
        );
        let mut empty = news_event(5, "");
        empty.text = None;
        assert_eq!(monitor.handle_event(&empty).await.unwrap(), Outcome::NoMatch);

        assert!(sink.sent().await.is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redelivery_is_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, store) = setup(sink.clone());
        let event = news_event(10, "bitcoin");

        assert_eq!(monitor.handle_event(&event).await.unwrap(), Outcome::Notified);
        assert_eq!(
            monitor.handle_event(&event).await.unwrap(),
            Outcome::AlreadyProcessed
        );

        assert_eq!(sink.sent().await.len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_notify_once() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, store) = setup(sink.clone());

        let mut handles = Vec::new();
        for _ in 0..12 {
            let monitor = Arc::clone(&monitor);
            handles.push(tokio::spawn(async move {
                monitor.handle_event(&news_event(77, "bitcoin")).await
            }));
        }

        let mut notified = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Outcome::Notified => notified += 1,
                Outcome::AlreadyProcessed | Outcome::ClaimedElsewhere => {}
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        assert_eq!(notified, 1);
        assert_eq!(sink.sent().await.len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_still_recorded() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let (monitor, store) = setup(sink.clone());

        let err = monitor
            .handle_event(&news_event(20, "bitcoin"))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Delivery { message_id: 20, .. }));
        assert!(store.has_processed(20).await.unwrap());

        // No retry once the sink recovers
        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(
            monitor.handle_event(&news_event(20, "bitcoin")).await.unwrap(),
            Outcome::AlreadyProcessed
        );
        assert!(sink.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_process_event_contains_errors() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let (monitor, _store) = setup(sink.clone());

        assert_eq!(monitor.process_event(news_event(30, "bitcoin")).await, None);
        assert_eq!(
            monitor.process_event(news_event(31, "nothing")).await,
            Some(Outcome::NoMatch)
        );
    }

    #[tokio::test]
    async fn test_run_drains_stream() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, store) = setup(sink.clone());

        let events = futures::stream::iter(vec![
            news_event(1, "bitcoin"),
            news_event(1, "bitcoin"),
            news_event(2, "nothing here"),
            private_event(3, "launch"),
            news_event(4, "bitcoin price"),
        ]);
        monitor
            .run(events, futures::future::pending(), no_intake)
            .await;

        assert_eq!(sink.sent().await.len(), 3);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, store) = setup(sink.clone());

        let (tx, rx) = futures::channel::mpsc::unbounded();
        tx.unbounded_send(news_event(1, "bitcoin")).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let runner = tokio::spawn(monitor.run(
            rx,
            async move {
                stop_rx.await.ok();
            },
            no_intake,
        ));

        // Wait until the first message has been picked up
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.count().await.unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        stop_tx.send(()).unwrap();
        runner.await.unwrap();

        // Events sent after shutdown are never consumed
        assert!(tx.unbounded_send(news_event(2, "bitcoin")).is_err());
        assert_eq!(sink.sent().await.len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_intake_then_handles_queued_events() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, store) = setup(sink.clone());

        let (tx, rx) = futures::channel::mpsc::unbounded();
        let intake_stopped = Arc::new(AtomicBool::new(false));
        let stopped = Arc::clone(&intake_stopped);
        let stop_intake = move || {
            // The source hands over what it received while stopping, then closes
            tx.unbounded_send(news_event(5, "bitcoin")).unwrap();
            tx.unbounded_send(private_event(6, "launch")).unwrap();
            stopped.store(true, Ordering::SeqCst);
            futures::future::ready(())
        };

        monitor
            .run(rx, futures::future::ready(()), stop_intake)
            .await;

        assert!(intake_stopped.load(Ordering::SeqCst));
        assert_eq!(sink.sent().await.len(), 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_storage_failure_abandons_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let store = ProcessedStore::open(&path).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with_store(sink.clone(), store.clone());

        let admin = rusqlite::Connection::open(&path).unwrap();
        admin.execute_batch("DROP TABLE processed_messages;").unwrap();

        let err = monitor
            .handle_event(&news_event(1, "bitcoin"))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Storage(StoreError::Sqlite(_))));
        assert_eq!(monitor.process_event(news_event(1, "bitcoin")).await, None);
        assert!(sink.sent().await.is_empty());

        // Once storage is back, later events go through normally
        admin
            .execute_batch(
                "CREATE TABLE processed_messages (
                    message_id INTEGER PRIMARY KEY,
                    chat_id INTEGER NOT NULL,
                    chat_key TEXT NOT NULL,
                    processed_at TEXT NOT NULL
                );",
            )
            .unwrap();
        assert_eq!(
            monitor.process_event(news_event(2, "bitcoin")).await,
            Some(Outcome::Notified)
        );
        assert_eq!(sink.sent().await.len(), 1);
        assert!(store.has_processed(2).await.unwrap());
        assert!(!store.has_processed(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_survives_storage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        let store = ProcessedStore::open(&path).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with_store(sink.clone(), store);

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE processed_messages;")
            .unwrap();

        let events = futures::stream::iter(vec![news_event(1, "bitcoin"), news_event(2, "bitcoin")]);
        monitor
            .run(events, futures::future::pending(), no_intake)
            .await;

        assert!(sink.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_abandons_stalled_handlers_after_grace() {
        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let (monitor, store) = setup(sink.clone());

        let events = futures::stream::iter(vec![news_event(1, "bitcoin")]);
        let started = tokio::time::Instant::now();
        monitor
            .run(events, futures::future::pending(), no_intake)
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(sink.sent().await.is_empty());
        // Recorded before the stalled delivery, so it will not be re-sent
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
