//! QueueEvents - queue の event log を読み、listener に順番どおり配送する
//!
//! - 開始位置は `config.last_event_id`、なければ ready になった時点の最新 id
//! - 配送済み id 以下の event はスキップ（再接続時の重複対策）
//! - listener は event kind ごとに登録、`once` は 1 回で外れる

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QueueEventsConfig;
use crate::domain::{EventId, EventKind, EventRecord, QueueEvent};
use crate::error::BobbinError;
use crate::ports::JobStore;

type Callback = Arc<dyn Fn(&QueueEvent, EventId) + Send + Sync>;

/// Handle returned by `on` / `once`, used with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    callback: Callback,
}

#[derive(Debug, Clone, Copy, Default)]
struct ReaderState {
    ready: bool,
    closing: bool,
}

struct Inner {
    queue: String,
    store: Arc<dyn JobStore>,
    config: QueueEventsConfig,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    state: watch::Sender<ReaderState>,
}

pub struct QueueEvents {
    inner: Arc<Inner>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueEvents {
    /// With `autorun` (the default) the reader starts right away, so this
    /// must be called inside a Tokio runtime.
    pub fn new(
        queue_name: impl Into<String>,
        connection: Arc<dyn JobStore>,
        config: QueueEventsConfig,
    ) -> Self {
        let (state, _) = watch::channel(ReaderState::default());
        let autorun = config.autorun;
        let events = Self {
            inner: Arc::new(Inner {
                queue: queue_name.into(),
                store: connection,
                config,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                state,
            }),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        };
        if autorun {
            // 新規作成直後なので Closed / AlreadyRunning にはならない
            let _ = events.start();
        }
        events
    }

    /// Call `listener` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent, EventId) + Send + Sync + 'static,
    {
        self.inner.add_listener(kind, false, Arc::new(listener))
    }

    /// Call `listener` for the next event of `kind` only.
    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent, EventId) + Send + Sync + 'static,
    {
        self.inner.add_listener(kind, true, Arc::new(listener))
    }

    /// Remove a listener. `false` when it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.lock_listeners();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Resolve once the reader has fixed its starting position; events
    /// published after that are delivered.
    pub async fn wait_until_ready(&self) -> Result<(), BobbinError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| s.ready || s.closing)
            .await
            .map(|s| *s)
            .map_err(|_| self.closed())?;
        if state.closing && !state.ready {
            return Err(self.closed());
        }
        Ok(())
    }

    /// Start reading when built with `autorun = false`.
    pub async fn run(&self) -> Result<(), BobbinError> {
        self.start()
    }

    fn start(&self) -> Result<(), BobbinError> {
        if self.inner.state.borrow().closing {
            return Err(self.closed());
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(BobbinError::AlreadyRunning);
        }
        let join = tokio::spawn(Arc::clone(&self.inner).read_loop());
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
        Ok(())
    }

    /// Stop reading. Listeners are not called after this resolves.
    pub async fn close(&self) {
        self.inner.state.send_modify(|s| s.closing = true);
        let join = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!(queue = %self.inner.queue, error = %e, "event reader ended abnormally");
            }
            info!(queue = %self.inner.queue, "queue events closed");
        }
    }

    fn closed(&self) -> BobbinError {
        BobbinError::Closed(format!("queue events for {}", self.inner.queue))
    }
}

impl Drop for QueueEvents {
    fn drop(&mut self) {
        self.inner.state.send_modify(|s| s.closing = true);
    }
}

/// Events trimmed between the last delivered id and the next one read.
fn missed_between(last: EventId, next: EventId) -> u64 {
    next.seq().saturating_sub(last.seq().saturating_add(1))
}

/// Resolves once `close` has been requested.
async fn closing(rx: &mut watch::Receiver<ReaderState>) {
    let _ = rx.wait_for(|s| s.closing).await;
}

impl Inner {
    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_listener(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push(Listener {
            id,
            kind,
            once,
            callback,
        });
        id
    }

    async fn read_loop(self: Arc<Self>) {
        let mut rx = self.state.subscribe();

        let mut last = match self.config.last_event_id {
            Some(id) => id,
            None => loop {
                let fetched = tokio::select! {
                    res = self.store.last_event_id(&self.queue) => res,
                    _ = closing(&mut rx) => return,
                };
                match fetched {
                    Ok(id) => break id,
                    Err(e) => {
                        warn!(queue = %self.queue, error = %e, "event reader could not start");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.retry_delay()) => {}
                            _ = closing(&mut rx) => return,
                        }
                    }
                }
            },
        };
        self.state.send_modify(|s| s.ready = true);
        info!(queue = %self.queue, from = %last, "queue events ready");

        loop {
            let read = tokio::select! {
                res = self.store.read_events(&self.queue, last, self.config.blocking_timeout()) => res,
                _ = closing(&mut rx) => break,
            };
            match read {
                Ok(records) => {
                    if let Some(first) = records.first() {
                        let missed = missed_between(last, first.id);
                        if missed > 0 {
                            warn!(
                                queue = %self.queue,
                                after = %last,
                                resumed_at = %first.id,
                                missed,
                                "event log trimmed past the reader, events lost"
                            );
                        }
                    }
                    for record in records {
                        if record.id <= last {
                            continue;
                        }
                        last = record.id;
                        self.dispatch(&record);
                    }
                }
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "reading events failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay()) => {}
                        _ = closing(&mut rx) => break,
                    }
                }
            }
        }
        debug!(queue = %self.queue, last = %last, "event reader stopped");
    }

    fn dispatch(&self, record: &EventRecord) {
        let kind = record.event.kind();
        let callbacks: Vec<Callback> = {
            let mut listeners = self.lock_listeners();
            let matched = listeners
                .iter()
                .filter(|l| l.kind == kind)
                .map(|l| Arc::clone(&l.callback))
                .collect();
            listeners.retain(|l| !(l.once && l.kind == kind));
            matched
        };

        for callback in callbacks {
            let delivered = catch_unwind(AssertUnwindSafe(|| callback(&record.event, record.id)));
            if delivered.is_err() {
                warn!(queue = %self.queue, event = %kind, id = %record.id, "listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::queue::Queue;
    use crate::app::testing::{FlakyStore, eventually};
    use crate::config::MemoryStoreConfig;
    use crate::domain::{JobOptions, JobState, LockToken};
    use crate::impls::InMemoryStore;
    use crate::ports::SystemClock;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use ulid::Ulid;

    fn setup() -> (Arc<dyn JobStore>, Queue) {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::new());
        let queue = Queue::new("events", Arc::clone(&store));
        (store, queue)
    }

    fn fast() -> QueueEventsConfig {
        QueueEventsConfig {
            blocking_timeout_ms: 200,
            ..QueueEventsConfig::default()
        }
    }

    type Seen = Arc<Mutex<Vec<(EventKind, EventId)>>>;

    fn record(events: &QueueEvents, kinds: &[EventKind]) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        for kind in kinds {
            let sink = Arc::clone(&seen);
            events.on(*kind, move |event, id| {
                sink.lock().unwrap().push((event.kind(), id));
            });
        }
        seen
    }

    #[tokio::test]
    async fn paused_and_resumed_arrive_in_order() {
        let (store, queue) = setup();
        let events = QueueEvents::new("events", store, fast());
        let seen = record(&events, &[EventKind::Paused, EventKind::Resumed]);
        events.wait_until_ready().await.unwrap();

        queue.pause().await.unwrap();
        queue.resume().await.unwrap();

        eventually(|| async { seen.lock().unwrap().len() == 2 }).await;
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0].0, EventKind::Paused);
        assert_eq!(seen[1].0, EventKind::Resumed);
        assert!(seen[0].1 < seen[1].1);
        events.close().await;
    }

    #[tokio::test]
    async fn once_fires_a_single_time_and_off_removes() {
        let (store, queue) = setup();
        let events = QueueEvents::new("events", store, fast());
        let once_calls = Arc::new(AtomicUsize::new(0));
        let removed_calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&once_calls);
        events.once(EventKind::Added, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&removed_calls);
        let removed = events.on(EventKind::Added, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(events.off(removed));
        assert!(!events.off(removed));
        let all = record(&events, &[EventKind::Added]);
        events.wait_until_ready().await.unwrap();

        queue.add("a", json!(1), JobOptions::new()).await.unwrap();
        queue.add("b", json!(2), JobOptions::new()).await.unwrap();

        eventually(|| async { all.lock().unwrap().len() == 2 }).await;
        assert_eq!(once_calls.load(Ordering::SeqCst), 1);
        assert_eq!(removed_calls.load(Ordering::SeqCst), 0);
        events.close().await;
    }

    #[tokio::test]
    async fn waiting_carries_previous_state() {
        let (store, queue) = setup();
        let events = QueueEvents::new("events", store, fast());
        let prevs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&prevs);
        events.on(EventKind::Waiting, move |event, _| {
            if let QueueEvent::Waiting { prev, .. } = event {
                sink.lock().unwrap().push(*prev);
            }
        });
        events.wait_until_ready().await.unwrap();

        queue.add("now", json!(1), JobOptions::new()).await.unwrap();
        queue
            .add("later", json!(2), JobOptions::new().with_delay(Duration::from_millis(50)))
            .await
            .unwrap();

        eventually(|| async { prevs.lock().unwrap().len() == 2 }).await;
        assert_eq!(
            *prevs.lock().unwrap(),
            vec![None, Some(JobState::Delayed)]
        );
        events.close().await;
    }

    #[tokio::test]
    async fn drained_fires_when_claim_finds_nothing() {
        let (store, queue) = setup();
        let events = QueueEvents::new("events", Arc::clone(&store), fast());
        let seen = record(&events, &[EventKind::Drained]);
        events.wait_until_ready().await.unwrap();

        queue.add("a", json!(1), JobOptions::new()).await.unwrap();
        let lock = Duration::from_secs(30);
        assert!(store
            .move_to_active("events", LockToken::from_ulid(Ulid::new()), lock)
            .await
            .unwrap()
            .is_some());
        for _ in 0..2 {
            assert!(store
                .move_to_active("events", LockToken::from_ulid(Ulid::new()), lock)
                .await
                .unwrap()
                .is_none());
        }

        eventually(|| async { seen.lock().unwrap().len() == 1 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        events.close().await;
    }

    #[tokio::test]
    async fn history_is_skipped_unless_replay_is_requested() {
        let (store, queue) = setup();
        queue.add("old", json!(1), JobOptions::new()).await.unwrap();

        let live = QueueEvents::new("events", Arc::clone(&store), fast());
        let live_seen = record(&live, &[EventKind::Added]);
        let replay = QueueEvents::new(
            "events",
            Arc::clone(&store),
            QueueEventsConfig {
                last_event_id: Some(EventId::ORIGIN),
                ..fast()
            },
        );
        let replay_seen = record(&replay, &[EventKind::Added]);
        live.wait_until_ready().await.unwrap();
        replay.wait_until_ready().await.unwrap();

        queue.add("new", json!(2), JobOptions::new()).await.unwrap();

        eventually(|| async { replay_seen.lock().unwrap().len() == 2 }).await;
        eventually(|| async { live_seen.lock().unwrap().len() == 1 }).await;
        live.close().await;
        replay.close().await;
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_delivery() {
        let (store, queue) = setup();
        let events = QueueEvents::new("events", store, fast());
        events.on(EventKind::Paused, |_, _| panic!("listener bug"));
        let seen = record(&events, &[EventKind::Paused, EventKind::Resumed]);
        events.wait_until_ready().await.unwrap();

        queue.pause().await.unwrap();
        queue.resume().await.unwrap();
        eventually(|| async { seen.lock().unwrap().len() == 2 }).await;
        events.close().await;
    }

    #[rstest]
    #[case(0, 1, 0)]
    #[case(4, 5, 0)]
    #[case(4, 3, 0)]
    #[case(0, 5, 4)]
    fn missed_counts_trimmed_ids(#[case] last: u64, #[case] next: u64, #[case] expected: u64) {
        assert_eq!(missed_between(EventId::new(last), EventId::new(next)), expected);
    }

    #[tokio::test]
    async fn reader_continues_after_log_was_trimmed() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryStore::with_config(
            Arc::new(SystemClock),
            MemoryStoreConfig { max_events: 2 },
        ));
        let queue = Queue::new("events", Arc::clone(&store));
        // added + waiting per job; only the last two records survive
        for n in 0..3 {
            queue.add("old", json!(n), JobOptions::new()).await.unwrap();
        }

        let events = QueueEvents::new(
            "events",
            Arc::clone(&store),
            QueueEventsConfig {
                last_event_id: Some(EventId::ORIGIN),
                ..fast()
            },
        );
        let seen = record(&events, &[EventKind::Added, EventKind::Paused]);
        events.wait_until_ready().await.unwrap();

        eventually(|| async { seen.lock().unwrap().len() == 1 }).await;
        queue.pause().await.unwrap();
        eventually(|| async { seen.lock().unwrap().len() == 2 }).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0], (EventKind::Added, EventId::new(5)));
        assert_eq!(seen[1].0, EventKind::Paused);
        events.close().await;
    }

    #[tokio::test]
    async fn close_is_not_held_up_by_startup_retry() {
        let store: Arc<dyn JobStore> = Arc::new(FlakyStore::new(0, 0).with_event_failures(usize::MAX));
        let events = QueueEvents::new(
            "events",
            store,
            QueueEventsConfig {
                retry_delay_ms: 10_000,
                ..fast()
            },
        );
        // reader は最初の失敗の後 retry_delay で寝ている
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), events.close())
            .await
            .expect("close should not wait for the retry delay");
        assert!(events.wait_until_ready().await.is_err());
    }

    #[tokio::test]
    async fn manual_reader_runs_once_and_not_after_close() {
        let (store, _queue) = setup();
        let events = QueueEvents::new(
            "events",
            store,
            QueueEventsConfig {
                autorun: false,
                ..fast()
            },
        );
        events.run().await.unwrap();
        assert!(matches!(events.run().await, Err(BobbinError::AlreadyRunning)));
        events.wait_until_ready().await.unwrap();

        events.close().await;
        assert!(matches!(events.run().await, Err(BobbinError::Closed(_))));
    }
}
