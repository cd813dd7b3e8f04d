use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{tick, unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::data::BoardService;
use crate::error::Error;
use crate::events::{Bus, Signal};
use crate::markup;
use crate::model::{Message, ThreadColors, ThreadId, UNTITLED};
use crate::storage::Store;

pub const PALETTE: [&str; 20] = [
    "#e6194B", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
    "#bcf60c", "#fabebe", "#008080", "#e6beff", "#9A6324", "#fffac8", "#800000", "#aaffc3",
    "#808000", "#ffd8b1", "#000075", "#808080",
];

/// Used once every palette entry is taken. May repeat.
pub const FALLBACK_COLOR: &str = "#888";

/// First palette color no thread holds yet.
pub fn next_color(colors: &ThreadColors) -> String {
    let used: HashSet<&str> = colors.values().map(String::as_str).collect();
    PALETTE
        .iter()
        .find(|color| !used.contains(*color))
        .copied()
        .unwrap_or(FALLBACK_COLOR)
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Scheduled; yields to any sync already running and never assigns colors.
    Background,
    /// User-requested; waits for the gate and colors new threads at once.
    Manual,
}

impl SyncMode {
    fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Background => "background",
            SyncMode::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub added_threads: usize,
    pub added_messages: usize,
    /// A background sync found the gate occupied and did nothing.
    pub skipped: bool,
}

impl MergeResult {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn changed(&self) -> bool {
        self.added_threads > 0 || self.added_messages > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub color: String,
    pub title: String,
    pub first_time: Option<i64>,
    pub message_count: usize,
}

/// Adds `incoming` messages whose ids are not stored yet, then restores time
/// order. Existing entries are never replaced. Returns how many were added.
pub fn merge_messages(existing: &mut Vec<Message>, incoming: Vec<Message>) -> usize {
    let mut seen: HashSet<u64> = existing.iter().map(|msg| msg.id).collect();
    let before = existing.len();
    for message in incoming {
        if seen.insert(message.id) {
            existing.push(message);
        }
    }
    existing.sort_by_key(|msg| msg.time);
    existing.len() - before
}

pub struct SyncEngine {
    board: Arc<dyn BoardService>,
    store: Store,
    bus: Arc<Bus>,
    gate: Mutex<()>,
    in_progress: AtomicBool,
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(board: Arc<dyn BoardService>, store: Store, bus: Arc<Bus>) -> Self {
        Self {
            board,
            store,
            bus,
            gate: Mutex::new(()),
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn sync(&self, mode: SyncMode) -> Result<MergeResult> {
        let _gate = match mode {
            SyncMode::Background => {
                let guard = if self.is_syncing() {
                    None
                } else {
                    self.gate.try_lock()
                };
                match guard {
                    Some(guard) => guard,
                    None => {
                        debug!("sync already in progress, skipping background sync");
                        return Ok(MergeResult::skipped());
                    }
                }
            }
            SyncMode::Manual => self.gate.lock(),
        };
        let _flag = self.mark_in_progress();
        self.run(mode)
    }

    /// Forgets every tracked thread, message and color, then syncs manually.
    pub fn clear_and_refresh(&self) -> Result<MergeResult> {
        let _gate = self.gate.lock();
        let _flag = self.mark_in_progress();
        self.store.clear().context("sync: clear store")?;
        info!("store cleared");
        self.run(SyncMode::Manual)
    }

    /// Active threads in tracking order. Threads without a color get one
    /// here, which is how background-discovered threads are eventually
    /// colored. Waits for an in-flight sync.
    pub fn thread_summaries(&self) -> Result<Vec<ThreadSummary>> {
        let _gate = self.gate.lock();
        let snapshot = self.store.snapshot().context("sync: read store")?;
        let mut colors = snapshot.colors;
        let mut assigned = false;

        let mut summaries = Vec::with_capacity(snapshot.active_threads.len());
        for id in snapshot.active_threads {
            let color = match colors.get(&id) {
                Some(color) => color.clone(),
                None => {
                    let color = next_color(&colors);
                    colors.insert(id, color.clone());
                    assigned = true;
                    color
                }
            };
            let messages = snapshot.messages.get(&id);
            let first = messages.and_then(|list| list.first());
            summaries.push(ThreadSummary {
                id,
                color,
                title: first
                    .map(|msg| markup::decode_entities(&msg.title).into_owned())
                    .unwrap_or_else(|| UNTITLED.to_string()),
                first_time: first.map(|msg| msg.time),
                message_count: messages.map_or(0, Vec::len),
            });
        }

        if assigned {
            self.store
                .set_thread_colors(&colors)
                .context("sync: persist thread colors")?;
        }
        Ok(summaries)
    }

    fn mark_in_progress(&self) -> InProgress<'_> {
        self.in_progress.store(true, Ordering::SeqCst);
        InProgress(&self.in_progress)
    }

    fn run(&self, mode: SyncMode) -> Result<MergeResult> {
        let snapshot = self.store.snapshot().context("sync: read store")?;
        let mut active = snapshot.active_threads;
        let mut messages = snapshot.messages;
        let mut colors = snapshot.colors;
        let mut result = MergeResult::default();

        let found = self.board.scan_catalog().context("sync: scan catalog")?;
        debug!(mode = mode.as_str(), found = found.len(), "catalog scan finished");
        let found_ids: HashSet<ThreadId> = found.iter().map(|thread| thread.id).collect();

        for candidate in &found {
            if active.contains(&candidate.id) {
                continue;
            }
            active.push(candidate.id);
            result.added_threads += 1;
            if mode == SyncMode::Manual && !colors.contains_key(&candidate.id) {
                let color = next_color(&colors);
                colors.insert(candidate.id, color);
            }
        }

        let mut kept = HashSet::new();
        active.retain(|id| {
            let has_messages = messages.get(id).map_or(false, |list| !list.is_empty());
            (found_ids.contains(id) || has_messages) && kept.insert(*id)
        });
        debug!(active = active.len(), "active threads after pruning");

        for id in &active {
            let fetched = self
                .board
                .fetch_thread_messages(*id)
                .with_context(|| format!("sync: fetch thread {id}"))?;
            debug!(thread = id, fetched = fetched.len(), "thread fetched");
            if fetched.is_empty() {
                continue;
            }
            let stored = messages.entry(*id).or_default();
            result.added_messages += merge_messages(stored, fetched);
        }

        self.store
            .set_messages_by_thread(&messages)
            .context("sync: persist messages")?;
        self.store
            .set_active_threads(&active)
            .context("sync: persist active threads")?;
        if mode == SyncMode::Manual {
            self.store
                .set_thread_colors(&colors)
                .context("sync: persist thread colors")?;
        }

        info!(
            mode = mode.as_str(),
            threads = active.len(),
            added_threads = result.added_threads,
            added_messages = result.added_messages,
            "sync finished"
        );
        self.bus.publish(Signal::DataUpdated);
        Ok(result)
    }
}

/// Label for the `reason` log field of a failed sync.
/// Whether the next scheduled sync may succeed where this one failed.
pub fn failure_is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Error>().is_some_and(Error::is_retryable)
}

pub fn failure_reason(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<Error>()
        .map(Error::reason_code)
        .unwrap_or("store")
}

/// Runs background syncs on a fixed interval until dropped.
pub struct BackgroundRefresher {
    stop: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BackgroundRefresher {
    pub fn spawn(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = unbounded();
        let ticker = tick(interval);
        let handle = thread::spawn(move || loop {
            crossbeam_channel::select! {
                recv(stop_rx) -> _ => break,
                recv(ticker) -> _ => {
                    if let Err(err) = engine.sync(SyncMode::Background) {
                        warn!(reason = failure_reason(&err), retryable = failure_is_retryable(&err), error = %format!("{err:#}"), "background sync failed");
                    }
                }
            }
        });
        Self {
            stop: stop_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundRefresher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MockBoardService;
    use crate::storage::{KeyValue, MemoryKv, MESSAGES_KEY, THREADS_KEY};

    fn message(id: u64, time: i64, thread_id: ThreadId, text: &str) -> Message {
        Message {
            id,
            time,
            text: text.into(),
            title: "otk".into(),
            thread_id,
            attachment: None,
        }
    }

    fn engine(board: Arc<MockBoardService>) -> (SyncEngine, Store, Arc<Bus>) {
        let store = Store::in_memory();
        let bus = Arc::new(Bus::new());
        (SyncEngine::new(board, store.clone(), bus.clone()), store, bus)
    }

    #[test]
    fn sync_sorts_merged_posts_by_time() {
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[101]);
        board.set_thread(
            101,
            vec![message(1, 100, 101, "hello"), message(2, 50, 101, "&gt;&gt;1")],
        );
        let (engine, store, bus) = engine(board);
        let sub = bus.subscribe();

        let result = engine.sync(SyncMode::Manual).unwrap();

        assert_eq!(result.added_threads, 1);
        assert_eq!(result.added_messages, 2);
        let ids: Vec<u64> = store.messages_by_thread().unwrap()[&101]
            .iter()
            .map(|msg| msg.id)
            .collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(sub.pending(), vec![Signal::DataUpdated]);
    }

    #[test]
    fn merge_is_idempotent_and_add_only() {
        let mut stored = vec![message(1, 10, 1, "original")];
        let batch = vec![message(1, 10, 1, "edited"), message(3, 5, 1, "c"), message(2, 20, 1, "b")];
        assert_eq!(merge_messages(&mut stored, batch.clone()), 2);
        let once = stored.clone();
        assert_eq!(merge_messages(&mut stored, batch), 0);
        assert_eq!(stored, once);
        assert_eq!(stored[1].text, "original");
        assert!(stored.windows(2).all(|pair| pair[0].time <= pair[1].time));
    }

    #[test]
    fn prunes_empty_threads_missing_from_catalog() {
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[1, 2]);
        board.set_thread(1, vec![message(10, 1, 1, "kept")]);
        let (engine, store, _bus) = engine(board.clone());
        engine.sync(SyncMode::Manual).unwrap();
        assert_eq!(store.active_threads().unwrap(), vec![1, 2]);

        board.set_catalog(&[]);
        board.remove_thread(1);
        engine.sync(SyncMode::Background).unwrap();

        assert_eq!(store.active_threads().unwrap(), vec![1]);
        assert_eq!(store.messages_by_thread().unwrap()[&1].len(), 1);
    }

    #[test]
    fn fetches_threads_sequentially_in_active_order() {
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[30, 10, 20]);
        let (engine, _store, _bus) = engine(board.clone());
        engine.sync(SyncMode::Manual).unwrap();
        assert_eq!(board.fetched(), vec![30, 10, 20]);
    }

    #[test]
    fn failed_sync_leaves_store_untouched() {
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[1, 2]);
        board.set_thread(1, vec![message(10, 1, 1, "a")]);
        let (engine, store, bus) = engine(board.clone());
        engine.sync(SyncMode::Manual).unwrap();
        let before = store.snapshot().unwrap();
        let sub = bus.subscribe();

        board.set_catalog(&[1, 2, 3]);
        board.set_thread(1, vec![message(11, 2, 1, "b")]);
        board.fail_thread(2, Error::network("thread/2", "connection reset"));
        let err = engine.sync(SyncMode::Manual).unwrap_err();

        assert_eq!(failure_reason(&err), "network");
        assert!(failure_is_retryable(&err));
        assert_eq!(store.snapshot().unwrap(), before);
        assert!(sub.pending().is_empty());
        assert!(!engine.is_syncing());

        board.fail_catalog(Some(Error::parse("catalog", "eof")));
        let err = engine.sync(SyncMode::Background).unwrap_err();
        assert_eq!(failure_reason(&err), "parse");
        assert_eq!(store.snapshot().unwrap(), before);
    }

    #[test]
    fn background_sync_skips_when_gate_is_held() {
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[1]);
        let (engine, store, _bus) = engine(board.clone());

        let held = engine.gate.lock();
        let result = engine.sync(SyncMode::Background).unwrap();
        drop(held);

        assert!(result.skipped);
        assert!(board.fetched().is_empty());
        assert!(store.active_threads().unwrap().is_empty());
    }

    #[test]
    fn background_sync_skips_while_manual_sync_runs() {
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[1]);
        board.set_thread(1, vec![message(10, 1, 1, "a")]);
        let hold = board.hold_thread(1);
        let (engine, store, _bus) = engine(board.clone());
        let engine = Arc::new(engine);

        let manual = {
            let engine = engine.clone();
            thread::spawn(move || engine.sync(SyncMode::Manual))
        };
        assert!(hold.wait_entered(Duration::from_secs(5)));
        assert!(engine.is_syncing());

        let background = engine.sync(SyncMode::Background).unwrap();
        assert_eq!(background, MergeResult::skipped());
        assert_eq!(board.fetched(), vec![1]);

        hold.release();
        let manual = manual.join().unwrap().unwrap();
        assert!(!manual.skipped);
        assert_eq!(manual.added_messages, 1);
        assert!(!engine.is_syncing());
        assert_eq!(store.active_threads().unwrap(), vec![1]);
    }

    #[test]
    fn only_manual_sync_assigns_colors() {
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[1]);
        let (engine, store, _bus) = engine(board.clone());

        engine.sync(SyncMode::Background).unwrap();
        assert!(store.thread_colors().unwrap().is_empty());

        board.set_catalog(&[1, 2]);
        engine.sync(SyncMode::Manual).unwrap();
        let colors = store.thread_colors().unwrap();
        assert_eq!(colors.get(&2).map(String::as_str), Some(PALETTE[0]));
        assert!(!colors.contains_key(&1));

        let summaries = engine.thread_summaries().unwrap();
        assert_eq!(summaries[0].color, PALETTE[1]);
        assert_eq!(summaries[1].color, PALETTE[0]);
        assert_eq!(store.thread_colors().unwrap().len(), 2);
    }

    #[test]
    fn colors_survive_syncs_until_clear() {
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[1, 2]);
        board.set_thread(1, vec![message(10, 1, 1, "a")]);
        board.set_thread(2, vec![message(20, 1, 2, "b")]);
        let (engine, store, _bus) = engine(board.clone());
        engine.sync(SyncMode::Manual).unwrap();
        let first = store.thread_colors().unwrap();

        board.set_catalog(&[2]);
        for _ in 0..3 {
            engine.sync(SyncMode::Manual).unwrap();
            engine.sync(SyncMode::Background).unwrap();
        }
        assert_eq!(store.thread_colors().unwrap(), first);

        board.remove_thread(1);
        engine.clear_and_refresh().unwrap();
        let after = store.thread_colors().unwrap();
        assert_eq!(after.get(&2).map(String::as_str), Some(PALETTE[0]));
        assert_eq!(store.active_threads().unwrap(), vec![2]);
    }

    #[test]
    fn palette_falls_back_when_exhausted() {
        let mut colors = ThreadColors::new();
        for (idx, color) in PALETTE.iter().enumerate() {
            colors.insert(idx as u64, color.to_string());
        }
        assert_eq!(next_color(&colors), FALLBACK_COLOR);
        colors.remove(&4);
        assert_eq!(next_color(&colors), PALETTE[4]);
    }

    struct RecordingKv {
        inner: MemoryKv,
        writes: Mutex<Vec<String>>,
    }

    impl KeyValue for RecordingKv {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.writes.lock().push(key.to_string());
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn messages_are_written_before_thread_list() {
        let kv = Arc::new(RecordingKv {
            inner: MemoryKv::new(),
            writes: Mutex::new(Vec::new()),
        });
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[1]);
        let engine = SyncEngine::new(
            board,
            Store::with_backend(kv.clone()),
            Arc::new(Bus::new()),
        );
        engine.sync(SyncMode::Background).unwrap();
        assert_eq!(*kv.writes.lock(), vec![MESSAGES_KEY.to_string(), THREADS_KEY.to_string()]);
    }

    #[test]
    fn refresher_runs_background_syncs() {
        let board = Arc::new(MockBoardService::new());
        board.set_catalog(&[5]);
        let store = Store::in_memory();
        let engine = Arc::new(SyncEngine::new(board, store.clone(), Arc::new(Bus::new())));
        let mut refresher = BackgroundRefresher::spawn(engine, Duration::from_millis(10));
        let mut waited = 0;
        while store.active_threads().unwrap().is_empty() && waited < 200 {
            thread::sleep(Duration::from_millis(10));
            waited += 1;
        }
        refresher.stop();
        assert_eq!(store.active_threads().unwrap(), vec![5]);
    }
}
