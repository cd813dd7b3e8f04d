use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::board;
use crate::error::{self, Error};
use crate::model::{Message, ThreadCandidate, ThreadId};

/// Upstream board access used by the sync engine.
pub trait BoardService: Send + Sync {
    fn scan_catalog(&self) -> error::Result<Vec<ThreadCandidate>>;
    fn fetch_thread_messages(&self, id: ThreadId) -> error::Result<Vec<Message>>;
}

pub struct BoardApiService {
    client: Arc<board::Client>,
}

impl BoardApiService {
    pub fn new(client: Arc<board::Client>) -> Self {
        Self { client }
    }
}

impl BoardService for BoardApiService {
    fn scan_catalog(&self) -> error::Result<Vec<ThreadCandidate>> {
        self.client.scan_catalog()
    }

    fn fetch_thread_messages(&self, id: ThreadId) -> error::Result<Vec<Message>> {
        self.client.fetch_thread_messages(id)
    }
}

/// In-memory board whose catalog and threads are set by the caller. Records
/// the order of thread fetches.
#[derive(Default)]
pub struct MockBoardService {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    catalog: Vec<ThreadCandidate>,
    catalog_error: Option<Error>,
    threads: HashMap<ThreadId, Vec<Message>>,
    failing: HashMap<ThreadId, Error>,
    fetched: Vec<ThreadId>,
    holds: HashMap<ThreadId, (Sender<ThreadId>, Receiver<()>)>,
}

/// Parks the next fetch of one thread until released.
pub struct FetchHold {
    entered: Receiver<ThreadId>,
    release: Sender<()>,
}

impl FetchHold {
    /// True once the held fetch has started.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    pub fn release(self) {
        let _ = self.release.send(());
    }
}

impl MockBoardService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_catalog(&self, ids: &[ThreadId]) {
        self.state.lock().catalog = ids
            .iter()
            .map(|id| ThreadCandidate {
                id: *id,
                title: format!("otk {id}"),
            })
            .collect();
    }

    pub fn fail_catalog(&self, err: Option<Error>) {
        self.state.lock().catalog_error = err;
    }

    pub fn set_thread(&self, id: ThreadId, messages: Vec<Message>) {
        self.state.lock().threads.insert(id, messages);
    }

    pub fn remove_thread(&self, id: ThreadId) {
        self.state.lock().threads.remove(&id);
    }

    pub fn fail_thread(&self, id: ThreadId, err: Error) {
        self.state.lock().failing.insert(id, err);
    }

    /// The next fetch of `id` blocks until the returned hold is released
    /// or dropped.
    pub fn hold_thread(&self, id: ThreadId) -> FetchHold {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        self.state.lock().holds.insert(id, (entered_tx, release_rx));
        FetchHold {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub fn fetched(&self) -> Vec<ThreadId> {
        self.state.lock().fetched.clone()
    }
}

impl BoardService for MockBoardService {
    fn scan_catalog(&self) -> error::Result<Vec<ThreadCandidate>> {
        let state = self.state.lock();
        match &state.catalog_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.catalog.clone()),
        }
    }

    fn fetch_thread_messages(&self, id: ThreadId) -> error::Result<Vec<Message>> {
        let hold = {
            let mut state = self.state.lock();
            state.fetched.push(id);
            state.holds.remove(&id)
        };
        if let Some((entered, release)) = hold {
            let _ = entered.send(id);
            let _ = release.recv();
        }

        let state = self.state.lock();
        if let Some(err) = state.failing.get(&id) {
            return Err(err.clone());
        }
        Ok(state.threads.get(&id).cloned().unwrap_or_default())
    }
}
