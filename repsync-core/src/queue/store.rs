/*
    store.rs - Durable queue store

    The only shared mutable resource in the sync layer. The enqueuer
    appends to it and the flush engine removes from / rewrites it.

    Rules:
    - Every mutation re-reads the persisted queue before changing it,
      so a snapshot taken before an await point is never written back.
    - Each read-modify-write cycle holds the store lock for the duration
      of one load + persist and nothing longer.
    - Every mutation publishes the new depth on a watch channel.
    - Appends never fail. If the backend is unavailable the item is kept
      in the last-known in-memory copy and a warning is logged. Such items
      are merged back in, in order, once the backend answers again.
*/

use crate::metrics;
use crate::queue::errors::{StoreError, StoreResult};
use crate::queue::item::QueueItem;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Raw persistence for the ordered item list
pub trait QueueBackend: Send + Sync {
    /// Load the full queue, oldest first
    fn load(&self) -> StoreResult<Vec<QueueItem>>;

    /// Atomically replace the persisted queue
    fn persist(&self, items: &[QueueItem]) -> StoreResult<()>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// JSON file backend
///
/// Writes go to a sibling temp file which is then renamed over the
/// queue file, so a crash mid-write leaves the previous queue intact.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBackend { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "queue.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl QueueBackend for FileBackend {
    fn load(&self) -> StoreResult<Vec<QueueItem>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Unavailable(e.to_string())),
        };

        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    fn persist(&self, items: &[QueueItem]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(items)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let tmp = self.tmp_path();
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory backend for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryBackend {
    items: Mutex<Vec<QueueItem>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<QueueItem>) -> Self {
        MemoryBackend { items: Mutex::new(items) }
    }
}

impl QueueBackend for MemoryBackend {
    fn load(&self) -> StoreResult<Vec<QueueItem>> {
        Ok(self.items.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn persist(&self, items: &[QueueItem]) -> StoreResult<()> {
        *self.items.lock().unwrap_or_else(PoisonError::into_inner) = items.to_vec();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Ordered, durable queue of pending write intents
pub struct QueueStore {
    backend: Arc<dyn QueueBackend>,

    /// Last contents observed or written. Also serialises read-modify-write
    /// cycles.
    last_known: Mutex<KnownQueue>,

    depth_tx: watch::Sender<usize>,
}

#[derive(Default)]
struct KnownQueue {
    items: Vec<QueueItem>,
    /// Ids in `items` the backend has not stored yet
    unpersisted: HashSet<String>,
}

/// Put items the backend never stored back into freshly loaded contents
///
/// Each one goes right after the nearest earlier item it followed in the
/// in-memory copy, so FIFO order survives the outage.
fn merge_unpersisted(
    mut loaded: Vec<QueueItem>,
    known: &[QueueItem],
    unpersisted: &HashSet<String>,
) -> Vec<QueueItem> {
    if unpersisted.is_empty() {
        return loaded;
    }

    let mut anchor: Option<usize> = None;
    for item in known {
        let position = loaded.iter().position(|l| l.id == item.id);
        match position {
            Some(pos) => anchor = Some(pos),
            None if unpersisted.contains(&item.id) => {
                let at = anchor.map_or(0, |a| a + 1);
                loaded.insert(at, item.clone());
                anchor = Some(at);
            }
            None => {}
        }
    }
    loaded
}

impl QueueStore {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        let initial = match backend.load() {
            Ok(items) => items,
            Err(e) => {
                warn!(backend = %backend.describe(), error = %e, "queue unreadable at startup, starting empty");
                Vec::new()
            }
        };
        let (depth_tx, _) = watch::channel(initial.len());

        QueueStore {
            backend,
            last_known: Mutex::new(KnownQueue {
                items: initial,
                unpersisted: HashSet::new(),
            }),
            depth_tx,
        }
    }

    /// Queue persisted to a JSON file
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(path)))
    }

    /// Queue that lives only for this process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    fn guard(&self) -> MutexGuard<'_, KnownQueue> {
        self.last_known.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, depth: usize) {
        self.depth_tx.send_replace(depth);
        metrics::record_gauge(metrics::QUEUE_DEPTH, depth as f64);
    }

    /// Backend contents plus anything appended while it was unreachable
    fn load_merged(&self, known: &KnownQueue) -> StoreResult<Vec<QueueItem>> {
        let loaded = self.backend.load()?;
        Ok(merge_unpersisted(loaded, &known.items, &known.unpersisted))
    }

    fn persist_known(&self, known: &mut KnownQueue, items: &[QueueItem]) -> StoreResult<()> {
        self.backend.persist(items)?;
        if !known.unpersisted.is_empty() {
            info!(
                backend = %self.backend.describe(),
                recovered = known.unpersisted.len(),
                "queue items held in memory are now persisted"
            );
            known.unpersisted.clear();
        }
        Ok(())
    }

    /// Current queue contents, oldest first
    ///
    /// Falls back to the last-known copy while the backend is unavailable.
    /// Corrupted data is an error. Items held in memory during an outage
    /// are written out on the first read after the backend comes back.
    pub fn read(&self) -> StoreResult<Vec<QueueItem>> {
        let mut known = self.guard();
        match self.load_merged(&known) {
            Ok(items) => {
                if !known.unpersisted.is_empty() {
                    if let Err(e) = self.persist_known(&mut known, &items) {
                        warn!(backend = %self.backend.describe(), error = %e, "queue items still held in memory only");
                    }
                }
                known.items = items.clone();
                Ok(items)
            }
            Err(StoreError::Unavailable(reason)) => {
                warn!(backend = %self.backend.describe(), %reason, "queue backend unavailable, serving last known contents");
                Ok(known.items.clone())
            }
            Err(e) => Err(e),
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        match self.read() {
            Ok(items) => items.len(),
            Err(_) => self.guard().items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items the backend has not stored yet
    pub fn unpersisted_len(&self) -> usize {
        self.guard().unpersisted.len()
    }

    /// Append an item at the back of the queue. Never fails.
    ///
    /// If the item cannot be written it is held in memory and written out
    /// with the next successful mutation or read.
    pub fn append(&self, item: QueueItem) {
        let mut known = self.guard();

        let (mut items, writable) = match self.load_merged(&known) {
            Ok(items) => (items, true),
            Err(StoreError::Unavailable(reason)) => {
                warn!(backend = %self.backend.describe(), %reason, "queue backend unavailable, appending to last known contents");
                (known.items.clone(), true)
            }
            // Never overwrite contents that failed to parse
            Err(e) => {
                warn!(backend = %self.backend.describe(), error = %e, "queue unreadable, holding item in memory");
                (known.items.clone(), false)
            }
        };

        let item_id = item.id.clone();
        items.push(item);

        let persisted = writable
            && match self.persist_known(&mut known, &items) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        backend = %self.backend.describe(),
                        item_id = %item_id,
                        error = %e,
                        "queue append not persisted, keeping item in memory"
                    );
                    false
                }
            };
        if !persisted {
            known.unpersisted.insert(item_id.clone());
        }

        let depth = items.len();
        known.items = items;
        drop(known);

        debug!(item_id = %item_id, depth, persisted, "queue item appended");
        self.notify(depth);
    }

    /// Atomic read-modify-write against freshly loaded contents
    pub fn modify<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Vec<QueueItem>) -> R,
    {
        let mut known = self.guard();
        let mut items = self.load_merged(&known)?;
        let result = f(&mut items);
        self.persist_known(&mut known, &items)?;

        let depth = items.len();
        known.items = items;
        drop(known);

        self.notify(depth);
        Ok(result)
    }

    /// Remove one item by id. Returns whether it was present.
    pub fn remove_by_id(&self, id: &str) -> StoreResult<bool> {
        self.modify(|items| {
            let before = items.len();
            items.retain(|item| item.id != id);
            items.len() != before
        })
    }

    /// Remove every item whose id is in `ids`. Returns how many were removed.
    pub fn remove_ids(&self, ids: &HashSet<String>) -> StoreResult<usize> {
        self.modify(|items| {
            let before = items.len();
            items.retain(|item| !ids.contains(&item.id));
            before - items.len()
        })
    }

    /// Atomically rewrite the whole queue
    pub fn replace_all(&self, new_items: Vec<QueueItem>) -> StoreResult<()> {
        self.modify(move |items| {
            *items = new_items;
        })
    }

    /// Subscribe to queue depth changes
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.depth_tx.subscribe()
    }

    pub fn backend_description(&self) -> String {
        self.backend.describe()
    }
}
