use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;

use crate::context::SessionId;
use crate::flag::{default_flags, FlagDefinition, RolloutStrategy};
use crate::segment::Segment;

/// Record holding the flag map, a JSON object keyed by flag name.
pub const FLAGS_KEY: &str = "featureFlags";
/// Record holding the active segment as a bare label.
pub const SEGMENT_KEY: &str = "userSegment";
/// Record holding the session identifier as a bare string.
pub const SESSION_KEY: &str = "userIdForSession";

lazy_static! {
    static ref STORAGE_KEY_REGEX: Regex = Regex::new(r"^[A-Za-z0-9._-]+$").unwrap();
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("'{0}' is not a valid storage key")]
    InvalidKey(String),
}

/// Storage is a durable string-keyed record store, the equivalent of browser local storage.
///
/// Implementations must be safe to share between threads: the store reads through it on the
/// caller's thread at startup and writes through it from a background thread.
pub trait Storage: Send + Sync {
    /// Returns the record stored under `key`, or `None` if there is none.
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replaces the record stored under `key`.
    fn save(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// Storage that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.records.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Storage keeping one file per record inside a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a reader never sees a
/// half-written record.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Opens (creating if needed) the directory that holds the records.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if !STORAGE_KEY_REGEX.is_match(key) || key.starts_with('.') {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        Ok(self.dir.join(key))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!(".{}.tmp", key));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// The storage keys of one store, all sharing the configured namespace prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Keys {
    pub(crate) flags: String,
    pub(crate) segment: String,
    pub(crate) session: String,
}

impl Keys {
    pub(crate) fn new(namespace: &str) -> Self {
        Self {
            flags: format!("{}{}", namespace, FLAGS_KEY),
            segment: format!("{}{}", namespace, SEGMENT_KEY),
            session: format!("{}{}", namespace, SESSION_KEY),
        }
    }
}

/// What a store starts from after reading its records.
#[derive(Debug)]
pub(crate) struct LoadedState {
    pub(crate) flags: HashMap<String, FlagDefinition>,
    pub(crate) active_segment: Segment,
    pub(crate) session: Option<SessionId>,
    /// False if any record could not be read because of an I/O failure.
    pub(crate) healthy: bool,
}

impl LoadedState {
    pub(crate) fn defaults(default_segment: Segment) -> Self {
        Self {
            flags: default_flags(),
            active_segment: default_segment,
            session: None,
            healthy: true,
        }
    }
}

/// Read every record of a store.
///
/// Nothing here fails: a missing or corrupt record is replaced by its default, and an I/O failure
/// additionally marks the result unhealthy.
pub(crate) fn load_state(
    storage: &dyn Storage,
    keys: &Keys,
    default_segment: Segment,
) -> LoadedState {
    let mut state = LoadedState::defaults(default_segment);

    if let Some(doc) = read_record(storage, &keys.flags, &mut state.healthy) {
        match decode_flags(&doc) {
            Ok(saved) => state.flags = merge_flags(state.flags, saved),
            Err(e) => warn!("saved feature flags are unreadable, using defaults: {}", e),
        }
    }

    if let Some(label) = read_record(storage, &keys.segment, &mut state.healthy) {
        match Segment::try_from(label.as_str()) {
            Ok(segment) => state.active_segment = segment,
            Err(e) => warn!("ignoring saved segment: {}", e),
        }
    }

    if let Some(id) = read_record(storage, &keys.session, &mut state.healthy) {
        match SessionId::try_from(id) {
            Ok(id) => state.session = Some(id),
            Err(e) => warn!("discarding saved session: {}", e),
        }
    }

    state
}

fn read_record(storage: &dyn Storage, key: &str, healthy: &mut bool) -> Option<String> {
    match storage.load(key) {
        Ok(record) => record,
        Err(e) => {
            warn!("failed to read {}: {}", key, e);
            *healthy = false;
            None
        }
    }
}

pub(crate) fn decode_flags(
    doc: &str,
) -> Result<HashMap<String, FlagDefinition>, serde_json::Error> {
    serde_json::from_str(doc)
}

/// Serialize the flag map. Keys are written in sorted order so identical maps produce identical
/// records.
pub(crate) fn encode_flags(
    flags: &HashMap<String, FlagDefinition>,
) -> Result<String, serde_json::Error> {
    let sorted: BTreeMap<&String, &FlagDefinition> = flags.iter().collect();
    serde_json::to_string(&sorted)
}

/// Overlay saved flags onto the defaults. The map key is authoritative for the flag's name.
fn merge_flags(
    mut flags: HashMap<String, FlagDefinition>,
    saved: HashMap<String, FlagDefinition>,
) -> HashMap<String, FlagDefinition> {
    for (name, mut flag) in saved {
        if flag.name != name {
            if !flag.name.is_empty() {
                warn!(
                    "saved flag {} carried the name '{}', using the key",
                    name, flag.name
                );
            }
            flag.name = name.clone();
        }
        if flag.rollout_strategy == RolloutStrategy::Unrecognized {
            warn!(
                "saved flag {} has an unrecognized rollout strategy and stays disabled",
                name
            );
        }
        flags.insert(name, flag);
    }
    flags
}

enum Command {
    Save { key: String, value: String },
    Flush(mpsc::Sender<()>),
}

/// Persister writes records from a single background thread, in the order they were queued.
///
/// Callers never wait on storage. The first failed write switches the persister off for good and
/// the store carries on in memory only.
pub(crate) struct Persister {
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    healthy: Arc<AtomicBool>,
}

impl Persister {
    pub(crate) fn spawn(storage: Arc<dyn Storage>, healthy: bool) -> Self {
        if !healthy {
            info!("storage failed while loading; flag changes will be kept in memory only");
            return Self::disabled();
        }

        let (sender, receiver) = mpsc::channel();
        let flag = Arc::new(AtomicBool::new(true));
        let worker_flag = Arc::clone(&flag);

        let spawned = thread::Builder::new()
            .name("flag-persistence".into())
            .spawn(move || write_loop(storage.as_ref(), receiver, &worker_flag));

        match spawned {
            Ok(handle) => Self {
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(handle)),
                healthy: flag,
            },
            Err(e) => {
                warn!("could not start persistence thread: {}", e);
                Self::disabled()
            }
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Queue a write of `value` under `key`. Returns immediately.
    pub(crate) fn save(&self, key: &str, value: String) {
        if !self.is_healthy() {
            return;
        }
        if let Some(sender) = self.sender.lock().as_ref() {
            let command = Command::Save {
                key: key.to_owned(),
                value,
            };
            if sender.send(command).is_err() {
                self.healthy.store(false, Ordering::Release);
            }
        }
    }

    /// Block until every write queued before this call has been attempted.
    pub(crate) fn flush(&self) {
        let (done, finished) = mpsc::channel();
        let queued = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Command::Flush(done)).is_ok(),
            None => false,
        };
        if queued {
            // an Err only means the worker is gone, which also means there is nothing left to wait on
            let _ = finished.recv();
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        // closing the channel lets the worker drain what is queued and exit
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("persistence thread panicked");
            }
        }
    }
}

fn write_loop(storage: &dyn Storage, commands: mpsc::Receiver<Command>, healthy: &AtomicBool) {
    for command in commands {
        match command {
            Command::Save { key, value } => {
                if !healthy.load(Ordering::Acquire) {
                    continue;
                }
                match storage.save(&key, &value) {
                    Ok(()) => debug!("persisted {}", key),
                    Err(e) => {
                        warn!("failed to persist {}: {}", key, e);
                        info!("flag changes will be kept in memory only from now on");
                        healthy.store(false, Ordering::Release);
                    }
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
