use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use log::{debug, warn};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::config::Config;
use crate::context::{EvaluationContext, SessionId, SessionIdentity};
use crate::eval::{self, Detail};
use crate::flag::{default_flags, FlagDefinition, FlagPatch, UpdateError};
use crate::persistence::{
    encode_flags, load_state, FileStorage, Keys, LoadedState, MemoryStorage, Persister, Storage,
};
use crate::segment::Segment;

/// Store is the lookup interface the evaluator reads flag definitions through.
pub trait Store {
    /// Retrieve the flag named `flag_name`.
    fn flag(&self, flag_name: &str) -> Option<&FlagDefinition>;
}

/// Flags is an immutable name-keyed collection of flag definitions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags(HashMap<String, FlagDefinition>);

impl Flags {
    pub fn new(flags: HashMap<String, FlagDefinition>) -> Self {
        Flags(flags)
    }

    /// The compiled-in seed flags.
    pub fn defaults() -> Self {
        Flags(default_flags())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlagDefinition> {
        self.0.values()
    }

    pub fn into_inner(self) -> HashMap<String, FlagDefinition> {
        self.0
    }
}

impl Store for Flags {
    fn flag(&self, flag_name: &str) -> Option<&FlagDefinition> {
        self.0.get(flag_name)
    }
}

struct State {
    flags: Flags,
    active_segment: Segment,
}

/// FlagStore owns the flag definitions and the active segment of one application, and makes both
/// durable.
///
/// Construct one at startup and hand a reference to every consumer. Reads and evaluations are
/// served from memory. Every change is queued for a background write and never waits on storage;
/// if storage fails the store keeps working in memory only.
pub struct FlagStore {
    state: RwLock<State>,
    session: OnceCell<SessionId>,
    persister: Persister,
    keys: Keys,
}

impl FlagStore {
    /// Open a store as described by `config`: file storage if a directory is configured, in-memory
    /// storage otherwise.
    pub fn open(config: &Config) -> Self {
        match &config.storage_dir {
            Some(dir) => match FileStorage::new(dir) {
                Ok(storage) => Self::with_storage(config, Arc::new(storage)),
                Err(e) => {
                    warn!(
                        "cannot use {} for flag storage, keeping flags in memory: {}",
                        dir.display(),
                        e
                    );
                    let config = Config {
                        persist: false,
                        ..config.clone()
                    };
                    Self::with_storage(&config, Arc::new(MemoryStorage::new()))
                }
            },
            None => Self::with_storage(config, Arc::new(MemoryStorage::new())),
        }
    }

    /// Open a store on top of the given storage.
    pub fn with_storage(config: &Config, storage: Arc<dyn Storage>) -> Self {
        let keys = Keys::new(&config.namespace);

        let (loaded, persister) = if config.persist {
            let loaded = load_state(storage.as_ref(), &keys, config.default_segment);
            let persister = Persister::spawn(storage, loaded.healthy);
            (loaded, persister)
        } else {
            (
                LoadedState::defaults(config.default_segment),
                Persister::disabled(),
            )
        };

        debug!(
            "opened flag store with {} flags, active segment {}",
            loaded.flags.len(),
            loaded.active_segment
        );

        Self {
            state: RwLock::new(State {
                flags: Flags::new(loaded.flags),
                active_segment: loaded.active_segment,
            }),
            session: loaded.session.map(OnceCell::with_value).unwrap_or_default(),
            persister,
            keys,
        }
    }

    /// Retrieve a copy of the flag named `flag_name`.
    pub fn get(&self, flag_name: &str) -> Option<FlagDefinition> {
        self.state.read().flags.flag(flag_name).cloned()
    }

    /// All flags, sorted by name.
    pub fn list(&self) -> Vec<FlagDefinition> {
        self.state
            .read()
            .flags
            .iter()
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .cloned()
            .collect()
    }

    /// A snapshot of the current flag definitions.
    pub fn snapshot(&self) -> Flags {
        self.state.read().flags.clone()
    }

    /// Merge `patch` into the flag named `flag_name` and schedule a write of the flag map.
    ///
    /// Updates never create flags: an unknown name is refused with [UpdateError::FlagNotFound] and
    /// nothing changes. A patch the flag cannot accept is refused as a whole.
    pub fn update(
        &self,
        flag_name: &str,
        patch: &FlagPatch,
    ) -> Result<FlagDefinition, UpdateError> {
        let mut state = self.state.write();

        let current = match state.flags.flag(flag_name) {
            Some(flag) => flag,
            None => {
                warn!("refusing to update unknown flag {}", flag_name);
                return Err(UpdateError::FlagNotFound(flag_name.to_owned()));
            }
        };

        let updated = current.apply(patch).map_err(|e| {
            warn!("refusing update of flag {}: {}", flag_name, e);
            e
        })?;

        state.flags.0.insert(flag_name.to_owned(), updated.clone());
        debug!("updated flag {}", flag_name);

        // queued under the write lock so records reach storage in update order
        match encode_flags(&state.flags.0) {
            Ok(doc) => self.persister.save(&self.keys.flags, doc),
            Err(e) => warn!("could not encode flags for storage: {}", e),
        }

        Ok(updated)
    }

    pub fn active_segment(&self) -> Segment {
        self.state.read().active_segment
    }

    /// Replace the active segment and schedule a write of it. Takes effect on the next evaluation.
    pub fn set_active_segment(&self, segment: Segment) {
        let mut state = self.state.write();
        state.active_segment = segment;
        debug!("active segment is now {}", segment);
        self.persister
            .save(&self.keys.segment, segment.as_str().to_owned());
    }

    /// Returns true if the named flag is enabled for the active segment and this session.
    /// Unknown names are disabled.
    pub fn is_enabled(&self, flag_name: &str) -> bool {
        self.evaluate(flag_name).value
    }

    /// Evaluate the named flag and explain the result.
    pub fn evaluate(&self, flag_name: &str) -> Detail {
        let state = self.state.read();
        let session = LazySession(self);
        let context = EvaluationContext::new(state.active_segment, &session);
        eval::evaluate_flag(&state.flags, flag_name, &context)
    }

    /// Evaluate every flag against the same state.
    pub fn evaluate_all(&self) -> HashMap<String, bool> {
        let state = self.state.read();
        let session = LazySession(self);
        let context = EvaluationContext::new(state.active_segment, &session);
        state
            .flags
            .iter()
            .map(|flag| (flag.name.clone(), eval::evaluate(flag, &context).value))
            .collect()
    }

    /// The identifier percentage rollouts are bucketed by. It is created on first use and
    /// persisted, so it survives restarts on the same storage.
    pub fn session_identifier(&self) -> &str {
        self.session
            .get_or_init(|| {
                let id = SessionId::generate();
                debug!("created session identifier {}", id);
                self.persister.save(&self.keys.session, id.to_string());
                id
            })
            .as_str()
    }

    /// Block until every queued write has been attempted.
    pub fn flush(&self) {
        self.persister.flush();
    }

    /// Returns false once the store has stopped writing to storage, either because persistence is
    /// disabled or because storage failed.
    pub fn is_persistent(&self) -> bool {
        self.persister.is_healthy()
    }
}

// Hands out the store's session identifier only when an evaluation asks for it.
struct LazySession<'a>(&'a FlagStore);

impl SessionIdentity for LazySession<'_> {
    fn identifier(&self) -> &str {
        self.0.session_identifier()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::eval::{Error, Reason};
    use crate::flag::RolloutStrategy;
    use crate::persistence::{FLAGS_KEY, SEGMENT_KEY, SESSION_KEY};
    use crate::test_common::FlakyStorage;
    use maplit::btreeset;
    use spectral::prelude::*;
    use std::thread;
    use test_case::test_case;

    fn memory_store() -> (FlagStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let store = FlagStore::with_storage(&Config::default(), storage.clone());
        (store, storage)
    }

    #[test]
    fn store_is_shareable_between_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FlagStore>();
    }

    #[test]
    fn fresh_store_serves_seed_flags() {
        let (store, _) = memory_store();

        assert_that!(store.list()).has_length(5);
        assert_that!(store.get("smartSearch").map(|f| f.rollout_percentage)).contains_value(50);
        assert_that!(store.get("missing")).is_none();
        assert_that!(store.active_segment()).is_equal_to(Segment::All);

        let names: Vec<String> = store.list().into_iter().map(|f| f.name).collect();
        assert_that!(names).is_equal_to(vec![
            "dashboard_v2".to_string(),
            "hero_v2".to_string(),
            "showVirtualCard".to_string(),
            "smartSearch".to_string(),
            "supportChat".to_string(),
        ]);
    }

    #[test]
    fn seed_flags_evaluate_as_configured() {
        let (store, _) = memory_store();

        assert!(!store.is_enabled("hero_v2"));
        assert!(!store.is_enabled("dashboard_v2"));
        assert!(!store.is_enabled("supportChat"));
        assert!(store.is_enabled("showVirtualCard"));

        store.set_active_segment(Segment::Guest);
        assert!(!store.is_enabled("showVirtualCard"));
        store.set_active_segment(Segment::Premium);
        assert!(store.is_enabled("showVirtualCard"));
    }

    #[test]
    fn unknown_flag_is_disabled() {
        let (store, _) = memory_store();
        assert!(!store.is_enabled("doesNotExist"));
        assert_that!(store.evaluate("doesNotExist")).is_equal_to(Detail::err(Error::FlagNotFound));
    }

    #[test]
    fn update_merges_and_persists() {
        let (store, storage) = memory_store();

        let updated = store
            .update(
                "hero_v2",
                &FlagPatch::new().rollout_strategy(RolloutStrategy::On),
            )
            .unwrap();
        assert_that!(updated.rollout_strategy).is_equal_to(RolloutStrategy::On);
        assert_that!(updated.allowed_segments)
            .is_equal_to(btreeset! { Segment::Beta, Segment::Premium });
        assert!(store.is_enabled("hero_v2"));

        store.flush();
        let doc = storage.load(FLAGS_KEY).unwrap().unwrap();
        let saved: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(saved["hero_v2"]["rolloutStrategy"], "on");
        assert_eq!(saved["smartSearch"]["rolloutPercentage"], 50);
    }

    #[test_case(150, 100)]
    #[test_case(-10, 0)]
    #[test_case(35, 35)]
    fn update_clamps_percentage(requested: i64, stored: u8) {
        let (store, _) = memory_store();
        store
            .update("smartSearch", &FlagPatch::new().rollout_percentage(requested))
            .unwrap();
        assert_that!(store.get("smartSearch").unwrap().rollout_percentage).is_equal_to(stored);
    }

    #[test]
    fn update_of_unknown_flag_is_refused() {
        let (store, storage) = memory_store();
        let before = store.list();

        let patch = FlagPatch::new().rollout_strategy(RolloutStrategy::On);
        let result = store.update("brandNew", &patch);
        assert_that!(result).is_err_containing(UpdateError::FlagNotFound("brandNew".to_string()));

        assert_that!(store.get("brandNew")).is_none();
        assert_that!(store.list()).is_equal_to(before);
        store.flush();
        assert_that!(storage.load(FLAGS_KEY)).is_ok_containing(None);
    }

    #[test]
    fn invalid_patch_leaves_flag_untouched() {
        let (store, _) = memory_store();
        let before = store.get("supportChat").unwrap();

        let patch = FlagPatch::new()
            .rollout_strategy(RolloutStrategy::Segment)
            .allowed_segments([Segment::All]);
        assert_that!(store.update("supportChat", &patch))
            .is_err_containing(UpdateError::WildcardSegment);
        assert_that!(store.get("supportChat")).contains_value(before);
    }

    #[test]
    fn active_segment_is_persisted_as_label() {
        let (store, storage) = memory_store();
        store.set_active_segment(Segment::Beta);
        assert_that!(store.active_segment()).is_equal_to(Segment::Beta);

        store.flush();
        assert_that!(storage.load(SEGMENT_KEY)).is_ok_containing(Some("beta".to_string()));
    }

    #[test]
    fn session_is_created_lazily_and_kept() {
        let (store, storage) = memory_store();

        // non-percentage evaluations never need the session
        store.is_enabled("hero_v2");
        store.is_enabled("showVirtualCard");
        store.flush();
        assert_that!(storage.load(SESSION_KEY)).is_ok_containing(None);

        let first = store.is_enabled("smartSearch");
        let id = store.session_identifier().to_owned();
        for _ in 0..10 {
            assert_eq!(store.is_enabled("smartSearch"), first);
        }
        assert_eq!(store.session_identifier(), id);

        store.flush();
        assert_that!(storage.load(SESSION_KEY)).is_ok_containing(Some(id));
    }

    #[test]
    fn percentage_flag_end_to_end() {
        let (store, _) = memory_store();
        let first = store.evaluate("smartSearch");
        let second = store.evaluate("smartSearch");
        assert_that!(first).is_equal_to(&second);
        assert!(matches!(first.reason, Reason::Percentage { .. }));

        store
            .update("smartSearch", &FlagPatch::new().rollout_percentage(0))
            .unwrap();
        assert!(!store.is_enabled("smartSearch"));

        for _ in 0..50 {
            let id = SessionId::generate();
            let storage = Arc::new(MemoryStorage::new());
            storage.save(SESSION_KEY, id.as_str()).unwrap();
            let doc = encode_flags(&store.snapshot().into_inner()).unwrap();
            storage.save(FLAGS_KEY, &doc).unwrap();

            let other = FlagStore::with_storage(&Config::default(), storage);
            assert_eq!(other.session_identifier(), id.as_str());
            assert!(!other.is_enabled("smartSearch"));
        }
    }

    #[test]
    fn state_survives_reopen() {
        let storage = Arc::new(MemoryStorage::new());
        let config = Config::default();

        let (flags, session) = {
            let store = FlagStore::with_storage(&config, storage.clone());
            store
                .update(
                    "smartSearch",
                    &FlagPatch::new()
                        .rollout_percentage(150)
                        .allowed_segments([Segment::Guest])
                        .description("search, but smarter"),
                )
                .unwrap();
            store
                .update("supportChat", &FlagPatch::new().rollout_strategy(RolloutStrategy::Segment))
                .unwrap();
            store.set_active_segment(Segment::Premium);
            store.is_enabled("smartSearch");
            // dropping the store at the end of this block drains its write queue
            (store.list(), store.session_identifier().to_owned())
        };

        let reopened = FlagStore::with_storage(&config, storage);
        assert_that!(reopened.list()).is_equal_to(&flags);
        assert_that!(reopened.get("smartSearch").unwrap().rollout_percentage).is_equal_to(100);
        assert_that!(reopened.active_segment()).is_equal_to(Segment::Premium);
        assert_eq!(reopened.session_identifier(), session);
    }

    #[test]
    fn namespaces_keep_stores_apart() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let a_config = ConfigBuilder::new().namespace("a.").build();
        let b_config = ConfigBuilder::new().namespace("b.").build();
        let a = FlagStore::with_storage(&a_config, storage.clone());

        a.set_active_segment(Segment::Guest);
        a.flush();

        let b = FlagStore::with_storage(&b_config, storage);
        assert_that!(b.active_segment()).is_equal_to(Segment::All);
    }

    #[test]
    fn disabled_persistence_touches_nothing() {
        let storage = Arc::new(FlakyStorage::default());
        storage
            .records
            .lock()
            .insert(SEGMENT_KEY.to_string(), "beta".to_string());
        let config = ConfigBuilder::new()
            .persist(false)
            .default_segment(Segment::Guest)
            .build();

        let store = FlagStore::with_storage(&config, storage.clone());
        assert_that!(store.active_segment()).is_equal_to(Segment::Guest);
        store.set_active_segment(Segment::Premium);
        store.flush();

        assert!(!store.is_persistent());
        assert_eq!(*storage.saves.lock(), 0);
    }

    #[test]
    fn failing_storage_degrades_to_memory() {
        let storage = Arc::new(FlakyStorage::failing_saves());
        let store = FlagStore::with_storage(&Config::default(), storage.clone());
        assert!(store.is_persistent());

        store.set_active_segment(Segment::Beta);
        store.flush();
        assert!(!store.is_persistent());

        store
            .update("hero_v2", &FlagPatch::new().rollout_strategy(RolloutStrategy::On))
            .unwrap();
        store.flush();
        assert!(store.is_enabled("hero_v2"));
        assert_that!(store.active_segment()).is_equal_to(Segment::Beta);
        assert_eq!(*storage.saves.lock(), 1);
    }

    #[test]
    fn unreadable_storage_starts_from_defaults() {
        let storage = Arc::new(FlakyStorage::failing_loads());
        let store = FlagStore::with_storage(&Config::default(), storage);

        assert!(!store.is_persistent());
        assert_that!(store.snapshot()).is_equal_to(Flags::defaults());
    }

    #[test]
    fn unusable_storage_dir_degrades_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "plain file").unwrap();
        let config = ConfigBuilder::new()
            .storage_dir(blocker.join("flags"))
            .default_segment(Segment::Beta)
            .build();

        let store = FlagStore::open(&config);
        assert!(!store.is_persistent());
        assert_that!(store.active_segment()).is_equal_to(Segment::Beta);
        assert_that!(store.snapshot()).is_equal_to(Flags::defaults());

        store
            .update("supportChat", &FlagPatch::new().rollout_strategy(RolloutStrategy::On))
            .unwrap();
        store.flush();
        assert!(store.is_enabled("supportChat"));
    }

    #[test]
    fn corrupt_flag_record_starts_from_defaults() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save(FLAGS_KEY, "{ this is not json").unwrap();

        let store = FlagStore::with_storage(&Config::default(), storage);
        assert_that!(store.snapshot()).is_equal_to(Flags::defaults());
        assert!(store.is_persistent());
    }

    #[test]
    fn file_backed_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::new().storage_dir(dir.path()).build();

        {
            let store = FlagStore::open(&config);
            store
                .update("dashboard_v2", &FlagPatch::new().rollout_strategy(RolloutStrategy::On))
                .unwrap();
            store.set_active_segment(Segment::Guest);
        }

        let store = FlagStore::open(&config);
        assert!(store.is_enabled("dashboard_v2"));
        assert_that!(store.active_segment()).is_equal_to(Segment::Guest);
    }

    #[test]
    fn evaluate_all_covers_every_flag() {
        let (store, _) = memory_store();
        store.set_active_segment(Segment::Premium);
        store
            .update("smartSearch", &FlagPatch::new().rollout_percentage(100))
            .unwrap();

        let results = store.evaluate_all();
        assert_that!(results).has_length(5);
        assert!(results["showVirtualCard"]);
        assert!(results["smartSearch"]);
        assert!(!results["hero_v2"]);
    }

    #[test]
    fn concurrent_readers_see_whole_updates() {
        let (store, _) = memory_store();
        let strategies = [RolloutStrategy::On, RolloutStrategy::Off];

        thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    let patch = FlagPatch::new()
                        .rollout_strategy(strategies[i % 2])
                        .rollout_percentage(if i % 2 == 0 { 100 } else { 0 });
                    store.update("supportChat", &patch).unwrap();
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let flag = store.get("supportChat").unwrap();
                        let expected = match flag.rollout_strategy {
                            RolloutStrategy::On => 100,
                            _ => 0,
                        };
                        assert_eq!(flag.rollout_percentage, expected);
                        store.is_enabled("supportChat");
                    }
                });
            }
        });
    }
}
