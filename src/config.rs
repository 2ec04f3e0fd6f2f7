use std::path::PathBuf;

use serde::Deserialize;

use crate::segment::Segment;

/// Config controls how a [crate::FlagStore] finds and keeps its state.
///
/// It can be deserialized from JSON, with every field optional:
///
/// ```json
/// {"namespace": "demo.", "defaultSegment": "guest", "storageDir": "/var/lib/demo/flags"}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Prefix applied to every storage key, letting several stores share one storage.
    pub namespace: String,
    /// Active segment used until one is selected or restored.
    pub default_segment: Segment,
    /// Directory for file-backed storage. Without one, state lives in memory only.
    pub storage_dir: Option<PathBuf>,
    /// When false, nothing is read from or written to storage.
    pub persist: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            default_segment: Segment::All,
            storage_dir: None,
            persist: true,
        }
    }
}

/// Contains methods for building a [Config].
///
/// If no methods are called, the result equals [Config::default]: no namespace, the
/// [Segment::All] wildcard as default segment, in-memory storage and persistence enabled.
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(&mut self, namespace: impl Into<String>) -> &mut Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn default_segment(&mut self, segment: Segment) -> &mut Self {
        self.config.default_segment = segment;
        self
    }

    /// Keep state in files under `dir`.
    pub fn storage_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.config.storage_dir = Some(dir.into());
        self
    }

    pub fn persist(&mut self, persist: bool) -> &mut Self {
        self.config.persist = persist;
        self
    }

    pub fn build(&self) -> Config {
        self.config.clone()
    }
}
