#![cfg(test)]

use crate::flag::FlagDefinition;
use crate::persistence::{Storage, StorageError};
use crate::store::Store;
use maplit::hashmap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;

pub struct TestStore {
    flags: HashMap<String, FlagDefinition>,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            flags: hashmap! {
                "offFlag".to_string() => serde_json::from_str(r#"{
                        "name": "offFlag",
                        "description": "always off",
                        "rolloutStrategy": "off",
                        "rolloutPercentage": 100,
                        "userSegments": ["premium", "beta", "guest"]
                    }"#).unwrap(),
                "onFlag".to_string() => serde_json::from_str(r#"{
                        "name": "onFlag",
                        "description": "always on",
                        "rolloutStrategy": "on",
                        "rolloutPercentage": 0,
                        "userSegments": []
                    }"#).unwrap(),
                "segmentFlag".to_string() => serde_json::from_str(r#"{
                        "name": "segmentFlag",
                        "description": "premium and beta only",
                        "rolloutStrategy": "userSegment",
                        "rolloutPercentage": 0,
                        "userSegments": ["premium", "beta"]
                    }"#).unwrap(),
                "emptySegmentFlag".to_string() => serde_json::from_str(r#"{
                        "name": "emptySegmentFlag",
                        "description": "no segment is allowed",
                        "rolloutStrategy": "userSegment",
                        "rolloutPercentage": 0,
                        "userSegments": []
                    }"#).unwrap(),
                "percentageFlag".to_string() => serde_json::from_str(r#"{
                        "name": "percentageFlag",
                        "description": "three percent of sessions",
                        "rolloutStrategy": "percentage",
                        "rolloutPercentage": 3,
                        "userSegments": []
                    }"#).unwrap(),
                "zeroPercentageFlag".to_string() => serde_json::from_str(r#"{
                        "name": "zeroPercentageFlag",
                        "description": "rollout not started",
                        "rolloutStrategy": "percentage",
                        "rolloutPercentage": 0,
                        "userSegments": []
                    }"#).unwrap(),
                "fullPercentageFlag".to_string() => serde_json::from_str(r#"{
                        "name": "fullPercentageFlag",
                        "description": "rollout finished",
                        "rolloutStrategy": "percentage",
                        "rolloutPercentage": 100,
                        "userSegments": []
                    }"#).unwrap(),
                "malformedFlag".to_string() => serde_json::from_str(r#"{
                        "name": "malformedFlag",
                        "description": "written by something newer",
                        "rolloutStrategy": "gradualRamp",
                        "rolloutPercentage": 30,
                        "userSegments": ["beta"]
                    }"#).unwrap(),
            },
        }
    }
}

impl Store for TestStore {
    fn flag(&self, flag_name: &str) -> Option<&FlagDefinition> {
        self.flags.get(flag_name)
    }
}

/// Storage that can be switched to fail every call, and records how often `save` was called.
#[derive(Default)]
pub struct FlakyStorage {
    pub records: Mutex<HashMap<String, String>>,
    pub fail_loads: bool,
    pub fail_saves: bool,
    pub saves: Mutex<usize>,
}

impl FlakyStorage {
    pub fn failing_saves() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    pub fn failing_loads() -> Self {
        Self {
            fail_loads: true,
            ..Self::default()
        }
    }
}

impl Storage for FlakyStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.fail_loads {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "load refused").into());
        }
        Ok(self.records.lock().get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        *self.saves.lock() += 1;
        if self.fail_saves {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full").into());
        }
        self.records.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
