//! Registry of the record classes stored by a ledger node.
//!
//! Every key in a node's store starts with exactly one registered prefix. The
//! registry also records which classes carry consensus state (fed into
//! checksums) and which are produced differently depending on how the node
//! synced, so they are excluded from raw database comparison.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::KeyPrefix;

/// Description of one registered record class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixInfo {
    pub prefix: KeyPrefix,
    pub name: String,
    /// Records under this prefix are part of the ledger state.
    pub state_bearing: bool,
    /// Contents legitimately differ between full sync and hypersync.
    pub sync_path_dependent: bool,
}

impl PrefixInfo {
    /// A state-bearing record class.
    pub fn state(prefix: KeyPrefix, name: impl Into<String>) -> Self {
        Self {
            prefix,
            name: name.into(),
            state_bearing: true,
            sync_path_dependent: false,
        }
    }

    /// An auxiliary (index or bookkeeping) record class.
    pub fn auxiliary(prefix: KeyPrefix, name: impl Into<String>) -> Self {
        Self {
            prefix,
            name: name.into(),
            state_bearing: false,
            sync_path_dependent: false,
        }
    }

    /// Mark the class as dependent on the sync path.
    pub fn sync_path_dependent(mut self) -> Self {
        self.sync_path_dependent = true;
        self
    }
}

/// Ordered set of disjoint, registered prefixes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefixRegistry {
    classes: BTreeMap<KeyPrefix, PrefixInfo>,
}

impl PrefixRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record class.
    ///
    /// Fails if the prefix is already registered or if it is a prefix of (or
    /// prefixed by) a registered one, since keys must map to exactly one class.
    pub fn register(&mut self, info: PrefixInfo) -> Result<(), CoreError> {
        if self.classes.contains_key(&info.prefix) {
            return Err(CoreError::DuplicatePrefix(info.prefix));
        }
        if let Some(existing) = self.classes.keys().find(|p| p.overlaps(&info.prefix)) {
            return Err(CoreError::OverlappingPrefix {
                existing: existing.clone(),
                new: info.prefix,
            });
        }
        self.classes.insert(info.prefix.clone(), info);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, info: PrefixInfo) -> Result<Self, CoreError> {
        self.register(info)?;
        Ok(self)
    }

    /// All registered classes in ascending prefix order.
    pub fn classes(&self) -> impl Iterator<Item = &PrefixInfo> {
        self.classes.values()
    }

    /// Every registered prefix, ascending.
    pub fn all(&self) -> Vec<KeyPrefix> {
        self.classes.keys().cloned().collect()
    }

    /// State-bearing prefixes, ascending.
    pub fn state_prefixes(&self) -> Vec<KeyPrefix> {
        self.classes
            .values()
            .filter(|c| c.state_bearing)
            .map(|c| c.prefix.clone())
            .collect()
    }

    /// Prefixes whose contents must match regardless of sync path, ascending.
    pub fn comparable_prefixes(&self) -> Vec<KeyPrefix> {
        self.classes
            .values()
            .filter(|c| !c.sync_path_dependent)
            .map(|c| c.prefix.clone())
            .collect()
    }

    /// The record class `key` belongs to, if any.
    pub fn classify(&self, key: &[u8]) -> Option<&PrefixInfo> {
        self.classes.values().find(|c| c.prefix.matches(key))
    }

    /// Whether `key` belongs to a state-bearing class.
    pub fn is_state_key(&self, key: &[u8]) -> bool {
        self.classify(key).map_or(false, |c| c.state_bearing)
    }

    /// Look up a class by prefix.
    pub fn get(&self, prefix: &KeyPrefix) -> Option<&PrefixInfo> {
        self.classes.get(prefix)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PrefixRegistry {
        PrefixRegistry::new()
            .with(PrefixInfo::state(KeyPrefix::from_byte(0x02), "posts"))
            .unwrap()
            .with(PrefixInfo::state(KeyPrefix::from_byte(0x01), "balances"))
            .unwrap()
            .with(PrefixInfo::auxiliary(KeyPrefix::from_byte(0x03), "undo").sync_path_dependent())
            .unwrap()
            .with(PrefixInfo::auxiliary(KeyPrefix::from_byte(0x04), "block hashes"))
            .unwrap()
    }

    #[test]
    fn test_registry_orders_prefixes() {
        let hex: Vec<_> = registry().all().iter().map(KeyPrefix::to_hex).collect();
        assert_eq!(hex, vec!["01", "02", "03", "04"]);
    }

    #[test]
    fn test_state_and_comparable_views() {
        let reg = registry();
        let state: Vec<_> = reg.state_prefixes().iter().map(KeyPrefix::to_hex).collect();
        assert_eq!(state, vec!["01", "02"]);

        let comparable: Vec<_> = reg
            .comparable_prefixes()
            .iter()
            .map(KeyPrefix::to_hex)
            .collect();
        assert_eq!(comparable, vec!["01", "02", "04"]);
    }

    #[test]
    fn test_classify() {
        let reg = registry();
        assert_eq!(reg.classify(&[0x02, 0xff]).unwrap().name, "posts");
        assert!(reg.is_state_key(&[0x01, 0x00]));
        assert!(!reg.is_state_key(&[0x04, 0x00]));
        assert!(reg.classify(&[0x09]).is_none());
    }

    #[test]
    fn test_rejects_duplicate_and_overlap() {
        let mut reg = registry();
        assert!(matches!(
            reg.register(PrefixInfo::state(KeyPrefix::from_byte(0x01), "again")),
            Err(CoreError::DuplicatePrefix(_))
        ));
        let nested = KeyPrefix::new(vec![0x01, 0x07]).unwrap();
        assert!(matches!(
            reg.register(PrefixInfo::state(nested, "nested")),
            Err(CoreError::OverlappingPrefix { .. })
        ));
    }
}
