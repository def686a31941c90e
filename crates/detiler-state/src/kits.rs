//! Registered rendering kits and their running aggregates.

use std::collections::BTreeMap;

use detiler_core::KitMetadata;
use tracing::{debug, info, warn};

use crate::engine::{Engine, Transaction};
use crate::error::{StoreError, StoreResult};
use crate::keys::{KITS_SET_KEY, kit_key, validate_kit_name};

/// Hash field holding the highest state ever written for the kit.
pub const MAX_STATE_FIELD: &str = "maxState";
/// Hash field holding the latest tile `updatedAt` seen for the kit.
pub const MAX_UPDATED_AT_FIELD: &str = "maxUpdatedAt";

const NAME_FIELD: &str = "name";

#[derive(Clone)]
pub struct KitRegistry {
    engine: Engine,
}

impl KitRegistry {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Register a kit. The attribute hash and the membership entry are
    /// written in one watched transaction.
    pub fn register(&self, kit: &KitMetadata) -> StoreResult<()> {
        validate_kit_name(&kit.name)?;
        let key = kit_key(&kit.name);

        let mut session = self.engine.isolated();
        session.watch(&key)?;
        if session.exists(&key)? {
            warn!(kit = %kit.name, "kit already registered");
            return Err(StoreError::AlreadyExists(format!("kit {}", kit.name)));
        }

        let mut fields: BTreeMap<String, String> = kit.attributes.clone();
        fields.insert(NAME_FIELD.to_string(), kit.name.clone());
        fields.insert(MAX_UPDATED_AT_FIELD.to_string(), "0".to_string());
        fields.insert(MAX_STATE_FIELD.to_string(), "0".to_string());

        let mut txn = Transaction::new();
        txn.hash_set(&key, fields).set_add(KITS_SET_KEY, &kit.name);
        session.exec(txn)?;
        info!(kit = %kit.name, "kit registered");
        Ok(())
    }

    pub fn exists(&self, name: &str) -> StoreResult<bool> {
        self.engine.exists(&kit_key(name))
    }

    pub fn get(&self, name: &str) -> StoreResult<KitMetadata> {
        self.engine
            .hash_get_all(&kit_key(name))?
            .map(|fields| to_metadata(name, fields))
            .ok_or_else(|| StoreError::NotFound(format!("kit {name}")))
    }

    /// Every registered kit. Names in the membership set without an
    /// attribute hash come back as name only.
    pub fn list_all(&self) -> StoreResult<Vec<KitMetadata>> {
        let names = self.engine.set_members(KITS_SET_KEY)?;
        let keys: Vec<String> = names.iter().map(|n| kit_key(n)).collect();
        let hashes = self.engine.hash_mget(&keys)?;
        let kits = names
            .into_iter()
            .zip(hashes)
            .map(|(name, fields)| match fields {
                Some(fields) => to_metadata(&name, fields),
                None => {
                    debug!(kit = %name, "kit listed without attributes");
                    KitMetadata::new(name)
                }
            })
            .collect();
        Ok(kits)
    }

    /// Add the running-aggregate updates for one tile write to `txn`.
    pub(crate) fn track_write(txn: &mut Transaction, kit: &str, state: i64, updated_at: u64) {
        let key = kit_key(kit);
        txn.hash_max(&key, MAX_STATE_FIELD, state).hash_max(
            &key,
            MAX_UPDATED_AT_FIELD,
            i64::try_from(updated_at).unwrap_or(i64::MAX),
        );
    }
}

fn to_metadata(name: &str, mut fields: BTreeMap<String, String>) -> KitMetadata {
    let name = fields.remove(NAME_FIELD).unwrap_or_else(|| name.to_string());
    KitMetadata {
        name,
        attributes: fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> KitRegistry {
        KitRegistry::new(Engine::open_in_memory().unwrap())
    }

    #[test]
    fn register_and_get() {
        let kits = registry();
        kits.register(&KitMetadata::new("osm").with_attribute("style", "bright"))
            .unwrap();

        assert!(kits.exists("osm").unwrap());
        assert!(!kits.exists("other").unwrap());

        let kit = kits.get("osm").unwrap();
        assert_eq!(kit.name, "osm");
        assert_eq!(kit.attributes["style"], "bright");
        assert_eq!(kit.attributes[MAX_STATE_FIELD], "0");
        assert_eq!(kit.attributes[MAX_UPDATED_AT_FIELD], "0");
        assert!(matches!(kits.get("other"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let kits = registry();
        kits.register(&KitMetadata::new("osm")).unwrap();
        assert!(matches!(
            kits.register(&KitMetadata::new("osm").with_attribute("a", "b")),
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(!kits.get("osm").unwrap().attributes.contains_key("a"));
    }

    #[test]
    fn invalid_name_is_rejected() {
        let kits = registry();
        assert!(matches!(
            kits.register(&KitMetadata::new("a\nb")),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn list_all_includes_names_without_hash() {
        let engine = Engine::open_in_memory().unwrap();
        let kits = KitRegistry::new(engine.clone());
        kits.register(&KitMetadata::new("a")).unwrap();
        kits.register(&KitMetadata::new("b")).unwrap();

        // membership entry left without its hash
        let mut txn = Transaction::new();
        txn.set_add(KITS_SET_KEY, "legacy");
        engine.exec(txn).unwrap();

        let mut names: Vec<_> = kits.list_all().unwrap().into_iter().map(|k| k.name).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "legacy"]);

        let legacy = kits.list_all().unwrap().into_iter().find(|k| k.name == "legacy").unwrap();
        assert!(legacy.attributes.is_empty());
    }

    #[test]
    fn track_write_raises_aggregates() {
        let engine = Engine::open_in_memory().unwrap();
        let kits = KitRegistry::new(engine.clone());
        kits.register(&KitMetadata::new("a")).unwrap();

        for (state, at) in [(5, 2000), (3, 1000), (-1, 3000)] {
            let mut txn = Transaction::new();
            KitRegistry::track_write(&mut txn, "a", state, at);
            engine.exec(txn).unwrap();
        }

        let kit = kits.get("a").unwrap();
        assert_eq!(kit.attributes[MAX_STATE_FIELD], "5");
        assert_eq!(kit.attributes[MAX_UPDATED_AT_FIELD], "3000");
    }

    #[test]
    fn list_all_empty() {
        assert!(registry().list_all().unwrap().is_empty());
    }
}
