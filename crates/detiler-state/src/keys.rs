//! Key layout of the persisted documents.

use detiler_core::TileKey;

use crate::error::{StoreError, StoreResult};

pub const TILE_KEY_PREFIX: &str = "tile";
pub const COOLDOWN_KEY_PREFIX: &str = "cooldown";
pub const KIT_KEY_PREFIX: &str = "kit";
/// Membership set of registered kit names.
pub const KITS_SET_KEY: &str = "kits";

pub const TILE_INDEX_NAME: &str = "idx:tiles";
pub const COOLDOWN_INDEX_NAME: &str = "idx:cooldowns";

/// `tile:{kit}:{z}/{x}/{y}`
pub fn tile_key(key: &TileKey) -> String {
    format!("{TILE_KEY_PREFIX}:{}:{}/{}/{}", key.kit, key.z, key.x, key.y)
}

/// `kit:{name}`
pub fn kit_key(name: &str) -> String {
    format!("{KIT_KEY_PREFIX}:{name}")
}

/// `cooldown:{hash}`
pub fn cooldown_key(hash: &str) -> String {
    format!("{COOLDOWN_KEY_PREFIX}:{hash}")
}

/// Kit names must be non-empty and free of control characters. Tag
/// predicates escape everything else.
pub fn validate_kit_name(name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::Validation("kit name must not be empty".to_string()));
    }
    if let Some(c) = name.chars().find(|c| c.is_control()) {
        return Err(StoreError::Validation(format!(
            "kit name {name:?} contains invalid character {c:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(tile_key(&TileKey::new("k1", 1, 0, 0)), "tile:k1:1/0/0");
        assert_eq!(kit_key("k1"), "kit:k1");
        assert_eq!(cooldown_key("abc"), "cooldown:abc");
    }

    #[test]
    fn kit_name_validation() {
        assert!(validate_kit_name("osm-bright_v2.1").is_ok());
        assert!(validate_kit_name("osm bright").is_ok());
        assert!(validate_kit_name("a|b").is_ok());
        assert!(validate_kit_name("").is_err());
        assert!(validate_kit_name("line\nbreak").is_err());
        assert!(validate_kit_name("tab\t").is_err());
    }
}
