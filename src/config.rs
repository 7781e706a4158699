//! Proxy configuration.

use rand::RngCore;

use crate::crypto::LayerKey;
use crate::error::{Error, Result};
use crate::onions::SecurityRating;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Root of every layer key.
    pub master_key: LayerKey,
    /// Database statements refer to when they do not name one.
    pub default_db: String,
    /// Rating of new columns. AUTO_INCREMENT columns are always plain.
    pub default_rating: SecurityRating,
    /// Run the predicate simplifier before gather.
    pub simplify_predicates: bool,
    /// How many onion adjustments one statement may trigger.
    pub max_adjust_attempts: usize,
    /// Server table recording finished adjustments, used by recovery.
    pub completion_table: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let mut master_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut master_key);
        Self {
            master_key,
            default_db: "cryptdb".to_string(),
            default_rating: SecurityRating::Sensitive,
            simplify_predicates: true,
            max_adjust_attempts: 8,
            completion_table: "cdb_remote_completion".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn with_master_key(master_key: LayerKey) -> Self {
        Self {
            master_key,
            ..Self::default()
        }
    }

    /// DDL of the server-side completion table.
    pub fn completion_table_ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (id SERIAL PRIMARY KEY, completion_id BIGINT UNSIGNED NOT NULL)",
            self.completion_table
        )
    }
}

/// Parses a 64 digit hexadecimal master key.
pub fn parse_master_key(text: &str) -> Result<LayerKey> {
    hex::decode(text.trim())
        .ok()
        .and_then(|k| k.try_into().ok())
        .ok_or_else(|| Error::text("the master key must be 64 hexadecimal digits"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let a = ProxyConfig::default();
        let b = ProxyConfig::default();
        assert_ne!(a.master_key, b.master_key);
        assert_eq!(a.default_db, "cryptdb");
        assert_eq!(a.max_adjust_attempts, 8);
        assert!(a.completion_table_ddl().contains("cdb_remote_completion"));
        let fixed = ProxyConfig::with_master_key([7; 32]);
        assert_eq!(fixed.master_key, [7; 32]);
        assert!(fixed.simplify_predicates);
    }

    #[test]
    fn master_key_parsing() {
        let key = parse_master_key(&"0a".repeat(32)).unwrap();
        assert_eq!(key, [10; 32]);
        assert!(parse_master_key("0a0b").is_err());
        assert!(parse_master_key(&"zz".repeat(32)).is_err());
    }
}
