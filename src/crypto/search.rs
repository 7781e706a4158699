//! Keyword search layer.
//!
//! A text is stored as the concatenation of 8-byte keyed tokens, one per
//! distinct lower-cased word. Searching for a word means handing the server
//! the word's token, which it looks for among the stored ones. The words
//! themselves cannot be recovered.

use std::collections::BTreeSet;

use crate::crypto::prf::{prf, LayerKey};
use crate::encoding::Value;
use crate::error::{Error, Result};

pub const TOKEN_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchLayer {
    pub key: LayerKey,
}

fn words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl SearchLayer {
    pub fn token(&self, word: &str) -> Result<Vec<u8>> {
        let full = prf(&self.key, &[word.to_lowercase().as_bytes()])?;
        Ok(full[..TOKEN_LEN].to_vec())
    }

    pub fn encrypt(&self, v: &Value) -> Result<Value> {
        let bytes = v.to_bytes()?;
        let text = String::from_utf8_lossy(&bytes);
        let mut out = Vec::new();
        for word in words(&text) {
            out.extend(self.token(&word)?);
        }
        Ok(Value::Blob(out))
    }

    /// What the server-side search function does with a stored value.
    pub fn matches(stored: &[u8], token: &[u8]) -> bool {
        stored.chunks(TOKEN_LEN).any(|chunk| chunk == token)
    }

    /// Extracts the keyword out of a `LIKE` pattern of the form `%word%`.
    pub fn keyword(pattern: &str) -> Result<String> {
        let inner = pattern
            .strip_prefix('%')
            .and_then(|p| p.strip_suffix('%'))
            .ok_or_else(|| Error::text(format!("only '%word%' patterns can be searched, got '{pattern}'")))?;
        if inner.is_empty() || inner.chars().any(|c| !c.is_alphanumeric()) {
            return Err(Error::text(format!("'{pattern}' does not search for a single word")));
        }
        Ok(inner.to_string())
    }
}
