//! Onion adjustment.
//!
//! When a query needs an onion below its current level, the outer layers
//! are removed on the server: one `UPDATE` rewrites the column through
//! nested decryption UDFs, the outermost layer's call innermost, and an
//! `ALTER TABLE` follows if the remaining layer needs another column type.
//! The metadata side of the change is a list of deltas: one `Delete` per
//! removed layer and a `Replace` of the onion.

use std::fmt;

use tracing::debug;

use crate::crypto::EncLayer;
use crate::delta::Delta;
use crate::enc_set::FieldRef;
use crate::error::{Error, Result};
use crate::onions::{Onion, SecLevel};
use crate::schema::{AnyMeta, MetaKey, MetaPath, SchemaInfo};
use crate::store::NodeKind;

/// Request to lower `onion` of `field` to `to_level`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionAdjustment {
    pub field: FieldRef,
    pub onion: Onion,
    pub to_level: SecLevel,
}

impl fmt::Display for OnionAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} to {}", self.field, self.onion, self.to_level)
    }
}

/// Everything needed to carry out one adjustment.
#[derive(Clone, Debug, PartialEq)]
pub struct AdjustPlan {
    pub adjustment: OnionAdjustment,
    pub deltas: Vec<Delta>,
    /// Statements rewriting the ciphertext column, run inside one
    /// transaction.
    pub updates: Vec<String>,
}

impl OnionAdjustment {
    /// Plans the adjustment against the current tree. Returns `None` if the
    /// onion is already at or below the requested level.
    pub fn plan(&self, schema: &SchemaInfo) -> Result<Option<AdjustPlan>> {
        let table = schema.get_table(&self.field.db, &self.field.table)?;
        let field = schema.get_field(&self.field)?;
        let om = field
            .onion(self.onion)
            .ok_or_else(|| Error::identifier_not_found(format!("{} {}", self.field, self.onion)))?;
        if om.level() <= self.to_level {
            debug!(adjustment = %self, current = %om.level(), "nothing to peel");
            return Ok(None);
        }

        let mut peeled = om.clone();
        let removed = peeled.peel_to(self.to_level)?;
        let salt = field.has_salt.then_some(field.salt_name.as_str());
        let mut value = om.anon_name.clone();
        for key in &removed {
            let layer = om
                .layer_meta(key)
                .ok_or_else(|| Error::metadata(format!("layer {key} of {} vanished", om.anon_name)))?;
            value = layer.layer.decrypt_udf(&value, salt)?;
        }
        let mut updates = vec![format!("UPDATE {} SET {} = {value}", table.anon_name, om.anon_name)];

        let column_type = |layers: Vec<&EncLayer>| {
            layers
                .last()
                .map_or(field.field_type.plain_column_type(), |l| l.column_type())
        };
        let (before, after) = (column_type(om.layers()), column_type(peeled.layers()));
        if before != after {
            updates.push(format!(
                "ALTER TABLE {} MODIFY {} {after}",
                table.anon_name, om.anon_name
            ));
        }

        let path = MetaPath::onion(&self.field, self.onion);
        let mut deltas: Vec<Delta> = removed
            .into_iter()
            .map(|key| Delta::Delete {
                parent: path.clone(),
                key,
                kind: NodeKind::Layer,
            })
            .collect();
        deltas.push(Delta::Replace {
            parent: MetaPath::field(&self.field),
            key: MetaKey::identity(self.onion.name()),
            meta: AnyMeta::Onion(peeled),
        });
        Ok(Some(AdjustPlan {
            adjustment: self.clone(),
            deltas,
            updates,
        }))
    }
}

impl AdjustPlan {
    /// The live transaction: the column rewrite plus the insert marking
    /// `completion_id` done on the server.
    pub fn transaction(&self, completion_table: &str, completion_id: u64) -> Vec<String> {
        let mut statements = vec!["START TRANSACTION".to_string()];
        statements.extend(self.updates.iter().cloned());
        statements.push(format!("INSERT INTO {completion_table} (completion_id) VALUES ({completion_id})"));
        statements.push("COMMIT".to_string());
        statements
    }

    /// Text recorded in the completion log.
    pub fn query(&self) -> String {
        self.updates.join("; ")
    }
}
