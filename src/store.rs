//! Persistence of the metadata tree and of the completion log.
//!
//! Every kind of node has two tables: an object table holding the node's
//! own serialization, and a join table linking it to its parent under a
//! serialized key. Children of a node are found by joining on `parent_id`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Node kinds, one pair of tables each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Database,
    Table,
    Field,
    Onion,
    Layer,
}

pub const ALL_KINDS: [NodeKind; 5] = [
    NodeKind::Database,
    NodeKind::Table,
    NodeKind::Field,
    NodeKind::Onion,
    NodeKind::Layer,
];

/// Name of the metadata database on the proxy side.
pub const PDB: &str = "pdb";

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Database => "DatabaseMeta",
            NodeKind::Table => "TableMeta",
            NodeKind::Field => "FieldMeta",
            NodeKind::Onion => "OnionMeta",
            NodeKind::Layer => "EncLayer",
        }
    }

    pub fn object_table(&self) -> String {
        format!("{PDB}.`{}`", self.name())
    }

    pub fn join_table(&self) -> String {
        format!("{PDB}.`{}_join`", self.name())
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionType {
    Ddl,
    AdjustOnion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Applied,
    Failed,
}

impl fmt::Display for CompletionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompletionType::Ddl => "DDL",
            CompletionType::AdjustOnion => "ADJUST_ONION",
        })
    }
}

impl FromStr for CompletionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DDL" => Ok(CompletionType::Ddl),
            "ADJUST_ONION" => Ok(CompletionType::AdjustOnion),
            _ => Err(Error::metadata(format!("unknown completion type `{s}`"))),
        }
    }
}

/// Durable record written before a schema-changing statement runs.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRecord {
    pub id: u64,
    pub kind: CompletionType,
    /// The statements to run on the live database.
    pub query: String,
    /// Serialized deltas to apply once the statements succeed.
    pub deltas: Vec<String>,
    pub state: CompletionState,
}

/// A child as found through the join table.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredChild {
    pub object_id: u64,
    pub key: String,
    pub serial: String,
}

/// Storage for the metadata tree.
pub trait MetaStore: Send {
    /// Stores a node's serialization and returns its new id.
    fn insert_object(&mut self, kind: NodeKind, serial: &str) -> Result<u64>;
    fn update_object(&mut self, kind: NodeKind, id: u64, serial: &str) -> Result<()>;
    fn delete_object(&mut self, kind: NodeKind, id: u64) -> Result<()>;
    /// Records that `object_id` is the child of `parent_id` under `key`.
    fn link(&mut self, kind: NodeKind, object_id: u64, parent_id: u64, key: &str) -> Result<()>;
    fn unlink(&mut self, kind: NodeKind, object_id: u64) -> Result<()>;
    fn children(&self, kind: NodeKind, parent_id: u64) -> Result<Vec<StoredChild>>;

    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    fn log_completion(&mut self, kind: CompletionType, query: &str, deltas: &[String]) -> Result<u64>;
    fn set_completion_state(&mut self, id: u64, state: CompletionState) -> Result<()>;
    fn completions(&self) -> Result<Vec<CompletionRecord>>;
}

/// Statements creating the metadata tables on a SQL-backed store.
pub fn pdb_ddl() -> Vec<String> {
    let mut result = vec![format!("CREATE DATABASE IF NOT EXISTS {PDB}")];
    for kind in ALL_KINDS {
        result.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (serial_object VARBINARY(500) NOT NULL, \
             serial_object_len BIGINT NOT NULL, id SERIAL PRIMARY KEY) ENGINE=InnoDB",
            kind.object_table()
        ));
        result.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (object_id BIGINT NOT NULL UNIQUE, \
             parent_id BIGINT NOT NULL, serial_key VARBINARY(500) NOT NULL, \
             serial_key_len BIGINT NOT NULL, id SERIAL PRIMARY KEY) ENGINE=InnoDB",
            kind.join_table()
        ));
    }
    result.push(format!(
        "CREATE TABLE IF NOT EXISTS {PDB}.embedded_completion (id SERIAL PRIMARY KEY, \
         type VARCHAR(100) NOT NULL, query BLOB NOT NULL, deltas BLOB NOT NULL, \
         state VARCHAR(20) NOT NULL) ENGINE=InnoDB"
    ));
    result
}

#[derive(Clone, Debug, PartialEq)]
struct ObjectRow {
    serial_object: String,
    serial_object_len: usize,
}

#[derive(Clone, Debug, PartialEq)]
struct JoinRow {
    object_id: u64,
    parent_id: u64,
    serial_key: String,
    serial_key_len: usize,
}

#[derive(Clone, Debug, Default)]
struct Tables {
    objects: HashMap<NodeKind, BTreeMap<u64, ObjectRow>>,
    joins: HashMap<NodeKind, BTreeMap<u64, JoinRow>>,
    completions: BTreeMap<u64, CompletionRecord>,
    next_id: u64,
}

impl Tables {
    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory store with the same row layout as the SQL tables.
///
/// `begin` takes a copy of all tables that `rollback` restores.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Tables,
    saved: Option<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self, kind: NodeKind) -> usize {
        self.tables.objects.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Overwrites a stored serialization without touching its recorded
    /// length, the way a torn write would.
    #[cfg(test)]
    pub fn corrupt(&mut self, kind: NodeKind, id: u64, serial: &str) {
        if let Some(row) = self.tables.objects.get_mut(&kind).and_then(|t| t.get_mut(&id)) {
            row.serial_object = serial.to_string();
        }
    }
}

impl MetaStore for MemoryStore {
    fn insert_object(&mut self, kind: NodeKind, serial: &str) -> Result<u64> {
        let id = self.tables.fresh_id();
        self.tables.objects.entry(kind).or_default().insert(
            id,
            ObjectRow {
                serial_object: serial.to_string(),
                serial_object_len: serial.len(),
            },
        );
        debug!(%kind, id, "metadata object inserted");
        Ok(id)
    }

    fn update_object(&mut self, kind: NodeKind, id: u64, serial: &str) -> Result<()> {
        let row = self
            .tables
            .objects
            .get_mut(&kind)
            .and_then(|t| t.get_mut(&id))
            .ok_or_else(|| Error::metadata(format!("no {kind} object with id {id}")))?;
        row.serial_object = serial.to_string();
        row.serial_object_len = serial.len();
        Ok(())
    }

    fn delete_object(&mut self, kind: NodeKind, id: u64) -> Result<()> {
        self.tables
            .objects
            .get_mut(&kind)
            .and_then(|t| t.remove(&id))
            .map(|_| ())
            .ok_or_else(|| Error::metadata(format!("no {kind} object with id {id}")))
    }

    fn link(&mut self, kind: NodeKind, object_id: u64, parent_id: u64, key: &str) -> Result<()> {
        let joins = self.tables.joins.entry(kind).or_default();
        if joins
            .values()
            .any(|j| j.parent_id == parent_id && j.serial_key == key)
        {
            return Err(Error::metadata(format!(
                "{kind} {parent_id} already has a child with key {key}"
            )));
        }
        let id = self.tables.fresh_id();
        self.tables.joins.entry(kind).or_default().insert(
            id,
            JoinRow {
                object_id,
                parent_id,
                serial_key: key.to_string(),
                serial_key_len: key.len(),
            },
        );
        Ok(())
    }

    fn unlink(&mut self, kind: NodeKind, object_id: u64) -> Result<()> {
        let joins = self
            .tables
            .joins
            .get_mut(&kind)
            .ok_or_else(|| Error::metadata(format!("no {kind} links")))?;
        let before = joins.len();
        joins.retain(|_, j| j.object_id != object_id);
        if joins.len() == before {
            return Err(Error::metadata(format!("{kind} {object_id} is not linked")));
        }
        Ok(())
    }

    fn children(&self, kind: NodeKind, parent_id: u64) -> Result<Vec<StoredChild>> {
        let (Some(joins), Some(objects)) = (self.tables.joins.get(&kind), self.tables.objects.get(&kind))
        else {
            return Ok(Vec::new());
        };
        let mut result = Vec::new();
        for join in joins.values().filter(|j| j.parent_id == parent_id) {
            let object = objects.get(&join.object_id).ok_or_else(|| {
                Error::metadata(format!("{kind} link points at missing object {}", join.object_id))
            })?;
            if object.serial_object.len() != object.serial_object_len
                || join.serial_key.len() != join.serial_key_len
            {
                return Err(Error::metadata(format!(
                    "{kind} {} has a serialization-length mismatch",
                    join.object_id
                )));
            }
            result.push(StoredChild {
                object_id: join.object_id,
                key: join.serial_key.clone(),
                serial: object.serial_object.clone(),
            });
        }
        Ok(result)
    }

    fn begin(&mut self) -> Result<()> {
        if self.saved.is_some() {
            return Err(Error::metadata("metadata transaction already open"));
        }
        self.saved = Some(self.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.saved
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::metadata("no metadata transaction to commit"))
    }

    fn rollback(&mut self) -> Result<()> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| Error::metadata("no metadata transaction to roll back"))?;
        self.tables = saved;
        Ok(())
    }

    fn log_completion(&mut self, kind: CompletionType, query: &str, deltas: &[String]) -> Result<u64> {
        let id = self.tables.fresh_id();
        self.tables.completions.insert(
            id,
            CompletionRecord {
                id,
                kind,
                query: query.to_string(),
                deltas: deltas.to_vec(),
                state: CompletionState::Pending,
            },
        );
        info!(id, %kind, "completion record written");
        Ok(id)
    }

    fn set_completion_state(&mut self, id: u64, state: CompletionState) -> Result<()> {
        let record = self
            .tables
            .completions
            .get_mut(&id)
            .ok_or_else(|| Error::metadata(format!("no completion record {id}")))?;
        record.state = state;
        info!(id, ?state, "completion record updated");
        Ok(())
    }

    fn completions(&self) -> Result<Vec<CompletionRecord>> {
        Ok(self.tables.completions.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_are_found_by_parent() {
        let mut store = MemoryStore::new();
        let a = store.insert_object(NodeKind::Table, "a").unwrap();
        let b = store.insert_object(NodeKind::Table, "bb").unwrap();
        store.link(NodeKind::Table, a, 1, "k1").unwrap();
        store.link(NodeKind::Table, b, 2, "k2").unwrap();
        let children = store.children(NodeKind::Table, 1).unwrap();
        assert_eq!(
            children,
            vec![StoredChild {
                object_id: a,
                key: "k1".into(),
                serial: "a".into()
            }]
        );
        assert!(store.link(NodeKind::Table, b, 1, "k1").is_err());
    }

    #[test]
    fn length_mismatch_is_detected() {
        let mut store = MemoryStore::new();
        let a = store.insert_object(NodeKind::Field, "abc").unwrap();
        store.link(NodeKind::Field, a, 7, "k").unwrap();
        store.corrupt(NodeKind::Field, a, "abcd");
        assert!(matches!(
            store.children(NodeKind::Field, 7),
            Err(Error::MetadataConsistency { .. })
        ));
    }

    #[test]
    fn rollback_restores_rows() {
        let mut store = MemoryStore::new();
        store.begin().unwrap();
        store.insert_object(NodeKind::Onion, "x").unwrap();
        assert_eq!(store.object_count(NodeKind::Onion), 1);
        store.rollback().unwrap();
        assert_eq!(store.object_count(NodeKind::Onion), 0);
        assert!(store.commit().is_err());
    }

    #[test]
    fn completion_log() {
        let mut store = MemoryStore::new();
        let id = store
            .log_completion(CompletionType::AdjustOnion, "UPDATE t SET c = 1", &["d".into()])
            .unwrap();
        store.set_completion_state(id, CompletionState::Applied).unwrap();
        let records = store.completions().unwrap();
        assert_eq!(records[0].state, CompletionState::Applied);
        assert_eq!(records[0].deltas, vec!["d".to_string()]);
        assert!(store.set_completion_state(id + 1, CompletionState::Failed).is_err());
    }

    #[test]
    fn ddl_has_a_table_pair_per_kind() {
        let ddl = pdb_ddl();
        assert_eq!(ddl.len(), 2 + 2 * ALL_KINDS.len());
        assert!(ddl.iter().any(|s| s.contains("pdb.`OnionMeta_join`")
            && s.contains("serial_key_len")));
        assert!(ddl.iter().any(|s| s.contains("pdb.`FieldMeta`") && s.contains("serial_object_len")));
    }
}
