//! Pending changes to the metadata tree.
//!
//! Deltas are collected while a statement is analyzed, written to the
//! completion log before anything touches the live database, and applied
//! to the tree and the store once the live statements have succeeded.

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::schema::{AnyMeta, MetaKey, MetaPath, SchemaInfo};
use crate::serial::{Deserializer, Serializer};
use crate::store::{CompletionState, CompletionType, MetaStore, NodeKind, ALL_KINDS};

#[derive(Clone, Debug, PartialEq)]
pub enum Delta {
    /// Adds `meta`, with its subtree, under the node at `parent`.
    Create {
        parent: MetaPath,
        key: MetaKey,
        meta: AnyMeta,
    },
    /// Replaces the attributes of an existing child. Its children stay.
    Replace {
        parent: MetaPath,
        key: MetaKey,
        meta: AnyMeta,
    },
    /// Removes a child and its subtree.
    Delete {
        parent: MetaPath,
        key: MetaKey,
        kind: NodeKind,
    },
}

fn kind_from_name(name: &str) -> Result<NodeKind> {
    ALL_KINDS
        .into_iter()
        .find(|k| k.name() == name)
        .ok_or_else(|| Error::metadata(format!("unknown node kind `{name}`")))
}

impl Delta {
    pub fn parent(&self) -> &MetaPath {
        match self {
            Delta::Create { parent, .. } | Delta::Replace { parent, .. } | Delta::Delete { parent, .. } => parent,
        }
    }

    pub fn key(&self) -> &MetaKey {
        match self {
            Delta::Create { key, .. } | Delta::Replace { key, .. } | Delta::Delete { key, .. } => key,
        }
    }

    /// Applies the delta to the in-memory tree and to the store.
    pub fn apply(&self, schema: &mut SchemaInfo, store: &mut dyn MetaStore) -> Result<()> {
        if let Some(MetaKey::Identity(db)) = self.parent().0.first() {
            schema.load_database(&*store, db)?;
        }
        let node = schema.node_mut(self.parent())?;
        match self {
            Delta::Create { key, meta, .. } => {
                if node.get(key).is_some() {
                    return Err(Error::metadata(format!(
                        "{}/{key} already exists",
                        self.parent()
                    )));
                }
                let mut meta = meta.clone();
                meta.save(store, node.db_id()?, key)?;
                node.add(key.clone(), meta)?;
            }
            Delta::Replace { key, meta, .. } => {
                let old = node.get(key).ok_or_else(|| {
                    Error::metadata(format!("{}/{key} does not exist", self.parent()))
                })?;
                let id = old
                    .db_id()
                    .ok_or_else(|| Error::metadata(format!("{}/{key} has not been saved", self.parent())))?;
                let mut meta = meta.clone();
                meta.adopt_children(old)?;
                meta.set_db_id(id);
                meta.update(store)?;
                node.replace(key, meta)?;
            }
            Delta::Delete { key, kind, .. } => {
                let old = node.destroy(key)?;
                if old.kind() != *kind {
                    return Err(Error::metadata(format!(
                        "{}/{key} is a {}, not a {kind}",
                        self.parent(),
                        old.kind()
                    )));
                }
                old.erase(store)?;
            }
        }
        info!(delta = %self, "delta applied");
        Ok(())
    }

    pub fn serialize(&self) -> String {
        let (tag, kind, tree) = match self {
            Delta::Create { meta, .. } => ("C", meta.kind(), meta.serialize_tree()),
            Delta::Replace { meta, .. } => ("R", meta.kind(), meta.serialize_tree()),
            Delta::Delete { kind, .. } => ("D", *kind, String::new()),
        };
        Serializer::new()
            .field(tag)
            .field(self.parent().serialize())
            .field(self.key().serialize())
            .field(kind)
            .field(tree)
            .finish()
    }

    pub fn deserialize(serial: &str) -> Result<Self> {
        let mut d = Deserializer::new(serial);
        let tag = d.next_field()?;
        let parent = MetaPath::deserialize(d.next_field()?)?;
        let key = MetaKey::deserialize(d.next_field()?)?;
        let kind = kind_from_name(d.next_field()?)?;
        let tree = d.next_field()?;
        match tag {
            "C" => Ok(Delta::Create {
                meta: AnyMeta::deserialize_tree(kind, &key, tree)?,
                parent,
                key,
            }),
            "R" => Ok(Delta::Replace {
                meta: AnyMeta::deserialize_tree(kind, &key, tree)?,
                parent,
                key,
            }),
            "D" => Ok(Delta::Delete { parent, key, kind }),
            other => Err(Error::metadata(format!("unknown delta tag `{other}`"))),
        }
    }
}

impl std::fmt::Display for Delta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (verb, kind) = match self {
            Delta::Create { meta, .. } => ("create", meta.kind()),
            Delta::Replace { meta, .. } => ("replace", meta.kind()),
            Delta::Delete { kind, .. } => ("delete", *kind),
        };
        let parent = self.parent().to_string();
        let sep = if parent.ends_with('/') { "" } else { "/" };
        write!(f, "{verb} {kind} {parent}{sep}{}", self.key())
    }
}

pub fn write_deltas(deltas: &[Delta]) -> Vec<String> {
    deltas.iter().map(Delta::serialize).collect()
}

pub fn read_deltas(serials: &[String]) -> Result<Vec<Delta>> {
    serials.iter().map(|s| Delta::deserialize(s)).collect()
}

/// Logs the deltas of `query` before it runs. Returns the completion id.
pub fn delta_output_before_query(
    store: &mut dyn MetaStore,
    kind: CompletionType,
    query: &str,
    deltas: &[Delta],
) -> Result<u64> {
    store.log_completion(kind, query, &write_deltas(deltas))
}

/// Applies the deltas of a completed query in one store transaction and
/// marks the completion record applied. On failure nothing is applied and
/// the record stays pending: the live side has already committed.
pub fn delta_output_after_query(
    schema: &mut SchemaInfo,
    store: &mut dyn MetaStore,
    completion_id: u64,
    deltas: &[Delta],
) -> Result<()> {
    let mut scratch = schema.clone();
    store.begin()?;
    let applied = deltas
        .iter()
        .try_for_each(|delta| delta.apply(&mut scratch, store));
    match applied {
        Ok(()) => {
            store.commit()?;
            store.set_completion_state(completion_id, CompletionState::Applied)?;
            *schema = scratch;
            Ok(())
        }
        Err(e) => {
            warn!(completion_id, error = %e, "deltas could not be applied");
            store.rollback()?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enc_set::FieldRef;
    use crate::onions::{Onion, SecLevel};
    use crate::schema::tests::emp_table;
    use crate::schema::{DatabaseMeta, DbMeta, ROOT_ID};
    use crate::store::MemoryStore;

    fn bootstrap() -> (SchemaInfo, MemoryStore) {
        let mut schema = SchemaInfo::new();
        let mut store = MemoryStore::new();
        let deltas = vec![
            Delta::Create {
                parent: MetaPath::root(),
                key: MetaKey::identity("db"),
                meta: AnyMeta::Database(DatabaseMeta::new("db")),
            },
            Delta::Create {
                parent: MetaPath::database("db"),
                key: MetaKey::identity("emp"),
                meta: AnyMeta::Table(emp_table()),
            },
        ];
        let id = delta_output_before_query(&mut store, CompletionType::Ddl, "CREATE TABLE emp", &deltas).unwrap();
        delta_output_after_query(&mut schema, &mut store, id, &deltas).unwrap();
        (schema, store)
    }

    fn peel_deltas(schema: &SchemaInfo, field: &FieldRef, onion: Onion, level: SecLevel) -> Vec<Delta> {
        let mut om = schema.get_field(field).unwrap().onion(onion).unwrap().clone();
        let removed = om.peel_to(level).unwrap();
        let path = MetaPath::onion(field, onion);
        let mut deltas: Vec<Delta> = removed
            .into_iter()
            .map(|key| Delta::Delete {
                parent: path.clone(),
                key,
                kind: NodeKind::Layer,
            })
            .collect();
        deltas.push(Delta::Replace {
            parent: MetaPath::field(field),
            key: MetaKey::identity(onion.name()),
            meta: AnyMeta::Onion(om),
        });
        deltas
    }

    #[test]
    fn created_tree_is_persisted() {
        let (schema, store) = bootstrap();
        let loaded = SchemaInfo::load_all(&store).unwrap();
        assert_eq!(
            loaded.table("db", "emp").unwrap().anon_name,
            schema.table("db", "emp").unwrap().anon_name
        );
        assert!(schema.table("db", "emp").unwrap().db_id.is_some());
        let records = store.completions().unwrap();
        assert_eq!(records[0].state, CompletionState::Applied);
    }

    #[test]
    fn peeling_through_deltas() {
        let (mut schema, mut store) = bootstrap();
        let field = FieldRef::new("db", "emp", "id");
        let deltas = peel_deltas(&schema, &field, Onion::Ord, SecLevel::Ope);
        assert_eq!(deltas.len(), 2);
        let id = delta_output_before_query(&mut store, CompletionType::AdjustOnion, "", &deltas).unwrap();
        delta_output_after_query(&mut schema, &mut store, id, &deltas).unwrap();
        let om = schema.get_field(&field).unwrap().onion(Onion::Ord).unwrap();
        assert_eq!(om.level(), SecLevel::Ope);

        let loaded = SchemaInfo::load_all(&store).unwrap();
        let om = loaded.get_field(&field).unwrap().onion(Onion::Ord).unwrap();
        assert_eq!(om.level(), SecLevel::Ope);
        assert_eq!(om.layers().len(), 1);
    }

    #[test]
    fn failed_application_changes_nothing() {
        let (mut schema, mut store) = bootstrap();
        let field = FieldRef::new("db", "emp", "id");
        let mut deltas = peel_deltas(&schema, &field, Onion::Det, SecLevel::Det);
        deltas.push(Delta::Delete {
            parent: MetaPath::table("db", "emp"),
            key: MetaKey::identity("nope"),
            kind: NodeKind::Field,
        });
        let before = schema.clone();
        let id = delta_output_before_query(&mut store, CompletionType::AdjustOnion, "", &deltas).unwrap();
        assert!(delta_output_after_query(&mut schema, &mut store, id, &deltas).is_err());
        assert_eq!(schema, before);
        let loaded = SchemaInfo::load_all(&store).unwrap();
        let om = loaded.get_field(&field).unwrap().onion(Onion::Det).unwrap();
        assert_eq!(om.level(), SecLevel::Rnd);
        let record = store.completions().unwrap().pop().unwrap();
        assert_eq!(record.state, CompletionState::Pending);
    }

    #[test]
    fn deltas_load_their_database_first() {
        let (_, mut store) = bootstrap();
        let mut schema = SchemaInfo::load(&store).unwrap();
        assert!(schema.table("db", "emp").is_none());
        let deltas = vec![Delta::Create {
            parent: MetaPath::database("db"),
            key: MetaKey::identity("dept"),
            meta: AnyMeta::Table(crate::schema::TableMeta::new("dept", false)),
        }];
        let id = delta_output_before_query(&mut store, CompletionType::Ddl, "CREATE TABLE dept", &deltas).unwrap();
        delta_output_after_query(&mut schema, &mut store, id, &deltas).unwrap();
        assert!(schema.table("db", "emp").is_some());
        assert!(schema.table("db", "dept").is_some());
        let loaded = SchemaInfo::load_all(&store).unwrap();
        assert_eq!(loaded.database("db").unwrap().tables().count(), 2);
    }

    #[test]
    fn deltas_survive_the_log() {
        let (schema, _) = bootstrap();
        let field = FieldRef::new("db", "emp", "salary");
        let deltas = peel_deltas(&schema, &field, Onion::Det, SecLevel::DetJoin);
        let back = read_deltas(&write_deltas(&deltas)).unwrap();
        assert_eq!(back.len(), deltas.len());
        for (a, b) in back.iter().zip(&deltas) {
            assert_eq!(a.to_string(), b.to_string());
        }
        let created = Delta::Create {
            parent: MetaPath::database("db"),
            key: MetaKey::identity("emp"),
            meta: AnyMeta::Table(emp_table()),
        };
        let back = Delta::deserialize(&created.serialize()).unwrap();
        assert_eq!(back, created);
    }

    #[test]
    fn replayed_replace_keeps_layer_ids() {
        let (mut schema, mut store) = bootstrap();
        let field = FieldRef::new("db", "emp", "name");
        let deltas = read_deltas(&write_deltas(&peel_deltas(&schema, &field, Onion::Det, SecLevel::Det))).unwrap();
        let id = delta_output_before_query(&mut store, CompletionType::AdjustOnion, "", &deltas).unwrap();
        delta_output_after_query(&mut schema, &mut store, id, &deltas).unwrap();
        let om = schema.get_field(&field).unwrap().onion(Onion::Det).unwrap();
        let ids: Vec<_> = om.layers_outside_in().iter().map(|(_, l)| l.db_id).collect();
        assert!(ids.iter().all(Option::is_some));
        assert!(om.persisted_id().unwrap() > ROOT_ID);
    }
}
