//! The metadata tree.
//!
//! `SchemaInfo → DatabaseMeta → TableMeta → FieldMeta → OnionMeta →
//! LayerMeta`. Every node owns its children through a [`MappedMeta`], a
//! keyed list whose keys are compared by value, since keys are rebuilt from
//! persisted data. Nodes get their id from the [`MetaStore`] when first
//! saved.
//!
//! Tables, fields, onions and indexes are known to the server only by
//! their anonymized names.

use std::fmt;

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::crypto::{EncLayer, LayerKey};
use crate::enc_set::{EncSet, FieldRef};
use crate::error::{Error, Result};
use crate::onions::{FieldType, Onion, OnionLayout, SecLevel, SecurityRating};
use crate::serial::{flag, Deserializer, Serializer};
use crate::store::{MetaStore, NodeKind};

/// Id of the implicit root, parent of every database.
pub const ROOT_ID: u64 = 0;

/// Random upper-case name, the base of every anonymized identifier.
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    (0..10).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetaKey {
    Identity(String),
    Index(u64),
}

impl MetaKey {
    pub fn identity(name: impl Into<String>) -> Self {
        MetaKey::Identity(name.into())
    }

    #[track_caller]
    pub fn name(&self) -> Result<&str> {
        match self {
            MetaKey::Identity(name) => Ok(name),
            MetaKey::Index(i) => Err(Error::metadata(format!("expected a named key, got #{i}"))),
        }
    }

    pub fn serialize(&self) -> String {
        match self {
            MetaKey::Identity(name) => Serializer::new().field("I").field(name).finish(),
            MetaKey::Index(i) => Serializer::new().field("N").field(i).finish(),
        }
    }

    pub fn deserialize(serial: &str) -> Result<Self> {
        let mut d = Deserializer::new(serial);
        match d.next_field()? {
            "I" => Ok(MetaKey::Identity(d.next_field()?.to_string())),
            "N" => Ok(MetaKey::Index(d.parse()?)),
            other => Err(Error::metadata(format!("unknown key tag `{other}`"))),
        }
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaKey::Identity(name) => f.write_str(name),
            MetaKey::Index(i) => write!(f, "#{i}"),
        }
    }
}

/// A node of the tree that can be persisted.
pub trait DbMeta: Clone + Sized {
    const KIND: NodeKind;

    /// The node's own attributes, children excluded.
    fn serialize(&self) -> String;
    fn deserialize(key: &MetaKey, serial: &str) -> Result<Self>;
    fn db_id(&self) -> Option<u64>;
    fn set_db_id(&mut self, id: u64);

    fn fetch_children(&mut self, _store: &dyn MetaStore) -> Result<()> {
        Ok(())
    }

    fn save_children(&mut self, _store: &mut dyn MetaStore) -> Result<()> {
        Ok(())
    }

    fn erase_children(&self, _store: &mut dyn MetaStore) -> Result<()> {
        Ok(())
    }

    fn children_tree(&self) -> String {
        String::new()
    }

    fn load_children_tree(&mut self, _serial: &str) -> Result<()> {
        Ok(())
    }

    /// Takes over the children of the node this one replaces.
    fn adopt_children(&mut self, _old: Self) {}

    #[track_caller]
    fn persisted_id(&self) -> Result<u64> {
        self.db_id()
            .ok_or_else(|| Error::metadata(format!("{} has not been saved", Self::KIND)))
    }

    /// Saves the node and its whole subtree as a child of `parent_id`.
    fn save(&mut self, store: &mut dyn MetaStore, parent_id: u64, key: &MetaKey) -> Result<u64> {
        let id = store.insert_object(Self::KIND, &self.serialize())?;
        store.link(Self::KIND, id, parent_id, &key.serialize())?;
        self.set_db_id(id);
        self.save_children(store)?;
        Ok(id)
    }

    /// Removes the node and its whole subtree from the store.
    fn erase(&self, store: &mut dyn MetaStore) -> Result<()> {
        self.erase_children(store)?;
        let id = self.persisted_id()?;
        store.unlink(Self::KIND, id)?;
        store.delete_object(Self::KIND, id)
    }

    fn update(&self, store: &mut dyn MetaStore) -> Result<()> {
        store.update_object(Self::KIND, self.persisted_id()?, &self.serialize())
    }

    /// The node together with its subtree, for the delta log.
    fn serialize_tree(&self) -> String {
        Serializer::new()
            .field(self.serialize())
            .field(self.children_tree())
            .finish()
    }

    fn deserialize_tree(key: &MetaKey, serial: &str) -> Result<Self> {
        let mut d = Deserializer::new(serial);
        let mut node = Self::deserialize(key, d.next_field()?)?;
        node.load_children_tree(d.next_field()?)?;
        Ok(node)
    }
}

/// Children of a node, keyed by value.
#[derive(Clone, Debug)]
pub struct MappedMeta<C> {
    entries: Vec<(MetaKey, C)>,
    fetched: bool,
}

impl<C> Default for MappedMeta<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            fetched: false,
        }
    }
}

impl<C: PartialEq> PartialEq for MappedMeta<C> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<C: DbMeta> MappedMeta<C> {
    #[track_caller]
    pub fn add_child(&mut self, key: MetaKey, child: C) -> Result<()> {
        if self.child_exists(&key) {
            return Err(Error::metadata(format!("duplicate {} child {key}", C::KIND)));
        }
        self.entries.push((key, child));
        Ok(())
    }

    #[track_caller]
    pub fn replace_child(&mut self, key: &MetaKey, child: C) -> Result<()> {
        let i = self
            .find_child(key)
            .ok_or_else(|| Error::metadata(format!("no {} child {key} to replace", C::KIND)))?;
        self.entries[i].1 = child;
        Ok(())
    }

    #[track_caller]
    pub fn destroy_child(&mut self, key: &MetaKey) -> Result<C> {
        let i = self
            .find_child(key)
            .ok_or_else(|| Error::metadata(format!("no {} child {key} to destroy", C::KIND)))?;
        Ok(self.entries.remove(i).1)
    }

    pub fn find_child(&self, key: &MetaKey) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    pub fn child_exists(&self, key: &MetaKey) -> bool {
        self.find_child(key).is_some()
    }

    pub fn get_child(&self, key: &MetaKey) -> Option<&C> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, c)| c)
    }

    pub fn get_child_mut(&mut self, key: &MetaKey) -> Option<&mut C> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, c)| c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetaKey, &C)> {
        self.entries.iter().map(|(k, c)| (k, c))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads the children of `parent_id` with their whole subtrees. Only
    /// the first call reads the store.
    pub fn fetch_children(&mut self, store: &dyn MetaStore, parent_id: u64) -> Result<()> {
        self.fetch(store, parent_id, true)
    }

    /// Loads the children of `parent_id` but none of theirs.
    pub fn fetch_shallow(&mut self, store: &dyn MetaStore, parent_id: u64) -> Result<()> {
        self.fetch(store, parent_id, false)
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    fn fetch(&mut self, store: &dyn MetaStore, parent_id: u64, deep: bool) -> Result<()> {
        if self.fetched {
            return Ok(());
        }
        for row in store.children(C::KIND, parent_id)? {
            let key = MetaKey::deserialize(&row.key)?;
            let mut child = C::deserialize(&key, &row.serial)?;
            child.set_db_id(row.object_id);
            if deep {
                child.fetch_children(store)?;
            }
            self.add_child(key, child)?;
        }
        self.fetched = true;
        Ok(())
    }

    fn save_all(&mut self, store: &mut dyn MetaStore, parent_id: u64) -> Result<()> {
        for (key, child) in self.entries.iter_mut() {
            child.save(store, parent_id, key)?;
        }
        self.fetched = true;
        Ok(())
    }

    fn erase_all(&self, store: &mut dyn MetaStore) -> Result<()> {
        self.entries.iter().try_for_each(|(_, child)| child.erase(store))
    }

    fn serialize_tree(&self) -> String {
        self.entries
            .iter()
            .fold(Serializer::new().field(self.entries.len()), |s, (key, child)| {
                s.field(key.serialize()).field(child.serialize_tree())
            })
            .finish()
    }

    fn deserialize_tree(serial: &str) -> Result<Self> {
        let mut d = Deserializer::new(serial);
        let count: usize = d.parse()?;
        let mut result = Self::default();
        for _ in 0..count {
            let key = MetaKey::deserialize(d.next_field()?)?;
            let child = C::deserialize_tree(&key, d.next_field()?)?;
            result.add_child(key, child)?;
        }
        result.fetched = true;
        Ok(result)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayerMeta {
    pub db_id: Option<u64>,
    pub layer: EncLayer,
}

impl DbMeta for LayerMeta {
    const KIND: NodeKind = NodeKind::Layer;

    fn serialize(&self) -> String {
        self.layer.serialize()
    }

    fn deserialize(_key: &MetaKey, serial: &str) -> Result<Self> {
        Ok(Self {
            db_id: None,
            layer: EncLayer::deserialize(serial)?,
        })
    }

    fn db_id(&self) -> Option<u64> {
        self.db_id
    }

    fn set_db_id(&mut self, id: u64) {
        self.db_id = Some(id);
    }
}

/// One onion of a field: its ciphertext column and its layer stack.
#[derive(Clone, Debug, PartialEq)]
pub struct OnionMeta {
    pub db_id: Option<u64>,
    pub onion: Onion,
    pub anon_name: String,
    pub uniq_count: u64,
    /// Level read from the store, until checked against the layers.
    unchecked_level: Option<SecLevel>,
    layers: MappedMeta<LayerMeta>,
}

impl OnionMeta {
    /// `layers` are given innermost first.
    pub fn new(onion: Onion, anon_name: String, uniq_count: u64, layers: Vec<EncLayer>) -> Result<Self> {
        let mut result = Self {
            db_id: None,
            onion,
            anon_name,
            uniq_count,
            unchecked_level: None,
            layers: MappedMeta::default(),
        };
        for (i, layer) in layers.into_iter().enumerate() {
            result
                .layers
                .add_child(MetaKey::Index(i as u64), LayerMeta { db_id: None, layer })?;
        }
        Ok(result)
    }

    /// The layers, innermost first.
    pub fn layers(&self) -> Vec<&EncLayer> {
        let mut keyed: Vec<_> = self.layers.iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        keyed.into_iter().map(|(_, l)| &l.layer).collect()
    }

    /// Layers with their keys, outermost first.
    pub fn layers_outside_in(&self) -> Vec<(&MetaKey, &LayerMeta)> {
        let mut keyed: Vec<_> = self.layers.iter().collect();
        keyed.sort_by(|a, b| b.0.cmp(a.0));
        keyed
    }

    /// Current level: the level of the outermost layer.
    pub fn level(&self) -> SecLevel {
        self.layers()
            .last()
            .map_or(SecLevel::PlainVal, |l| l.level())
    }

    pub fn has_level(&self, level: SecLevel) -> bool {
        level == SecLevel::PlainVal || self.layers().iter().any(|l| l.level() == level)
    }

    /// Removes the layers above `level`, returning their keys outermost
    /// first.
    #[track_caller]
    pub fn peel_to(&mut self, level: SecLevel) -> Result<Vec<MetaKey>> {
        if !self.has_level(level) {
            return Err(Error::unexpected_security_level(self.onion, level, self.level()));
        }
        let doomed: Vec<MetaKey> = self
            .layers_outside_in()
            .into_iter()
            .take_while(|(_, l)| l.layer.level() != level)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.layers.destroy_child(key)?;
        }
        Ok(doomed)
    }

    pub fn layer_meta(&self, key: &MetaKey) -> Option<&LayerMeta> {
        self.layers.get_child(key)
    }

    pub fn needs_salt(&self) -> bool {
        self.layers().iter().any(|l| l.needs_salt())
    }

    fn check_level(&mut self) -> Result<()> {
        match self.unchecked_level.take() {
            Some(stored) if stored != self.level() => Err(Error::metadata(format!(
                "onion {} is recorded at {stored} but its layers reach {}",
                self.anon_name,
                self.level()
            ))),
            _ => Ok(()),
        }
    }
}

impl DbMeta for OnionMeta {
    const KIND: NodeKind = NodeKind::Onion;

    fn serialize(&self) -> String {
        Serializer::new()
            .field(&self.anon_name)
            .field(self.onion)
            .field(self.level())
            .field(self.uniq_count)
            .finish()
    }

    fn deserialize(_key: &MetaKey, serial: &str) -> Result<Self> {
        let mut d = Deserializer::new(serial);
        Ok(Self {
            db_id: None,
            anon_name: d.next_field()?.to_string(),
            onion: d.parse()?,
            unchecked_level: Some(d.parse()?),
            uniq_count: d.parse()?,
            layers: MappedMeta::default(),
        })
    }

    fn db_id(&self) -> Option<u64> {
        self.db_id
    }

    fn set_db_id(&mut self, id: u64) {
        self.db_id = Some(id);
    }

    fn fetch_children(&mut self, store: &dyn MetaStore) -> Result<()> {
        let id = self.persisted_id()?;
        self.layers.fetch_children(store, id)?;
        self.check_level()
    }

    fn save_children(&mut self, store: &mut dyn MetaStore) -> Result<()> {
        let id = self.persisted_id()?;
        self.layers.save_all(store, id)
    }

    fn erase_children(&self, store: &mut dyn MetaStore) -> Result<()> {
        self.layers.erase_all(store)
    }

    fn children_tree(&self) -> String {
        self.layers.serialize_tree()
    }

    fn load_children_tree(&mut self, serial: &str) -> Result<()> {
        self.layers = MappedMeta::deserialize_tree(serial)?;
        self.check_level()
    }

    fn adopt_children(&mut self, old: Self) {
        self.layers = old.layers;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldMeta {
    pub db_id: Option<u64>,
    pub name: String,
    pub field_type: FieldType,
    pub has_salt: bool,
    pub salt_name: String,
    pub onion_layout: OnionLayout,
    pub uniq_count: u64,
    counter: u64,
    onions: MappedMeta<OnionMeta>,
}

impl FieldMeta {
    /// A new field with the onions its type and rating call for.
    pub fn new(
        name: &str,
        field_type: FieldType,
        rating: SecurityRating,
        uniq_count: u64,
        master: &LayerKey,
    ) -> Result<Self> {
        let layout = OnionLayout::for_field(field_type, rating);
        Self::with_onions(name, field_type, layout, &layout.onions(), uniq_count, master)
    }

    /// A new field with explicit layer stacks, innermost layer first.
    pub fn with_onions(
        name: &str,
        field_type: FieldType,
        onion_layout: OnionLayout,
        stacks: &[(Onion, Vec<SecLevel>)],
        uniq_count: u64,
        master: &LayerKey,
    ) -> Result<Self> {
        let mut result = Self {
            db_id: None,
            name: name.to_string(),
            field_type,
            has_salt: false,
            salt_name: format!("cdb_salt{}", random_name()),
            onion_layout,
            uniq_count,
            counter: 0,
            onions: MappedMeta::default(),
        };
        for (onion, levels) in stacks {
            let anon_name = format!("{}_{}", random_name(), onion);
            let mut input = field_type;
            let layers = levels
                .iter()
                .map(|level| {
                    let layer = EncLayer::derive(master, &anon_name, *level, input)?;
                    input = layer.output_type();
                    Ok(layer)
                })
                .collect::<Result<Vec<_>>>()?;
            let uniq = result.lease_uniq();
            let om = OnionMeta::new(*onion, anon_name, uniq, layers)?;
            result.has_salt |= om.needs_salt();
            result.onions.add_child(MetaKey::identity(onion.name()), om)?;
        }
        Ok(result)
    }

    fn lease_uniq(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    pub fn onion(&self, onion: Onion) -> Option<&OnionMeta> {
        self.onions.get_child(&MetaKey::identity(onion.name()))
    }

    pub fn onion_mut(&mut self, onion: Onion) -> Option<&mut OnionMeta> {
        self.onions.get_child_mut(&MetaKey::identity(onion.name()))
    }

    /// Onions in creation order.
    pub fn ordered_onions(&self) -> Vec<&OnionMeta> {
        let mut result: Vec<_> = self.onions.iter().map(|(_, o)| o).collect();
        result.sort_by_key(|o| o.uniq_count);
        result
    }

    pub fn is_plain(&self) -> bool {
        self.onion_layout == OnionLayout::Plain
    }

    /// What a reference to this field can produce: every onion at its
    /// current level, bound to this field's keys.
    pub fn enc_set(&self, key: &FieldRef) -> EncSet {
        EncSet::new(self.ordered_onions().into_iter().map(|om| {
            let level = om.level();
            let key = (level != SecLevel::PlainVal).then(|| key.clone());
            (om.onion, level, key)
        }))
    }
}

impl DbMeta for FieldMeta {
    const KIND: NodeKind = NodeKind::Field;

    fn serialize(&self) -> String {
        Serializer::new()
            .field(self.field_type)
            .field(flag(self.has_salt))
            .field(&self.salt_name)
            .field(self.onion_layout)
            .field(self.uniq_count)
            .field(self.counter)
            .finish()
    }

    fn deserialize(key: &MetaKey, serial: &str) -> Result<Self> {
        let mut d = Deserializer::new(serial);
        Ok(Self {
            db_id: None,
            name: key.name()?.to_string(),
            field_type: d.parse()?,
            has_salt: d.parse_bool()?,
            salt_name: d.next_field()?.to_string(),
            onion_layout: d.parse()?,
            uniq_count: d.parse()?,
            counter: d.parse()?,
            onions: MappedMeta::default(),
        })
    }

    fn db_id(&self) -> Option<u64> {
        self.db_id
    }

    fn set_db_id(&mut self, id: u64) {
        self.db_id = Some(id);
    }

    fn fetch_children(&mut self, store: &dyn MetaStore) -> Result<()> {
        let id = self.persisted_id()?;
        self.onions.fetch_children(store, id)
    }

    fn save_children(&mut self, store: &mut dyn MetaStore) -> Result<()> {
        let id = self.persisted_id()?;
        self.onions.save_all(store, id)
    }

    fn erase_children(&self, store: &mut dyn MetaStore) -> Result<()> {
        self.onions.erase_all(store)
    }

    fn children_tree(&self) -> String {
        self.onions.serialize_tree()
    }

    fn load_children_tree(&mut self, serial: &str) -> Result<()> {
        self.onions = MappedMeta::deserialize_tree(serial)?;
        Ok(())
    }

    fn adopt_children(&mut self, old: Self) {
        self.onions = old.onions;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableMeta {
    pub db_id: Option<u64>,
    pub name: String,
    pub anon_name: String,
    pub has_sensitive: bool,
    counter: u64,
    fields: MappedMeta<FieldMeta>,
}

impl TableMeta {
    pub fn new(name: &str, has_sensitive: bool) -> Self {
        Self {
            db_id: None,
            name: name.to_string(),
            anon_name: format!("table_{}", random_name()),
            has_sensitive,
            counter: 0,
            fields: MappedMeta::default(),
        }
    }

    pub fn lease_uniq(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    #[track_caller]
    pub fn add_field(&mut self, field: FieldMeta) -> Result<()> {
        self.fields.add_child(MetaKey::identity(&field.name), field)
    }

    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.get_child(&MetaKey::identity(name))
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldMeta> {
        self.fields.get_child_mut(&MetaKey::identity(name))
    }

    /// Fields in creation order, which is the order of `SELECT *`.
    pub fn ordered_fields(&self) -> Vec<&FieldMeta> {
        let mut result: Vec<_> = self.fields.iter().map(|(_, f)| f).collect();
        result.sort_by_key(|f| f.uniq_count);
        result
    }

    /// Hash-derived server name of an index. Only the table and index names
    /// go in, so the index can be dropped knowing nothing else.
    pub fn index_anon_name(&self, index: &str) -> String {
        let digest = Sha256::new()
            .chain_update(self.anon_name.as_bytes())
            .chain_update(b"/")
            .chain_update(index.as_bytes())
            .finalize();
        format!("index_{}", &hex::encode(digest)[..16])
    }
}

impl DbMeta for TableMeta {
    const KIND: NodeKind = NodeKind::Table;

    fn serialize(&self) -> String {
        Serializer::new()
            .field(&self.anon_name)
            .field(flag(self.has_sensitive))
            .field(self.counter)
            .finish()
    }

    fn deserialize(key: &MetaKey, serial: &str) -> Result<Self> {
        let mut d = Deserializer::new(serial);
        Ok(Self {
            db_id: None,
            name: key.name()?.to_string(),
            anon_name: d.next_field()?.to_string(),
            has_sensitive: d.parse_bool()?,
            counter: d.parse()?,
            fields: MappedMeta::default(),
        })
    }

    fn db_id(&self) -> Option<u64> {
        self.db_id
    }

    fn set_db_id(&mut self, id: u64) {
        self.db_id = Some(id);
    }

    fn fetch_children(&mut self, store: &dyn MetaStore) -> Result<()> {
        let id = self.persisted_id()?;
        self.fields.fetch_children(store, id)
    }

    fn save_children(&mut self, store: &mut dyn MetaStore) -> Result<()> {
        let id = self.persisted_id()?;
        self.fields.save_all(store, id)
    }

    fn erase_children(&self, store: &mut dyn MetaStore) -> Result<()> {
        self.fields.erase_all(store)
    }

    fn children_tree(&self) -> String {
        self.fields.serialize_tree()
    }

    fn load_children_tree(&mut self, serial: &str) -> Result<()> {
        self.fields = MappedMeta::deserialize_tree(serial)?;
        Ok(())
    }

    fn adopt_children(&mut self, old: Self) {
        self.fields = old.fields;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseMeta {
    pub db_id: Option<u64>,
    pub name: String,
    tables: MappedMeta<TableMeta>,
}

impl DatabaseMeta {
    pub fn new(name: &str) -> Self {
        Self {
            db_id: None,
            name: name.to_string(),
            tables: MappedMeta::default(),
        }
    }

    #[track_caller]
    pub fn add_table(&mut self, table: TableMeta) -> Result<()> {
        self.tables.add_child(MetaKey::identity(&table.name), table)
    }

    pub fn table(&self, name: &str) -> Option<&TableMeta> {
        self.tables.get_child(&MetaKey::identity(name))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.iter().map(|(_, t)| t)
    }

    /// Whether the tables are in memory. Databases read from the store
    /// start without them.
    pub fn is_loaded(&self) -> bool {
        self.db_id.is_none() || self.tables.is_fetched()
    }
}

impl DbMeta for DatabaseMeta {
    const KIND: NodeKind = NodeKind::Database;

    fn serialize(&self) -> String {
        Serializer::new().field(&self.name).finish()
    }

    fn deserialize(key: &MetaKey, _serial: &str) -> Result<Self> {
        Ok(Self::new(key.name()?))
    }

    fn db_id(&self) -> Option<u64> {
        self.db_id
    }

    fn set_db_id(&mut self, id: u64) {
        self.db_id = Some(id);
    }

    fn fetch_children(&mut self, store: &dyn MetaStore) -> Result<()> {
        let id = self.persisted_id()?;
        self.tables.fetch_children(store, id)
    }

    fn save_children(&mut self, store: &mut dyn MetaStore) -> Result<()> {
        let id = self.persisted_id()?;
        self.tables.save_all(store, id)
    }

    fn erase_children(&self, store: &mut dyn MetaStore) -> Result<()> {
        self.tables.erase_all(store)
    }

    fn children_tree(&self) -> String {
        self.tables.serialize_tree()
    }

    fn load_children_tree(&mut self, serial: &str) -> Result<()> {
        self.tables = MappedMeta::deserialize_tree(serial)?;
        Ok(())
    }

    fn adopt_children(&mut self, old: Self) {
        self.tables = old.tables;
    }
}

/// Root of the tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemaInfo {
    databases: MappedMeta<DatabaseMeta>,
}

impl SchemaInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the databases from the store. Their tables are read on first
    /// use, through [`SchemaInfo::load_database`].
    pub fn load(store: &dyn MetaStore) -> Result<Self> {
        let mut result = Self::new();
        result.databases.fetch_shallow(store, ROOT_ID)?;
        Ok(result)
    }

    /// Reads the subtree of `db` unless it is already in memory. Returns
    /// whether the store was read.
    pub fn load_database(&mut self, store: &dyn MetaStore, db: &str) -> Result<bool> {
        let Some(meta) = self.databases.get_child_mut(&MetaKey::identity(db)) else {
            return Ok(false);
        };
        if meta.is_loaded() {
            return Ok(false);
        }
        meta.fetch_children(store)?;
        debug!(db, tables = meta.tables.len(), "database loaded");
        Ok(true)
    }

    /// [`SchemaInfo::load`] followed by loading every database.
    pub fn load_all(store: &dyn MetaStore) -> Result<Self> {
        let mut result = Self::load(store)?;
        let names: Vec<String> = result.databases().map(|d| d.name.clone()).collect();
        for name in names {
            result.load_database(store, &name)?;
        }
        Ok(result)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseMeta> {
        self.databases.get_child(&MetaKey::identity(name))
    }

    pub fn databases(&self) -> impl Iterator<Item = &DatabaseMeta> {
        self.databases.iter().map(|(_, d)| d)
    }

    pub fn table(&self, db: &str, table: &str) -> Option<&TableMeta> {
        self.database(db)?.table(table)
    }

    pub fn field(&self, key: &FieldRef) -> Option<&FieldMeta> {
        self.table(&key.db, &key.table)?.field(&key.field)
    }

    #[track_caller]
    pub fn get_field(&self, key: &FieldRef) -> Result<&FieldMeta> {
        self.field(key)
            .ok_or_else(|| Error::identifier_not_found(key.to_string()))
    }

    #[track_caller]
    pub fn get_table(&self, db: &str, table: &str) -> Result<&TableMeta> {
        self.table(db, table)
            .ok_or_else(|| Error::identifier_not_found(table))
    }

    /// Walks `path` down from the root.
    pub fn node_mut(&mut self, path: &MetaPath) -> Result<NodeMut<'_>> {
        let mut node = NodeMut::Root(self);
        for key in &path.0 {
            node = node.descend(key)?;
        }
        Ok(node)
    }
}

/// Keys leading from the root to a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaPath(pub Vec<MetaKey>);

impl MetaPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn database(db: &str) -> Self {
        Self(vec![MetaKey::identity(db)])
    }

    pub fn table(db: &str, table: &str) -> Self {
        Self(vec![MetaKey::identity(db), MetaKey::identity(table)])
    }

    pub fn field(key: &FieldRef) -> Self {
        Self(vec![
            MetaKey::identity(&key.db),
            MetaKey::identity(&key.table),
            MetaKey::identity(&key.field),
        ])
    }

    pub fn onion(key: &FieldRef, onion: Onion) -> Self {
        let mut result = Self::field(key);
        result.0.push(MetaKey::identity(onion.name()));
        result
    }

    pub fn serialize(&self) -> String {
        self.0
            .iter()
            .fold(Serializer::new().field(self.0.len()), |s, k| s.field(k.serialize()))
            .finish()
    }

    pub fn deserialize(serial: &str) -> Result<Self> {
        let mut d = Deserializer::new(serial);
        let count: usize = d.parse()?;
        (0..count)
            .map(|_| MetaKey::deserialize(d.next_field()?))
            .collect::<Result<_>>()
            .map(Self)
    }
}

impl fmt::Display for MetaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

/// Any node below the root.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyMeta {
    Database(DatabaseMeta),
    Table(TableMeta),
    Field(FieldMeta),
    Onion(OnionMeta),
    Layer(LayerMeta),
}

macro_rules! dispatch {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            AnyMeta::Database($m) => $body,
            AnyMeta::Table($m) => $body,
            AnyMeta::Field($m) => $body,
            AnyMeta::Onion($m) => $body,
            AnyMeta::Layer($m) => $body,
        }
    };
}

impl AnyMeta {
    pub fn kind(&self) -> NodeKind {
        match self {
            AnyMeta::Database(_) => NodeKind::Database,
            AnyMeta::Table(_) => NodeKind::Table,
            AnyMeta::Field(_) => NodeKind::Field,
            AnyMeta::Onion(_) => NodeKind::Onion,
            AnyMeta::Layer(_) => NodeKind::Layer,
        }
    }

    pub fn db_id(&self) -> Option<u64> {
        dispatch!(self, m => m.db_id())
    }

    pub fn set_db_id(&mut self, id: u64) {
        dispatch!(self, m => m.set_db_id(id))
    }

    pub fn save(&mut self, store: &mut dyn MetaStore, parent_id: u64, key: &MetaKey) -> Result<u64> {
        dispatch!(self, m => m.save(store, parent_id, key))
    }

    pub fn erase(&self, store: &mut dyn MetaStore) -> Result<()> {
        dispatch!(self, m => m.erase(store))
    }

    pub fn update(&self, store: &mut dyn MetaStore) -> Result<()> {
        dispatch!(self, m => m.update(store))
    }

    pub fn serialize_tree(&self) -> String {
        dispatch!(self, m => m.serialize_tree())
    }

    /// Moves the children of `old`, a node of the same kind, under `self`.
    pub fn adopt_children(&mut self, old: AnyMeta) -> Result<()> {
        match (self, old) {
            (AnyMeta::Database(m), AnyMeta::Database(o)) => m.adopt_children(o),
            (AnyMeta::Table(m), AnyMeta::Table(o)) => m.adopt_children(o),
            (AnyMeta::Field(m), AnyMeta::Field(o)) => m.adopt_children(o),
            (AnyMeta::Onion(m), AnyMeta::Onion(o)) => m.adopt_children(o),
            (AnyMeta::Layer(m), AnyMeta::Layer(o)) => m.adopt_children(o),
            (m, o) => {
                return Err(Error::metadata(format!(
                    "cannot replace a {} with a {}",
                    o.kind(),
                    m.kind()
                )))
            }
        }
        Ok(())
    }

    pub fn deserialize_tree(kind: NodeKind, key: &MetaKey, serial: &str) -> Result<Self> {
        Ok(match kind {
            NodeKind::Database => AnyMeta::Database(DatabaseMeta::deserialize_tree(key, serial)?),
            NodeKind::Table => AnyMeta::Table(TableMeta::deserialize_tree(key, serial)?),
            NodeKind::Field => AnyMeta::Field(FieldMeta::deserialize_tree(key, serial)?),
            NodeKind::Onion => AnyMeta::Onion(OnionMeta::deserialize_tree(key, serial)?),
            NodeKind::Layer => AnyMeta::Layer(LayerMeta::deserialize_tree(key, serial)?),
        })
    }
}

/// Mutable handle on a node that can have children.
pub enum NodeMut<'a> {
    Root(&'a mut SchemaInfo),
    Database(&'a mut DatabaseMeta),
    Table(&'a mut TableMeta),
    Field(&'a mut FieldMeta),
    Onion(&'a mut OnionMeta),
}

impl<'a> NodeMut<'a> {
    pub fn db_id(&self) -> Result<u64> {
        match self {
            NodeMut::Root(_) => Ok(ROOT_ID),
            NodeMut::Database(m) => m.persisted_id(),
            NodeMut::Table(m) => m.persisted_id(),
            NodeMut::Field(m) => m.persisted_id(),
            NodeMut::Onion(m) => m.persisted_id(),
        }
    }

    fn descend(self, key: &MetaKey) -> Result<NodeMut<'a>> {
        let child = match self {
            NodeMut::Root(m) => m.databases.get_child_mut(key).map(NodeMut::Database),
            NodeMut::Database(m) => m.tables.get_child_mut(key).map(NodeMut::Table),
            NodeMut::Table(m) => m.fields.get_child_mut(key).map(NodeMut::Field),
            NodeMut::Field(m) => m.onions.get_child_mut(key).map(NodeMut::Onion),
            NodeMut::Onion(_) => None,
        };
        child.ok_or_else(|| Error::metadata(format!("no node {key} on the path")))
    }

    pub fn get(&self, key: &MetaKey) -> Option<AnyMeta> {
        match self {
            NodeMut::Root(m) => m.databases.get_child(key).cloned().map(AnyMeta::Database),
            NodeMut::Database(m) => m.tables.get_child(key).cloned().map(AnyMeta::Table),
            NodeMut::Table(m) => m.fields.get_child(key).cloned().map(AnyMeta::Field),
            NodeMut::Field(m) => m.onions.get_child(key).cloned().map(AnyMeta::Onion),
            NodeMut::Onion(m) => m.layers.get_child(key).cloned().map(AnyMeta::Layer),
        }
    }

    pub fn add(self, key: MetaKey, meta: AnyMeta) -> Result<()> {
        match (self, meta) {
            (NodeMut::Root(m), AnyMeta::Database(c)) => m.databases.add_child(key, c),
            (NodeMut::Database(m), AnyMeta::Table(c)) => m.tables.add_child(key, c),
            (NodeMut::Table(m), AnyMeta::Field(c)) => m.fields.add_child(key, c),
            (NodeMut::Field(m), AnyMeta::Onion(c)) => m.onions.add_child(key, c),
            (NodeMut::Onion(m), AnyMeta::Layer(c)) => m.layers.add_child(key, c),
            (_, meta) => Err(Error::metadata(format!("a {} cannot go there", meta.kind()))),
        }
    }

    pub fn replace(self, key: &MetaKey, meta: AnyMeta) -> Result<()> {
        match (self, meta) {
            (NodeMut::Root(m), AnyMeta::Database(c)) => m.databases.replace_child(key, c),
            (NodeMut::Database(m), AnyMeta::Table(c)) => m.tables.replace_child(key, c),
            (NodeMut::Table(m), AnyMeta::Field(c)) => m.fields.replace_child(key, c),
            (NodeMut::Field(m), AnyMeta::Onion(c)) => m.onions.replace_child(key, c),
            (NodeMut::Onion(m), AnyMeta::Layer(c)) => m.layers.replace_child(key, c),
            (_, meta) => Err(Error::metadata(format!("a {} cannot go there", meta.kind()))),
        }
    }

    pub fn destroy(self, key: &MetaKey) -> Result<AnyMeta> {
        Ok(match self {
            NodeMut::Root(m) => AnyMeta::Database(m.databases.destroy_child(key)?),
            NodeMut::Database(m) => AnyMeta::Table(m.tables.destroy_child(key)?),
            NodeMut::Table(m) => AnyMeta::Field(m.fields.destroy_child(key)?),
            NodeMut::Field(m) => AnyMeta::Onion(m.onions.destroy_child(key)?),
            NodeMut::Onion(m) => AnyMeta::Layer(m.layers.destroy_child(key)?),
        })
    }
}
