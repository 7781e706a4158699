//! The `EncSet` algebra.
//!
//! An [`EncSet`] says at which onion/level combinations a value can be
//! produced. Intersecting the set a node can produce with the set an
//! operator requires gives the choices that satisfy both.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::onions::{Onion, SecLevel};
use crate::rewrite_plan::Reason;

/// Identifies the field whose keys back a ciphertext.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef {
    pub db: String,
    pub table: String,
    pub field: String,
}

impl FieldRef {
    pub fn new(db: impl Into<String>, table: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            table: table.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.field)
    }
}

/// One concrete onion, level and key choice.
///
/// Two `Olk`s are equal when onion and level match; the key is payload.
#[derive(Clone, Debug)]
pub struct Olk {
    pub onion: Onion,
    pub level: SecLevel,
    pub key: Option<FieldRef>,
}

impl Olk {
    pub fn new(onion: Onion, level: SecLevel, key: Option<FieldRef>) -> Self {
        Self { onion, level, key }
    }

    pub fn plain() -> Self {
        Self::new(Onion::Plain, SecLevel::PlainVal, None)
    }

    pub fn is_plain(&self) -> bool {
        self.level == SecLevel::PlainVal
    }
}

impl PartialEq for Olk {
    fn eq(&self, other: &Self) -> bool {
        self.onion == other.onion && self.level == other.level
    }
}

impl Eq for Olk {}

impl Hash for Olk {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.onion.hash(state);
        self.level.hash(state);
    }
}

impl fmt::Display for Olk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.onion, self.level)?;
        if let Some(key) = &self.key {
            write!(f, "({key})")?;
        }
        Ok(())
    }
}

/// Merges keys the way intersection does: both set means both must agree.
fn merge_keys(a: &Option<FieldRef>, b: &Option<FieldRef>) -> Option<Option<FieldRef>> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => None,
        (Some(x), _) => Some(Some(x.clone())),
        (None, y) => Some(y.clone()),
    }
}

/// Mapping from onion to the highest tolerable level on that onion, with
/// the field whose keys are bound to it, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncSet {
    entries: BTreeMap<Onion, (SecLevel, Option<FieldRef>)>,
}

impl EncSet {
    pub fn new<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Onion, SecLevel, Option<FieldRef>)>,
    {
        Self {
            entries: entries.into_iter().map(|(o, l, k)| (o, (l, k))).collect(),
        }
    }

    fn unkeyed(entries: &[(Onion, SecLevel)]) -> Self {
        Self::new(entries.iter().map(|(o, l)| (*o, *l, None)))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// What a literal can be encrypted into.
    pub fn full() -> Self {
        Self::unkeyed(&[
            (Onion::Plain, SecLevel::PlainVal),
            (Onion::Det, SecLevel::Rnd),
            (Onion::Ord, SecLevel::Rnd),
            (Onion::Agg, SecLevel::Hom),
            (Onion::Swp, SecLevel::Search),
        ])
    }

    pub fn full_int() -> Self {
        Self::unkeyed(&[
            (Onion::Plain, SecLevel::PlainVal),
            (Onion::Det, SecLevel::Rnd),
            (Onion::Ord, SecLevel::Rnd),
            (Onion::Agg, SecLevel::Hom),
        ])
    }

    pub fn full_str() -> Self {
        Self::unkeyed(&[
            (Onion::Plain, SecLevel::PlainVal),
            (Onion::Det, SecLevel::Rnd),
            (Onion::Ord, SecLevel::Rnd),
            (Onion::Swp, SecLevel::Search),
        ])
    }

    /// Equality against a constant.
    pub fn equality() -> Self {
        Self::unkeyed(&[(Onion::Plain, SecLevel::PlainVal), (Onion::Det, SecLevel::Det)])
    }

    /// Equality between two fields with different keys.
    pub fn join() -> Self {
        Self::unkeyed(&[(Onion::Plain, SecLevel::PlainVal), (Onion::Det, SecLevel::DetJoin)])
    }

    pub fn order() -> Self {
        Self::unkeyed(&[(Onion::Plain, SecLevel::PlainVal), (Onion::Ord, SecLevel::Ope)])
    }

    pub fn plain() -> Self {
        Self::unkeyed(&[(Onion::Plain, SecLevel::PlainVal)])
    }

    pub fn addition() -> Self {
        Self::unkeyed(&[(Onion::Plain, SecLevel::PlainVal), (Onion::Agg, SecLevel::Hom)])
    }

    pub fn search() -> Self {
        Self::unkeyed(&[(Onion::Plain, SecLevel::PlainVal), (Onion::Swp, SecLevel::Search)])
    }

    pub fn from_olk(olk: &Olk) -> Self {
        Self::new([(olk.onion, olk.level, olk.key.clone())])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, onion: Onion) -> Option<(SecLevel, Option<&FieldRef>)> {
        self.entries.get(&onion).map(|(l, k)| (*l, k.as_ref()))
    }

    pub fn iter(&self) -> impl Iterator<Item = Olk> + '_ {
        self.entries
            .iter()
            .map(|(o, (l, k))| Olk::new(*o, *l, k.clone()))
    }

    /// Onions present on both sides, at the lower of the two levels.
    ///
    /// An onion is dropped when both sides bind it to different fields.
    pub fn intersect(&self, other: &EncSet) -> EncSet {
        let mut entries = BTreeMap::new();
        for (onion, (level, key)) in &self.entries {
            let Some((other_level, other_key)) = other.entries.get(onion) else {
                continue;
            };
            if let Some(merged) = merge_keys(key, other_key) {
                entries.insert(*onion, ((*level).min(*other_level), merged));
            }
        }
        EncSet { entries }
    }

    /// True if `olk` can be produced from this set: its onion is present at
    /// a level at least as high and the keys do not conflict.
    pub fn contains(&self, olk: &Olk) -> bool {
        match self.entries.get(&olk.onion) {
            Some((level, key)) => *level >= olk.level && merge_keys(key, &olk.key).is_some(),
            None => false,
        }
    }

    /// True if some entry can actually be materialised: either it needs no
    /// key (plaintext) or a field key is bound to it.
    pub fn available(&self) -> bool {
        self.entries.values().any(|(l, k)| Self::selectable(*l, k))
    }

    fn selectable(level: SecLevel, key: &Option<FieldRef>) -> bool {
        level == SecLevel::PlainVal || key.is_some()
    }

    /// Picks one entry deterministically.
    ///
    /// Onions are tried in the order plain, DET, OPE, AGG, SWP; the first
    /// entry that is plaintext or has a bound key wins. Plain is therefore
    /// always preferred when allowed.
    #[track_caller]
    pub fn choose_one(&self) -> Result<Olk> {
        self.entries
            .iter()
            .find(|(_, (l, k))| Self::selectable(*l, k))
            .map(|(o, (l, k))| Olk::new(*o, *l, k.clone()))
            .ok_or_else(|| {
                Error::no_available_enc_set(
                    "choose_one",
                    self,
                    Reason::leaf("no onion is plaintext or bound to a key", self.clone()),
                )
            })
    }

    /// The same set with every key removed.
    pub fn without_keys(&self) -> EncSet {
        EncSet {
            entries: self
                .entries
                .iter()
                .map(|(o, (l, _))| (*o, (*l, None)))
                .collect(),
        }
    }
}

impl fmt::Display for EncSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, olk) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{olk}")?;
        }
        f.write_str("}")
    }
}

/// Merges two choices that must describe the same onion and level.
///
/// Fails if either the onions or the levels differ. Keys follow the
/// intersection rule.
#[track_caller]
pub fn merge_complete_olk(a: &Olk, b: &Olk) -> Result<Olk> {
    if a.onion != b.onion || a.level != b.level {
        return Err(Error::unexpected_security_level(a.onion, a.level, b.level));
    }
    match merge_keys(&a.key, &b.key) {
        Some(key) => Ok(Olk::new(a.onion, a.level, key)),
        None => Err(Error::text(format!(
            "cannot merge {a} and {b}: bound to different fields"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn emp(field: &str) -> FieldRef {
        FieldRef::new("db", "emp", field)
    }

    #[test]
    fn intersection_takes_the_lower_level() {
        let field = EncSet::new([
            (Onion::Det, SecLevel::Rnd, Some(emp("id"))),
            (Onion::Ord, SecLevel::Rnd, Some(emp("id"))),
        ]);
        let out = field.intersect(&EncSet::equality());
        assert_eq!(out, EncSet::new([(Onion::Det, SecLevel::Det, Some(emp("id")))]));
    }

    #[test]
    fn conflicting_keys_drop_the_onion() {
        let a = EncSet::new([(Onion::Det, SecLevel::Det, Some(emp("id")))]);
        let b = EncSet::new([(Onion::Det, SecLevel::Det, Some(emp("salary")))]);
        assert!(a.intersect(&b).is_empty());
        assert_eq!(a.without_keys().intersect(&b.without_keys()).len(), 1);
    }

    #[test]
    fn choose_one_prefers_plain() {
        let es = EncSet::new([
            (Onion::Det, SecLevel::Det, Some(emp("id"))),
            (Onion::Plain, SecLevel::PlainVal, None),
        ]);
        assert_eq!(es.choose_one().unwrap(), Olk::plain());
    }

    #[test]
    fn choose_one_skips_unkeyed_ciphertext() {
        let es = EncSet::new([
            (Onion::Det, SecLevel::Det, None),
            (Onion::Ord, SecLevel::Ope, Some(emp("salary"))),
        ]);
        let olk = es.choose_one().unwrap();
        assert_eq!((olk.onion, olk.level), (Onion::Ord, SecLevel::Ope));
        assert_eq!(olk.key, Some(emp("salary")));

        let unkeyed = EncSet::new([(Onion::Det, SecLevel::Det, None)]);
        assert!(!unkeyed.available());
        assert!(matches!(
            unkeyed.choose_one(),
            Err(Error::NoAvailableEncSet { .. })
        ));
        assert!(EncSet::empty().choose_one().is_err());
    }

    #[test]
    fn equality_set_has_no_order_onion() {
        let salary = EncSet::new([(Onion::Ord, SecLevel::Ope, Some(emp("salary")))]);
        assert!(salary.intersect(&EncSet::equality()).is_empty());
    }

    #[test]
    fn merge_requires_same_onion_and_level() {
        let a = Olk::new(Onion::Det, SecLevel::Det, Some(emp("id")));
        let b = Olk::new(Onion::Det, SecLevel::Det, None);
        assert_eq!(merge_complete_olk(&a, &b).unwrap().key, Some(emp("id")));
        assert_eq!(merge_complete_olk(&b, &a).unwrap().key, Some(emp("id")));

        // a mismatch in either component is enough to refuse the merge
        let other_level = Olk::new(Onion::Det, SecLevel::Rnd, None);
        assert!(merge_complete_olk(&a, &other_level).is_err());
        let other_onion = Olk::new(Onion::Ord, SecLevel::Det, None);
        assert!(merge_complete_olk(&a, &other_onion).is_err());

        let other_key = Olk::new(Onion::Det, SecLevel::Det, Some(emp("salary")));
        assert!(merge_complete_olk(&a, &other_key).is_err());
    }

    #[test]
    fn olk_equality_ignores_key() {
        let a = Olk::new(Onion::Det, SecLevel::Det, Some(emp("id")));
        let b = Olk::new(Onion::Det, SecLevel::Det, None);
        assert_eq!(a, b);
    }

    fn arb_onion() -> impl Strategy<Value = Onion> {
        prop_oneof![
            Just(Onion::Plain),
            Just(Onion::Det),
            Just(Onion::Ord),
            Just(Onion::Agg),
            Just(Onion::Swp),
        ]
    }

    fn arb_level() -> impl Strategy<Value = SecLevel> {
        prop_oneof![
            Just(SecLevel::PlainVal),
            Just(SecLevel::DetJoin),
            Just(SecLevel::Det),
            Just(SecLevel::Ope),
            Just(SecLevel::Hom),
            Just(SecLevel::Search),
            Just(SecLevel::Rnd),
        ]
    }

    fn arb_key() -> impl Strategy<Value = Option<FieldRef>> {
        prop_oneof![Just(None), Just(Some(emp("id"))), Just(Some(emp("salary")))]
    }

    fn arb_olk() -> impl Strategy<Value = Olk> {
        (arb_onion(), arb_level(), arb_key()).prop_map(|(o, l, k)| Olk::new(o, l, k))
    }

    fn arb_enc_set() -> impl Strategy<Value = EncSet> {
        proptest::collection::vec((arb_onion(), arb_level(), arb_key()), 0..6).prop_map(EncSet::new)
    }

    proptest! {
        #[test]
        fn intersect_commutes(a in arb_enc_set(), b in arb_enc_set()) {
            prop_assert_eq!(a.intersect(&b), b.intersect(&a));
        }

        #[test]
        fn intersect_is_idempotent(a in arb_enc_set()) {
            prop_assert_eq!(a.intersect(&a), a);
        }

        #[test]
        fn choose_one_is_deterministic(a in arb_enc_set()) {
            let first = a.choose_one().ok().map(|o| (o.onion, o.level, o.key));
            let second = a.choose_one().ok().map(|o| (o.onion, o.level, o.key));
            prop_assert_eq!(first, second);
        }

        #[test]
        fn contains_implies_nonempty_intersection(e in arb_enc_set(), o in arb_olk()) {
            if e.contains(&o) {
                prop_assert!(!e.intersect(&EncSet::from_olk(&o)).is_empty());
            }
        }

        #[test]
        fn available_matches_choose_one(e in arb_enc_set()) {
            prop_assert_eq!(e.available(), e.choose_one().is_ok());
        }
    }
}
