//! Onions, security levels and the onion layouts given to new fields.
//!
//! An onion is a stack of encryption layers over one field. Peeling the
//! outermost layer lowers the onion's security level and enables more
//! operations on the server. Levels are only comparable within one onion.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// One variant per operation class a field can be encrypted for.
///
/// The declaration order is also the preference order used when picking
/// one onion out of several equally valid ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Onion {
    Plain,
    Det,
    Ord,
    Agg,
    Swp,
}

/// Security levels, weakest first.
///
/// `PlainVal` means no layer at all, `Rnd` is the opaque outermost layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecLevel {
    PlainVal,
    DetJoin,
    Det,
    Ope,
    Hom,
    Search,
    Rnd,
}

/// Plaintext type of a field, as far as the encryption layers care.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Str,
}

/// How much protection a newly created field gets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SecurityRating {
    Plain,
    #[default]
    Sensitive,
}

/// The set of onions a field is created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OnionLayout {
    Plain,
    Num,
    Str,
}

pub const ALL_ONIONS: [Onion; 5] = [Onion::Plain, Onion::Det, Onion::Ord, Onion::Agg, Onion::Swp];

impl Onion {
    pub fn name(&self) -> &'static str {
        match self {
            Onion::Plain => "oPLAIN",
            Onion::Det => "oDET",
            Onion::Ord => "oOPE",
            Onion::Agg => "oAGG",
            Onion::Swp => "oSWP",
        }
    }
}

impl fmt::Display for Onion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Onion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_ONIONS
            .into_iter()
            .find(|o| o.name() == s)
            .ok_or_else(|| Error::metadata(format!("unknown onion `{s}`")))
    }
}

const ALL_LEVELS: [SecLevel; 7] = [
    SecLevel::PlainVal,
    SecLevel::DetJoin,
    SecLevel::Det,
    SecLevel::Ope,
    SecLevel::Hom,
    SecLevel::Search,
    SecLevel::Rnd,
];

impl SecLevel {
    pub fn name(&self) -> &'static str {
        match self {
            SecLevel::PlainVal => "PLAINVAL",
            SecLevel::DetJoin => "DETJOIN",
            SecLevel::Det => "DET",
            SecLevel::Ope => "OPE",
            SecLevel::Hom => "HOM",
            SecLevel::Search => "SEARCH",
            SecLevel::Rnd => "RND",
        }
    }
}

impl fmt::Display for SecLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SecLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_LEVELS
            .into_iter()
            .find(|l| l.name() == s)
            .ok_or_else(|| Error::metadata(format!("unknown security level `{s}`")))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldType::Int => "INT",
            FieldType::Str => "STR",
        })
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INT" => Ok(FieldType::Int),
            "STR" => Ok(FieldType::Str),
            _ => Err(Error::metadata(format!("unknown field type `{s}`"))),
        }
    }
}

impl FieldType {
    /// Column type used for unencrypted values of this type.
    pub fn plain_column_type(&self) -> &'static str {
        match self {
            FieldType::Int => "BIGINT",
            FieldType::Str => "TEXT",
        }
    }
}

impl OnionLayout {
    pub fn for_field(field_type: FieldType, rating: SecurityRating) -> Self {
        match (rating, field_type) {
            (SecurityRating::Plain, _) => OnionLayout::Plain,
            (SecurityRating::Sensitive, FieldType::Int) => OnionLayout::Num,
            (SecurityRating::Sensitive, FieldType::Str) => OnionLayout::Str,
        }
    }

    /// Onions of the layout with their layer stacks, innermost layer first.
    pub fn onions(&self) -> Vec<(Onion, Vec<SecLevel>)> {
        use SecLevel::*;
        match self {
            OnionLayout::Plain => vec![(Onion::Plain, vec![])],
            OnionLayout::Num => vec![
                (Onion::Det, vec![DetJoin, Det, Rnd]),
                (Onion::Ord, vec![Ope, Rnd]),
                (Onion::Agg, vec![Hom]),
            ],
            OnionLayout::Str => vec![
                (Onion::Det, vec![DetJoin, Det, Rnd]),
                (Onion::Ord, vec![Ope, Rnd]),
                (Onion::Swp, vec![Search]),
            ],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OnionLayout::Plain => "PLAIN",
            OnionLayout::Num => "NUM",
            OnionLayout::Str => "STR",
        }
    }
}

impl fmt::Display for OnionLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OnionLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PLAIN" => Ok(OnionLayout::Plain),
            "NUM" => Ok(OnionLayout::Num),
            "STR" => Ok(OnionLayout::Str),
            _ => Err(Error::metadata(format!("unknown onion layout `{s}`"))),
        }
    }
}
