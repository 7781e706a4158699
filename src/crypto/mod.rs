//! Encryption layers.
//!
//! Every onion is a stack of [`EncLayer`]s. The planner only needs a layer's
//! level, how to encrypt and decrypt a value, which column type its
//! ciphertexts need, how the server removes it, and how to persist it.

mod det;
mod hom;
mod ope;
mod prf;
mod search;

pub use det::{DetLayer, RndLayer};
pub use hom::HomLayer;
pub use ope::OpeLayer;
pub use prf::{join_key, layer_key, LayerKey};
pub use search::SearchLayer;

use crate::encoding::Value;
use crate::error::{Error, Result};
use crate::onions::{FieldType, SecLevel};
use crate::serial::{Deserializer, Serializer};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncLayer {
    Rnd(RndLayer),
    Det(DetLayer),
    DetJoin(DetLayer),
    Ope(OpeLayer),
    Hom(Box<HomLayer>),
    Search(SearchLayer),
}

impl EncLayer {
    pub fn new(level: SecLevel, field_type: FieldType, key: LayerKey) -> Result<Self> {
        Ok(match level {
            SecLevel::Rnd => EncLayer::Rnd(RndLayer { field_type, key }),
            SecLevel::Det => EncLayer::Det(DetLayer { field_type, key }),
            SecLevel::DetJoin => EncLayer::DetJoin(DetLayer { field_type, key }),
            SecLevel::Ope => EncLayer::Ope(OpeLayer { field_type, key }),
            SecLevel::Hom if field_type == FieldType::Int => EncLayer::Hom(Box::new(HomLayer::new(key)?)),
            SecLevel::Search if field_type == FieldType::Str => EncLayer::Search(SearchLayer { key }),
            other => {
                return Err(Error::text(format!(
                    "no {other} layer exists for {field_type} values"
                )))
            }
        })
    }

    /// Builds the layer at `level` of the onion named `onion_name`, with a
    /// key derived from `master`.
    pub fn derive(master: &LayerKey, onion_name: &str, level: SecLevel, field_type: FieldType) -> Result<Self> {
        let key = match level {
            SecLevel::DetJoin => join_key(master)?,
            _ => layer_key(master, onion_name, level)?,
        };
        Self::new(level, field_type, key)
    }

    pub fn level(&self) -> SecLevel {
        match self {
            EncLayer::Rnd(_) => SecLevel::Rnd,
            EncLayer::Det(_) => SecLevel::Det,
            EncLayer::DetJoin(_) => SecLevel::DetJoin,
            EncLayer::Ope(_) => SecLevel::Ope,
            EncLayer::Hom(_) => SecLevel::Hom,
            EncLayer::Search(_) => SecLevel::Search,
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            EncLayer::Rnd(l) => l.field_type,
            EncLayer::Det(l) | EncLayer::DetJoin(l) => l.field_type,
            EncLayer::Ope(l) => l.field_type,
            EncLayer::Hom(_) => FieldType::Int,
            EncLayer::Search(_) => FieldType::Str,
        }
    }

    /// Type of the values this layer produces, which is what the next
    /// layer of the onion encrypts. Order-preserving ciphertexts of strings
    /// are integers.
    pub fn output_type(&self) -> FieldType {
        match self {
            EncLayer::Ope(_) | EncLayer::Hom(_) => FieldType::Int,
            EncLayer::Search(_) => FieldType::Str,
            other => other.field_type(),
        }
    }

    pub fn key(&self) -> &LayerKey {
        match self {
            EncLayer::Rnd(l) => &l.key,
            EncLayer::Det(l) | EncLayer::DetJoin(l) => &l.key,
            EncLayer::Ope(l) => &l.key,
            EncLayer::Hom(l) => &l.key,
            EncLayer::Search(l) => &l.key,
        }
    }

    /// Layers whose ciphertexts depend on the row salt.
    pub fn needs_salt(&self) -> bool {
        matches!(self, EncLayer::Rnd(_) | EncLayer::Hom(_))
    }

    pub fn encrypt(&self, v: &Value, salt: u64) -> Result<Value> {
        if v.is_null() {
            return Ok(Value::Null);
        }
        match self {
            EncLayer::Rnd(l) => l.encrypt(v, salt),
            EncLayer::Det(l) | EncLayer::DetJoin(l) => l.encrypt(v),
            EncLayer::Ope(l) => l.encrypt(v),
            EncLayer::Hom(l) => l.encrypt(v, salt),
            EncLayer::Search(l) => l.encrypt(v),
        }
    }

    pub fn decrypt(&self, v: &Value, salt: u64) -> Result<Value> {
        if v.is_null() {
            return Ok(Value::Null);
        }
        match self {
            EncLayer::Rnd(l) => l.decrypt(v, salt),
            EncLayer::Det(l) | EncLayer::DetJoin(l) => l.decrypt(v),
            EncLayer::Ope(l) => l.decrypt(v),
            EncLayer::Hom(l) => l.decrypt(v),
            EncLayer::Search(_) => Err(Error::Crypto("search tokens cannot be decrypted".into())),
        }
    }

    /// Column type holding this layer's ciphertexts.
    pub fn column_type(&self) -> &'static str {
        match (self, self.field_type()) {
            (EncLayer::Hom(_), _) => "VARBINARY(16)",
            (EncLayer::Search(_), _) => "BLOB",
            (EncLayer::Ope(_), _) => "BIGINT UNSIGNED",
            (_, FieldType::Int) => "BIGINT UNSIGNED",
            (_, FieldType::Str) => "BLOB",
        }
    }

    /// Server-side expression that removes this layer from `column`.
    pub fn decrypt_udf(&self, column: &str, salt_column: Option<&str>) -> Result<String> {
        let suffix = match self.field_type() {
            FieldType::Int => "int",
            FieldType::Str => "text",
        };
        let key = Value::Blob(self.key().to_vec()).to_sql();
        match self {
            EncLayer::Rnd(_) => {
                let salt = salt_column
                    .ok_or_else(|| Error::metadata(format!("{column} has a RND layer but no salt")))?;
                Ok(format!("cdb_decrypt_rnd_{suffix}({column}, {key}, {salt})"))
            }
            EncLayer::Det(_) => Ok(format!("cdb_decrypt_det_{suffix}({column}, {key})")),
            EncLayer::DetJoin(_) => Ok(format!("cdb_decrypt_detjoin_{suffix}({column}, {key})")),
            other => Err(Error::text(format!(
                "the {} layer cannot be removed on the server",
                other.level()
            ))),
        }
    }

    pub fn serialize(&self) -> String {
        Serializer::new()
            .field(self.level())
            .field(self.field_type())
            .field(hex::encode(self.key()))
            .finish()
    }

    pub fn deserialize(serial: &str) -> Result<Self> {
        let mut d = Deserializer::new(serial);
        let level: SecLevel = d.parse()?;
        let field_type: FieldType = d.parse()?;
        let key_hex = d.next_field()?;
        let key: LayerKey = hex::decode(key_hex)
            .ok()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| Error::metadata(format!("bad layer key `{key_hex}`")))?;
        Self::new(level, field_type, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_signed;

    const MASTER: LayerKey = [42u8; 32];

    fn stack(levels: &[SecLevel], field_type: FieldType) -> Vec<EncLayer> {
        levels
            .iter()
            .map(|l| EncLayer::derive(&MASTER, "t_x_oDET", *l, field_type).unwrap())
            .collect()
    }

    #[test]
    fn onion_round_trip() {
        let layers = stack(&[SecLevel::DetJoin, SecLevel::Det, SecLevel::Rnd], FieldType::Int);
        let mut v = Value::Int(-77);
        for l in &layers {
            v = l.encrypt(&v, 99).unwrap();
        }
        for l in layers.iter().rev() {
            v = l.decrypt(&v, 99).unwrap();
        }
        assert_eq!(v, Value::UInt(encode_signed(-77i64)));
        assert_eq!(v.into_plain(FieldType::Int).unwrap(), Value::Int(-77));
    }

    #[test]
    fn join_layers_agree_across_fields() {
        let a = EncLayer::derive(&MASTER, "a_oDET", SecLevel::DetJoin, FieldType::Str).unwrap();
        let b = EncLayer::derive(&MASTER, "b_oDET", SecLevel::DetJoin, FieldType::Str).unwrap();
        let v = Value::Text("x".into());
        assert_eq!(a.encrypt(&v, 0).unwrap(), b.encrypt(&v, 0).unwrap());
        let c = EncLayer::derive(&MASTER, "a_oDET", SecLevel::Det, FieldType::Str).unwrap();
        let d = EncLayer::derive(&MASTER, "b_oDET", SecLevel::Det, FieldType::Str).unwrap();
        assert_ne!(c.encrypt(&v, 0).unwrap(), d.encrypt(&v, 0).unwrap());
    }

    #[test]
    fn serialization_keeps_the_key() {
        for layer in stack(&[SecLevel::Rnd, SecLevel::Ope], FieldType::Int) {
            let back = EncLayer::deserialize(&layer.serialize()).unwrap();
            assert_eq!(back, layer);
        }
        assert!(EncLayer::deserialize("3_RND3_INT2_ab").is_err());
    }

    #[test]
    fn udfs() {
        let rnd = EncLayer::derive(&MASTER, "o", SecLevel::Rnd, FieldType::Int).unwrap();
        let udf = rnd.decrypt_udf("c1", Some("s1")).unwrap();
        assert!(udf.starts_with("cdb_decrypt_rnd_int(c1, X'"));
        assert!(udf.ends_with(", s1)"));
        assert!(rnd.decrypt_udf("c1", None).is_err());
        let ope = EncLayer::derive(&MASTER, "o", SecLevel::Ope, FieldType::Int).unwrap();
        assert!(ope.decrypt_udf("c1", None).is_err());
    }

    #[test]
    fn text_order_onion_stacks_an_integer_rnd_layer() {
        let ope = EncLayer::derive(&MASTER, "t_x_oOPE", SecLevel::Ope, FieldType::Str).unwrap();
        assert_eq!(ope.output_type(), FieldType::Int);
        let rnd = EncLayer::derive(&MASTER, "t_x_oOPE", SecLevel::Rnd, ope.output_type()).unwrap();
        let inner = ope.encrypt(&Value::Text("alice".into()), 0).unwrap();
        let outer = rnd.encrypt(&inner, 17).unwrap();
        assert_eq!(rnd.decrypt(&outer, 17).unwrap(), inner);
        assert_eq!(rnd.column_type(), ope.column_type());
        assert!(rnd.decrypt_udf("c", Some("s")).unwrap().starts_with("cdb_decrypt_rnd_int("));
    }

    #[test]
    fn unsupported_combinations() {
        assert!(EncLayer::new(SecLevel::Hom, FieldType::Str, [0u8; 32]).is_err());
        assert!(EncLayer::new(SecLevel::PlainVal, FieldType::Int, [0u8; 32]).is_err());
    }
}
