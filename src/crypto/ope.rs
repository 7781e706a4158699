//! Order-preserving layer.
//!
//! Maps a 32-bit domain into the 64-bit range by recursive bisection: the
//! image of the middle of the current domain interval is drawn
//! pseudo-randomly from the part of the current range interval that leaves
//! room for both halves. Equal plaintexts get equal ciphertexts and order is
//! strictly preserved.
//!
//! Integers must fit in 32 bits. Strings are ordered by their first four
//! bytes and cannot be decrypted.

use crate::crypto::prf::{prf_u64, LayerKey};
use crate::encoding::{decode_signed, encode_signed, pack_prefix, Value};
use crate::error::{Error, Result};
use crate::onions::FieldType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpeLayer {
    pub field_type: FieldType,
    pub key: LayerKey,
}

/// Picks a point of `[lo, hi]` from the PRF output.
fn pick(key: &LayerKey, dl: u64, dh: u64, lo: u64, hi: u64) -> Result<u64> {
    let span = (hi - lo) as u128 + 1;
    let r = prf_u64(key, &[&dl.to_be_bytes(), &dh.to_be_bytes()])? as u128;
    Ok(lo + (r % span) as u64)
}

/// Walks the bisection tree towards `x`, or towards the ciphertext `y` when
/// decrypting, and returns the leaf's domain value and ciphertext.
fn walk(key: &LayerKey, go_left: impl Fn(u64, u64) -> bool) -> Result<(u64, u64)> {
    let (mut dl, mut dh) = (0u64, u32::MAX as u64);
    let (mut rl, mut rh) = (0u64, u64::MAX);
    while dl < dh {
        let dm = dl + (dh - dl) / 2;
        let rm = pick(key, dl, dh, rl + (dm - dl), rh - (dh - dm))?;
        if go_left(dm, rm) {
            dh = dm;
            rh = rm;
        } else {
            dl = dm + 1;
            rl = rm + 1;
        }
    }
    Ok((dl, pick(key, dl, dh, rl, rh)?))
}

impl OpeLayer {
    fn domain_value(&self, v: &Value) -> Result<u32> {
        match self.field_type {
            FieldType::Int => {
                let i = decode_signed(v.to_u64()?);
                let small = i32::try_from(i)
                    .map_err(|_| Error::Crypto(format!("{i} does not fit the order-preserving domain")))?;
                Ok((small as u32) ^ (1 << 31))
            }
            FieldType::Str => Ok(pack_prefix(&v.to_bytes()?)),
        }
    }

    pub fn encrypt_u32(&self, x: u32) -> Result<u64> {
        let x = x as u64;
        Ok(walk(&self.key, |dm, _| x <= dm)?.1)
    }

    pub fn encrypt(&self, v: &Value) -> Result<Value> {
        Ok(Value::UInt(self.encrypt_u32(self.domain_value(v)?)?))
    }

    pub fn decrypt(&self, v: &Value) -> Result<Value> {
        if self.field_type == FieldType::Str {
            return Err(Error::Crypto("order-preserving text cannot be decrypted".into()));
        }
        let y = v.to_u64()?;
        let (x, expected) = walk(&self.key, |_, rm| y <= rm)?;
        if expected != y {
            return Err(Error::Crypto(format!("{y} is not an order-preserving ciphertext")));
        }
        let i = ((x as u32) ^ (1 << 31)) as i32;
        Ok(Value::UInt(encode_signed(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn layer() -> OpeLayer {
        OpeLayer {
            field_type: FieldType::Int,
            key: [5u8; 32],
        }
    }

    #[test]
    fn round_trip_and_range() {
        let l = layer();
        for i in [i32::MIN as i64, -1, 0, 7, i32::MAX as i64] {
            let ct = l.encrypt(&Value::Int(i)).unwrap();
            let back = l.decrypt(&ct).unwrap();
            assert_eq!(back, Value::UInt(encode_signed(i)));
        }
        assert!(l.encrypt(&Value::Int(1 << 40)).is_err());
    }

    #[test]
    fn text_is_not_decryptable() {
        let l = OpeLayer {
            field_type: FieldType::Str,
            key: [5u8; 32],
        };
        let a = l.encrypt(&Value::Text("apple".into())).unwrap();
        let b = l.encrypt(&Value::Text("banana".into())).unwrap();
        assert!(a.to_u64().unwrap() < b.to_u64().unwrap());
        assert!(l.decrypt(&a).is_err());
    }

    proptest! {
        #[test]
        fn preserves_order(a in any::<i32>(), b in any::<i32>()) {
            let l = layer();
            let ca = l.encrypt(&Value::Int(a as i64)).unwrap().to_u64().unwrap();
            let cb = l.encrypt(&Value::Int(b as i64)).unwrap().to_u64().unwrap();
            prop_assert_eq!(a.cmp(&b), ca.cmp(&cb));
        }
    }
}
