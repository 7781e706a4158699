//! Deterministic and randomized layers.
//!
//! Integers go through a 64-bit Feistel network whose round function is
//! HMAC, so ciphertexts stay `BIGINT UNSIGNED`. Byte strings go through
//! AES-256-GCM. The deterministic variant derives the nonce from the
//! plaintext (and prepends it); the randomized variant derives it from the
//! row salt, which is stored next to the ciphertext.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};

use crate::crypto::prf::{prf, prf_u64, LayerKey};
use crate::encoding::Value;
use crate::error::{Error, Result};
use crate::onions::FieldType;

const ROUNDS: u8 = 4;
const NONCE_LEN: usize = 12;

fn round(key: &LayerKey, tweak: u64, i: u8, half: u32) -> Result<u32> {
    Ok(prf_u64(key, &[&[i], &tweak.to_be_bytes(), &half.to_be_bytes()])? as u32)
}

/// Keyed permutation of `u64`, tweaked by `tweak`.
pub fn permute(key: &LayerKey, tweak: u64, x: u64) -> Result<u64> {
    let (mut l, mut r) = ((x >> 32) as u32, x as u32);
    for i in 0..ROUNDS {
        let next = l ^ round(key, tweak, i, r)?;
        l = r;
        r = next;
    }
    Ok(((l as u64) << 32) | r as u64)
}

/// Inverse of [`permute`].
pub fn unpermute(key: &LayerKey, tweak: u64, y: u64) -> Result<u64> {
    let (mut l, mut r) = ((y >> 32) as u32, y as u32);
    for i in (0..ROUNDS).rev() {
        let prev = r ^ round(key, tweak, i, l)?;
        r = l;
        l = prev;
    }
    Ok(((l as u64) << 32) | r as u64)
}

fn cipher(key: &LayerKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| Error::Crypto(format!("bad aes key: {e}")))
}

fn seal(key: &LayerKey, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    cipher(key)?
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::Crypto("aes-gcm encryption failed".into()))
}

fn open(key: &LayerKey, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    cipher(key)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("aes-gcm authentication failed".into()))
}

/// Deterministic encryption, used for both `DET` and `DETJOIN`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetLayer {
    pub field_type: FieldType,
    pub key: LayerKey,
}

impl DetLayer {
    pub fn encrypt(&self, v: &Value) -> Result<Value> {
        match self.field_type {
            FieldType::Int => Ok(Value::UInt(permute(&self.key, 0, v.to_u64()?)?)),
            FieldType::Str => {
                let plaintext = v.to_bytes()?;
                let synthetic = prf(&self.key, &[b"siv", &plaintext])?;
                let nonce = &synthetic[..NONCE_LEN];
                let mut out = nonce.to_vec();
                out.extend(seal(&self.key, nonce, &plaintext)?);
                Ok(Value::Blob(out))
            }
        }
    }

    pub fn decrypt(&self, v: &Value) -> Result<Value> {
        match self.field_type {
            FieldType::Int => Ok(Value::UInt(unpermute(&self.key, 0, v.to_u64()?)?)),
            FieldType::Str => {
                let bytes = v.to_bytes()?;
                if bytes.len() < NONCE_LEN {
                    return Err(Error::Crypto("deterministic ciphertext is too short".into()));
                }
                let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
                Ok(Value::Blob(open(&self.key, nonce, ciphertext)?))
            }
        }
    }
}

/// Randomized encryption keyed by the row salt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RndLayer {
    pub field_type: FieldType,
    pub key: LayerKey,
}

impl RndLayer {
    fn nonce(&self, salt: u64) -> Result<[u8; NONCE_LEN]> {
        let full = prf(&self.key, &[b"rnd", &salt.to_be_bytes()])?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&full[..NONCE_LEN]);
        Ok(nonce)
    }

    pub fn encrypt(&self, v: &Value, salt: u64) -> Result<Value> {
        match self.field_type {
            FieldType::Int => Ok(Value::UInt(permute(&self.key, salt, v.to_u64()?)?)),
            FieldType::Str => Ok(Value::Blob(seal(&self.key, &self.nonce(salt)?, &v.to_bytes()?)?)),
        }
    }

    pub fn decrypt(&self, v: &Value, salt: u64) -> Result<Value> {
        match self.field_type {
            FieldType::Int => Ok(Value::UInt(unpermute(&self.key, salt, v.to_u64()?)?)),
            FieldType::Str => Ok(Value::Blob(open(&self.key, &self.nonce(salt)?, &v.to_bytes()?)?)),
        }
    }
}
