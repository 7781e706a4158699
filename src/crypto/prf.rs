//! HMAC-SHA256 as the keyed pseudo-random function behind every layer.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::onions::SecLevel;

type HmacSha256 = Hmac<Sha256>;

pub type LayerKey = [u8; 32];

/// HMAC over the concatenation of `parts`.
pub fn prf(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("bad hmac key: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

pub fn prf_u64(key: &[u8], parts: &[&[u8]]) -> Result<u64> {
    let out = prf(key, parts)?;
    let mut head = [0u8; 8];
    head.copy_from_slice(&out[..8]);
    Ok(u64::from_be_bytes(head))
}

/// Key of the layer at `level` of the onion whose anonymized name is
/// `onion_name`.
pub fn layer_key(master: &LayerKey, onion_name: &str, level: SecLevel) -> Result<LayerKey> {
    prf(master, &[onion_name.as_bytes(), b"/", level.name().as_bytes()])
}

/// Key shared by the `DETJOIN` layers of all fields, so that joined
/// columns compare equal on the server.
pub fn join_key(master: &LayerKey) -> Result<LayerKey> {
    prf(master, &[b"join/", SecLevel::DetJoin.name().as_bytes()])
}
