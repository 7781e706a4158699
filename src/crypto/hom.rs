//! Additively homomorphic layer: Paillier with `g = n + 1`.
//!
//! The modulus is the product of two 31-bit primes drawn from a ChaCha
//! stream seeded with the layer key, so the key alone is enough to rebuild
//! the keypair. `n²` fits in a `u128`; ciphertexts are stored as 16
//! big-endian bytes. Multiplying ciphertexts modulo `n²` adds plaintexts,
//! which is what the server-side sum aggregate does.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::crypto::prf::{prf, LayerKey};
use crate::encoding::{decode_signed, encode_signed, Value};
use crate::error::{Error, Result};

fn add_mod(a: u128, b: u128, m: u128) -> u128 {
    // a, b < m < 2^127
    let s = a + b;
    if s >= m {
        s - m
    } else {
        s
    }
}

fn mul_mod(mut a: u128, mut b: u128, m: u128) -> u128 {
    let mut result = 0;
    a %= m;
    while b > 0 {
        if b & 1 == 1 {
            result = add_mod(result, a, m);
        }
        a = add_mod(a, a, m);
        b >>= 1;
    }
    result
}

fn pow_mod(mut base: u128, mut exp: u128, m: u128) -> u128 {
    let mut result = 1 % m;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Modular inverse through the extended Euclidean algorithm.
fn inv_mod(a: u128, m: u128) -> Option<u128> {
    let (mut t, mut new_t) = (0i128, 1i128);
    let (mut r, mut new_r) = (m as i128, (a % m) as i128);
    while new_r != 0 {
        let q = r / new_r;
        (t, new_t) = (new_t, t - q * new_t);
        (r, new_r) = (new_r, r - q * new_r);
    }
    if r != 1 {
        return None;
    }
    Some(t.rem_euclid(m as i128) as u128)
}

/// Deterministic Miller-Rabin, exact for every `u64`.
fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    const BASES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    for p in BASES {
        if n % p == 0 {
            return n == p;
        }
    }
    let (mut d, mut s) = (n - 1, 0);
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }
    let n128 = n as u128;
    'witness: for a in BASES {
        let mut x = pow_mod(a as u128, d as u128, n128);
        if x == 1 || x == n128 - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n128);
            if x == n128 - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn random_prime(rng: &mut ChaCha20Rng) -> u64 {
    loop {
        let candidate = rng.gen_range((1u64 << 30)..(1u64 << 31)) | 1;
        if is_prime(candidate) {
            return candidate;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HomLayer {
    pub key: LayerKey,
    n: u128,
    n2: u128,
    lambda: u128,
    mu: u128,
}

impl HomLayer {
    pub fn new(key: LayerKey) -> Result<Self> {
        let mut rng = ChaCha20Rng::from_seed(key);
        loop {
            let (p, q) = (random_prime(&mut rng) as u128, random_prime(&mut rng) as u128);
            if p == q {
                continue;
            }
            let n = p * q;
            let phi = (p - 1) * (q - 1);
            if gcd(n, phi) != 1 {
                continue;
            }
            let lambda = phi / gcd(p - 1, q - 1);
            let Some(mu) = inv_mod(lambda % n, n) else {
                continue;
            };
            return Ok(Self {
                key,
                n,
                n2: n * n,
                lambda,
                mu,
            });
        }
    }

    /// `n²`, the public modulus the server multiplies ciphertexts under.
    pub fn public_modulus(&self) -> u128 {
        self.n2
    }

    fn blinding(&self, salt: u64) -> Result<u128> {
        let seed = prf(&self.key, &[b"hom", &salt.to_be_bytes()])?;
        let mut rng = ChaCha20Rng::from_seed(seed);
        loop {
            let r = rng.gen_range(1..self.n);
            if gcd(r, self.n) == 1 {
                return Ok(r);
            }
        }
    }

    fn to_bytes(c: u128) -> Value {
        Value::Blob(c.to_be_bytes().to_vec())
    }

    fn from_bytes(v: &Value) -> Result<u128> {
        let bytes = v.to_bytes()?;
        let array: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto(format!("homomorphic ciphertext has {} bytes", bytes.len())))?;
        Ok(u128::from_be_bytes(array))
    }

    pub fn encrypt(&self, v: &Value, salt: u64) -> Result<Value> {
        let i = decode_signed(v.to_u64()?) as i128;
        let m = i.rem_euclid(self.n as i128) as u128;
        let r = self.blinding(salt)?;
        let gm = add_mod(1, mul_mod(m, self.n, self.n2), self.n2);
        let c = mul_mod(gm, pow_mod(r, self.n, self.n2), self.n2);
        Ok(Self::to_bytes(c))
    }

    pub fn decrypt(&self, v: &Value) -> Result<Value> {
        let c = Self::from_bytes(v)?;
        if c == 0 || c >= self.n2 {
            return Err(Error::Crypto("homomorphic ciphertext out of range".into()));
        }
        let u = pow_mod(c, self.lambda, self.n2);
        let l = (u - 1) / self.n;
        let m = mul_mod(l, self.mu, self.n);
        let i = if m > self.n / 2 {
            m as i128 - self.n as i128
        } else {
            m as i128
        };
        Ok(Value::UInt(encode_signed(i as i64)))
    }

    /// Ciphertext of the sum of the plaintexts of `a` and `b`.
    pub fn add(&self, a: &Value, b: &Value) -> Result<Value> {
        let c = mul_mod(Self::from_bytes(a)?, Self::from_bytes(b)?, self.n2);
        Ok(Self::to_bytes(c))
    }
}
