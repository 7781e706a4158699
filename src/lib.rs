//! Rewrites plaintext SQL into SQL over onion-encrypted columns.
//!
//! Every sensitive column is stored as several onions, stacks of
//! encryption layers each supporting one class of operations. Queries are
//! planned with two passes over the expression tree: [`gather`] computes
//! what every node can be evaluated at, [`rewrite`] picks one choice per
//! node and emits the ciphertext query. When an onion is too strongly
//! encrypted for a query, [`adjust`] peels it on the server and records
//! the change in the metadata tree through [`delta`]s.

pub mod adjust;
pub mod analysis;
pub mod config;
pub mod crypto;
pub mod delta;
pub mod enc_set;
pub mod encoding;
pub mod error;
pub mod expr;
pub mod gather;
pub mod onions;
pub mod proxy;
pub mod query;
pub mod rewrite;
pub mod rewrite_plan;
pub mod schema;
pub mod serial;
pub mod simplify;
pub mod statements;
pub mod store;
pub mod tables;
