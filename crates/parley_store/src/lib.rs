#![forbid(unsafe_code)]

//! Consumed external interfaces: the key/value record store (with per-key
//! locks and multi-step transactions), the fire-and-forget search index,
//! and the identity provider. Each ships an in-memory implementation plus,
//! for the record store, a SQLite backend.

pub mod identity;
pub mod records;
pub mod search;
pub mod tokens;

pub use identity::{Directory, IdentityError, IdentityProvider, IdentitySession, UserChange, UserPatch};
pub use records::{KeyLocks, MemoryRecordStore, RecordStore, SqliteRecordStore, StoreTransaction};
pub use search::{MemorySearchIndex, NullSearchIndex, SearchIndex};
pub use tokens::{AuthClaims, sign_token, verify_token};
