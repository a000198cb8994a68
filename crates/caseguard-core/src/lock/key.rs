//! Numeric advisory lock keys.
//!
//! The backing store locks integers, not strings. Every `(LockType, id)` pair
//! hashes to a 31-bit non-negative key with 32-bit FNV-1a over `"{type}:{id}"`.
//!
//! The key is NOT unique: two unrelated entities can land on the same key and
//! will then contend with each other. That is tolerated. The `update` mode
//! lock lives on `key + 1`, which can also coincide with another entity's
//! base key. Changing either rule changes the key space seen by any process
//! already holding locks, so both stay as they are.

use super::types::{LockMode, LockType};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;
const KEY_MASK: u32 = 0x7fff_ffff;

/// Backend primitive used for a given lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Exclusive,
    Shared,
}

/// Base key for an entity, in `0..=i32::MAX`.
#[must_use]
pub fn lock_key(entity_type: LockType, entity_id: &str) -> i64 {
    let type_name: &'static str = entity_type.into();
    let hash = type_name
        .bytes()
        .chain(std::iter::once(b':'))
        .chain(entity_id.bytes())
        .fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
        });
    i64::from(hash & KEY_MASK)
}

/// Key and primitive the backend is asked for when locking in `mode`.
///
/// `update` is an exclusive lock on the base key plus one.
#[must_use]
pub fn backend_target(entity_type: LockType, entity_id: &str, mode: LockMode) -> (i64, LockKind) {
    let key = lock_key(entity_type, entity_id);
    match mode {
        LockMode::Exclusive => (key, LockKind::Exclusive),
        LockMode::Shared => (key, LockKind::Shared),
        LockMode::Update => (key + 1, LockKind::Exclusive),
    }
}
