//! Stable shard-routing hash.
//!
//! A 32-bit string fold over UTF-16 code units: `h = (h << 5) - h + c`,
//! truncated to 32 bits each step, shard = `|h| mod num_shards`. The
//! algorithm identifier and version are pinned into table metadata at
//! creation time (`tessera_topology::HASH_ALGORITHM` / `HASH_VERSION`);
//! changing the fold requires a new version and a rehash of stored data,
//! never an in-place edit.

use tessera_shard::SqlValue;

/// Folds a string into a signed 32-bit hash.
pub fn fold32(value: &str) -> i32 {
    let mut h: i32 = 0;
    for unit in value.encode_utf16() {
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(unit as i32);
    }
    h
}

/// Maps a shard-key value onto a logical shard in `[0, num_shards)`.
///
/// Values are stringified through the same canonical form used for index
/// keys, so routing and index entries always agree on what a value "is".
pub fn shard_for_value(value: &SqlValue, num_shards: u32) -> u32 {
    shard_for_key(&value.display_string(), num_shards)
}

/// Maps an already-canonicalized key string onto a logical shard.
pub fn shard_for_key(key: &str, num_shards: u32) -> u32 {
    if num_shards <= 1 {
        return 0;
    }
    fold32(key).unsigned_abs() % num_shards
}
