use std::collections::HashSet;

use anyhow::{Context, Result};
use regex::Regex;

use super::store::LruStore;

/// Evicts every resident entry whose key matches any of the given patterns
/// and returns the number of entries removed.
///
/// All patterns are compiled before anything is evicted, so a malformed
/// pattern aborts the whole invalidation with the store untouched. Patterns
/// are matched as authored; no anchoring is added, so `/posts` also selects
/// `GET:/posts/42` unless the author anchors it.
///
/// The key snapshot and the deletions are separate store operations, so a
/// concurrent reader may observe a prefix of the evictions. That is fine:
/// invalidation runs before the triggering request's response exists.
pub fn invalidate(store: &LruStore, patterns: &[String]) -> Result<usize> {
    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let regex = Regex::new(pattern)
            .with_context(|| format!("invalid bust pattern '{pattern}'"))?;
        compiled.push(regex);
    }

    let mut selected = HashSet::new();
    for key in store.keys() {
        if compiled.iter().any(|regex| regex.is_match(&key)) {
            selected.insert(key);
        }
    }

    Ok(store.delete(selected))
}
