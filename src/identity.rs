//! Deterministic track identity.
//!
//! Two stages that never talk to each other (the chart producer and the
//! enrichment worker) agree on an item's key by hashing the same normalized
//! text. The hash is the only coordination they need.

use sha2::{Digest, Sha256};

use crate::model::ItemId;

/// Separator between the normalized artist and title.
const FIELD_DELIMITER: &str = "::";

/// Canonical form of a natural-language field.
///
/// Lowercases, drops everything that is neither a word character
/// (alphanumeric or `_`) nor whitespace, collapses whitespace runs to a
/// single space, and trims.
pub fn normalize(s: &str) -> String {
    let kept: String = s
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Identity of a track from its title and artist.
pub fn identity(title: &str, artist: &str) -> ItemId {
    let combined = format!("{}{FIELD_DELIMITER}{}", normalize(artist), normalize(title));
    let digest = Sha256::digest(combined.as_bytes());
    ItemId(format!("{digest:x}"))
}
