//! Enriched track items and the additive attribute merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity;

/// Attribute payload of an item. Field order is irrelevant.
pub type Attributes = serde_json::Map<String, Value>;

/// Fields that arrive under more than one name. The first name is canonical.
const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("rank", &["rank", "position"]),
    ("release_date", &["release_date", "released"]),
    ("beatport_url", &["beatport_url", "url"]),
    ("beatport_id", &["beatport_id", "id"]),
];

/// Keys consumed by identity resolution; never copied into `extra`.
const IDENTITY_KEYS: &[&str] = &["title", "track", "name", "artist", "artists", "track_id"];

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// Content-addressed identity: hex SHA-256 of the normalized title/artist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub(crate) String);

impl ItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accept a previously computed identity (e.g. from a database row).
    pub fn from_hex(hex: impl Into<String>) -> Option<Self> {
        let hex = hex.into();
        let valid = hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(hex.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored, enriched track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of `ItemStore::upsert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertResult {
    pub item_id: ItemId,
    pub created: bool,
}

/// Whether a stored value counts as absent for merge purposes.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Fill absent or empty fields of `stored` from `incoming`.
///
/// Non-empty stored values are never replaced and nothing is removed, so
/// applying the same merge twice is a no-op. Returns whether anything changed.
pub fn merge_attributes(stored: &mut Attributes, incoming: &Attributes) -> bool {
    let mut changed = false;
    for (key, value) in incoming {
        if is_empty_value(value) {
            continue;
        }
        let fill = stored.get(key).is_none_or(is_empty_value);
        if fill {
            stored.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

/// One chart entry as carried on the wire: the two identity fields plus
/// whatever else the chart knew about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    pub artist: String,
    #[serde(flatten)]
    pub extra: Attributes,
}

impl Track {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            extra: Attributes::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Build a track from a loosely shaped chart or message object.
    ///
    /// Title falls back to `track` then `name`; artist falls back to
    /// `artists`, which may be a list. Returns `None` when either identity
    /// field is missing or blank.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;

        let title = ["title", "track", "name"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(text_of))?;
        let artist = ["artist", "artists"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(text_of))?;

        let mut extra = Attributes::new();
        for (canonical, names) in FIELD_ALIASES {
            if let Some(v) = names
                .iter()
                .filter_map(|n| obj.get(*n))
                .find(|v| !is_empty_value(v))
            {
                extra.insert((*canonical).to_string(), v.clone());
            }
        }
        for (key, v) in obj {
            let aliased = FIELD_ALIASES.iter().any(|(_, names)| names.contains(&key.as_str()));
            if aliased || IDENTITY_KEYS.contains(&key.as_str()) || is_empty_value(v) {
                continue;
            }
            extra.insert(key.clone(), v.clone());
        }

        Some(Self {
            title,
            artist,
            extra,
        })
    }

    pub fn identity(&self) -> ItemId {
        identity::identity(&self.title, &self.artist)
    }

    /// Attributes to store for this track: identity fields plus non-empty extras.
    pub fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("title".to_string(), Value::String(self.title.clone()));
        attrs.insert("artist".to_string(), Value::String(self.artist.clone()));
        for (k, v) in &self.extra {
            if !is_empty_value(v) {
                attrs.insert(k.clone(), v.clone());
            }
        }
        attrs
    }
}

/// Render a title/artist value as trimmed text. Lists join with ", ".
fn text_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(text_of)
            .collect::<Vec<_>>()
            .join(", "),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}
