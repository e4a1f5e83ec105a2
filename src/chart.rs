//! Locating the track list inside a chart document.
//!
//! Charts come from scrapers of different vintages, so the track array may
//! be the document itself, a `tracks` field, a nested `playlist.tracks`, or
//! any array whose first entry looks like a track.

use serde_json::Value;
use tracing::debug;

use crate::model::Track;

/// Extract every valid track from a chart document.
///
/// Entries without a usable title and artist are skipped.
pub fn extract_tracks(chart: &Value) -> Vec<Track> {
    let Some(entries) = track_array(chart) else {
        return Vec::new();
    };

    let tracks: Vec<Track> = entries.iter().filter_map(Track::from_value).collect();
    if tracks.len() < entries.len() {
        debug!(
            skipped = entries.len() - tracks.len(),
            "chart entries without title or artist"
        );
    }
    tracks
}

fn track_array(chart: &Value) -> Option<&Vec<Value>> {
    match chart {
        Value::Array(entries) => Some(entries),
        Value::Object(obj) => {
            if let Some(Value::Array(entries)) = obj.get("tracks") {
                return Some(entries);
            }
            if let Some(Value::Array(entries)) = obj.get("playlist").and_then(|p| p.get("tracks")) {
                return Some(entries);
            }
            obj.values().find_map(|v| match v {
                Value::Array(entries) if looks_like_tracks(entries) => Some(entries),
                _ => None,
            })
        }
        _ => None,
    }
}

fn looks_like_tracks(entries: &[Value]) -> bool {
    entries
        .first()
        .and_then(Value::as_object)
        .is_some_and(|first| first.contains_key("title") || first.contains_key("artist"))
}
