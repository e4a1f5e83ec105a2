//! Enrichment lookups.
//!
//! The search backend that resolves a track to a playable video is an
//! external collaborator. Its failures are transient: the message is
//! redelivered and the lookup tried again.

use std::future::Future;

use crate::error::Result;
use crate::model::{Attributes, Track};

/// Looks up extra attributes for a track (e.g. `youtube_video_id`).
pub trait Enricher: Send + Sync {
    /// Attributes found for `track`. Empty when nothing matched; `Err` only
    /// for lookups that should be retried.
    fn enrich(&self, track: &Track) -> impl Future<Output = Result<Attributes>> + Send;
}

/// Stores tracks as charted, without any lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnrichment;

impl Enricher for NoEnrichment {
    async fn enrich(&self, _track: &Track) -> Result<Attributes> {
        Ok(Attributes::new())
    }
}
