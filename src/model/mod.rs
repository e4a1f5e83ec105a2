//! Core data model.
//!
//! A job is "process N tracks derived from one chart". Each track becomes
//! a content-addressed item; each queued message carries one track and the
//! job it counts toward.

pub mod item;
pub mod job;
pub mod message;

pub use item::{Attributes, Item, ItemId, Track, UpsertResult, merge_attributes};
pub use job::{IncrementResult, Job, JobFilter, JobId, JobStatus, NewJob};
pub use message::{Envelope, InboundMessage, ItemMessage};
