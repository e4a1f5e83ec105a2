//! # chartflow
//!
//! Fan-out/fan-in coordination for chart enrichment.
//!
//! A producer turns one chart into a job with `expected = N` and N queued
//! track messages. Workers enrich and store each track under a
//! content-addressed identity and count it toward its job. The counter's
//! single conditional update decides, exactly once per job, when the last
//! track is in, and the completion event is fired from there.

pub mod chart;
pub mod config;
pub mod db;
pub mod enrich;
pub mod error;
pub mod event;
pub mod identity;
pub mod model;
pub mod notifier;
pub mod processor;
pub mod producer;
pub mod store;
pub mod telemetry;
pub mod worker;
