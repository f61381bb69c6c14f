//! FundLab Core: domain types, source connectors, normalizer, reconciler.
//!
//! This crate holds everything up to and including adjudication:
//! - Domain types (fund ids, reporting months, records, provenance)
//! - Source connectors over HTTP and local directories, with retry
//! - Normalizer with versioned column mappings
//! - Reconciler applying primary/fallback precedence per key

pub mod data;
pub mod domain;
pub mod normalize;
pub mod reconcile;
