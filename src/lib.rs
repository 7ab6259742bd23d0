//! CF1400 Report Harvester Library
//!
//! Exposes the reconciliation core and its collaborators for the
//! `cf1400d` binary and the integration tests.

pub mod api;
pub mod candidates;
pub mod config;
pub mod engine;
pub mod fetcher;
pub mod history;
pub mod models;
pub mod naming;
