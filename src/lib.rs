//! Video generation gateway
//!
//! Accepts image-to-video generation jobs over HTTP, authenticates and
//! rate-limits callers, tracks each job through a compare-and-set state
//! machine while an external model does the work, stores the resulting video
//! in S3-compatible storage and notifies callers through signed webhooks.

pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
