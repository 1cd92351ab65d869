pub mod auth;
pub mod inference;
pub mod job_store;
pub mod orchestrator;
pub mod outbound;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod runner;
pub mod storage;
pub mod validation;
pub mod webhook;
