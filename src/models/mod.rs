pub mod credential;
pub mod generation;
pub mod job;
