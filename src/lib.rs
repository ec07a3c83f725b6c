//! batchforge: fan-out/fan-in batch generation over tabular rows.
//!
//! A job's rows are fanned out to a fixed pool of workers
//! ([`worker::WorkerPool`]), each row is run against a [`generator::Generator`]
//! with per-worker rate limiting and bounded retries, and a fan-in
//! [`barrier::Barrier`] hands every result to the [`aggregator::Aggregator`],
//! which writes the artifact in submission order. Progress and status live in
//! a durable [`store`]; [`recovery`] rebuilds a partial artifact from persisted
//! per-task results when the fan-in never ran.

pub mod aggregator;
pub mod artifact;
pub mod barrier;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod generator;
pub mod input;
pub mod job;
pub mod recovery;
pub mod store;
pub mod ui;
pub mod worker;
