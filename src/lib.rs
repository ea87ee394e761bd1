//! Concurrent scheduler for multi-phase document pipelines.
//!
//! Every pipeline is split into Input, Process, Transform and Output phases.
//! The [`engine::Engine`] turns the registered pipelines into a phase graph,
//! runs independent phases concurrently on tokio, and publishes each
//! pipeline's Process output to a shared [`output_store::OutputStore`].

pub mod barrier;
pub mod config;
pub mod context;
pub mod document;
pub mod engine;
pub mod error;
pub mod graph;
pub mod log;
pub mod output_store;
pub mod phase;
pub mod pipeline;
pub mod scheduler;
pub mod stage;
pub mod stages;
