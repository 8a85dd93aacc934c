pub mod aggregates;
pub mod cache;
pub mod config;
pub mod content;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod index;
pub mod orchestrator;
pub mod persistence;
pub mod profile;
pub mod protocol;
pub mod scoring;
pub mod server;
pub mod topics;
pub mod transport;
pub mod trend;
