pub mod combiner;
pub mod config;
pub mod executors;
pub mod job;
pub mod manifest;
pub mod orchestrator;
pub mod path;
pub mod pipeline;
pub mod sync;
pub mod template;
