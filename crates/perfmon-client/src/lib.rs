//! The perfmon client: a sampling task feeding a bounded queue, drained by a
//! sender loop that keeps a mutual-TLS channel to the ingest server alive.

pub mod client;
pub mod config;
pub mod connector;
pub mod queue;
