//! The perfmon ingest server.
//!
//! [`ingest::IngestServer`] accepts mutual-TLS connections, runs one task per
//! connection, validates each decoded batch against the connection state in
//! [`connection::Connection`] and forwards it to a [`perfmon_storage::Sink`],
//! acknowledging only once the sink has accepted it.

pub mod config;
pub mod connection;
pub mod ingest;
pub mod retention;
pub mod sink;
pub mod throughput;
