//! Shared building blocks of the perfmon telemetry pipeline.
//!
//! - [`types`]: samples, batches and identities
//! - [`codec`]: fixed-width binary encoding of batches and acks
//! - [`channel`]: length-prefixed message channel over any async stream
//! - [`tls`]: mutual-TLS configuration and peer identity
//! - [`backoff`]: exponential backoff for reconnects and retries
//! - [`error`]: the pipeline-wide error taxonomy

pub mod backoff;
pub mod channel;
pub mod codec;
pub mod error;
pub mod id;
pub mod tls;
pub mod types;
