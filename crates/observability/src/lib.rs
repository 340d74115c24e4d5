//! `bos-observability` — process-wide tracing setup.

mod tracing;

pub use crate::tracing::init;
