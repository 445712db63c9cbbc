//! Observability setup for the stepwise binaries.

pub mod tracing_setup;
