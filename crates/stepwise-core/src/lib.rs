//! Interpreter, durable execution engine and port definitions for Stepwise.
//!
//! This crate defines the "ports" (storage, lock, crypto, reader and
//! validator traits) that the infrastructure layer implements. It depends
//! only on `stepwise-types` -- never on `stepwise-infra` or any database,
//! filesystem or crypto crate.

pub mod durable;
pub mod engine;
pub mod repository;
pub mod service;
pub mod token;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
