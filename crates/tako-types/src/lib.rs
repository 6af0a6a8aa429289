//! Domain types for the Tako multi-repository workflow orchestrator.
//!
//! This crate defines the canonical data model shared by every other Tako
//! crate: run identity, events, the consumed `tako.yml` schema, subscription
//! declarations, fan-out state, lock records, resource specifications, and
//! the global operator configuration. It depends only on serde-family crates
//! -- never on the engine or any I/O layer.

pub mod config;
pub mod error;
pub mod event;
pub mod fanout;
pub mod lock;
pub mod resource;
pub mod runid;
pub mod subscription;
pub mod workflow;
