//! The Tako execution engine.
//!
//! Given a triggering event from a source repository, the engine discovers
//! every subscribing repository, materialises a tree of child workflow
//! executions, runs them concurrently under resource and concurrency
//! bounds, and converges to a single terminal outcome. The engine is
//! single-host: cross-process coordination goes through file-backed
//! repository locks, and all durable state is JSON under the workspace.
//!
//! Module map:
//! - `config` -- `tako.yml` loading and structural validation
//! - `state` -- per-run durable execution state
//! - `template` -- text templating with the fixed function catalog
//! - `lock` -- cross-process repository lock manager
//! - `subscription` -- discovery, semver ranges, filter evaluation
//! - `orchestrator` -- validated, deterministic subscription discovery
//! - `resource` -- hierarchical quotas and usage monitoring
//! - `runtime` -- the container runtime port
//! - `fanout` -- fan-out state machine and child launcher
//! - `child` -- per-child workspace isolation factory
//! - `runner` -- the workflow runner root and step executor
//! - `graph` -- directed dependent propagation port

pub mod child;
pub mod config;
pub mod fanout;
pub mod graph;
pub mod lock;
pub mod orchestrator;
pub mod resource;
pub mod runner;
pub mod runtime;
pub mod state;
pub mod subscription;
pub mod template;
