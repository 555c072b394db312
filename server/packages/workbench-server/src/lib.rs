//! Research workbench coordinator.
//!
//! Owns the session registry, per-session working directories, and the
//! run lifecycle (background execution, progress polling, cancellation),
//! and exposes all of it over HTTP. The research agent itself stays
//! opaque behind [`workbench_agent_client::ResearchAgent`].

pub mod cli;
pub mod config;
pub mod router;
pub mod runner;
pub mod scanner;
pub mod sessions;
pub mod workspace;
