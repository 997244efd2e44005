//! # stevedore
//!
//! **Node-local container execution agent.**
//!
//! Stevedore accepts declarative container specifications from a
//! higher-level scheduler, reserves node capacity, provisions containers
//! through an external low-level runtime, drives each container through
//! a strict lifecycle while running a tree of composable action steps
//! inside it, reports every transition as an event, and exposes a local
//! HTTP API for control and inspection.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                           stevedore                               │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  HTTP API (axum)                                                  │
//! │      │                                                            │
//! │      ▼                                                            │
//! │  Agent facade ──────────────► EventHub ──► subscribers            │
//! │      │                                                            │
//! │      ├─► AllocationStore   Reserved / Initializing   (no runtime) │
//! │      │        │  transfer (capacity claim travels)                │
//! │      └─► ContainerStore    Created / Running / Completed          │
//! │               │                                                   │
//! │               ▼                                                   │
//! │          RunSupervisor ──► Step tree (run / download / upload /   │
//! │               │            monitor / combinators)                 │
//! │               ▼                                                   │
//! │        RuntimeClient trait (external sandbox runtime)             │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!            reserve        initialize       create        mark running     complete
//!  (absent) ─────────► Reserved ─────► Initializing ─► Created ────────► Running ─────► Completed
//!                          │                │              │                              ▲
//!                          │                └──fail────────┴──────────────────────────────┘
//!                          └── expire ──► (absent)
//! ```
//!
//! Capacity is claimed exactly once (at reserve) and released exactly
//! once (at reservation expiry or deletion after completion). Illegal
//! transitions fail without side effects.
//!
//! # Key Seams
//!
//! | Area | Trait | Provided implementation |
//! |---|---|---|
//! | Sandbox runtime | [`RuntimeClient`] / [`Sandbox`] | external (injected) |
//! | Artifact fetch  | [`ArtifactDownloader`] | [`HttpDownloader`] (cached, tar-normalizing) |
//! | Artifact upload | [`Uploader`] | [`HttpUploader`] |
//! | Credentials     | [`CredentialManager`] | [`InstanceIdentityManager`] / no-op |
//! | Log delivery    | [`LogSink`] | `tracing` sink |
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stevedore::{Agent, AgentConfig, Collaborators};
//!
//! let agent = Agent::start(
//!     AgentConfig::default(),
//!     Collaborators {
//!         runtime,        // your RuntimeClient
//!         downloader: Arc::new(downloader),
//!         uploader: Arc::new(uploader),
//!         credentials: Arc::new(stevedore::NoopCredentialManager),
//!         log_sink: Arc::new(stevedore::TracingLogSink),
//!     },
//! )
//! .await?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:1700").await?;
//! stevedore::api::serve(agent, listener).await?;
//! ```

pub mod actions;
pub mod agent;
pub mod api;
pub mod capacity;
pub mod config;
pub mod constants;
pub mod container;
pub mod credentials;
pub mod downloader;
pub mod error;
pub mod events;
pub mod healthcheck;
pub mod logstream;
pub mod runtime;
pub mod steps;
pub mod store;
pub mod transformer;
pub mod uploader;
pub mod workpool;

// ---- Public re-exports ----

pub use actions::Action;
pub use agent::{Agent, Collaborators};
pub use capacity::{CapacityAccountant, Resources};
pub use config::AgentConfig;
pub use container::{Container, ContainerState, LogConfig, PortMapping, Resource, RunResult};
pub use credentials::{CredentialManager, InstanceIdentityManager, NoopCredentialManager};
pub use downloader::{ArtifactDownloader, HttpDownloader};
pub use error::{Error, Result, RuntimeError};
pub use events::{ContainerEvent, EventHub};
pub use logstream::{LogSink, LogStreamer, TracingLogSink};
pub use runtime::{RuntimeClient, Sandbox, SandboxProcess};
pub use steps::{Step, StepError};
pub use store::{AllocationStore, ContainerStore};
pub use transformer::Transformer;
pub use uploader::{HttpUploader, Uploader};
