//! Dockwatch - readiness status for a fleet of containerized backends.
//!
//! Every backend process (chain daemon, lightning node, exchange daemon, ...)
//! runs inside one container. Dockwatch combines the container's lifecycle
//! state with a backend-specific health probe to produce a human-facing
//! status string, reacts to container lifecycle events, and aggregates the
//! whole fleet concurrently.
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │                         ServiceRegistry                          │
//!   │   get_status() ── fan-out ──▶ Service ── fan-in ──▶ name→status  │
//!   │                                 │                                │
//!   │          ┌──────────────────────┼───────────────────┐            │
//!   │          ▼                      ▼                   ▼            │
//!   │   ContainerHandle        RpcClient<C>          LogWatcher        │
//!   │   (inspect/logs/exec)    (lazy dial loop)      (sync progress)   │
//!   └──────────────────────────────────────────────────────────────────┘
//!            ▲
//!            └── event loop (create / start / die / destroy)
//! ```
//!
//! A [`setup::SetupBroadcaster`] tails the bring-up log and republishes
//! parsed milestones to subscribers with optional history replay.

pub mod cli;
pub mod config;
pub mod container;
pub mod error;
pub mod registry;
pub mod rpc;
pub mod service;
pub mod setup;
pub mod testing;
pub mod watcher;

pub use config::Config;
pub use error::{Error, Result};
pub use registry::ServiceRegistry;
pub use service::{Service, StatusReport};
