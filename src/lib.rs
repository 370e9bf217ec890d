//! # Switchyard
//!
//! The concurrent resource-management substrate for an event-driven server.
//!
//! Request handlers in such a server share four pieces of machinery, and this
//! crate provides exactly those four:
//!
//! - **`TaskDispatcher`**: independent worker pools per workload class (general,
//!   database, network, scheduled) with caller-runs backpressure, awaitable handles,
//!   timeouts, fixed-delay retries, bounded-concurrency batches and periodic schedules
//! - **`ObjectPool`**: a bounded pool of resettable scratch objects with a lock-free
//!   idle set and overflow allocation instead of blocking
//! - **`ConnectionPoolManager`**: a bounded, self-healing pool of database connections
//!   over an external connection factory, with a prepared-statement cache
//! - **`CommandRegistry`**: case-insensitive command routing with hooks, capability
//!   checks cached under a TTL, cooldowns and usage statistics
//!
//! Every component is an explicit instance. Build them once at startup (directly or
//! with [`builders::build_switchyard`]) and hand `Arc` clones to collaborators.
//!
//! ## Dispatching work
//!
//! ```rust,ignore
//! use switchyard::config::DispatcherConfig;
//! use switchyard::core::{TaskDispatcher, WorkloadClass};
//! use std::time::Duration;
//!
//! let dispatcher = TaskDispatcher::new(DispatcherConfig::default())?;
//!
//! let handle = dispatcher.submit(WorkloadClass::Database, || {
//!     Ok(load_profile("user-42")?)
//! });
//! let profile = handle.join()?;
//!
//! let guarded = dispatcher.with_timeout(WorkloadClass::Network, fetch_avatar, Duration::from_secs(2));
//! let retried = dispatcher.with_retry(WorkloadClass::Network, flaky_call, 3, Duration::from_millis(250));
//!
//! dispatcher.shutdown(Duration::from_secs(5));
//! ```
//!
//! ## Routing commands
//!
//! ```rust,ignore
//! use switchyard::core::{AllowAll, AppResult, CommandEvent, CommandMetadata, CommandRegistry, ExecutionContext};
//!
//! let registry = CommandRegistry::new(&Default::default(), AllowAll);
//! let pong = |_: &ExecutionContext, _: &CommandEvent| -> AppResult<()> { Ok(()) };
//! registry.register("Ping", pong, CommandMetadata::new("utility"));
//! assert!(registry.execute(&CommandEvent::new("PING", "user-1")));
//! ```
//!
//! For complete scenarios, see the integration tests under `tests/`.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core components: dispatcher, pools, registry and caches.
pub mod core;
/// Configuration models for dispatcher, pools and registry.
pub mod config;
/// Builders to assemble the runtime from configuration.
pub mod builders;
/// The assembled runtime and its API-facing snapshot types.
pub mod runtime;
/// Shared utilities.
pub mod util;
