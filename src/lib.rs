//! Live-preview session manager for an AI app builder.
//!
//! Boots one sandboxed Node.js runtime, installs npm dependencies
//! incrementally, syncs project files into it by diff, and supervises the
//! project's dev server. See [`SessionManager`] for the entry points.

pub mod bundle;
pub mod compat;
pub mod config;
pub mod deps;
pub mod error;
pub mod inject;
pub mod runtime;
pub mod session;
pub mod single_flight;
pub mod status;
pub mod sync;
pub mod template;
pub mod tree;

pub use bundle::{BundleSource, FileBundle, FileUpdate, HttpBundleSource, ProjectId};
pub use config::PreviewConfig;
pub use error::{PreviewError, Result};
pub use runtime::{Container, Runtime, ServerReady, SpawnedProcess};
pub use session::{ErrorSink, LoadHooks, LoadOutcome, LogSink, SessionManager, SessionPhase};
pub use status::{PreWarmPhase, PreWarmStatus, Subscription};
