//! devsync - keeps a local view of remote project servers in sync.
//!
//! A [`Session`] is a live connection to one server: a control API for
//! requests and a push-event channel that keeps the server's projects up to
//! date. The [`SessionRegistry`] owns all sessions, persists the server list
//! and retries servers that are down.

pub mod api;
pub mod channel;
pub mod collab;
pub mod config;
pub mod debug;
pub mod error;
pub mod event;
pub mod project;
pub mod registry;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod uri;

pub use error::SyncError;
pub use project::{Project, ProjectList, ProjectUpdate, RunState, StartMode};
pub use registry::{ReconnectOutcome, SessionRegistry};
pub use session::{Session, SessionContext};
pub use uri::ConnectionUri;
