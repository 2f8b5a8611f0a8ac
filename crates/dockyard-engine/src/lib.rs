//! Container lifecycle and terminal multiplexing engine for the dockyard
//! sandbox service.
//!
//! The engine gives each authenticated user a set of named, isolated
//! containers on a single Docker host. [`SandboxManager`] owns lifecycle,
//! resource fair-sharing, and archive-based file CRUD; [`TerminalMultiplexer`]
//! owns interactive shell sessions, one per (connection, tab) pair, and
//! streams their output back over per-connection channels.
//!
//! The web/socket layer in front of this crate is expected to have resolved
//! a stable user identifier already; nothing here authenticates anyone.

pub mod config;
pub mod files;
pub mod manager;
pub mod rebalance;
pub mod terminal;

pub use config::Settings;
pub use manager::SandboxManager;
pub use terminal::{SessionKey, TerminalEvent, TerminalMultiplexer};

// Re-export dependencies potentially needed by consumers (like the socket layer)
pub use bollard;
pub use dockyard_common as common;
