//! Spawn, supervise and fan requests out to language servers.
//!
//! [`session::SessionRegistry`] maps documents to running
//! [`session::LanguageServerSession`]s, starting them on first use;
//! [`session::RequestFanout`] sends one request to all of them and merges the
//! answers under a [`session::CancellationSupport`] scope.

pub mod config;
pub mod definition;
pub mod lsp;
pub mod session;
pub mod utils;
pub mod workspace;

pub use utils::error::{HubError, Result};
