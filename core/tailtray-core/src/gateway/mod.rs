//! The boundary to the mesh daemon.
//!
//! The engine only needs raw status and prefs text plus an optional push
//! stream; the tray UI additionally drives the mutations. Two transports
//! implement the trait: [`CliGateway`] spawns the daemon's CLI, and
//! [`SocketGateway`] speaks HTTP to the LocalAPI socket.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{TransportKind, TrayConfig};
use crate::error::Result;
use crate::types::Preference;

mod cli;
mod socket;

pub use cli::CliGateway;
pub use socket::SocketGateway;

/// Options for bringing the connection up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpFlags {
    pub operator: Option<String>,
    pub accept_routes: bool,
}

/// Options for an interactive login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginFlags {
    pub operator: Option<String>,
    pub accept_routes: bool,
    pub login_server: Option<String>,
}

impl UpFlags {
    pub fn from_config(config: &TrayConfig) -> Self {
        Self {
            operator: config.operator.clone(),
            accept_routes: config.accept_routes_on_up,
        }
    }
}

impl LoginFlags {
    pub fn from_config(config: &TrayConfig) -> Self {
        Self {
            operator: config.operator.clone(),
            accept_routes: config.accept_routes_on_up,
            login_server: config.login_server.clone(),
        }
    }
}

/// A stream of self-delimited JSON frames from the daemon's watch channel.
///
/// Dropping the stream cancels it.
#[async_trait]
pub trait FrameStream: Send {
    /// Next complete frame, or `None` once the daemon closes the stream.
    async fn next_frame(&mut self) -> Result<Option<String>>;
}

#[async_trait]
pub trait CommandGateway: Send + Sync {
    /// Raw status document, possibly wrapped in noise.
    async fn fetch_status(&self) -> Result<String>;

    /// Raw prefs document, possibly wrapped in noise.
    async fn fetch_prefs(&self) -> Result<String>;

    /// Opens the push channel. `Ok(None)` means this transport has none.
    async fn watch(&self) -> Result<Option<Box<dyn FrameStream>>>;

    async fn up(&self, flags: &UpFlags) -> Result<String>;

    async fn down(&self) -> Result<String>;

    /// Starts an interactive login and returns the URL the user must visit.
    async fn login(&self, flags: &LoginFlags) -> Result<String>;

    async fn logout(&self) -> Result<String>;

    /// Selects an exit node by name or id; `None` clears the selection.
    async fn set_exit_node(&self, node: Option<&str>) -> Result<String>;

    async fn set_preference(&self, preference: Preference, enabled: bool) -> Result<String>;
}

/// Builds the transport selected in `config`.
pub fn from_config(config: &TrayConfig) -> Arc<dyn CommandGateway> {
    match config.transport {
        TransportKind::Cli => Arc::new(CliGateway::from_config(config)),
        TransportKind::Socket => Arc::new(SocketGateway::from_config(config)),
    }
}
