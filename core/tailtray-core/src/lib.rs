//! # tailtray-core
//!
//! State reconciliation for a mesh VPN tray: fetches raw status and prefs from
//! the local daemon, normalizes them, and publishes field-level changes plus an
//! identity-stable peer list to UI collaborators.
//!
//! ## Design Principles
//!
//! - **Defensive parsing**: Daemon output is semi-trusted. Missing fields become
//!   defaults, bad peers are skipped, unreadable documents keep the old state.
//! - **Quiet when nothing changed**: Re-fetching identical state emits nothing,
//!   and unchanged peers keep the same `Arc` instance.
//! - **One cycle at a time**: Refreshes requested mid-poll are dropped.
//! - **Swappable transport**: CLI or LocalAPI socket behind [`CommandGateway`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tailtray_core::{gateway, ReconciliationEngine, StateField, TrayConfig};
//!
//! let config = TrayConfig::load()?;
//! let engine = ReconciliationEngine::new(gateway::from_config(&config), config.engine_config())?;
//! engine.subscribe(StateField::Health, |change| println!("{:?}", change));
//! // Polls right away, then on the timer and on watch frames.
//! engine.listen();
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod observe;
pub mod peers;
pub mod types;

pub use config::{TransportKind, TrayConfig};
pub use engine::{EngineConfig, PollOutcome, ReconciliationEngine};
pub use error::{Result, TrayError};
pub use gateway::{CommandGateway, FrameStream, LoginFlags, UpFlags};
pub use observe::{Listener, StateChange, StateField, SubscriptionId};
pub use peers::{ListChange, PeerRegistry};
pub use types::*;
