//! Normalized state derived from daemon payloads.
//!
//! Everything here is plain data: cheap to clone, compared structurally, and
//! serializable so the CLI can print it as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// Connection State
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    NeedLogin = -1,
    Disabled = 0,
    Enabled = 1,
    Connected = 2,
}

impl ConnectionState {
    /// Classifies the daemon from its preference flags.
    ///
    /// Login wins over everything, then `WantRunning`, then exit node selection.
    pub fn classify(prefs: &PreferenceFlags) -> Self {
        if !prefs.logged_in {
            ConnectionState::NeedLogin
        } else if !prefs.want_running {
            ConnectionState::Disabled
        } else if prefs.exit_node_id.is_empty() {
            ConnectionState::Enabled
        } else {
            ConnectionState::Connected
        }
    }

    pub fn code(&self) -> i8 {
        *self as i8
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::NeedLogin => "need-login",
            ConnectionState::Disabled => "disabled",
            ConnectionState::Enabled => "enabled",
            ConnectionState::Connected => "connected",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Network Identity & Health
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub network_name: String,
    pub domain_suffix: String,
    pub self_node_id: String,
}

/// Warnings reported by the daemon, benign transitional messages removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthReport(Vec<String>);

impl HealthReport {
    pub fn new(messages: Vec<String>) -> Self {
        Self(messages)
    }

    pub fn is_healthy(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Preferences
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceFlags {
    /// Stored identity present and not explicitly logged out.
    pub logged_in: bool,
    pub want_running: bool,
    pub accept_routes: bool,
    pub shields_up: bool,
    pub allow_lan_access: bool,
    pub web_client: bool,
    pub login_page_url: String,
    pub exit_node_id: String,
}

/// A user-togglable daemon preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preference {
    AcceptRoutes,
    ShieldsUp,
    AllowLanAccess,
    WebClient,
}

impl Preference {
    pub const ALL: [Preference; 4] = [
        Preference::AcceptRoutes,
        Preference::ShieldsUp,
        Preference::AllowLanAccess,
        Preference::WebClient,
    ];

    /// Flag name understood by `tailscale set`.
    pub fn cli_flag(&self) -> &'static str {
        match self {
            Preference::AcceptRoutes => "--accept-routes",
            Preference::ShieldsUp => "--shields-up",
            Preference::AllowLanAccess => "--exit-node-allow-lan-access",
            Preference::WebClient => "--webclient",
        }
    }

    /// Field name in the daemon's prefs document.
    pub fn prefs_field(&self) -> &'static str {
        match self {
            Preference::AcceptRoutes => "RouteAll",
            Preference::ShieldsUp => "ShieldsUp",
            Preference::AllowLanAccess => "ExitNodeAllowLANAccess",
            Preference::WebClient => "RunWebClient",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Preference::AcceptRoutes => "accept-routes",
            Preference::ShieldsUp => "shields-up",
            Preference::AllowLanAccess => "allow-lan-access",
            Preference::WebClient => "web-client",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|pref| pref.name() == name)
    }

    pub fn read(&self, prefs: &PreferenceFlags) -> bool {
        match self {
            Preference::AcceptRoutes => prefs.accept_routes,
            Preference::ShieldsUp => prefs.shields_up,
            Preference::AllowLanAccess => prefs.allow_lan_access,
            Preference::WebClient => prefs.web_client,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Peers
// ═══════════════════════════════════════════════════════════════════════════════

/// One mesh node as shown in the peer list. Never mutated after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub domain: String,
    pub name: String,
    pub os: String,
    pub tags: Vec<String>,
    pub ip_v4: String,
    pub ip_v6: String,
    pub active: bool,
    pub online: bool,
    /// This peer is the exit node currently routing our traffic.
    pub exit_active: bool,
    /// This peer offers itself as an exit node.
    pub exit_support: bool,
}

impl PeerRecord {
    /// Tags joined with commas, the form list widgets display.
    pub fn tags_label(&self) -> String {
        self.tags.join(",")
    }
}

/// Which raw peer fields feed the exit-node flags.
///
/// Daemon versions disagree on whether `ExitNode` means "selected" or
/// "capable", so the mapping is explicit rather than guessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitFlagMapping {
    pub active_field: String,
    pub support_field: String,
    /// Derive `exit_active` from the selected exit node id instead of a field.
    pub active_from_selection: bool,
}

impl Default for ExitFlagMapping {
    fn default() -> Self {
        Self {
            active_field: "ExitNode".to_string(),
            support_field: "ExitNodeOption".to_string(),
            active_from_selection: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// Scalar state published by the engine after each successful poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub identity: NetworkIdentity,
    pub health: HealthReport,
    pub prefs: PreferenceFlags,
    pub last_poll: Option<DateTime<Utc>>,
}
