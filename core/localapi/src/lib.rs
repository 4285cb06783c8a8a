//! Wire helpers for the mesh daemon's LocalAPI.
//!
//! The daemon exposes an HTTP/1.1 API on a UNIX socket and a long-lived
//! "IPN bus" stream of JSON notifications. This crate holds what both
//! transports in `tailtray-core` share: endpoint names, bus frame types,
//! masked prefs bodies and frame splitting. Nothing here performs I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod framing;

pub use framing::FrameSplitter;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/tailscale/tailscaled.sock";
pub const LOCALAPI_HOST: &str = "local-tailscaled.sock";

pub const PATH_STATUS: &str = "/localapi/v0/status";
pub const PATH_PREFS: &str = "/localapi/v0/prefs";
pub const PATH_WATCH_IPN_BUS: &str = "/localapi/v0/watch-ipn-bus";
pub const PATH_LOGIN_INTERACTIVE: &str = "/localapi/v0/login-interactive";
pub const PATH_LOGOUT: &str = "/localapi/v0/logout";

/// IPN bus subscription bits understood by `watch-ipn-bus?mask=`.
pub const NOTIFY_WATCH_ENGINE_UPDATES: u32 = 1 << 0;
pub const NOTIFY_INITIAL_STATE: u32 = 1 << 1;
pub const NOTIFY_INITIAL_PREFS: u32 = 1 << 2;
pub const NOTIFY_INITIAL_NETMAP: u32 = 1 << 3;

pub const MAX_RESPONSE_BYTES: usize = 32 * 1024 * 1024;
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LocalApiError {
    #[error("Payload exceeded maximum size of {limit} bytes")]
    TooLarge { limit: usize },
}

/// Daemon backend state as carried by the numeric `State` field of bus frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    NoState,
    InUseOtherUser,
    NeedsLogin,
    NeedsMachineAuth,
    Stopped,
    Starting,
    Running,
}

impl BackendState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::NoState),
            1 => Some(Self::InUseOtherUser),
            2 => Some(Self::NeedsLogin),
            3 => Some(Self::NeedsMachineAuth),
            4 => Some(Self::Stopped),
            5 => Some(Self::Starting),
            6 => Some(Self::Running),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoState => "NoState",
            Self::InUseOtherUser => "InUseOtherUser",
            Self::NeedsLogin => "NeedsLogin",
            Self::NeedsMachineAuth => "NeedsMachineAuth",
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
        }
    }
}

/// One notification pushed over the IPN bus.
///
/// Every field is optional: the daemon only fills in what changed.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IpnBusFrame {
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "ErrMessage", default, skip_serializing_if = "Option::is_none")]
    pub err_message: Option<String>,
    #[serde(rename = "State", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<i64>,
    #[serde(rename = "Prefs", default, skip_serializing_if = "Option::is_none")]
    pub prefs: Option<Value>,
    #[serde(rename = "NetMap", default, skip_serializing_if = "Option::is_none")]
    pub net_map: Option<Value>,
    #[serde(rename = "BrowseToURL", default, skip_serializing_if = "Option::is_none")]
    pub browse_to_url: Option<String>,
    #[serde(rename = "Health", default, skip_serializing_if = "Option::is_none")]
    pub health: Option<Value>,
}

impl IpnBusFrame {
    pub fn backend_state(&self) -> Option<BackendState> {
        self.state.and_then(BackendState::from_code)
    }

    /// Prefs payload, ignoring `null`.
    pub fn prefs_object(&self) -> Option<&Value> {
        self.prefs.as_ref().filter(|value| value.is_object())
    }
}

/// Path and query for subscribing to the IPN bus.
pub fn watch_path(mask: u32) -> String {
    format!("{}?mask={}", PATH_WATCH_IPN_BUS, mask)
}

/// Body for `PATCH /localapi/v0/prefs` touching a single field.
///
/// The daemon only applies fields whose `<Field>Set` companion is true.
pub fn masked_prefs(field: &str, value: Value) -> Value {
    let mut object = serde_json::Map::new();
    object.insert(field.to_string(), value);
    object.insert(format!("{}Set", field), Value::Bool(true));
    Value::Object(object)
}
