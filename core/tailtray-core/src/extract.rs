//! Payload extraction: turns raw daemon output into normalized state.
//!
//! Daemon output is semi-trusted. It may arrive wrapped in shell or HTTP noise,
//! and any nested field may be missing or null. Nothing in this module panics
//! or returns an error for a bad document; whole-document failures come back as
//! `None` and are logged, and individual bad peers are skipped.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::net::IpAddr;
use tracing::warn;

use crate::error::{Result, TrayError};
use crate::types::{ExitFlagMapping, HealthReport, NetworkIdentity, PeerRecord, PreferenceFlags};

/// Health messages that only describe an expected transition.
pub const BENIGN_HEALTH_MESSAGES: &[&str] = &[
    "state=Stopped, wantRunning=false",
    "state=Starting, wantRunning=true",
];

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_LEADING_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[A-Za-z0-9\s;,_:./'"?%&!#@*+=<>()|\\\[\]\-]*\{"#).unwrap());
static RE_TRAILING_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\}[A-Za-z0-9\s;,_:./'"?%&!#@*+=<>()|\\\[\]\-]*$"#).unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// Raw Documents
// ═══════════════════════════════════════════════════════════════════════════════

/// Extracts the JSON object embedded in `raw`.
///
/// Whitespace runs collapse to one space, then noise before the first `{` and
/// after the last `}` is trimmed. Returns `None` (and logs) when what remains is
/// not a JSON object.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let collapsed = RE_WHITESPACE.replace_all(raw, " ");
    let trimmed = RE_LEADING_NOISE.replace(&collapsed, "{");
    let trimmed = RE_TRAILING_NOISE.replace(&trimmed, "}");

    match serde_json::from_str::<Value>(trimmed.trim()) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            warn!(bytes = raw.len(), "Daemon payload is not a JSON object");
            None
        }
        Err(err) => {
            warn!(error = %err, bytes = raw.len(), "Failed to parse daemon payload");
            None
        }
    }
}

/// Like [`extract_json_object`], falling back to `default`.
pub fn extract_json_object_or(raw: &str, default: Value) -> Value {
    extract_json_object(raw).unwrap_or(default)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Projections
// ═══════════════════════════════════════════════════════════════════════════════

pub fn extract_network_identity(status: &Value) -> NetworkIdentity {
    let tailnet = status.get("CurrentTailnet");
    let network_name = tailnet
        .map(|tailnet| str_field(tailnet, "Name"))
        .unwrap_or_default()
        .to_string();

    let mut domain_suffix = str_field(status, "MagicDNSSuffix");
    if domain_suffix.is_empty() {
        domain_suffix = tailnet
            .map(|tailnet| str_field(tailnet, "MagicDNSSuffix"))
            .unwrap_or_default();
    }

    let self_node_id = status
        .get("Self")
        .map(|node| id_field(node, "ID"))
        .unwrap_or_default();

    NetworkIdentity {
        network_name,
        domain_suffix: domain_suffix.trim_end_matches('.').to_string(),
        self_node_id,
    }
}

/// Health warnings with the built-in denylist applied.
pub fn extract_health(status: &Value) -> HealthReport {
    extract_health_with(status, &[])
}

/// Health warnings with the built-in denylist plus `extra_ignore` applied.
pub fn extract_health_with(status: &Value, extra_ignore: &[String]) -> HealthReport {
    let Some(messages) = status.get("Health").and_then(Value::as_array) else {
        return HealthReport::default();
    };

    let kept = messages
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .filter(|message| !BENIGN_HEALTH_MESSAGES.contains(message))
        .filter(|message| !extra_ignore.iter().any(|ignored| ignored.trim() == *message))
        .map(str::to_string)
        .collect();

    HealthReport::new(kept)
}

pub fn extract_preference_flags(prefs: &Value) -> PreferenceFlags {
    let has_config = prefs.get("Config").map(Value::is_object).unwrap_or(false);
    let logged_out = bool_field(prefs, "LoggedOut");

    PreferenceFlags {
        logged_in: has_config && !logged_out,
        want_running: bool_field(prefs, "WantRunning"),
        accept_routes: bool_field(prefs, "RouteAll"),
        shields_up: bool_field(prefs, "ShieldsUp"),
        allow_lan_access: bool_field(prefs, "ExitNodeAllowLANAccess"),
        web_client: bool_field(prefs, "RunWebClient"),
        login_page_url: str_field(prefs, "ControlURL").to_string(),
        exit_node_id: id_field(prefs, "ExitNodeID"),
    }
}

/// Raw peer objects in display order: self first, then by creation time.
pub fn extract_peers(status: &Value) -> Vec<&Value> {
    let mut peers = Vec::new();
    if let Some(self_node) = status.get("Self").filter(|node| node.is_object()) {
        peers.push(self_node);
    }

    let Some(map) = status.get("Peer").and_then(Value::as_object) else {
        return peers;
    };

    let mut remote: Vec<(Option<DateTime<Utc>>, String, &Value)> = Vec::with_capacity(map.len());
    for (key, peer) in map {
        if !peer.is_object() {
            warn!(key = %key, "Skipping non-object peer entry");
            continue;
        }
        let created = peer
            .get("Created")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        remote.push((created, id_field(peer, "ID"), peer));
    }

    remote.sort_by(|left, right| compare_created(&left.0, &right.0).then_with(|| left.1.cmp(&right.1)));
    peers.extend(remote.into_iter().map(|(_, _, peer)| peer));
    peers
}

// ═══════════════════════════════════════════════════════════════════════════════
// Peer Decoding
// ═══════════════════════════════════════════════════════════════════════════════

/// Values from the rest of the snapshot that peer records depend on.
#[derive(Debug, Clone, Copy)]
pub struct PeerContext<'a> {
    pub domain_suffix: &'a str,
    pub exit_node_id: &'a str,
    pub exit_flags: &'a ExitFlagMapping,
}

/// Builds a record from one raw peer; fails when identity or addresses are missing.
pub fn decode_peer(raw: &Value, ctx: &PeerContext<'_>) -> Result<PeerRecord> {
    let id = id_field(raw, "ID");
    if id.is_empty() {
        return Err(TrayError::MalformedPeer("missing ID".to_string()));
    }

    let mut ip_v4 = String::new();
    let mut ip_v6 = String::new();
    for address in raw
        .get("TailscaleIPs")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_str)
    {
        let bare = address.split('/').next().unwrap_or_default().trim();
        match bare.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) if ip_v4.is_empty() => ip_v4 = bare.to_string(),
            Ok(IpAddr::V6(_)) if ip_v6.is_empty() => ip_v6 = bare.to_string(),
            _ => {}
        }
    }
    if ip_v4.is_empty() && ip_v6.is_empty() {
        return Err(TrayError::MalformedPeer(format!("{} has no addresses", id)));
    }

    let domain = str_field(raw, "DNSName").to_string();
    let name = peer_name(&domain, str_field(raw, "HostName"), ctx.domain_suffix);
    let tags = raw
        .get("Tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let exit_active = if ctx.exit_flags.active_from_selection {
        !ctx.exit_node_id.is_empty() && ctx.exit_node_id == id
    } else {
        bool_field(raw, &ctx.exit_flags.active_field)
    };

    Ok(PeerRecord {
        domain,
        name,
        os: str_field(raw, "OS").to_string(),
        tags,
        ip_v4,
        ip_v6,
        active: bool_field(raw, "Active"),
        online: bool_field(raw, "Online"),
        exit_active,
        exit_support: bool_field(raw, &ctx.exit_flags.support_field),
        id,
    })
}

/// Decodes every peer, skipping malformed entries with a warning.
pub fn decode_peers(raw_peers: &[&Value], ctx: &PeerContext<'_>) -> Vec<PeerRecord> {
    raw_peers
        .iter()
        .filter_map(|raw| match decode_peer(raw, ctx) {
            Ok(peer) => Some(peer),
            Err(err) => {
                warn!(error = %err, "Skipping peer");
                None
            }
        })
        .collect()
}

/// Short name: the DNS name without the tailnet suffix.
fn peer_name(dns_name: &str, host_name: &str, domain_suffix: &str) -> String {
    if dns_name.is_empty() {
        return host_name.to_string();
    }
    if !domain_suffix.is_empty() {
        let marker = format!(".{}", domain_suffix);
        if let Some(index) = dns_name.find(&marker) {
            return dns_name[..index].to_string();
        }
    }
    dns_name.split('.').next().unwrap_or_default().to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Node ids are strings in current daemons and integers in older ones.
fn id_field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn compare_created(left: &Option<DateTime<Utc>>, right: &Option<DateTime<Utc>>) -> Ordering {
    match (left, right) {
        (Some(left), Some(right)) => left.cmp(right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOISE_PREFIX: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=utf-8\r\n\r\n";

    fn ctx<'a>(mapping: &'a ExitFlagMapping) -> PeerContext<'a> {
        PeerContext {
            domain_suffix: "local-domain.net",
            exit_node_id: "",
            exit_flags: mapping,
        }
    }

    #[test]
    fn extracts_clean_object() {
        let value = extract_json_object(r#"{"WantRunning": true}"#).expect("object");
        assert_eq!(value["WantRunning"], json!(true));
    }

    #[test]
    fn noise_around_object_is_ignored() {
        let clean = r#"{"Config": {"NodeID": "n1"}, "Health": ["a  b"]}"#;
        let dirty = format!("{}{}\n0\r\n\r\nok_done.", NOISE_PREFIX, clean);
        assert_eq!(extract_json_object(&dirty), extract_json_object(clean));
        assert!(extract_json_object(&dirty).is_some());
    }

    #[test]
    fn whitespace_runs_collapse() {
        let value = extract_json_object("{\n\t\"Name\":   \"a   b\"\n}").expect("object");
        assert_eq!(value["Name"], json!("a b"));
    }

    #[test]
    fn non_object_and_garbage_return_none() {
        assert!(extract_json_object("[1, 2]").is_none());
        assert!(extract_json_object("").is_none());
        assert!(extract_json_object("connection refused").is_none());
        assert!(extract_json_object("{\"a\": }").is_none());
    }

    #[test]
    fn fallback_default_is_returned() {
        let value = extract_json_object_or("nope", json!({}));
        assert_eq!(value, json!({}));
    }

    #[test]
    fn identity_defaults_when_absent() {
        assert_eq!(extract_network_identity(&json!({})), NetworkIdentity::default());
        assert_eq!(
            extract_network_identity(&json!({"CurrentTailnet": null, "Self": null})),
            NetworkIdentity::default()
        );
    }

    #[test]
    fn identity_reads_nested_fields() {
        let status = json!({
            "CurrentTailnet": {"Name": "email@gmail.com", "MagicDNSSuffix": "other.net"},
            "MagicDNSSuffix": "local-domain.net",
            "Self": {"ID": "nYsTpNwY6321CNTRL"}
        });
        let identity = extract_network_identity(&status);
        assert_eq!(identity.network_name, "email@gmail.com");
        assert_eq!(identity.domain_suffix, "local-domain.net");
        assert_eq!(identity.self_node_id, "nYsTpNwY6321CNTRL");
    }

    #[test]
    fn identity_falls_back_to_tailnet_suffix() {
        let status = json!({"CurrentTailnet": {"MagicDNSSuffix": "tail.ts.net."}});
        assert_eq!(extract_network_identity(&status).domain_suffix, "tail.ts.net");
    }

    #[test]
    fn health_filters_benign_messages_in_order() {
        let status = json!({
            "Health": ["state=Stopped, wantRunning=false", "custom warning"]
        });
        assert_eq!(extract_health(&status).messages(), ["custom warning".to_string()]);
    }

    #[test]
    fn health_tolerates_null_and_applies_extra_ignores() {
        assert!(extract_health(&json!({"Health": null})).is_healthy());
        let status = json!({"Health": ["b", "a", 3, "not in map poll"]});
        let report = extract_health_with(&status, &["not in map poll".to_string()]);
        assert_eq!(report.messages(), ["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn preference_flags_map_daemon_fields() {
        let prefs = json!({
            "ControlURL": "https://test.node.com",
            "RouteAll": false,
            "ExitNodeID": "nQHfhyY3PC21CNTRL",
            "ExitNodeAllowLANAccess": true,
            "RunWebClient": false,
            "WantRunning": true,
            "LoggedOut": false,
            "ShieldsUp": true,
            "Config": {"NodeID": "nYsTpNwY6321CNTRL"}
        });
        let flags = extract_preference_flags(&prefs);
        assert!(flags.logged_in);
        assert!(flags.want_running);
        assert!(!flags.accept_routes);
        assert!(flags.shields_up);
        assert!(flags.allow_lan_access);
        assert!(!flags.web_client);
        assert_eq!(flags.login_page_url, "https://test.node.com");
        assert_eq!(flags.exit_node_id, "nQHfhyY3PC21CNTRL");
    }

    #[test]
    fn preference_flags_default_when_empty() {
        assert_eq!(extract_preference_flags(&json!({})), PreferenceFlags::default());
        let logged_out = json!({"LoggedOut": true, "Config": {}});
        assert!(!extract_preference_flags(&logged_out).logged_in);
    }

    #[test]
    fn peers_are_self_first_then_by_creation() {
        let status = json!({
            "Self": {"ID": "self"},
            "Peer": {
                "nodekey:b": {"ID": "late", "Created": "2024-02-01T00:00:00Z"},
                "nodekey:a": {"ID": "early", "Created": "2023-01-01T00:00:00+07:00"},
                "nodekey:c": {"ID": "undated"},
                "nodekey:d": null
            }
        });
        let ids: Vec<String> = extract_peers(&status)
            .into_iter()
            .map(|peer| id_field(peer, "ID"))
            .collect();
        assert_eq!(ids, ["self", "early", "late", "undated"]);
    }

    #[test]
    fn peers_empty_without_map() {
        assert!(extract_peers(&json!({"Peer": null})).is_empty());
    }

    #[test]
    fn decodes_peer_fields() {
        let mapping = ExitFlagMapping::default();
        let raw = json!({
            "ID": "n1",
            "DNSName": "amsterdam.local-domain.net.",
            "OS": "linux",
            "Tags": ["tag:exit", "tag:home"],
            "TailscaleIPs": ["fd7a:115c:a1e0::270f:654e", "100.79.101.78/32"],
            "Active": true,
            "Online": true,
            "ExitNode": false,
            "ExitNodeOption": true
        });
        let peer = decode_peer(&raw, &ctx(&mapping)).expect("peer");
        assert_eq!(peer.name, "amsterdam");
        assert_eq!(peer.domain, "amsterdam.local-domain.net.");
        assert_eq!(peer.ip_v4, "100.79.101.78");
        assert_eq!(peer.ip_v6, "fd7a:115c:a1e0::270f:654e");
        assert_eq!(peer.tags_label(), "tag:exit,tag:home");
        assert!(peer.exit_support);
        assert!(!peer.exit_active);
    }

    #[test]
    fn exit_active_can_follow_selection() {
        let mapping = ExitFlagMapping {
            active_from_selection: true,
            ..ExitFlagMapping::default()
        };
        let context = PeerContext {
            exit_node_id: "n1",
            ..ctx(&mapping)
        };
        let raw = json!({"ID": "n1", "TailscaleIPs": ["100.1.1.1"], "ExitNode": false});
        assert!(decode_peer(&raw, &context).expect("peer").exit_active);
    }

    #[test]
    fn name_falls_back_when_suffix_unknown() {
        assert_eq!(peer_name("msi.other.net.", "", "local-domain.net"), "msi");
        assert_eq!(peer_name("", "my-home.local", ""), "my-home.local");
    }

    #[test]
    fn malformed_peers_are_skipped() {
        let mapping = ExitFlagMapping::default();
        let missing_id = json!({"TailscaleIPs": ["100.1.1.1"]});
        let missing_ips = json!({"ID": "n2", "TailscaleIPs": null});
        let bad_ips = json!({"ID": "n3", "TailscaleIPs": ["not-an-ip"]});
        let good = json!({"ID": 42, "TailscaleIPs": ["100.1.1.2"]});

        assert!(matches!(
            decode_peer(&missing_id, &ctx(&mapping)),
            Err(TrayError::MalformedPeer(_))
        ));
        let peers = decode_peers(&[&missing_id, &missing_ips, &bad_ips, &good], &ctx(&mapping));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "42");
    }
}
