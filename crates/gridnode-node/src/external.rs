//! Grid-facing view of a freshly started session.
//!
//! The driver reports its own endpoints; clients must only ever see the
//! grid's. CDP, BiDi and VNC endpoints are rewritten to websocket URLs on
//! the grid address under `/session/{id}/se/...`, or stripped when the
//! protocol is not on offer.

use chrono::Utc;
use serde_json::Value;
use url::Url;

use gridnode_core::capabilities::{VNC_LOCAL_ADDRESS, WEB_SOCKET_URL};
use gridnode_core::{Capabilities, Session};

use crate::factory::ActiveSession;

/// Which debugging protocols the node and the slot allow.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolSupport {
    pub cdp_enabled: bool,
    pub bidi_enabled: bool,
    pub slot_supports_cdp: bool,
    pub slot_supports_bidi: bool,
}

/// Build the [`Session`] handed back to the grid.
///
/// Requested capabilities are merged under the negotiated ones so values
/// the client sent remain visible.
pub fn external_session(
    active: &dyn ActiveSession,
    requested: &Capabilities,
    stereotype: &Capabilities,
    external_uri: &Url,
    grid_uri: &Url,
    support: ProtocolSupport,
) -> Session {
    let id = active.id();
    let mut caps = requested.merge(active.capabilities());

    let wants_cdp = support.slot_supports_cdp || caps.contains("se:cdp");
    if wants_cdp && support.cdp_enabled {
        caps.set("se:cdp", websocket_url(grid_uri, &format!("/session/{id}/se/cdp")).to_string());
    } else {
        caps = caps.without_prefix("se:cdp").with("se:cdpEnabled", false);
    }

    let wants_bidi = support.slot_supports_bidi || caps.contains("se:bidi");
    if wants_bidi && support.bidi_enabled && requests_web_socket(&caps) {
        caps.set("se:bidi", websocket_url(grid_uri, &format!("/session/{id}/se/bidi")).to_string());
    } else {
        caps = caps.without_prefix("se:bidi").with("se:bidiEnabled", false);
    }

    if stereotype.contains(VNC_LOCAL_ADDRESS) {
        caps.set("se:vnc", websocket_url(grid_uri, &format!("/session/{id}/se/vnc")).to_string());
    }

    Session {
        id: id.clone(),
        uri: external_uri.clone(),
        stereotype: stereotype.clone(),
        capabilities: caps,
        start_time: Utc::now(),
    }
}

/// `ws://` (or `wss://` for an https grid) URL for `path` under the grid
/// address, keeping any base path the grid is mounted on.
pub fn websocket_url(grid_uri: &Url, path: &str) -> Url {
    let mut url = grid_uri.clone();
    let scheme = if grid_uri.scheme() == "https" { "wss" } else { "ws" };
    // Only fails for non-special schemes, which keep their own.
    let _ = url.set_scheme(scheme);
    let base = grid_uri.path().trim_end_matches('/');
    url.set_path(&format!("{base}{path}"));
    url.set_query(None);
    url.set_fragment(None);
    url
}

fn requests_web_socket(caps: &Capabilities) -> bool {
    !matches!(
        caps.get(WEB_SOCKET_URL),
        None | Some(Value::Null) | Some(Value::Bool(false))
    )
}
