//! Capability matching — decides whether a slot can serve a request.
//!
//! A slot advertises a *stereotype*; a request carries the capabilities a
//! client asked for. The match is deliberately permissive on the request
//! side: anything the client leaves unset is a don't-care.
//!
//! Rules, all of which must hold:
//!
//! 1. Every standard name in the stereotype (no `:` in the name, not a
//!    platform field) is absent, null, or empty in the request, or equal.
//! 2. Every requested name containing `platformVersion` is absent in the
//!    stereotype or equal to it.
//! 3. `browserName` is unset/empty in the request, or equal.
//! 4. `browserVersion` is unset/empty/`stable` in the request, or equal.
//! 5. `platformName` is unset in the request, equal, or the stereotype's
//!    platform belongs to the requested family.
//!
//! A request for managed downloads (`se:downloadsEnabled: true`) only
//! matches stereotypes that enable them too.
//!
//! Extension capabilities are otherwise ignored; each driver validates its
//! own vendor options.

use serde_json::Value;

use crate::capabilities::{
    Capabilities, BROWSER_NAME, BROWSER_VERSION, DOWNLOADS_ENABLED, PLATFORM_NAME,
};

const PLATFORM_VERSION: &str = "platformVersion";

/// Pluggable matching strategy.
pub trait SlotMatcher: Send + Sync {
    fn matches(&self, stereotype: &Capabilities, requested: &Capabilities) -> bool;
}

/// The standard matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSlotMatcher;

impl SlotMatcher for DefaultSlotMatcher {
    fn matches(&self, stereotype: &Capabilities, requested: &Capabilities) -> bool {
        matches(stereotype, requested)
    }
}

/// Whether `stereotype` satisfies `requested`. Pure and lock-free.
pub fn matches(stereotype: &Capabilities, requested: &Capabilities) -> bool {
    managed_downloads_match(stereotype, requested)
        && standard_capabilities_match(stereotype, requested)
        && platform_version_match(stereotype, requested)
        && browser_name_match(stereotype, requested)
        && browser_version_match(stereotype, requested)
        && platform_name_match(stereotype, requested)
}

fn managed_downloads_match(stereotype: &Capabilities, requested: &Capabilities) -> bool {
    !requested.is_enabled(DOWNLOADS_ENABLED) || stereotype.is_enabled(DOWNLOADS_ENABLED)
}

fn standard_capabilities_match(stereotype: &Capabilities, requested: &Capabilities) -> bool {
    stereotype
        .names()
        .filter(|name| !name.contains(':'))
        .filter(|name| !is_platform_field(name))
        .filter(|name| *name != BROWSER_NAME && *name != BROWSER_VERSION)
        .all(|name| match requested.get(name) {
            None => true,
            Some(value) if is_unset(value) => true,
            Some(value) => stereotype.get(name) == Some(value),
        })
}

fn platform_version_match(stereotype: &Capabilities, requested: &Capabilities) -> bool {
    requested
        .names()
        .filter(|name| name.contains(PLATFORM_VERSION))
        .all(|name| match stereotype.get(name) {
            None => true,
            Some(value) => requested.get(name) == Some(value),
        })
}

fn browser_name_match(stereotype: &Capabilities, requested: &Capabilities) -> bool {
    match requested.browser_name() {
        None | Some("") => !has_non_string(requested, BROWSER_NAME),
        Some(name) => stereotype.browser_name() == Some(name),
    }
}

fn browser_version_match(stereotype: &Capabilities, requested: &Capabilities) -> bool {
    match requested.browser_version() {
        None | Some("") | Some("stable") => !has_non_string(requested, BROWSER_VERSION),
        Some(version) => stereotype.browser_version() == Some(version),
    }
}

fn platform_name_match(stereotype: &Capabilities, requested: &Capabilities) -> bool {
    let Some(wanted) = requested.platform_name() else {
        return !has_non_string(requested, PLATFORM_NAME);
    };
    let Some(offered) = stereotype.platform_name() else {
        return false;
    };
    if offered == wanted {
        return true;
    }
    match (stereotype.platform(), requested.platform()) {
        (Some(offered), Some(wanted)) => offered.is(wanted),
        _ => false,
    }
}

/// `platformName` plus the legacy `platform` key.
fn is_platform_field(name: &str) -> bool {
    name.eq_ignore_ascii_case(PLATFORM_NAME) || name.eq_ignore_ascii_case("platform")
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// A present value that is neither null nor a string never matches a
/// string-typed field.
fn has_non_string(caps: &Capabilities, name: &str) -> bool {
    caps.get(name)
        .is_some_and(|v| !matches!(v, Value::Null | Value::String(_)))
}
