//! Capability maps and platform families.
//!
//! A [`Capabilities`] value is an ordered JSON object. Standard WebDriver
//! names (`browserName`, `platformName`, ...) sit next to vendor extension
//! names, which always contain a `:` (`goog:chromeOptions`, `se:cdp`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const BROWSER_NAME: &str = "browserName";
pub const BROWSER_VERSION: &str = "browserVersion";
pub const PLATFORM_NAME: &str = "platformName";
pub const WEB_SOCKET_URL: &str = "webSocketUrl";
pub const DOWNLOADS_ENABLED: &str = "se:downloadsEnabled";
pub const VNC_LOCAL_ADDRESS: &str = "se:vncLocalAddress";

/// An immutable-by-convention set of named capabilities.
///
/// Keys are kept sorted so two sets with the same entries compare and
/// serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
    /// An empty capability set.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap an existing JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Builder-style setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn browser_name(&self) -> Option<&str> {
        self.get_str(BROWSER_NAME)
    }

    pub fn browser_version(&self) -> Option<&str> {
        self.get_str(BROWSER_VERSION)
    }

    /// The raw `platformName` value, if it is a string.
    pub fn platform_name(&self) -> Option<&str> {
        self.get_str(PLATFORM_NAME)
    }

    /// `platformName` parsed into a [`Platform`], if recognised.
    pub fn platform(&self) -> Option<Platform> {
        self.platform_name().and_then(|p| p.parse().ok())
    }

    /// Whether a boolean capability is present and set to `true`.
    pub fn is_enabled(&self, name: &str) -> bool {
        matches!(self.get(name), Some(Value::Bool(true)))
    }

    /// Merge `other` on top of `self`. Entries in `other` win.
    pub fn merge(&self, other: &Capabilities) -> Capabilities {
        let mut merged = self.0.clone();
        for (k, v) in &other.0 {
            merged.insert(k.clone(), v.clone());
        }
        Capabilities(merged)
    }

    /// Copy of this set without any names starting with `prefix`.
    pub fn without_prefix(&self, prefix: &str) -> Capabilities {
        Capabilities(
            self.0
                .iter()
                .filter(|(k, _)| !k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for Capabilities {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

/// Operating system platforms, grouped into families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    Xp,
    Vista,
    Win7,
    Win8,
    Win8_1,
    Win10,
    Win11,
    Mac,
    Catalina,
    BigSur,
    Monterey,
    Ventura,
    Sonoma,
    Sequoia,
    Unix,
    Linux,
    Bsd,
    Solaris,
    Android,
    Ios,
    Any,
}

impl Platform {
    /// The family this platform belongs to, if it is a member of one.
    pub fn family(self) -> Option<Platform> {
        use Platform::*;
        match self {
            Xp | Vista | Win7 | Win8 | Win8_1 | Win10 | Win11 => Some(Windows),
            Catalina | BigSur | Monterey | Ventura | Sonoma | Sequoia => Some(Mac),
            Linux | Bsd | Solaris => Some(Unix),
            Windows | Mac | Unix | Android | Ios | Any => None,
        }
    }

    /// Whether `self` satisfies a request for `other`.
    ///
    /// A platform is itself, is `Any`, and is every family it belongs to.
    pub fn is(self, other: Platform) -> bool {
        self == other
            || other == Platform::Any
            || self.family().is_some_and(|family| family.is(other))
    }

    pub fn as_str(self) -> &'static str {
        use Platform::*;
        match self {
            Windows => "WINDOWS",
            Xp => "XP",
            Vista => "VISTA",
            Win7 => "WIN7",
            Win8 => "WIN8",
            Win8_1 => "WIN8_1",
            Win10 => "WIN10",
            Win11 => "WIN11",
            Mac => "MAC",
            Catalina => "CATALINA",
            BigSur => "BIG_SUR",
            Monterey => "MONTEREY",
            Ventura => "VENTURA",
            Sonoma => "SONOMA",
            Sequoia => "SEQUOIA",
            Unix => "UNIX",
            Linux => "LINUX",
            Bsd => "BSD",
            Solaris => "SOLARIS",
            Android => "ANDROID",
            Ios => "IOS",
            Any => "ANY",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    /// Accepts the canonical names (any case) and the common OS spellings
    /// clients send (`linux`, `mac`, `windows 10`, `macOS 14`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Platform::*;
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '.'], "_");
        let platform = match normalized.as_str() {
            "WINDOWS" => Windows,
            "XP" | "WINDOWS_XP" => Xp,
            "VISTA" | "WINDOWS_VISTA" => Vista,
            "WIN7" | "WINDOWS_7" => Win7,
            "WIN8" | "WINDOWS_8" => Win8,
            "WIN8_1" | "WINDOWS_8_1" => Win8_1,
            "WIN10" | "WINDOWS_10" => Win10,
            "WIN11" | "WINDOWS_11" => Win11,
            "MAC" | "MACOS" | "MAC_OS_X" | "DARWIN" => Mac,
            "CATALINA" | "MACOS_10_15" => Catalina,
            "BIG_SUR" | "MACOS_11" => BigSur,
            "MONTEREY" | "MACOS_12" => Monterey,
            "VENTURA" | "MACOS_13" => Ventura,
            "SONOMA" | "MACOS_14" => Sonoma,
            "SEQUOIA" | "MACOS_15" => Sequoia,
            "UNIX" => Unix,
            "LINUX" => Linux,
            "BSD" | "FREEBSD" | "OPENBSD" => Bsd,
            "SOLARIS" | "SUNOS" => Solaris,
            "ANDROID" => Android,
            "IOS" => Ios,
            "ANY" => Any,
            _ => return Err(format!("unknown platform: {s}")),
        };
        Ok(platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_prefers_other() {
        let a = Capabilities::new().with("browserName", "chrome").with("x", 1);
        let b = Capabilities::new().with("x", 2).with("y", true);

        let merged = a.merge(&b);
        assert_eq!(merged.browser_name(), Some("chrome"));
        assert_eq!(merged.get("x"), Some(&json!(2)));
        assert!(merged.is_enabled("y"));
    }

    #[test]
    fn without_prefix_strips_matching_names() {
        let caps = Capabilities::new()
            .with("se:cdp", "ws://x")
            .with("se:cdpVersion", "120")
            .with("se:vnc", "ws://y");

        let filtered = caps.without_prefix("se:cdp");
        assert!(!filtered.contains("se:cdp"));
        assert!(!filtered.contains("se:cdpVersion"));
        assert!(filtered.contains("se:vnc"));
    }

    #[test]
    fn platform_parses_common_spellings() {
        assert_eq!("linux".parse::<Platform>(), Ok(Platform::Linux));
        assert_eq!("Windows 10".parse::<Platform>(), Ok(Platform::Win10));
        assert_eq!("macOS 14".parse::<Platform>(), Ok(Platform::Sonoma));
        assert_eq!("any".parse::<Platform>(), Ok(Platform::Any));
        assert!("plan9".parse::<Platform>().is_err());
    }

    #[test]
    fn platform_family_membership() {
        assert!(Platform::Linux.is(Platform::Unix));
        assert!(Platform::Win11.is(Platform::Windows));
        assert!(Platform::Sonoma.is(Platform::Mac));
        assert!(Platform::Mac.is(Platform::Any));
        assert!(!Platform::Unix.is(Platform::Linux));
        assert!(!Platform::Linux.is(Platform::Windows));
    }

    #[test]
    fn serializes_as_plain_object() {
        let caps = Capabilities::new().with("browserName", "firefox");
        let json = serde_json::to_value(&caps).unwrap();
        assert_eq!(json, json!({"browserName": "firefox"}));

        let back: Capabilities = serde_json::from_value(json).unwrap();
        assert_eq!(back, caps);
    }
}
