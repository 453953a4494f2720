//! Managed downloads: point the browser at a per-session directory.

use std::path::Path;

use serde_json::{json, Map, Value};

use gridnode_core::Capabilities;

/// Merge browser-specific download preferences into `capabilities`.
///
/// Existing vendor options and preferences are kept; only the download keys
/// are overwritten. Browsers without known preference keys are returned
/// unchanged.
pub fn with_downloads_directory(capabilities: &Capabilities, dir: &Path) -> Capabilities {
    let dir = dir.display().to_string();
    match capabilities.browser_name() {
        Some("chrome") | Some("chromium") => merge_prefs(capabilities, "goog:chromeOptions", chromium_prefs(&dir)),
        Some("MicrosoftEdge") | Some("msedge") => merge_prefs(capabilities, "ms:edgeOptions", chromium_prefs(&dir)),
        Some("firefox") => merge_prefs(
            capabilities,
            "moz:firefoxOptions",
            json!({
                "browser.download.folderList": 2,
                "browser.download.dir": dir,
                "browser.download.manager.showWhenStarting": false,
            }),
        ),
        _ => capabilities.clone(),
    }
}

fn chromium_prefs(dir: &str) -> Value {
    json!({
        "download.prompt_for_download": false,
        "download.default_directory": dir,
    })
}

fn merge_prefs(capabilities: &Capabilities, options_key: &str, prefs: Value) -> Capabilities {
    let mut options = object_at(capabilities.get(options_key));
    let mut merged = object_at(options.get("prefs"));
    if let Value::Object(prefs) = prefs {
        merged.extend(prefs);
    }
    options.insert("prefs".to_string(), Value::Object(merged));
    capabilities.clone().with(options_key, Value::Object(options))
}

fn object_at(value: Option<&Value>) -> Map<String, Value> {
    value
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_gets_download_prefs() {
        let caps = Capabilities::new().with("browserName", "chrome");
        let updated = with_downloads_directory(&caps, Path::new("/tmp/dl"));

        let prefs = &updated.get("goog:chromeOptions").unwrap()["prefs"];
        assert_eq!(prefs["download.default_directory"], "/tmp/dl");
        assert_eq!(prefs["download.prompt_for_download"], false);
    }

    #[test]
    fn existing_options_are_preserved() {
        let caps = Capabilities::new().with("browserName", "chrome").with(
            "goog:chromeOptions",
            json!({"args": ["--headless"], "prefs": {"intl.accept_languages": "de"}}),
        );
        let updated = with_downloads_directory(&caps, Path::new("/tmp/dl"));

        let options = updated.get("goog:chromeOptions").unwrap();
        assert_eq!(options["args"], json!(["--headless"]));
        assert_eq!(options["prefs"]["intl.accept_languages"], "de");
        assert_eq!(options["prefs"]["download.default_directory"], "/tmp/dl");
    }

    #[test]
    fn edge_uses_its_own_options_key() {
        let caps = Capabilities::new().with("browserName", "MicrosoftEdge");
        let updated = with_downloads_directory(&caps, Path::new("/tmp/dl"));
        assert!(updated.get("ms:edgeOptions").is_some());
        assert!(updated.get("goog:chromeOptions").is_none());
    }

    #[test]
    fn firefox_gets_folder_list() {
        let caps = Capabilities::new().with("browserName", "firefox");
        let updated = with_downloads_directory(&caps, Path::new("/tmp/dl"));

        let prefs = &updated.get("moz:firefoxOptions").unwrap()["prefs"];
        assert_eq!(prefs["browser.download.folderList"], 2);
        assert_eq!(prefs["browser.download.dir"], "/tmp/dl");
    }

    #[test]
    fn unknown_browser_is_untouched() {
        let caps = Capabilities::new().with("browserName", "safari");
        assert_eq!(with_downloads_directory(&caps, Path::new("/tmp/dl")), caps);
    }
}
