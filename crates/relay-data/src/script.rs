//! Header recovery from the companion replay script the forwarder writes
//! next to each event (`<id>.sh`).
//!
//! The script's invocation line looks like:
//!
//! ```text
//! curl $curl_flags -H "Content-Type: application/json" -H 'X-GitHub-Event: push' -d @payload.json "$url"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

fn header_flag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"-H\s*(?:"([^"]*)"|'([^']*)')"#).expect("header flag pattern is valid")
    })
}

/// `true` for tokens made only of ASCII letters, digits, `-` and `_`.
pub fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extract `-H "Key: Value"` / `-H 'Key: Value'` pairs from the first
/// `curl` line that carries any.
pub fn parse_script_headers(content: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    for line in content.lines().map(str::trim) {
        if !line.contains("curl") {
            continue;
        }

        for caps in header_flag_re().captures_iter(line) {
            let Some(raw) = caps.get(1).or_else(|| caps.get(2)) else {
                continue;
            };
            let Some((name, value)) = raw.as_str().split_once(':') else {
                continue;
            };
            let name = name.trim();
            if is_valid_header_name(name) {
                headers.insert(name.to_string(), value.trim().to_string());
            }
        }

        if !headers.is_empty() {
            break;
        }
    }

    headers
}

/// Companion script path for an event record (`x.json` → `x.sh`).
pub fn companion_script_path(event_path: &Path) -> PathBuf {
    event_path.with_extension("sh")
}

/// Load headers from the companion script of `event_path`, if one exists.
pub fn load_script_headers(event_path: &Path) -> BTreeMap<String, String> {
    let script = companion_script_path(event_path);
    match std::fs::read_to_string(&script) {
        Ok(content) => parse_script_headers(&content),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Failed to read companion script {}: {}", script.display(), e);
            }
            BTreeMap::new()
        }
    }
}
