//! Block list and proxy auto-config script generation
//!
//! A [`BlockList`] is rendered into a PAC script whose only effect is to send
//! blocked hosts to a black-hole proxy and everything else `DIRECT`. A host is
//! blocked when it equals a listed domain or is a subdomain of one; a mere
//! suffix match (`notexample.com` against `example.com`) is not a block.
//!
//! [`route_for_host`] mirrors the script's decision in Rust so the matching
//! rule can be tested without a JavaScript engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Proxy host with no listener. Connections to it fail immediately.
pub const BLACKHOLE_HOST: &str = "0.0.0.0";

/// Fixed port paired with [`BLACKHOLE_HOST`].
pub const BLACKHOLE_PORT: u16 = 1;

/// File name of the persisted script.
pub const SCRIPT_FILE_NAME: &str = "proxy.pac";

/// Routing directive returned by the script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Blackhole,
}

impl Route {
    pub fn directive(self) -> String {
        match self {
            Self::Direct => "DIRECT".to_string(),
            Self::Blackhole => format!("PROXY {BLACKHOLE_HOST}:{BLACKHOLE_PORT}"),
        }
    }
}

/// Lower-cased blocked domains.
///
/// Uniqueness is enforced by the caller before domains reach the core; the
/// list is sorted and deduplicated again when rendered so the script only
/// depends on the set of domains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockList {
    domains: Vec<String>,
}

impl BlockList {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    /// Domains in rendering order.
    pub fn sorted(&self) -> Vec<&str> {
        let mut sorted: Vec<&str> = self.iter().collect();
        sorted.sort_unstable();
        sorted.dedup();
        sorted
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }
}

/// Decides how `host` is routed under `list`.
pub fn route_for_host(list: &BlockList, host: &str) -> Route {
    let host = host.to_lowercase();
    let host = host.strip_suffix('.').unwrap_or(&host);
    let blocked = list.iter().any(|domain| {
        host == domain
            || host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
    });

    if blocked { Route::Blackhole } else { Route::Direct }
}

/// Renders the PAC script for `list`.
///
/// Output is byte-identical for any two lists holding the same domains.
pub fn render_script(list: &BlockList) -> String {
    let entries = list
        .sorted()
        .into_iter()
        // JSON string literals are valid JavaScript string literals
        .map(|d| format!("    {}", serde_json::Value::from(d)))
        .collect::<Vec<_>>()
        .join(",\n");

    let mut script = String::with_capacity(512 + entries.len());
    script.push_str("function FindProxyForURL(url, host) {\n");
    script.push_str("  var blocked = [\n");
    if !entries.is_empty() {
        script.push_str(&entries);
        script.push('\n');
    }
    script.push_str("  ];\n");
    script.push_str("  var h = host.toLowerCase();\n");
    script.push_str("  if (h.charAt(h.length - 1) === \".\") {\n");
    script.push_str("    h = h.substring(0, h.length - 1);\n");
    script.push_str("  }\n");
    script.push_str("  for (var i = 0; i < blocked.length; i++) {\n");
    script.push_str("    var d = blocked[i];\n");
    script.push_str("    if (h === d || dnsDomainIs(h, \".\" + d)) {\n");
    script.push_str(&format!(
        "      return \"{}\";\n",
        Route::Blackhole.directive()
    ));
    script.push_str("    }\n");
    script.push_str("  }\n");
    script.push_str(&format!("  return \"{}\";\n", Route::Direct.directive()));
    script.push_str("}\n");
    script
}

/// SHA-256 of a rendered script, for the audit trail.
pub fn script_digest(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    format!("{:x}", hasher.finalize())
}
