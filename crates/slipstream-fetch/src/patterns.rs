//! URL pattern tables and the pure lookups over them
//!
//! All matching is case-insensitive. Keyword tables match anywhere in the URL;
//! extension tables match a trailing `.ext` or a `.ext?` before a query string.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Importance of a resource to initial content readiness.
///
/// Ordered so that `Critical` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityTier {
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword and extension tables for priority classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityTables {
    /// Keywords marking core executable assets
    pub critical: Vec<String>,
    /// Script, markup and style extensions
    pub high: Vec<String>,
    /// Image and font extensions
    pub medium: Vec<String>,
}

impl Default for PriorityTables {
    fn default() -> Self {
        Self {
            critical: strings(&[
                "wasm", "unity", "data", "framework", "loader", "bundle", "unityweb", "engine",
            ]),
            high: strings(&["js", "json", "css", "html", "htm"]),
            medium: strings(&["png", "jpg", "jpeg", "gif", "svg", "woff", "ttf"]),
        }
    }
}

/// Every pattern table the orchestrator consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPatterns {
    /// URLs handed straight to the proxy
    pub bypass: Vec<String>,
    /// URLs eligible for caching
    pub cacheable: Vec<String>,
    /// URLs belonging to the game asset class
    pub game_content: Vec<String>,
    pub priorities: PriorityTables,
}

impl Default for UrlPatterns {
    fn default() -> Self {
        Self {
            bypass: strings(&["/bare/", "/uv/service/", "/service/"]),
            cacheable: strings(&[
                ".js", ".css", ".woff", ".woff2", ".ttf", ".png", ".jpg", ".jpeg", ".gif",
                ".svg", "unity", "webgl", "game", "/assets/", "/static/", ".data", ".wasm",
                ".mem", "jsdelivr", "cloudfront", "akamai", "cdn", ".unityweb", ".unity3d",
                ".json", ".xml", ".txt", ".html", ".htm", ".ico", ".mp3", ".ogg", ".wav",
                ".webm", "poki", "y8.com", "crazygames", "coolmath", "kongregate",
                "newgrounds", "github.io", "gitlab.io", "itch.io", "simmer.io", "replit.com",
            ]),
            game_content: strings(&[
                "unity", "unitycdn", "webgl", "game", "games", "play", "3d", "canvas", "html5",
                "arcade", "gitlab.io", "github.io", "poki.com", "crazy", "y8.com", "fnaf",
                "five-night", "minecraft", "slope", "1v1.lol", "coolmath", "kongregate",
                "newgrounds", "addicting", "armor", "miniclip", "silver", "friv", "kizi",
            ]),
            priorities: PriorityTables::default(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn contains_any(url_lower: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|p| !p.is_empty() && url_lower.contains(&p.to_ascii_lowercase()))
}

fn has_extension(url_lower: &str, extensions: &[String]) -> bool {
    extensions.iter().any(|ext| {
        let ext = ext.to_ascii_lowercase();
        !ext.is_empty()
            && (url_lower.ends_with(&format!(".{ext}")) || url_lower.contains(&format!(".{ext}?")))
    })
}

impl UrlPatterns {
    pub fn is_bypass(&self, url: &str) -> bool {
        !url.is_empty() && contains_any(&url.to_ascii_lowercase(), &self.bypass)
    }

    /// Bypassed URLs are never cacheable.
    pub fn is_cacheable(&self, url: &str) -> bool {
        !self.is_bypass(url) && contains_any(&url.to_ascii_lowercase(), &self.cacheable)
    }

    /// Bypassed URLs are never game content.
    pub fn is_game_content(&self, url: &str) -> bool {
        !self.is_bypass(url) && contains_any(&url.to_ascii_lowercase(), &self.game_content)
    }

    /// Maps a URL to its priority tier. Pure: depends only on `url` and the tables.
    pub fn priority(&self, url: &str) -> PriorityTier {
        if url.is_empty() {
            return PriorityTier::Low;
        }
        let url = url.to_ascii_lowercase();
        let tables = &self.priorities;

        if contains_any(&url, &tables.critical) {
            PriorityTier::Critical
        } else if has_extension(&url, &tables.high) {
            PriorityTier::High
        } else if has_extension(&url, &tables.medium) {
            PriorityTier::Medium
        } else {
            PriorityTier::Low
        }
    }
}

/// Classifies a URL against the default tables.
pub fn classify(url: &str) -> PriorityTier {
    UrlPatterns::default().priority(url)
}
