//! Runtime cache configuration.
//!
//! Loaded from the `[cache]` table of `cache_machine.toml` or built directly.

use std::num::NonZeroU32;
use std::time::Duration;

const DEFAULT_FORMATS: [&str; 3] = ["ehtml", "json", "xml"];
const DEFAULT_MAX_PROBE_PAGES: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Content formats probed on deletion, besides the unformatted variant.
    pub formats: Vec<String>,
    /// Upper bound of the page probe per format.
    pub max_probe_pages: u32,
    /// TTL applied when a fetch names no expiry.
    pub default_expires_in_secs: Option<u64>,
    /// When false every fetch computes and invalidation is skipped.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            formats: DEFAULT_FORMATS.iter().map(|f| f.to_string()).collect(),
            max_probe_pages: DEFAULT_MAX_PROBE_PAGES,
            default_expires_in_secs: None,
            enabled: true,
        }
    }
}

impl CacheConfig {
    /// Probe bound, clamped to at least one page.
    pub fn max_probe_pages_non_zero(&self) -> NonZeroU32 {
        NonZeroU32::new(self.max_probe_pages).unwrap_or(NonZeroU32::MIN)
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_expires_in_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn with_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.formats = formats.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_probe_pages(mut self, pages: u32) -> Self {
        self.max_probe_pages = pages;
        self
    }

    pub fn with_default_expires_in(mut self, ttl: Option<Duration>) -> Self {
        self.default_expires_in_secs = ttl.map(|ttl| ttl.as_secs());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
