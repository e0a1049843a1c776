//! Pod label allow-list with an LRU decision cache
//!
//! Patterns are compiled once at construction; a label is admitted when any
//! compiled pattern matches its name. Decisions are cached per label name so
//! repeated scrapes avoid regex matching while memory stays bounded.

use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{info, warn};

/// Default decision-cache capacity, sized for large cloud clusters.
pub const DEFAULT_CACHE_SIZE: usize = 150_000;

/// Label allow-list filter.
pub struct LabelFilter {
    enabled: bool,
    patterns: Vec<Regex>,
    cache: Mutex<LruCache<String, bool>>,
}

impl LabelFilter {
    /// Compile the allow-list patterns. Patterns that fail to compile are
    /// dropped; when every pattern drops, filtering is disabled and all
    /// labels pass.
    pub fn new(patterns: &[String], cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_SIZE).expect("nonzero default"));

        if patterns.is_empty() {
            return Self {
                enabled: false,
                patterns: Vec::new(),
                cache: Mutex::new(LruCache::new(cache_size)),
            };
        }

        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match Regex::new(pattern) {
                Ok(re) => {
                    info!(pattern = %pattern, "compiled pod label allowlist pattern");
                    compiled.push(re);
                }
                Err(e) => {
                    warn!(pattern = %pattern, error = %e,
                        "failed to compile pod label allowlist pattern, skipping");
                }
            }
        }

        let enabled = !compiled.is_empty();
        if !enabled {
            warn!("no valid regex patterns for pod label filtering, all labels will be included");
        } else {
            info!(
                patterns = compiled.len(),
                original_patterns = patterns.len(),
                cache_size = cache_size.get(),
                "pod label filtering enabled"
            );
        }

        Self { enabled, patterns: compiled, cache: Mutex::new(LruCache::new(cache_size)) }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a label with this name is admitted.
    pub fn should_include(&self, label_key: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&allowed) = cache.get(label_key) {
            return allowed;
        }

        let allowed = self.patterns.iter().any(|p| p.is_match(label_key));
        cache.put(label_key.to_string(), allowed);
        allowed
    }
}

/// Sanitize a label name for exposition: any character outside
/// `[A-Za-z0-9_]` becomes `_`, and a leading digit is prefixed with `_`.
pub fn sanitize_label_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_patterns_admit_everything() {
        let filter = LabelFilter::new(&[], 16);
        assert!(!filter.is_enabled());
        assert!(filter.should_include("anything"));
    }

    #[test]
    fn test_allowlist_matching() {
        let patterns = vec!["^app".to_string(), "team".to_string()];
        let filter = LabelFilter::new(&patterns, 16);
        assert!(filter.is_enabled());

        assert!(filter.should_include("app.kubernetes.io/name"));
        assert!(filter.should_include("my-team-label"));
        assert!(!filter.should_include("irrelevant"));

        // Cached decisions stay stable.
        assert!(filter.should_include("app.kubernetes.io/name"));
        assert!(!filter.should_include("irrelevant"));
    }

    #[test]
    fn test_invalid_patterns_are_dropped() {
        let patterns = vec!["[invalid".to_string(), "^ok$".to_string()];
        let filter = LabelFilter::new(&patterns, 16);
        assert!(filter.is_enabled());
        assert!(filter.should_include("ok"));
        assert!(!filter.should_include("[invalid"));
    }

    #[test]
    fn test_all_patterns_invalid_disables_filtering() {
        let patterns = vec!["[invalid".to_string(), "(also-bad".to_string()];
        let filter = LabelFilter::new(&patterns, 16);
        assert!(!filter.is_enabled());
        assert!(filter.should_include("anything at all"));
    }

    #[test]
    fn test_lru_eviction_keeps_cache_bounded() {
        let filter = LabelFilter::new(&["^a".to_string()], 2);
        assert!(filter.should_include("a1"));
        assert!(filter.should_include("a2"));
        assert!(!filter.should_include("b1"));
        // "a1" was evicted and gets re-evaluated; the answer is unchanged.
        assert!(filter.should_include("a1"));
    }

    #[test]
    fn test_sanitize_label_name() {
        assert_eq!(sanitize_label_name("app.kubernetes.io/name"), "app_kubernetes_io_name");
        assert_eq!(sanitize_label_name("simple_label"), "simple_label");
        assert_eq!(sanitize_label_name("9starts-with-digit"), "_9starts_with_digit");
        assert_eq!(sanitize_label_name(""), "");
    }
}
