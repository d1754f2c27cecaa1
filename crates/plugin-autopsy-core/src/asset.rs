use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::classify::PathClassifier;
use crate::config::InstallLayout;
pub use crate::record::{AssetKind, AssetSource, RenderContext};
use crate::record::{AssetPayload, AssetUsage, MetricRecordInput, MetricType};
use crate::AutopsyError;

/// A script or style entry resolved by the host's registration system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredAsset {
    pub handle: String,
    pub src: Option<String>,
    pub kind: AssetKind,
    #[serde(default)]
    pub deps: Vec<String>,
    pub version: Option<String>,
}

/// Resolves the byte size of an asset; failures are reported as 0.
pub trait AssetSizer {
    fn byte_size(&self, src: &str) -> u64;
}

/// Stats on-host assets from disk and asks off-host servers with a bounded HEAD request.
#[derive(Debug)]
pub struct LocalOrRemoteSizer {
    layout: InstallLayout,
    agent: ureq::Agent,
}

impl LocalOrRemoteSizer {
    #[must_use]
    pub fn new(layout: InstallLayout, timeout_ms: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(timeout_ms.min(5000)))
            .build();
        Self { layout, agent }
    }

    fn absolute_url(&self, src: &str) -> String {
        if let Some(rest) = src.strip_prefix("//") {
            format!("https://{rest}")
        } else if src.starts_with('/') {
            format!("{}{src}", self.layout.site_url.trim_end_matches('/'))
        } else {
            src.to_string()
        }
    }

    fn local_path(&self, url: &str) -> Option<PathBuf> {
        let bare = url.split(['?', '#']).next().unwrap_or_default();
        let mappings = [
            (&self.layout.content_url, &self.layout.content_dir),
            (&self.layout.site_url, &self.layout.site_root),
        ];
        for (url_root, dir_root) in mappings {
            let url_root = url_root.trim_end_matches('/');
            if url_root.is_empty() {
                continue;
            }
            if let Some(rest) = bare.strip_prefix(url_root) {
                if !rest.starts_with('/') || rest.split('/').any(|segment| segment == "..") {
                    return None;
                }
                return Some(PathBuf::from(format!(
                    "{}{rest}",
                    dir_root.trim_end_matches('/')
                )));
            }
        }
        None
    }

    fn remote_size(&self, url: &str) -> Option<u64> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return None;
        }

        match self.agent.head(url).call() {
            Ok(response) => response
                .header("content-length")
                .and_then(|value| value.trim().parse::<u64>().ok()),
            Err(ureq::Error::Status(code, _)) => {
                tracing::debug!(url, code, "asset HEAD request rejected");
                None
            }
            Err(ureq::Error::Transport(err)) => {
                tracing::debug!(url, error = %err, "asset HEAD request failed");
                None
            }
        }
    }
}

impl AssetSizer for LocalOrRemoteSizer {
    fn byte_size(&self, src: &str) -> u64 {
        let url = self.absolute_url(src);
        if let Some(path) = self.local_path(&url) {
            if let Ok(meta) = std::fs::metadata(&path) {
                if meta.is_file() {
                    return meta.len();
                }
            }
        }
        self.remote_size(&url).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AssetTrackerState {
    Disabled,
    Idle,
    Capturing,
    Scanning,
    Analyzed,
    Persisted,
}

#[derive(Debug, Default)]
struct AssetAccumulator {
    scripts: Vec<AssetUsage>,
    styles: Vec<AssetUsage>,
}

#[derive(Debug)]
struct MarkupPatterns {
    link_tag: Regex,
    script_tag: Regex,
    href: Regex,
    src: Regex,
    rel: Regex,
}

impl MarkupPatterns {
    fn new() -> Result<Self, AutopsyError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| {
                AutopsyError::Configuration(format!("invalid markup pattern: {err}"))
            })
        };
        Ok(Self {
            link_tag: compile(r"(?is)<link\b[^>]*>")?,
            script_tag: compile(r"(?is)<script\b[^>]*>")?,
            href: compile(r#"(?i)\shref\s*=\s*["']([^"']*)["']"#)?,
            src: compile(r#"(?i)\ssrc\s*=\s*["']([^"']*)["']"#)?,
            rel: compile(r#"(?i)\srel\s*=\s*["']([^"']*)["']"#)?,
        })
    }

    fn attribute(pattern: &Regex, tag: &str) -> Option<String> {
        pattern
            .captures(tag)
            .and_then(|captures| captures.get(1))
            .map(|value| value.as_str().trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// `(kind, url)` for every external script and stylesheet tag in `markup`.
    fn discover(&self, markup: &str) -> Vec<(AssetKind, String)> {
        let mut found = Vec::new();

        for tag in self.link_tag.find_iter(markup).map(|m| m.as_str()) {
            let Some(href) = Self::attribute(&self.href, tag) else {
                continue;
            };
            let is_stylesheet = Self::attribute(&self.rel, tag)
                .is_some_and(|rel| rel.to_ascii_lowercase().contains("stylesheet"));
            let looks_like_css = PathClassifier::asset_identity(&href)
                .is_some_and(|path| path.to_ascii_lowercase().ends_with(".css"));
            if is_stylesheet || looks_like_css {
                found.push((AssetKind::Style, href));
            }
        }

        for tag in self.script_tag.find_iter(markup).map(|m| m.as_str()) {
            if let Some(src) = Self::attribute(&self.src, tag) {
                found.push((AssetKind::Script, src));
            }
        }

        found
    }
}

/// Attributes enqueued and hand-written scripts and styles to extensions.
#[derive(Debug)]
pub struct AssetTracker {
    state: AssetTrackerState,
    classifier: PathClassifier,
    patterns: MarkupPatterns,
    per_extension: BTreeMap<String, AssetAccumulator>,
    seen: BTreeSet<String>,
}

impl AssetTracker {
    /// # Errors
    /// Returns [`AutopsyError::Configuration`] if a markup pattern fails to compile.
    pub fn new(classifier: PathClassifier, enabled: bool) -> Result<Self, AutopsyError> {
        Ok(Self {
            state: if enabled {
                AssetTrackerState::Idle
            } else {
                AssetTrackerState::Disabled
            },
            classifier,
            patterns: MarkupPatterns::new()?,
            per_extension: BTreeMap::new(),
            seen: BTreeSet::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> AssetTrackerState {
        self.state
    }

    fn collecting(&self) -> bool {
        matches!(
            self.state,
            AssetTrackerState::Idle | AssetTrackerState::Capturing | AssetTrackerState::Scanning
        )
    }

    /// Records assets registered for the page; call late so every extension has registered.
    ///
    /// Returns how many new assets were attributed.
    pub fn capture_registered(
        &mut self,
        context: RenderContext,
        assets: &[RegisteredAsset],
        sizer: &dyn AssetSizer,
    ) -> usize {
        if !self.collecting() {
            return 0;
        }
        self.state = AssetTrackerState::Capturing;

        assets
            .iter()
            .filter(|asset| {
                let Some(src) = asset.src.as_deref() else {
                    return false;
                };
                self.add(
                    asset.kind,
                    src,
                    Some(asset.handle.clone()),
                    context,
                    AssetSource::Registered,
                    sizer,
                )
            })
            .count()
    }

    /// Scans rendered head markup for tags that bypassed registration.
    ///
    /// Returns how many new assets were attributed.
    pub fn scan_markup(
        &mut self,
        context: RenderContext,
        markup: &str,
        sizer: &dyn AssetSizer,
    ) -> usize {
        if !self.collecting() {
            return 0;
        }
        self.state = AssetTrackerState::Scanning;

        let discovered = self.patterns.discover(markup);
        discovered
            .into_iter()
            .filter(|(kind, url)| {
                self.add(*kind, url, None, context, AssetSource::Markup, sizer)
            })
            .count()
    }

    pub fn analyze(&mut self) {
        if self.collecting() {
            self.state = AssetTrackerState::Analyzed;
        }
    }

    pub fn mark_persisted(&mut self) {
        if self.state == AssetTrackerState::Analyzed {
            self.state = AssetTrackerState::Persisted;
        }
    }

    /// One asset record per extension with at least one detected asset.
    ///
    /// # Errors
    /// Returns [`AutopsyError::Payload`] when a payload cannot be encoded.
    pub fn records(
        &self,
        page_context: &str,
        recorded_at: OffsetDateTime,
    ) -> Result<Vec<MetricRecordInput>, AutopsyError> {
        self.per_extension
            .iter()
            .filter(|(_, acc)| !(acc.scripts.is_empty() && acc.styles.is_empty()))
            .map(|(slug, acc)| {
                let total_js_size: u64 = acc.scripts.iter().map(|a| a.byte_size).sum();
                let total_css_size: u64 = acc.styles.iter().map(|a| a.byte_size).sum();
                let payload = AssetPayload {
                    js_files: len_u64(acc.scripts.len()),
                    css_files: len_u64(acc.styles.len()),
                    total_js_size,
                    total_css_size,
                    total_size: total_js_size.saturating_add(total_css_size),
                    js_details: acc.scripts.clone(),
                    css_details: acc.styles.clone(),
                };
                MetricRecordInput::new(slug, MetricType::Asset, &payload, page_context, recorded_at)
            })
            .collect()
    }

    fn add(
        &mut self,
        kind: AssetKind,
        src: &str,
        handle: Option<String>,
        context: RenderContext,
        source: AssetSource,
        sizer: &dyn AssetSizer,
    ) -> bool {
        let src = src.trim();
        if src.is_empty() {
            return false;
        }
        let identity = PathClassifier::asset_identity(src).unwrap_or_else(|| src.to_string());
        if !self.seen.insert(identity) {
            return false;
        }

        let classification = self.classifier.classify(src);
        let usage = AssetUsage {
            extension_slug: classification.slug.clone(),
            kind,
            byte_size: sizer.byte_size(src),
            handle,
            src: src.to_string(),
            context,
            source,
        };
        let entry = self.per_extension.entry(classification.slug).or_default();
        match kind {
            AssetKind::Script => entry.scripts.push(usage),
            AssetKind::Style => entry.styles.push(usage),
        }
        true
    }
}

fn len_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedSizer(HashMap<String, u64>);

    impl AssetSizer for FixedSizer {
        fn byte_size(&self, src: &str) -> u64 {
            self.0.get(src).copied().unwrap_or(0)
        }
    }

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn layout() -> InstallLayout {
        InstallLayout::conventional("/var/www/html", "https://shop.example")
    }

    fn tracker() -> AssetTracker {
        must_ok(AssetTracker::new(PathClassifier::new(&layout()), true))
    }

    fn registered(handle: &str, src: Option<&str>, kind: AssetKind) -> RegisteredAsset {
        RegisteredAsset {
            handle: handle.to_string(),
            src: src.map(str::to_string),
            kind,
            deps: Vec::new(),
            version: None,
        }
    }

    fn at() -> OffsetDateTime {
        must_ok(crate::parse_rfc3339_utc("2026-03-01T12:00:00Z"))
    }

    fn payload_for(records: &[MetricRecordInput], slug: &str) -> AssetPayload {
        let record = match records.iter().find(|r| r.extension_slug == slug) {
            Some(value) => value,
            None => panic!("no asset record for {slug}"),
        };
        must_ok(serde_json::from_value(record.payload.clone()))
    }

    #[test]
    fn registered_assets_sum_per_extension_and_kind() {
        let sizes = FixedSizer(HashMap::from([
            (
                "https://shop.example/wp-content/plugins/slider/js/slider.js".to_string(),
                40_000,
            ),
            (
                "https://shop.example/wp-content/plugins/slider/css/slider.css".to_string(),
                12_000,
            ),
        ]));
        let mut tracker = tracker();
        let added = tracker.capture_registered(
            RenderContext::Front,
            &[
                registered(
                    "slider",
                    Some("https://shop.example/wp-content/plugins/slider/js/slider.js"),
                    AssetKind::Script,
                ),
                registered(
                    "slider-style",
                    Some("https://shop.example/wp-content/plugins/slider/css/slider.css"),
                    AssetKind::Style,
                ),
                registered("inline-config", None, AssetKind::Script),
                registered(
                    "jquery-core",
                    Some("/wp-includes/js/jquery/jquery.min.js"),
                    AssetKind::Script,
                ),
            ],
            &sizes,
        );
        assert_eq!(added, 3);
        assert_eq!(tracker.state(), AssetTrackerState::Capturing);
        tracker.analyze();

        let records = must_ok(tracker.records("/", at()));
        assert_eq!(records.len(), 2);
        let slider = payload_for(&records, "slider");
        assert_eq!(slider.js_files, 1);
        assert_eq!(slider.css_files, 1);
        assert_eq!(slider.total_size, 52_000);
        assert_eq!(slider.js_details[0].handle.as_deref(), Some("slider"));
        assert_eq!(payload_for(&records, "core").js_files, 1);
    }

    #[test]
    fn markup_scan_catches_unregistered_tags_without_double_counting() {
        let sizer = FixedSizer(HashMap::new());
        let mut tracker = tracker();
        let _ = tracker.capture_registered(
            RenderContext::Front,
            &[registered(
                "forms",
                Some("https://shop.example/wp-content/plugins/forms/forms.js"),
                AssetKind::Script,
            )],
            &sizer,
        );

        let markup = r#"
            <link rel="canonical" href="https://shop.example/cart/" />
            <link rel='stylesheet' id='chat-css' href='https://shop.example/wp-content/plugins/live-chat/chat.css?ver=3' media='all' />
            <script type="text/javascript" src="https://shop.example/wp-content/plugins/forms/forms.js?ver=1.2"></script>
            <SCRIPT data-src="/lazy.js" src="/wp-content/plugins/live-chat/widget.js"></SCRIPT>
            <script>window.inline = true;</script>
            <script src="https://cdn.tracker.example/pixel.js"></script>
        "#;
        let added = tracker.scan_markup(RenderContext::Front, markup, &sizer);
        assert_eq!(added, 3);
        assert_eq!(tracker.state(), AssetTrackerState::Scanning);
        tracker.analyze();

        let records = must_ok(tracker.records("/cart", at()));
        let chat = payload_for(&records, "live-chat");
        assert_eq!(chat.css_files, 1);
        assert_eq!(chat.js_files, 1);
        assert_eq!(chat.js_details[0].source, AssetSource::Markup);
        assert_eq!(payload_for(&records, "forms").js_files, 1);
        assert_eq!(payload_for(&records, "unknown").js_files, 1);
    }

    #[test]
    fn extensions_without_assets_produce_no_record() {
        let mut tracker = tracker();
        tracker.analyze();
        assert!(must_ok(tracker.records("/", at())).is_empty());
    }

    #[test]
    fn disabled_tracker_ignores_input() {
        let mut tracker = must_ok(AssetTracker::new(PathClassifier::new(&layout()), false));
        let added = tracker.scan_markup(
            RenderContext::Admin,
            r#"<script src="/wp-content/plugins/a/a.js"></script>"#,
            &FixedSizer(HashMap::new()),
        );
        assert_eq!(added, 0);
        assert_eq!(tracker.state(), AssetTrackerState::Disabled);
    }

    #[test]
    fn local_assets_are_sized_from_disk() {
        let root = std::env::temp_dir().join(format!("autopsy-assets-{}", ulid::Ulid::new()));
        let plugin_dir = root.join("wp-content/plugins/slider/js");
        if let Err(err) = std::fs::create_dir_all(&plugin_dir) {
            panic!("failed to create fixture dir: {err}");
        }
        if let Err(err) = std::fs::write(plugin_dir.join("slider.js"), vec![b'x'; 1234]) {
            panic!("failed to write fixture asset: {err}");
        }

        let root_str = match root.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp path must be valid UTF-8"),
        };
        let sizer = LocalOrRemoteSizer::new(
            InstallLayout::conventional(&root_str, "https://shop.example"),
            1000,
        );
        assert_eq!(
            sizer.byte_size("https://shop.example/wp-content/plugins/slider/js/slider.js?ver=9"),
            1234
        );
        assert_eq!(sizer.byte_size("/wp-content/plugins/slider/js/slider.js"), 1234);
        assert_eq!(sizer.byte_size("data:text/javascript;base64,AAAA"), 0);

        let _ = std::fs::remove_dir_all(&root);
    }
}
