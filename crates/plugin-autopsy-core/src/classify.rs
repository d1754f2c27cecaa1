use serde::{Deserialize, Serialize};

use crate::config::InstallLayout;
use crate::{CORE_SLUG, THEME_SLUG, UNKNOWN_SLUG};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    Extension,
    Theme,
    Core,
    Unknown,
}

impl OriginKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extension => "extension",
            Self::Theme => "theme",
            Self::Core => "core",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "extension" => Some(Self::Extension),
            "theme" => Some(Self::Theme),
            "core" => Some(Self::Core),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Classification {
    pub slug: String,
    pub kind: OriginKind,
}

impl Classification {
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            slug: UNKNOWN_SLUG.to_string(),
            kind: OriginKind::Unknown,
        }
    }

    fn extension(slug: &str) -> Self {
        Self {
            slug: slug.to_string(),
            kind: OriginKind::Extension,
        }
    }

    fn theme() -> Self {
        Self {
            slug: THEME_SLUG.to_string(),
            kind: OriginKind::Theme,
        }
    }

    fn core() -> Self {
        Self {
            slug: CORE_SLUG.to_string(),
            kind: OriginKind::Core,
        }
    }

    #[must_use]
    pub fn is_extension(&self) -> bool {
        matches!(self.kind, OriginKind::Extension)
    }
}

/// The three roots tested in priority order: extensions, theme, core.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RootSet {
    extensions: String,
    themes: String,
    core: Vec<String>,
}

impl RootSet {
    fn classify(&self, path: &str) -> Classification {
        if let Some(rest) = remainder(path, &self.extensions) {
            return match rest.split('/').next().filter(|segment| !segment.is_empty()) {
                Some(slug) => Classification::extension(slug),
                None => Classification::unknown(),
            };
        }

        if remainder(path, &self.themes).is_some() {
            return Classification::theme();
        }

        if self
            .core
            .iter()
            .any(|root| remainder(path, root).is_some())
        {
            return Classification::core();
        }

        Classification::unknown()
    }
}

/// Maps filesystem paths and URLs to the extension, theme, or core code that owns them.
///
/// Classification is a pure function of the input string; matching is
/// case-sensitive and requires a whole-segment prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathClassifier {
    paths: RootSet,
    urls: RootSet,
    site_root: String,
}

impl PathClassifier {
    #[must_use]
    pub fn new(layout: &InstallLayout) -> Self {
        let url_root = |raw: &str| url_path(raw).unwrap_or_default();
        Self {
            paths: RootSet {
                extensions: normalize_path(&layout.extensions_dir),
                themes: normalize_path(&layout.themes_dir),
                core: layout
                    .core_dirs
                    .iter()
                    .map(|dir| normalize_path(dir))
                    .filter(|dir| !dir.is_empty())
                    .collect(),
            },
            urls: RootSet {
                extensions: url_root(&layout.extensions_url),
                themes: url_root(&layout.themes_url),
                core: layout
                    .core_url_paths
                    .iter()
                    .map(|path| url_root(path))
                    .filter(|path| !path.is_empty())
                    .collect(),
            },
            site_root: normalize_path(&layout.site_root),
        }
    }

    /// Classifies either a filesystem path or a URL.
    ///
    /// Absolute and protocol-relative URLs are matched against the URL roots.
    /// Other input is matched against the filesystem roots first and, when it
    /// looks like a site-relative URL, against the URL roots second.
    #[must_use]
    pub fn classify(&self, path_or_url: &str) -> Classification {
        let trimmed = path_or_url.trim();
        if is_url(trimmed) {
            return self.classify_url(trimmed);
        }

        let by_path = self.classify_path(trimmed);
        if by_path.kind == OriginKind::Unknown && trimmed.starts_with('/') {
            return self.classify_url(trimmed);
        }
        by_path
    }

    #[must_use]
    pub fn classify_path(&self, path: &str) -> Classification {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return Classification::unknown();
        }
        self.paths.classify(&normalized)
    }

    #[must_use]
    pub fn classify_url(&self, url: &str) -> Classification {
        match url_path(url) {
            Some(path) if !path.is_empty() => self.urls.classify(&path),
            _ => Classification::unknown(),
        }
    }

    /// Returns the owning extension slug when `path` lies under the extensions root.
    #[must_use]
    pub fn extension_slug(&self, path: &str) -> Option<String> {
        let classification = self.classify_path(path);
        classification
            .is_extension()
            .then_some(classification.slug)
    }

    /// Rewrites an absolute path relative to the known roots so server layout never leaks.
    #[must_use]
    pub fn relativize(&self, path: &str) -> String {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return String::new();
        }
        if RELATIVE_PREFIXES
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
        {
            return normalized;
        }

        if let Some(rest) = remainder(&normalized, &self.paths.extensions) {
            return format!("extensions/{rest}");
        }
        if let Some(rest) = remainder(&normalized, &self.paths.themes) {
            return format!("themes/{rest}");
        }
        if let Some(rest) = remainder(&normalized, &self.site_root) {
            return format!("/{rest}");
        }

        let file_name = normalized.rsplit('/').next().unwrap_or_default();
        format!("external/{file_name}")
    }

    /// Normalized URL path used to detect the same asset reached through different URLs.
    #[must_use]
    pub fn asset_identity(url: &str) -> Option<String> {
        url_path(url).filter(|path| !path.is_empty())
    }
}

/// Prefixes produced by [`PathClassifier::relativize`]; already-relative input passes through.
const RELATIVE_PREFIXES: [&str; 3] = ["extensions/", "themes/", "external/"];

fn is_url(value: &str) -> bool {
    value.contains("://") || value.starts_with("//")
}

/// Unifies separators, collapses repeated slashes, and drops a trailing slash.
fn normalize_path(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    let mut previous_slash = false;
    for ch in raw.trim().chars() {
        let ch = if ch == '\\' { '/' } else { ch };
        if ch == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        normalized.push(ch);
    }

    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Extracts the path component of an absolute, protocol-relative, or site-relative URL.
fn url_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();

    let after_authority = if let Some(index) = without_query.find("://") {
        let rest = &without_query[index + 3..];
        rest.find('/').map_or("/", |slash| &rest[slash..])
    } else if let Some(rest) = without_query.strip_prefix("//") {
        rest.find('/').map_or("/", |slash| &rest[slash..])
    } else if without_query.starts_with('/') {
        without_query
    } else {
        return None;
    };

    Some(normalize_path(after_authority))
}

fn remainder<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    if root.is_empty() {
        return None;
    }
    if path == root {
        return Some("");
    }
    if root == "/" {
        return path.strip_prefix('/');
    }
    path.strip_prefix(root)?.strip_prefix('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classifier() -> PathClassifier {
        PathClassifier::new(&InstallLayout::conventional(
            "/var/www/html",
            "https://shop.example",
        ))
    }

    #[test]
    fn extension_paths_use_first_segment_after_root() {
        let result = classifier().classify("/var/www/html/wp-content/plugins/foo-cache/src/Db.php");
        assert_eq!(result.slug, "foo-cache");
        assert_eq!(result.kind, OriginKind::Extension);
    }

    #[test]
    fn windows_separators_are_normalized() {
        let layout = InstallLayout::conventional("C:/sites/shop", "https://shop.example");
        let result = PathClassifier::new(&layout)
            .classify("C:\\sites\\shop\\wp-content\\plugins\\seo-kit\\seo.php");
        assert_eq!(result.slug, "seo-kit");
    }

    #[test]
    fn root_prefix_requires_segment_boundary() {
        let result = classifier().classify("/var/www/html/wp-content/plugins-old/foo/x.php");
        assert_eq!(result, Classification::unknown());
    }

    #[test]
    fn extension_root_itself_is_unknown() {
        assert_eq!(
            classifier().classify("/var/www/html/wp-content/plugins/"),
            Classification::unknown()
        );
    }

    #[test]
    fn theme_and_core_roots_follow_priority_order() {
        let c = classifier();
        assert_eq!(
            c.classify("/var/www/html/wp-content/themes/storefront/functions.php")
                .kind,
            OriginKind::Theme
        );
        assert_eq!(
            c.classify("/var/www/html/wp-includes/class-wpdb.php").kind,
            OriginKind::Core
        );
        assert_eq!(c.classify("/usr/share/php/Foo.php"), Classification::unknown());
    }

    #[test]
    fn empty_input_is_unknown() {
        assert_eq!(classifier().classify(""), Classification::unknown());
        assert_eq!(classifier().classify("   "), Classification::unknown());
    }

    #[test]
    fn urls_classify_by_path_component() {
        let c = classifier();
        assert_eq!(
            c.classify("https://shop.example/wp-content/plugins/slider/js/app.js?ver=2.1")
                .slug,
            "slider"
        );
        assert_eq!(
            c.classify("//cdn.shop.example/wp-content/plugins/slider/css/app.css")
                .slug,
            "slider"
        );
        assert_eq!(
            c.classify("/wp-content/plugins/forms/forms.js").slug,
            "forms"
        );
        assert_eq!(
            c.classify("https://shop.example/wp-includes/js/jquery/jquery.min.js")
                .kind,
            OriginKind::Core
        );
        assert_eq!(
            c.classify("https://fonts.example/css?family=Inter"),
            Classification::unknown()
        );
    }

    #[test]
    fn relativize_never_returns_absolute_server_paths() {
        let c = classifier();
        assert_eq!(
            c.relativize("/var/www/html/wp-content/plugins/foo/db.php"),
            "extensions/foo/db.php"
        );
        assert_eq!(
            c.relativize("/var/www/html/wp-content/themes/storefront/inc/a.php"),
            "themes/storefront/inc/a.php"
        );
        assert_eq!(
            c.relativize("/var/www/html/wp-includes/load.php"),
            "/wp-includes/load.php"
        );
        assert_eq!(c.relativize("/opt/secret/lib/vendor.php"), "external/vendor.php");
        assert_eq!(c.relativize("extensions/foo/db.php"), "extensions/foo/db.php");
    }

    #[test]
    fn extension_slug_ignores_theme_and_core() {
        let c = classifier();
        assert_eq!(
            c.extension_slug("/var/www/html/wp-content/plugins/foo/a.php"),
            Some("foo".to_string())
        );
        assert_eq!(
            c.extension_slug("/var/www/html/wp-content/themes/t/a.php"),
            None
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_extension_slug_is_first_segment(
            slug in "[A-Za-z0-9][A-Za-z0-9_-]{0,20}",
            tail in prop::collection::vec("[A-Za-z0-9_-]{1,12}", 0..4),
            ext in prop::sample::select(vec!["", ".php", ".inc", ".js"]),
        ) {
            let mut path = format!("/var/www/html/wp-content/plugins/{slug}");
            for segment in &tail {
                path.push('/');
                path.push_str(segment);
            }
            path.push_str(ext);
            let result = classifier().classify(&path);
            let expected = if tail.is_empty() { format!("{slug}{ext}") } else { slug.clone() };
            prop_assert_eq!(result.slug, expected);
            prop_assert_eq!(result.kind, OriginKind::Extension);
        }

        #[test]
        fn prop_classification_is_case_sensitive(slug in "[a-z]{3,12}") {
            let path = format!("/var/www/html/WP-CONTENT/plugins/{slug}/main.php");
            prop_assert_eq!(classifier().classify(&path), Classification::unknown());
        }
    }
}
