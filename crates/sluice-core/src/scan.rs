//! Dependency scanning.
//!
//! Finds the specifiers a module references after its transforms ran:
//! `import`/`export ... from`/`require()`/`import()` for scripts, and
//! `@import`/`url()` for stylesheets. Text-level, not a parser: references
//! inside comments or strings are picked up too.

use crate::transform::ContentKind;
use regex_lite::Regex;
use std::ops::Range;
use std::sync::OnceLock;

/// A reference found in module content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedImport {
    /// Specifier exactly as written.
    pub specifier: String,
    /// Specifier handed to the resolver.
    pub request: String,
    /// Loaded on demand (`import()`), a code-split point.
    pub dynamic: bool,
}

/// A `url(...)` occurrence in a stylesheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssUrl {
    /// Byte range of the whole `url(...)` token.
    pub range: Range<usize>,
    pub specifier: String,
}

const STATIC_IMPORT: &str =
    r#"(?m)^[ \t]*(?:import|export)\s+(?:[\w$*{}\s,]+?\s+from\s+)?["']([^"'\n]+)["']"#;
const REQUIRE_CALL: &str = r#"\brequire\s*\(\s*["']([^"'\n]+)["']\s*\)"#;
const DYNAMIC_IMPORT: &str = r#"\bimport\s*\(\s*["']([^"'\n]+)["']\s*\)"#;
const CSS_IMPORT: &str = r#"@import\s+(?:url\(\s*)?["']?([^"'\s);]+)["']?\s*\)?[^;\n]*;?"#;
const CSS_URL: &str = r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^"'\s)][^\s)]*))\s*\)"#;

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn static_import_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&CELL, STATIC_IMPORT)
}

fn require_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&CELL, REQUIRE_CALL)
}

fn dynamic_import_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&CELL, DYNAMIC_IMPORT)
}

fn css_import_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&CELL, CSS_IMPORT)
}

fn css_url_re() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&CELL, CSS_URL)
}

/// Scan content of the given kind. Assets have no references.
#[must_use]
pub fn scan(content: &str, kind: ContentKind) -> Vec<ScannedImport> {
    match kind {
        ContentKind::Script => scan_script(content),
        ContentKind::Style => scan_style(content),
        ContentKind::Asset => Vec::new(),
    }
}

/// Script references in source order, deduplicated.
#[must_use]
pub fn scan_script(content: &str) -> Vec<ScannedImport> {
    let mut found: Vec<(usize, String, bool)> = Vec::new();

    for (re, dynamic) in [
        (static_import_re(), false),
        (require_re(), false),
        (dynamic_import_re(), true),
    ] {
        let Some(re) = re else { continue };
        for caps in re.captures_iter(content) {
            if let Some(m) = caps.get(1) {
                found.push((m.start(), m.as_str().to_string(), dynamic));
            }
        }
    }

    found.sort_by_key(|(pos, _, _)| *pos);
    dedup(found.into_iter().map(|(_, spec, dynamic)| ScannedImport {
        request: spec.clone(),
        specifier: spec,
        dynamic,
    }))
}

/// Stylesheet references in source order, deduplicated.
///
/// External URLs (`data:`, `http:`, `//`, `#`, root-absolute) are skipped.
#[must_use]
pub fn scan_style(content: &str) -> Vec<ScannedImport> {
    let mut found: Vec<(usize, String)> = Vec::new();
    let imports = css_import_ranges(content);

    for (range, spec) in &imports {
        if !is_external_url(spec) {
            found.push((range.start, spec.clone()));
        }
    }
    for url in css_urls(content) {
        let inside_import = imports.iter().any(|(r, _)| r.contains(&url.range.start));
        if !inside_import && !is_external_url(&url.specifier) {
            found.push((url.range.start, url.specifier));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    dedup(found.into_iter().map(|(_, spec)| ScannedImport {
        request: style_request(&spec),
        specifier: spec,
        dynamic: false,
    }))
}

fn dedup(items: impl Iterator<Item = ScannedImport>) -> Vec<ScannedImport> {
    let mut out: Vec<ScannedImport> = Vec::new();
    for item in items {
        if !out
            .iter()
            .any(|o| o.specifier == item.specifier && o.dynamic == item.dynamic)
        {
            out.push(item);
        }
    }
    out
}

fn css_import_ranges(content: &str) -> Vec<(Range<usize>, String)> {
    let Some(re) = css_import_re() else {
        return Vec::new();
    };
    re.captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let spec = caps.get(1)?;
            Some((whole.range(), spec.as_str().to_string()))
        })
        .collect()
}

/// Every `url(...)` token, external or not.
#[must_use]
pub fn css_urls(content: &str) -> Vec<CssUrl> {
    let Some(re) = css_url_re() else {
        return Vec::new();
    };
    re.captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let spec = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?;
            Some(CssUrl {
                range: whole.range(),
                specifier: spec.as_str().to_string(),
            })
        })
        .collect()
}

/// Remove `@import` statements; imported sheets are emitted as their own modules.
#[must_use]
pub fn strip_css_imports(content: &str) -> String {
    match css_import_re() {
        Some(re) => re.replace_all(content, "").into_owned(),
        None => content.to_string(),
    }
}

/// Returns true for URLs the pipeline leaves alone.
#[must_use]
pub fn is_external_url(spec: &str) -> bool {
    spec.is_empty()
        || spec.starts_with("data:")
        || spec.starts_with("http:")
        || spec.starts_with("https:")
        || spec.starts_with("//")
        || spec.starts_with('#')
        || spec.starts_with('/')
}

/// Stylesheet references are relative unless marked: `bg.png` means
/// `./bg.png`, and `~pkg/x.css` names a package.
#[must_use]
pub fn style_request(spec: &str) -> String {
    if let Some(pkg) = spec.strip_prefix('~') {
        pkg.to_string()
    } else if spec.starts_with("./") || spec.starts_with("../") || spec.starts_with('/') {
        spec.to_string()
    } else {
        format!("./{spec}")
    }
}
