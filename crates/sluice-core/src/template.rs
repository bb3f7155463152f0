//! Output filename templates.
//!
//! Placeholders: `[name]`, `[id]`, `[ext]`, `[hash]`, `[hash:N]`,
//! `[contenthash]`, `[contenthash:N]`. Unknown placeholders are kept as written.

use sluice_util::hash::short_hash;

/// Values substituted into a filename template.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateVars<'a> {
    pub name: &'a str,
    pub id: &'a str,
    /// Extension without the leading dot.
    pub ext: &'a str,
    pub hash: &'a str,
    /// Falls back to `hash` when empty.
    pub content_hash: &'a str,
}

/// Render `template` with `vars`.
#[must_use]
pub fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let placeholder = &after[..close];
        match expand(placeholder, vars) {
            Some(value) => out.push_str(value),
            None => {
                out.push('[');
                out.push_str(placeholder);
                out.push(']');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn expand<'a>(placeholder: &str, vars: &TemplateVars<'a>) -> Option<&'a str> {
    let (key, len) = match placeholder.split_once(':') {
        Some((key, len)) => (key, Some(len.parse::<usize>().ok()?)),
        None => (placeholder, None),
    };
    let value = match key {
        "name" => vars.name,
        "id" => vars.id,
        "ext" => vars.ext,
        "hash" => vars.hash,
        "contenthash" if vars.content_hash.is_empty() => vars.hash,
        "contenthash" => vars.content_hash,
        _ => return None,
    };
    match (key, len) {
        ("hash" | "contenthash", Some(len)) => Some(short_hash(value, len)),
        (_, Some(_)) => None,
        (_, None) => Some(value),
    }
}

/// Join a public path prefix and an output-relative file.
#[must_use]
pub fn public_url(public_path: &str, file: &str) -> String {
    if public_path.is_empty() {
        return file.to_string();
    }
    format!(
        "{}/{}",
        public_path.trim_end_matches('/'),
        file.trim_start_matches('/')
    )
}
