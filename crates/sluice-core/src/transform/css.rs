//! Stylesheet transforms.

use super::{ContentKind, SourceContext, Transform};
use crate::emit::js_string;
use crate::scan::{css_urls, is_external_url, scan_style, strip_css_imports, style_request};
use serde_json::Value;

/// Validates a stylesheet and optionally minifies it.
///
/// Options: `{ "minify": true }`.
pub struct CssTransform;

impl Transform for CssTransform {
    fn id(&self) -> &str {
        "css"
    }

    fn output_kind(&self, _input: ContentKind, _options: &Value) -> ContentKind {
        ContentKind::Style
    }

    fn apply(&self, content: &str, options: &Value, _ctx: &mut SourceContext<'_>) -> Result<String, String> {
        check_braces(content)?;
        let minify = options.get("minify").and_then(Value::as_bool).unwrap_or(false);
        if minify {
            Ok(minify_css(content))
        } else {
            Ok(content.to_string())
        }
    }
}

/// Turns a stylesheet into a script that injects it into the document.
///
/// `url()` references become `require()` calls so the referenced assets stay
/// in the module graph; `@import`s become side-effect requires.
pub struct StyleInjectTransform;

impl Transform for StyleInjectTransform {
    fn id(&self) -> &str {
        "style-inject"
    }

    fn output_kind(&self, _input: ContentKind, _options: &Value) -> ContentKind {
        ContentKind::Script
    }

    fn apply(&self, content: &str, _options: &Value, ctx: &mut SourceContext<'_>) -> Result<String, String> {
        let mut out = String::new();
        let imports: Vec<String> = scan_style(content)
            .into_iter()
            .filter(|i| i.request.ends_with(".css") || i.specifier.contains(".css?"))
            .map(|i| i.request)
            .collect();
        for request in &imports {
            out.push_str(&format!("require({});\n", js_string(request)));
        }

        let css = strip_css_imports(content);
        let mut parts = Vec::new();
        let mut last = 0;
        for url in css_urls(&css) {
            if is_external_url(&url.specifier) {
                continue;
            }
            parts.push(js_string(&css[last..url.range.start]));
            parts.push(format!(
                "\"url(\" + require({}) + \")\"",
                js_string(&style_request(&url.specifier))
            ));
            last = url.range.end;
        }
        parts.push(js_string(&css[last..]));

        out.push_str(&injection_script(&parts.join(" + "), ctx.rel_path()));
        Ok(out)
    }
}

/// Script that installs (or replaces) a `<style>` element for `id`.
///
/// `css_expr` is a JavaScript expression evaluating to the stylesheet text.
#[must_use]
pub fn injection_script(css_expr: &str, id: &str) -> String {
    format!(
        r"(function() {{
  var id = {id};
  var style = document.querySelector('style[data-sluice-id=' + JSON.stringify(id) + ']');
  if (!style) {{
    style = document.createElement('style');
    style.setAttribute('data-sluice-id', id);
    document.head.appendChild(style);
  }}
  style.textContent = {css_expr};
}})();
",
        id = js_string(id),
    )
}

fn check_braces(content: &str) -> Result<(), String> {
    let mut open_lines: Vec<usize> = Vec::new();
    let mut line = 1;
    let mut chars = content.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
        }
        if let Some(q) = quote {
            if c == '\\' {
                chars.next();
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '{' => open_lines.push(line),
            '}' => {
                if open_lines.pop().is_none() {
                    return Err(format!("unexpected '}}' at line {line}"));
                }
            }
            _ => {}
        }
    }

    match open_lines.pop() {
        Some(opened) => Err(format!("unclosed '{{' opened at line {opened}")),
        None => Ok(()),
    }
}

/// Comment removal and whitespace collapse.
#[must_use]
pub fn minify_css(content: &str) -> String {
    let mut result = String::with_capacity(content.len());
    let mut in_comment = false;
    let mut last_char = ' ';

    for c in content.chars() {
        if in_comment {
            if last_char == '*' && c == '/' {
                in_comment = false;
                last_char = ' ';
                continue;
            }
            last_char = c;
            continue;
        }

        if last_char == '/' && c == '*' {
            in_comment = true;
            result.pop();
            last_char = c;
            continue;
        }

        if c.is_whitespace() {
            if !last_char.is_whitespace() && !matches!(last_char, '{' | ';' | ':' | ',') {
                result.push(' ');
            }
            last_char = ' ';
            continue;
        }

        if last_char == ' ' && matches!(c, '{' | '}' | ';' | ':' | ',') && result.ends_with(' ') {
            result.pop();
        }

        result.push(c);
        last_char = c;
    }

    result.trim().to_string()
}
