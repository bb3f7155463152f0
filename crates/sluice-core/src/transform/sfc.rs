//! Single-file components.
//!
//! A `.vue`-style file holds one `<template>`, one `<script>` and any number
//! of `<style>` blocks. The script becomes the module; the template is
//! attached to its default export as a string; each style block is emitted
//! as an auxiliary stylesheet.

use super::{ContentKind, SourceContext, Transform};
use crate::emit::js_string;
use serde_json::Value;

pub struct SfcTransform;

/// One top-level block of a component file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Block<'a> {
    tag: &'a str,
    attrs: &'a str,
    content: &'a str,
}

impl Transform for SfcTransform {
    fn id(&self) -> &str {
        "sfc"
    }

    fn output_kind(&self, _input: ContentKind, _options: &Value) -> ContentKind {
        ContentKind::Script
    }

    fn apply(&self, content: &str, _options: &Value, ctx: &mut SourceContext<'_>) -> Result<String, String> {
        let blocks = parse_blocks(content)?;

        let template = blocks.iter().find(|b| b.tag == "template");
        let scripts: Vec<&Block<'_>> = blocks.iter().filter(|b| b.tag == "script").collect();
        if scripts.len() > 1 {
            return Err("a component may contain only one <script> block".to_string());
        }

        let stem = ctx
            .path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("component")
            .to_string();
        for (i, style) in blocks.iter().filter(|b| b.tag == "style").enumerate() {
            let ext = attr(style.attrs, "lang").unwrap_or("css");
            ctx.emit_auxiliary(
                format!("{stem}.{i}.{ext}"),
                ContentKind::Style,
                style.content.trim().to_string(),
            );
        }

        let mut out = String::new();
        match scripts.first() {
            Some(script) => {
                let body = script.content.trim();
                let mut replaced = false;
                for line in body.lines() {
                    let trimmed = line.trim_start();
                    if !replaced && trimmed.starts_with("export default") {
                        let rest = trimmed.trim_start_matches("export default").trim_start();
                        out.push_str("const __component__ = ");
                        out.push_str(rest);
                        replaced = true;
                    } else {
                        out.push_str(line);
                    }
                    out.push('\n');
                }
                if !replaced {
                    out.push_str("const __component__ = {};\n");
                }
            }
            None => out.push_str("const __component__ = {};\n"),
        }

        if let Some(template) = template {
            out.push_str(&format!(
                "__component__.template = {};\n",
                js_string(template.content.trim())
            ));
        }
        out.push_str("export default __component__;\n");
        Ok(out)
    }
}

/// Value of `name="..."` in a tag's attribute text.
fn attr<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let start = attrs.find(&format!("{name}="))? + name.len() + 1;
    let value = attrs[start..].trim_start_matches(['"', '\'']);
    let end = value.find(['"', '\'', ' ']).unwrap_or(value.len());
    Some(&value[..end])
}

/// Split a component file into its top-level blocks.
fn parse_blocks(source: &str) -> Result<Vec<Block<'_>>, String> {
    let mut blocks = Vec::new();
    let mut rest = source;
    let mut offset = 0;

    while let Some(lt) = rest.find('<') {
        let after = &rest[lt + 1..];
        let tag_end = after
            .find(|c: char| c.is_whitespace() || c == '>')
            .unwrap_or(after.len());
        let tag = &after[..tag_end];

        if !matches!(tag, "template" | "script" | "style") {
            // Comments and stray markup between blocks are skipped
            let skip = lt + 1;
            offset += skip;
            rest = &rest[skip..];
            continue;
        }

        let open_end = after
            .find('>')
            .ok_or_else(|| format!("unterminated <{tag}> tag at byte {}", offset + lt))?;
        let attrs = after[tag_end..open_end].trim();
        let body_start = lt + 1 + open_end + 1;
        let close = format!("</{tag}>");
        // Templates may nest <template>; the block ends at the last closing tag
        let body_len = if tag == "template" {
            rest[body_start..].rfind(&close)
        } else {
            rest[body_start..].find(&close)
        }
        .ok_or_else(|| format!("missing {close}"))?;

        blocks.push(Block {
            tag,
            attrs,
            content: &rest[body_start..body_start + body_len],
        });

        let consumed = body_start + body_len + close.len();
        offset += consumed;
        rest = &rest[consumed..];
    }

    Ok(blocks)
}
