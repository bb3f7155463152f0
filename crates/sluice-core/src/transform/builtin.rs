//! General-purpose built-in transforms.

use super::{ContentKind, SourceContext, Transform};
use serde_json::Value;
use std::io::Write;
use std::process::{Command, Stdio};

/// Turns a JSON document into a module exporting it.
pub struct JsonTransform;

impl Transform for JsonTransform {
    fn id(&self) -> &str {
        "json"
    }

    fn output_kind(&self, _input: ContentKind, _options: &Value) -> ContentKind {
        ContentKind::Script
    }

    fn apply(&self, content: &str, _options: &Value, _ctx: &mut SourceContext<'_>) -> Result<String, String> {
        let value: Value = serde_json::from_str(content).map_err(|e| format!("invalid JSON: {e}"))?;
        // Re-encoded on one line so the export lowering sees a single statement
        let encoded = serde_json::to_string(&value).map_err(|e| e.to_string())?;
        Ok(format!("export default {encoded};\n"))
    }
}

/// Turns any text into a module exporting it as a string.
pub struct TextTransform;

impl Transform for TextTransform {
    fn id(&self) -> &str {
        "text"
    }

    fn output_kind(&self, _input: ContentKind, _options: &Value) -> ContentKind {
        ContentKind::Script
    }

    fn apply(&self, content: &str, _options: &Value, _ctx: &mut SourceContext<'_>) -> Result<String, String> {
        let encoded = serde_json::to_string(content).map_err(|e| e.to_string())?;
        Ok(format!("export default {encoded};\n"))
    }
}

/// Replaces identifiers with literal values.
///
/// Options are an object of `identifier -> replacement`. String values are
/// inserted verbatim; other JSON values are inserted in JSON form.
///
/// ```json
/// { "transform": "define", "options": { "process.env.NODE_ENV": "\"production\"" } }
/// ```
pub struct DefineTransform;

impl Transform for DefineTransform {
    fn id(&self) -> &str {
        "define"
    }

    fn apply(&self, content: &str, options: &Value, _ctx: &mut SourceContext<'_>) -> Result<String, String> {
        let replacements = match options {
            Value::Null => return Ok(content.to_string()),
            Value::Object(map) => map,
            _ => return Err("define options must be an object".to_string()),
        };

        let mut result = content.to_string();
        // Longest keys first so `process.env.NODE_ENV` wins over `process.env`
        let mut keys: Vec<&String> = replacements.keys().collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        for key in keys {
            let to = match &replacements[key] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if result.contains(key.as_str()) {
                result = result.replace(key.as_str(), &to);
            }
        }
        Ok(result)
    }
}

/// Pipes content through an external command (stdin to stdout).
///
/// ```json
/// { "transform": "command", "options": { "command": "sass", "args": ["--stdin"], "kind": "style" } }
/// ```
pub struct CommandTransform;

impl Transform for CommandTransform {
    fn id(&self) -> &str {
        "command"
    }

    fn output_kind(&self, input: ContentKind, options: &Value) -> ContentKind {
        options
            .get("kind")
            .and_then(Value::as_str)
            .and_then(ContentKind::parse)
            .unwrap_or(input)
    }

    fn apply(&self, content: &str, options: &Value, ctx: &mut SourceContext<'_>) -> Result<String, String> {
        let program = options
            .get("command")
            .and_then(Value::as_str)
            .ok_or("command transform requires a 'command' option")?;
        let args: Vec<String> = match options.get("args") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or("'args' must be strings"))
                .collect::<Result<Vec<String>, &str>>()?,
            Some(_) => return Err("'args' must be an array".to_string()),
        };

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .env("SLUICE_FILE", ctx.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = ctx.path().parent() {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn '{program}': {e}"))?;

        // Feed stdin from another thread so a chatty child cannot deadlock us
        let input = content.as_bytes().to_vec();
        let stdin = child.stdin.take();
        let writer = std::thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&input);
            }
        });

        let output = child
            .wait_with_output()
            .map_err(|e| format!("failed to wait for '{program}': {e}"))?;
        let _ = writer.join();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "'{program}' exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        String::from_utf8(output.stdout).map_err(|_| format!("'{program}' produced non-UTF-8 output"))
    }
}
