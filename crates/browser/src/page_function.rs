use std::path::Path;

use crate::BrowserError;

/// Extraction used when the caller supplies none: title and meta tags.
const BUILTIN_SOURCE: &str = r#"function (context) {
  const metas = Array.prototype.slice
    .call(document.querySelectorAll('meta[name], meta[property]'))
    .map((m) => ({
      name: m.getAttribute('name') || m.getAttribute('property'),
      content: m.getAttribute('content'),
    }));
  return {
    url: context.url,
    label: context.label,
    title: document.title || '',
    metas,
  };
}"#;

/// A JavaScript function expression evaluated inside the page with a single
/// context argument. Its return value must be JSON-serializable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFunction {
    source: String,
}

impl PageFunction {
    pub fn new(source: impl Into<String>) -> Result<Self, BrowserError> {
        let source = normalize(&source.into());
        if !looks_callable(&source) {
            return Err(BrowserError::InvalidScript(
                "source must be a function expression".to_string(),
            ));
        }
        Ok(Self { source })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BrowserError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| BrowserError::InvalidScript(format!("{}: {}", path.display(), e)))?;
        Self::new(source).map_err(|e| match e {
            BrowserError::InvalidScript(msg) => {
                BrowserError::InvalidScript(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn builtin() -> Self {
        Self {
            source: BUILTIN_SOURCE.to_string(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Expression that calls the function with `context` and resolves to a
    /// JSON string: `{"ok": value}` or `{"error": message}`.
    pub fn invocation(&self, context: &serde_json::Value) -> String {
        format!(
            "(async () => {{ try {{ const __v = await ({})({}); \
             return JSON.stringify({{ ok: __v === undefined ? null : __v }}); }} \
             catch (e) {{ return JSON.stringify({{ error: String((e && e.stack) || e) }}); }} }})()",
            self.source, context
        )
    }
}

impl Default for PageFunction {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Skips leading comments and a `use strict` directive.
fn strip_preamble(source: &str) -> &str {
    let mut rest = source.trim_start();
    loop {
        if let Some(line) = rest.strip_prefix("//") {
            rest = line.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(block) = rest.strip_prefix("/*") {
            rest = block.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(tail) = rest
            .strip_prefix("'use strict'")
            .or_else(|| rest.strip_prefix("\"use strict\""))
        {
            rest = tail.trim_start().strip_prefix(';').unwrap_or(tail);
        } else {
            return rest;
        }
        rest = rest.trim_start();
    }
}

fn normalize(source: &str) -> String {
    let mut body = strip_preamble(source).trim();
    for prefix in ["module.exports =", "module.exports=", "export default"] {
        if let Some(rest) = body.strip_prefix(prefix) {
            body = rest.trim_start();
        }
    }
    body.trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

fn looks_callable(source: &str) -> bool {
    source.starts_with("function")
        || source.starts_with("async")
        || (source.starts_with('(') && source.contains("=>"))
        || source
            .split_once("=>")
            .map(|(params, _)| {
                let params = params.trim();
                !params.is_empty()
                    && params
                        .chars()
                        .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
            })
            .unwrap_or(false)
}

/// Decodes the JSON envelope produced by [`PageFunction::invocation`].
pub fn decode_envelope(raw: &serde_json::Value) -> Result<serde_json::Value, BrowserError> {
    let text = raw.as_str().ok_or_else(|| {
        BrowserError::EvaluationError(format!("unexpected evaluation result: {}", raw))
    })?;

    let mut envelope: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| BrowserError::EvaluationError(e.to_string()))?;

    if let Some(error) = envelope.get("error") {
        let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
        return Err(BrowserError::EvaluationError(message));
    }

    Ok(envelope
        .get_mut("ok")
        .map(serde_json::Value::take)
        .unwrap_or(serde_json::Value::Null))
}
