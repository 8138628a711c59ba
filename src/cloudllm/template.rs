//! Template rendering: Jinja2-equivalent instruction rendering, and the
//! narrow `$`-prefixed path-expression language used by the REST tool.
//!
//! Grounded on two distinct uses in the original implementation:
//! - `examples/original_source/llmulink/llm/svc_router.py`'s
//!   `jinja2.Template(instructions).render(params)` for instruction/skill text.
//! - `examples/original_source/llmulink/tool/provider/function_call/rest.py`'s
//!   `jsonata.Jsonata` expressions for REST request/response templates.
//!
//! The REST side is deliberately not a JSONata port: §9's open-question
//! resolution treats the template language as "opaque to the core beyond
//! `apply(template, params) -> string`", so this module implements only the
//! dotted/bracket path subset the original's own YAML configs actually use
//! (`$parameters.id`, `$response.items[0].name`), not general JSONata.

use std::collections::HashMap;

use serde_json::Value;

#[derive(Debug)]
pub enum TemplateError {
    Render(String),
    Path(String),
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::Render(msg) => write!(f, "template render error: {}", msg),
            TemplateError::Path(msg) => write!(f, "path expression error: {}", msg),
        }
    }
}

impl std::error::Error for TemplateError {}

/// Render an instruction/skill body as a Jinja2-equivalent template against `params`.
pub fn render_instructions(text: &str, params: &Value) -> Result<String, TemplateError> {
    let mut env = minijinja::Environment::new();
    env.add_template("instruction", text)
        .map_err(|e| TemplateError::Render(e.to_string()))?;
    let tmpl = env.get_template("instruction").map_err(|e| TemplateError::Render(e.to_string()))?;
    tmpl.render(params).map_err(|e| TemplateError::Render(e.to_string()))
}

/// A parsed path segment: a field name, optionally followed by an array index.
struct Segment {
    field: String,
    index: Option<usize>,
}

fn parse_path(expr: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    for raw_segment in expr.split('.') {
        if raw_segment.is_empty() {
            return Err(TemplateError::Path(format!("empty path segment in {:?}", expr)));
        }
        let (field_part, index) = match raw_segment.find('[') {
            Some(bracket_start) => {
                let field = &raw_segment[..bracket_start];
                let rest = &raw_segment[bracket_start + 1..];
                let close = rest
                    .find(']')
                    .ok_or_else(|| TemplateError::Path(format!("unterminated '[' in {:?}", raw_segment)))?;
                let index: usize = rest[..close]
                    .parse()
                    .map_err(|_| TemplateError::Path(format!("non-numeric index in {:?}", raw_segment)))?;
                (field, Some(index))
            }
            None => (raw_segment, None),
        };
        segments.push(Segment {
            field: field_part.to_string(),
            index,
        });
    }
    Ok(segments)
}

/// Evaluate a `$`-stripped dotted/bracket path expression (e.g.
/// `parameters.id` or `response.items[0].name`) against `params`.
pub fn evaluate_path(expr: &str, params: &Value) -> Result<Option<Value>, TemplateError> {
    let segments = parse_path(expr)?;
    let mut current = params;
    for segment in &segments {
        current = match current.get(&segment.field) {
            Some(v) => v,
            None => return Ok(None),
        };
        if let Some(index) = segment.index {
            current = match current.get(index) {
                Some(v) => v,
                None => return Ok(None),
            };
        }
    }
    Ok(Some(current.clone()))
}

/// As [`evaluate_path`], but stringified the way the original's
/// `JsonataDictCompiler._evaluate_expr` does: booleans become `"true"`/`"false"`,
/// strings pass through unquoted, everything else is JSON-stringified.
pub fn evaluate_path_as_string(expr: &str, params: &Value) -> Result<Option<String>, TemplateError> {
    Ok(evaluate_path(expr, params)?.map(|v| match v {
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }))
}

/// A template that is either a literal string or a `$`-prefixed path
/// expression, resolved once up front. Mirrors `JsonataDictCompiler`'s
/// per-value compilation step.
pub enum CompiledValue {
    Literal(String),
    Path(String),
}

/// The result of resolving a compiled path/body value: either plain text or
/// structured JSON (used for REST request bodies that resolve to an object).
pub enum Resolved {
    Text(String),
    Json(Value),
}

pub fn compile_value(raw: &str) -> CompiledValue {
    match raw.strip_prefix('$') {
        Some(expr) => CompiledValue::Path(expr.to_string()),
        None => CompiledValue::Literal(raw.to_string()),
    }
}

/// A map of string templates (request headers or query parameters), each
/// independently either literal or a path expression. Mirrors
/// `JsonataDictCompiler`.
pub struct CompiledDict {
    entries: HashMap<String, CompiledValue>,
}

impl CompiledDict {
    pub fn compile(raw: &HashMap<String, String>) -> Self {
        Self {
            entries: raw.iter().map(|(k, v)| (k.clone(), compile_value(v))).collect(),
        }
    }

    /// Evaluate every entry; entries that resolve to `None` are omitted.
    pub fn evaluate(&self, params: &Value) -> Result<HashMap<String, String>, TemplateError> {
        let mut out = HashMap::new();
        for (key, value) in &self.entries {
            let resolved = match value {
                CompiledValue::Literal(s) => Some(s.clone()),
                CompiledValue::Path(expr) => evaluate_path_as_string(expr, params)?,
            };
            if let Some(resolved) = resolved {
                out.insert(key.clone(), resolved);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_jinja_style_instructions() {
        let rendered = render_instructions("Hello {{ name }}!", &json!({"name": "world"})).unwrap();
        assert_eq!(rendered, "Hello world!");
    }

    #[test]
    fn evaluates_nested_path_with_index() {
        let params = json!({"response": {"items": [{"name": "first"}, {"name": "second"}]}});
        let value = evaluate_path("response.items[1].name", &params).unwrap();
        assert_eq!(value, Some(json!("second")));
    }

    #[test]
    fn missing_path_resolves_to_none_not_error() {
        let params = json!({"parameters": {}});
        assert_eq!(evaluate_path("parameters.missing", &params).unwrap(), None);
    }

    #[test]
    fn compiled_dict_drops_unresolved_entries() {
        let mut raw = HashMap::new();
        raw.insert("Authorization".to_string(), "Bearer static".to_string());
        raw.insert("X-Tenant".to_string(), "$parameters.tenant".to_string());
        let compiled = CompiledDict::compile(&raw);

        let params = json!({"parameters": {}});
        let evaluated = compiled.evaluate(&params).unwrap();
        assert_eq!(evaluated.get("Authorization"), Some(&"Bearer static".to_string()));
        assert_eq!(evaluated.get("X-Tenant"), None);
    }
}
