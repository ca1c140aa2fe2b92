//! Two-layer variable interpolation applied to every string in a step's
//! `params` tree (C8).
//!
//! `${{ expr }}` evaluates `expr` as a JMESPath expression against the
//! step/vars context; `${NAME}` / `${NAME:-default}` looks `NAME` up in
//! vars, then ambient environment, else falls back to `default`/empty.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::RecipeError;

static EXPR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{\{\s*(.*?)\s*\}\}").unwrap());
static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").unwrap());

/// Renders every string found (recursively) in `value`, leaving non-string
/// leaves untouched.
pub fn render_value(
    value: &Value,
    context: &Value,
    vars: &HashMap<String, String>,
) -> Result<Value, RecipeError> {
    match value {
        Value::String(s) => Ok(Value::String(render_string(s, context, vars)?)),
        Value::Array(items) => {
            let rendered: Result<Vec<Value>, RecipeError> =
                items.iter().map(|v| render_value(v, context, vars)).collect();
            Ok(Value::Array(rendered?))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, context, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

pub fn render_string(
    input: &str,
    context: &Value,
    vars: &HashMap<String, String>,
) -> Result<String, RecipeError> {
    let after_expr = render_expressions(input, context)?;
    Ok(render_env_vars(&after_expr, vars))
}

fn render_expressions(input: &str, context: &Value) -> Result<String, RecipeError> {
    let mut err = None;
    let rendered = EXPR_RE.replace_all(input, |caps: &regex::Captures| {
        let expr = &caps[1];
        match eval_jmespath(expr, context) {
            Ok(s) => s,
            Err(e) => {
                err = Some(e);
                String::new()
            }
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    Ok(rendered.into_owned())
}

fn eval_jmespath(expr: &str, context: &Value) -> Result<String, RecipeError> {
    let compiled = jmespath::compile(expr).map_err(|e| RecipeError::Template(e.to_string()))?;
    let result = compiled
        .search(context.clone())
        .map_err(|e| RecipeError::Template(e.to_string()))?;

    Ok(match result.as_string() {
        Some(s) => s.clone(),
        None if result.is_null() => String::new(),
        None => serde_json::to_string(&variable_to_json(&result)).unwrap_or_default(),
    })
}

fn variable_to_json(v: &jmespath::Variable) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

fn render_env_vars(input: &str, vars: &HashMap<String, String>) -> String {
    VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            let default = caps.get(3).map(|m| m.as_str());
            vars.get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
                .or_else(|| default.map(str::to_string))
                .unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expr_pulls_value_out_of_context() {
        let context = json!({"steps": {"a": {"result": {"id": 7}}}});
        let vars = HashMap::new();
        let out = render_string("id=${{ steps.a.result.id }}", &context, &vars).unwrap();
        assert_eq!(out, "id=7");
    }

    #[test]
    fn var_falls_back_to_default_when_unset() {
        let context = json!({});
        let vars = HashMap::new();
        let out = render_string("${MISSING:-fallback}", &context, &vars).unwrap();
        assert_eq!(out, "fallback");
    }

    #[test]
    fn var_prefers_declared_vars_over_env() {
        let context = json!({});
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "from-vars".to_string());
        unsafe { std::env::set_var("NAME", "from-env") };
        let out = render_string("${NAME}", &context, &vars).unwrap();
        assert_eq!(out, "from-vars");
        unsafe { std::env::remove_var("NAME") };
    }

    #[test]
    fn array_result_becomes_json_string() {
        let context = json!({"steps": {"a": {"result": {"items": [1, 2, 3]}}}});
        let vars = HashMap::new();
        let out = render_string("${{ steps.a.result.items }}", &context, &vars).unwrap();
        assert_eq!(out, "[1,2,3]");
    }

    #[test]
    fn nested_object_strings_are_all_rendered() {
        let context = json!({"vars": {"env": "prod"}});
        let vars = HashMap::new();
        let input = json!({"a": "${{ vars.env }}", "b": ["x", "${{ vars.env }}"]});
        let out = render_value(&input, &context, &vars).unwrap();
        assert_eq!(out, json!({"a": "prod", "b": ["x", "prod"]}));
    }
}
