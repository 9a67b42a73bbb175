use anyhow::{anyhow, Result};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::error::Error as _;
use tera::{Context as TeraContext, Tera};

use crate::playbook::filters::register_ansible_filters;

const MAX_TEMPLATE_RECURSION: usize = 10;

/// Positional argument names for filters Ansible calls positionally but Tera
/// only accepts with keywords.
const POSITIONAL_FILTER_ARGS: &[(&str, &[&str])] = &[
    ("default", &["value"]),
    ("d", &["value"]),
    ("join", &["sep"]),
    ("replace", &["from", "to"]),
    ("selectattr", &["attribute", "test", "value"]),
    ("truncate", &["length"]),
    ("round", &["precision"]),
];

static FILTER_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(([^()]*)\)").expect("valid filter call regex")
});

static SINGLE_EXPR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*\{\{(.*)\}\}\s*$").expect("valid expression regex"));

static INLINE_IF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*\{\{\s*(.+?)\s+if\s+(.+?)\s+else\s+(.+?)\s*\}\}\s*$")
        .expect("valid inline-if regex")
});

/// A Tera instance with the Ansible filters and tests registered.
pub fn new_tera() -> Tera {
    let mut tera = Tera::default();
    register_ansible_filters(&mut tera);
    tera
}

/// Convert a variable map into a Tera context.
pub fn create_tera_context(vars: &HashMap<String, Value>) -> TeraContext {
    let mut context = TeraContext::new();
    for (key, value) in vars {
        match serde_json::to_value(value) {
            Ok(json_val) => context.insert(key, &json_val),
            Err(e) => warn!("Could not convert variable '{}' for Tera context: {}", key, e),
        }
    }
    context
}

fn has_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

/// Render a string value.
///
/// A value made of a single `{{ expr }}` keeps the native type of the
/// expression (lists stay lists, numbers stay numbers). Anything else is
/// rendered to a string, repeatedly, until it no longer changes. With
/// `force_string` the result is always a string.
pub fn render_value(
    input: &str,
    tera: &mut Tera,
    context: &TeraContext,
    force_string: bool,
) -> Result<Value> {
    render_value_at_depth(input, tera, context, force_string, 0)
}

fn render_value_at_depth(
    input: &str,
    tera: &mut Tera,
    context: &TeraContext,
    force_string: bool,
    depth: usize,
) -> Result<Value> {
    if !has_template(input) {
        return Ok(Value::String(input.to_string()));
    }
    if depth >= MAX_TEMPLATE_RECURSION {
        warn!(
            "Template rendering exceeded maximum recursion depth ({}) for input: {}",
            MAX_TEMPLATE_RECURSION, input
        );
        return Ok(Value::String(input.to_string()));
    }

    let converted = convert_ansible_to_tera_syntax(input);
    if converted != input {
        debug!("Converted Ansible syntax to Tera syntax: {} -> {}", input, converted);
    }

    if !force_string {
        if let Some(expr) = single_expression(&converted) {
            match render_native(expr, tera, context) {
                Ok(value) => return resolve_nested(value, tera, context, depth + 1),
                Err(e) => debug!("Native rendering of '{}' failed, rendering as text: {}", expr, e),
            }
        }
    }

    let rendered = tera
        .render_str(&converted, context)
        .map_err(|e| anyhow!("Failed to render template '{}': {}", input, describe_tera_error(&e)))?;

    if rendered != input && has_template(&rendered) {
        return render_value_at_depth(&rendered, tera, context, force_string, depth + 1);
    }
    Ok(Value::String(rendered))
}

/// `{{ expr }}` covering the whole input, without other blocks inside.
fn single_expression(input: &str) -> Option<&str> {
    let caps = SINGLE_EXPR_RE.captures(input)?;
    let inner = caps.get(1)?.as_str();
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}

/// Evaluate one expression and keep its type by round-tripping through JSON.
fn render_native(expr: &str, tera: &mut Tera, context: &TeraContext) -> Result<Value> {
    let template = format!("{{% set __rl_value = {} %}}{{{{ __rl_value | json_encode() }}}}", expr);
    let json = tera
        .render_str(&template, context)
        .map_err(|e| anyhow!(describe_tera_error(&e)))?;
    let value: serde_json::Value = serde_json::from_str(&json)?;
    Ok(serde_yaml::to_value(value)?)
}

/// Strings inside a natively rendered value may hold templates of their own
/// (variables defined in terms of other variables).
fn resolve_nested(value: Value, tera: &mut Tera, context: &TeraContext, depth: usize) -> Result<Value> {
    match value {
        Value::String(s) if has_template(&s) => render_value_at_depth(&s, tera, context, false, depth),
        Value::Sequence(seq) => seq
            .into_iter()
            .map(|v| resolve_nested(v, tera, context, depth))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        Value::Mapping(map) => {
            let mut out = Mapping::new();
            for (k, v) in map {
                out.insert(k, resolve_nested(v, tera, context, depth)?);
            }
            Ok(Value::Mapping(out))
        }
        other => Ok(other),
    }
}

/// Render every string inside a YAML structure.
pub fn render_structure(value: &Value, tera: &mut Tera, context: &TeraContext) -> Result<Value> {
    match value {
        Value::String(s) => render_value(s, tera, context, false),
        Value::Sequence(seq) => seq
            .iter()
            .map(|v| render_structure(v, tera, context))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        Value::Mapping(map) => {
            let mut out = Mapping::new();
            for (k, v) in map {
                out.insert(k.clone(), render_structure(v, tera, context)?);
            }
            Ok(Value::Mapping(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render file content (templates, `copy: content=`) to text.
pub fn render_text(content: &str, vars: &HashMap<String, Value>) -> Result<String> {
    let mut tera = new_tera();
    let resolved = resolve_vars(vars, &mut tera);
    let context = create_tera_context(&resolved);
    let converted = convert_ansible_to_tera_syntax(content);
    tera.render_str(&converted, &context)
        .map_err(|e| anyhow!("Failed to render template: {}", describe_tera_error(&e)))
}

/// Render variables whose values are templates themselves. A value that
/// fails to render is kept raw.
fn resolve_vars(vars: &HashMap<String, Value>, tera: &mut Tera) -> HashMap<String, Value> {
    let context = create_tera_context(vars);
    vars.iter()
        .map(|(name, value)| {
            let resolved = match value {
                Value::String(s) if !has_template(s) => value.clone(),
                Value::String(_) | Value::Sequence(_) | Value::Mapping(_) => {
                    render_structure(value, tera, &context).unwrap_or_else(|_| value.clone())
                }
                _ => value.clone(),
            };
            (name.clone(), resolved)
        })
        .collect()
}

/// Evaluate a condition expression (`when`, `changed_when`, `failed_when`).
pub fn evaluate_condition(condition: &str, tera: &mut Tera, context: &TeraContext) -> Result<bool> {
    let trimmed = condition.trim();
    // `when: "{{ flag }}"` is accepted as well as the bare form.
    let expr = single_expression(trimmed).unwrap_or(trimmed);
    let expr = convert_ansible_to_tera_syntax(expr);
    debug!("Evaluating condition: {}", expr);

    let template = format!("{{% if {} %}}true{{% else %}}false{{% endif %}}", expr);
    let rendered = tera.render_str(&template, context).map_err(|e| {
        anyhow!(
            "Failed to evaluate condition '{}': {}",
            condition,
            describe_tera_error(&e)
        )
    })?;
    Ok(rendered.trim() == "true")
}

/// A `when`-style value: a boolean, an expression, or a list that must all hold.
pub fn evaluate_when(when: &Value, tera: &mut Tera, context: &TeraContext) -> Result<bool> {
    match when {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => evaluate_condition(s, tera, context),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::Sequence(items) => {
            for item in items {
                if !evaluate_when(item, tera, context)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Value::Null => Ok(true),
        other => Err(anyhow!("Unsupported condition: {:?}", other)),
    }
}

/// Truthiness of a value the way conditions see it.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Sequence(seq) => !seq.is_empty(),
        Value::Mapping(map) => !map.is_empty(),
        Value::Null => false,
        Value::Tagged(tagged) => is_truthy(&tagged.value),
    }
}

/// Rewrite the Ansible idioms Tera does not parse.
///
/// Positional filter arguments become keyword arguments
/// (`default('x')` -> `default(value='x')`), and a whole-value inline
/// conditional `{{ a if c else b }}` becomes an if block.
fn convert_ansible_to_tera_syntax(input: &str) -> String {
    let mut result = FILTER_CALL_RE
        .replace_all(input, |caps: &Captures| {
            let name = &caps[1];
            let raw_args = &caps[2];
            match keyword_args(name, raw_args) {
                Some(args) => format!("| {}({})", name, args),
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    // Tera spells the default filter in full.
    result = result.replace("| d(", "| default(");

    if let Some(caps) = INLINE_IF_RE.captures(&result) {
        result = format!(
            "{{% if {} %}}{{{{ {} }}}}{{% else %}}{{{{ {} }}}}{{% endif %}}",
            &caps[2], &caps[1], &caps[3]
        );
    }
    result
}

fn keyword_args(filter: &str, raw_args: &str) -> Option<String> {
    let names = POSITIONAL_FILTER_ARGS
        .iter()
        .find(|(name, _)| *name == filter)
        .map(|(_, names)| *names)?;

    let args = split_args(raw_args);
    if args.is_empty() || args.iter().any(|a| is_keyword_arg(a)) {
        return None;
    }
    if args.len() > names.len() {
        debug!(
            "Dropping {} extra positional argument(s) of filter '{}'",
            args.len() - names.len(),
            filter
        );
    }
    Some(
        names
            .iter()
            .zip(args.iter())
            .map(|(name, arg)| format!("{}={}", name, arg))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn is_keyword_arg(arg: &str) -> bool {
    match arg.find('=') {
        Some(pos) => {
            let name = arg[..pos].trim();
            let next = arg[pos + 1..].chars().next();
            !name.is_empty()
                && name.chars().all(|c| c.is_alphanumeric() || c == '_')
                && next != Some('=')
        }
        None => false,
    }
}

/// Split filter arguments on commas outside quotes and brackets.
fn split_args(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for c in raw.chars() {
        match (quote, c) {
            (Some(q), _) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), _) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '[' | '{') => {
                depth += 1;
                current.push(c);
            }
            (None, ']' | '}') => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            (None, ',') if depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

fn describe_tera_error(e: &tera::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context(pairs: &[(&str, Value)]) -> TeraContext {
        let vars: HashMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        create_tera_context(&vars)
    }

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_render_value_simple() {
        let mut tera = new_tera();
        let ctx = context(&[("name", yaml("World"))]);
        let result = render_value("Hello {{ name }}!", &mut tera, &ctx, false).unwrap();
        assert_eq!(result, Value::String("Hello World!".to_string()));
    }

    #[test]
    fn test_render_value_keeps_native_types() {
        let mut tera = new_tera();
        let ctx = context(&[
            ("a", yaml("5")),
            ("b", yaml("3")),
            ("items", yaml("[x, y]")),
        ]);
        assert_eq!(render_value("{{ a + b * 2 }}", &mut tera, &ctx, false).unwrap(), yaml("11"));
        assert_eq!(render_value("{{ items }}", &mut tera, &ctx, false).unwrap(), yaml("[x, y]"));
        assert_eq!(
            render_value("{{ items }}", &mut tera, &ctx, true).unwrap(),
            Value::String("[x, y]".to_string())
        );
    }

    #[test]
    fn test_render_value_without_template() {
        let mut tera = new_tera();
        let ctx = TeraContext::new();
        assert_eq!(
            render_value("user ALL=(ALL) NOPASSWD: ALL", &mut tera, &ctx, false).unwrap(),
            Value::String("user ALL=(ALL) NOPASSWD: ALL".to_string())
        );
    }

    #[test]
    fn test_render_value_recursive_vars() {
        let mut tera = new_tera();
        let ctx = context(&[
            ("base", yaml("/opt/app")),
            ("conf", Value::String("{{ base }}/conf".to_string())),
        ]);
        assert_eq!(
            render_value("{{ conf }}", &mut tera, &ctx, false).unwrap(),
            Value::String("/opt/app/conf".to_string())
        );
        assert_eq!(
            render_value("dir={{ conf }}", &mut tera, &ctx, false).unwrap(),
            Value::String("dir=/opt/app/conf".to_string())
        );
    }

    #[test]
    fn test_render_value_undefined_variable() {
        let mut tera = new_tera();
        let ctx = TeraContext::new();
        let err = render_value("{{ missing }}", &mut tera, &ctx, false).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_positional_filter_arguments() {
        let mut tera = new_tera();
        let ctx = context(&[("items", yaml("[a, b]"))]);
        assert_eq!(
            render_value("{{ undefined_thing | default('fallback') }}", &mut tera, &ctx, false).unwrap(),
            Value::String("fallback".to_string())
        );
        assert_eq!(
            render_value("{{ items | join(',') }}", &mut tera, &ctx, false).unwrap(),
            Value::String("a,b".to_string())
        );
        assert_eq!(
            render_value("{{ items | join(sep='-') }}", &mut tera, &ctx, false).unwrap(),
            Value::String("a-b".to_string())
        );
    }

    #[test]
    fn test_convert_syntax() {
        assert_eq!(
            convert_ansible_to_tera_syntax("{{ x | default('a, b') }}"),
            "{{ x | default(value='a, b') }}"
        );
        assert_eq!(
            convert_ansible_to_tera_syntax("{{ users | selectattr('active', 'equalto', true) | list }}"),
            "{{ users | selectattr(attribute='active', test='equalto', value=true) | list }}"
        );
        assert_eq!(
            convert_ansible_to_tera_syntax("{{ '0700' if secure else '0755' }}"),
            "{% if secure %}{{ '0700' }}{% else %}{{ '0755' }}{% endif %}"
        );
    }

    #[test]
    fn test_inline_if() {
        let mut tera = new_tera();
        let ctx = context(&[("secure", yaml("true"))]);
        assert_eq!(
            render_value("{{ '0700' if secure else '0755' }}", &mut tera, &ctx, false).unwrap(),
            Value::String("0700".to_string())
        );
    }

    #[test]
    fn test_evaluate_condition() {
        let mut tera = new_tera();
        let ctx = context(&[
            ("count", yaml("5")),
            ("name", yaml("test")),
            ("flag", yaml("'yes'")),
            ("my_list", yaml("[a, b]")),
        ]);
        assert!(evaluate_condition("count > 3", &mut tera, &ctx).unwrap());
        assert!(!evaluate_condition("count < 5", &mut tera, &ctx).unwrap());
        assert!(evaluate_condition("name == 'test'", &mut tera, &ctx).unwrap());
        assert!(evaluate_condition("flag | bool", &mut tera, &ctx).unwrap());
        assert!(evaluate_condition("'a' in my_list", &mut tera, &ctx).unwrap());
        assert!(evaluate_condition("{{ count == 5 }}", &mut tera, &ctx).unwrap());
        assert!(evaluate_condition("undefined_var is not defined", &mut tera, &ctx).unwrap());
        assert!(!evaluate_condition("name is not defined", &mut tera, &ctx).unwrap());
    }

    #[test]
    fn test_evaluate_when_forms() {
        let mut tera = new_tera();
        let ctx = context(&[("a", yaml("true")), ("b", yaml("false"))]);
        assert!(evaluate_when(&yaml("true"), &mut tera, &ctx).unwrap());
        assert!(evaluate_when(&yaml("[a, 'not b']"), &mut tera, &ctx).unwrap());
        assert!(!evaluate_when(&yaml("[a, b]"), &mut tera, &ctx).unwrap());
    }

    #[test]
    fn test_render_structure() {
        let mut tera = new_tera();
        let ctx = context(&[("port", yaml("8080")), ("host", yaml("web"))]);
        let rendered = render_structure(
            &yaml("{url: 'http://{{ host }}:{{ port }}', port: '{{ port }}', list: ['{{ host }}', 1]}"),
            &mut tera,
            &ctx,
        )
        .unwrap();
        assert_eq!(rendered, yaml("{url: 'http://web:8080', port: 8080, list: [web, 1]}"));
    }

    #[test]
    fn test_render_text() {
        let mut vars = HashMap::new();
        vars.insert("who".to_string(), yaml("world"));
        assert_eq!(
            render_text("hello {{ who }}\nline two\n", &vars).unwrap(),
            "hello world\nline two\n"
        );
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy(&yaml("1")));
        assert!(!is_truthy(&yaml("''")));
        assert!(!is_truthy(&Value::Null));
        assert!(is_truthy(&yaml("[1]")));
    }
}
