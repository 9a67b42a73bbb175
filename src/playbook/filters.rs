use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;
use tera::{to_value, try_get_value, Filter, Tera, Value};

/// Ansible's `bool` filter: yes/no/on/off/true/false/1/0 strings become booleans.
pub fn bool_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let b = match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "yes" | "y" | "on" | "true" | "t" | "1"
        ),
        Value::Null => false,
        _ => return Err(tera::Error::msg("bool filter expects a scalar value")),
    };
    Ok(Value::Bool(b))
}

pub fn to_json_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    serde_json::to_string(value)
        .map(Value::String)
        .map_err(|e| tera::Error::msg(format!("to_json failed: {}", e)))
}

pub fn to_nice_json_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    serde_json::to_string_pretty(value)
        .map(Value::String)
        .map_err(|e| tera::Error::msg(format!("to_nice_json failed: {}", e)))
}

pub fn basename_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let path = try_get_value!("basename", "value", String, value);
    let base = Path::new(&path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Value::String(base))
}

pub fn dirname_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let path = try_get_value!("dirname", "value", String, value);
    let dir = Path::new(&path)
        .parent()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Value::String(dir))
}

/// `string`: render any value the way it would be printed.
pub fn string_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }))
}

/// `selectattr(attribute, test, value)`.
///
/// Without a test, items whose attribute is truthy are kept. Supported tests:
/// `equalto`/`==`/`eq`, `ne`/`!=`, `defined`, `undefined`, `truthy`, `falsy`, `in`.
pub struct SelectAttrFilter;

impl Filter for SelectAttrFilter {
    fn filter(&self, value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let arr = try_get_value!("selectattr", "value", Vec<Value>, value);
        let attribute = match args.get("attribute") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(tera::Error::msg("selectattr requires an attribute")),
        };
        let test = match args.get("test") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(tera::Error::msg("selectattr test must be a string")),
            None => "truthy".to_string(),
        };
        let expected = args.get("value").cloned().unwrap_or(Value::Null);
        debug!(
            "selectattr: attribute='{}', test='{}', value={:?}",
            attribute, test, expected
        );

        let mut selected = Vec::new();
        for item in arr {
            let attr_value = lookup_attribute(&item, &attribute);
            let keep = match test.as_str() {
                "equalto" | "==" | "eq" | "equal" => attr_value == Some(&expected),
                "ne" | "!=" => attr_value != Some(&expected),
                "defined" => attr_value.is_some(),
                "undefined" => attr_value.is_none(),
                "truthy" => attr_value.map(is_truthy).unwrap_or(false),
                "falsy" => !attr_value.map(is_truthy).unwrap_or(false),
                "in" => match (&expected, attr_value) {
                    (Value::Array(options), Some(v)) => options.contains(v),
                    _ => false,
                },
                other => {
                    warn!("selectattr: unsupported test '{}'", other);
                    return Err(tera::Error::msg(format!(
                        "selectattr does not support test '{}'",
                        other
                    )));
                }
            };
            if keep {
                selected.push(item.clone());
            }
        }
        Ok(to_value(selected)?)
    }
}

/// Dotted attribute lookup (`a.b.c`) into nested objects.
fn lookup_attribute<'a>(item: &'a Value, attribute: &str) -> Option<&'a Value> {
    attribute
        .split('.')
        .try_fold(item, |current, part| current.as_object()?.get(part))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Tests over registered results: `is failed`, `is succeeded`, `is changed`, `is skipped`.
fn result_tester(key: &'static str, expect: bool) -> impl tera::Test {
    move |value: Option<&Value>, _args: &[Value]| -> tera::Result<bool> {
        let flag = value
            .and_then(|v| v.as_object())
            .and_then(|o| o.get(key))
            .map(is_truthy)
            .unwrap_or(false);
        Ok(flag == expect)
    }
}

/// Register the Ansible-flavoured filters and tests on a Tera instance.
///
/// `map(attribute=...)`, `length`, `default`, `join`, `lower`/`upper` and
/// `int` come from Tera's own builtins.
pub fn register_ansible_filters(tera: &mut Tera) {
    tera.register_filter("bool", bool_filter);
    tera.register_filter("to_json", to_json_filter);
    tera.register_filter("to_nice_json", to_nice_json_filter);
    tera.register_filter("basename", basename_filter);
    tera.register_filter("dirname", dirname_filter);
    tera.register_filter("string", string_filter);
    tera.register_filter("selectattr", SelectAttrFilter);

    tera.register_tester("failed", result_tester("failed", true));
    tera.register_tester("succeeded", result_tester("failed", false));
    tera.register_tester("success", result_tester("failed", false));
    tera.register_tester("changed", result_tester("changed", true));
    tera.register_tester("skipped", result_tester("skipped", true));
    debug!("Registered Ansible-compatible filters and tests");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_args() -> HashMap<String, Value> {
        HashMap::new()
    }

    #[test]
    fn test_bool_filter() {
        assert_eq!(bool_filter(&json!("yes"), &no_args()).unwrap(), json!(true));
        assert_eq!(bool_filter(&json!("Off"), &no_args()).unwrap(), json!(false));
        assert_eq!(bool_filter(&json!(1), &no_args()).unwrap(), json!(true));
        assert_eq!(bool_filter(&json!(null), &no_args()).unwrap(), json!(false));
        assert!(bool_filter(&json!([1]), &no_args()).is_err());
    }

    #[test]
    fn test_path_filters() {
        assert_eq!(
            basename_filter(&json!("/etc/nginx/nginx.conf"), &no_args()).unwrap(),
            json!("nginx.conf")
        );
        assert_eq!(
            dirname_filter(&json!("/etc/nginx/nginx.conf"), &no_args()).unwrap(),
            json!("/etc/nginx")
        );
    }

    #[test]
    fn test_json_filters() {
        let value = json!({"a": 1});
        assert_eq!(to_json_filter(&value, &no_args()).unwrap(), json!("{\"a\":1}"));
        let nice = to_nice_json_filter(&value, &no_args()).unwrap();
        assert!(nice.as_str().unwrap().contains("\n"));
    }

    #[test]
    fn test_selectattr_equalto_and_truthy() {
        let items = json!([
            {"name": "a", "enabled": true},
            {"name": "b", "enabled": false},
            {"name": "c"}
        ]);

        let mut args = HashMap::new();
        args.insert("attribute".to_string(), json!("enabled"));
        let truthy = SelectAttrFilter.filter(&items, &args).unwrap();
        assert_eq!(truthy, json!([{"name": "a", "enabled": true}]));

        args.insert("test".to_string(), json!("equalto"));
        args.insert("value".to_string(), json!(false));
        let equal = SelectAttrFilter.filter(&items, &args).unwrap();
        assert_eq!(equal, json!([{"name": "b", "enabled": false}]));

        args.insert("test".to_string(), json!("undefined"));
        let undefined = SelectAttrFilter.filter(&items, &args).unwrap();
        assert_eq!(undefined, json!([{"name": "c"}]));
    }

    #[test]
    fn test_selectattr_unknown_test() {
        let mut args = HashMap::new();
        args.insert("attribute".to_string(), json!("x"));
        args.insert("test".to_string(), json!("match"));
        assert!(SelectAttrFilter.filter(&json!([{"x": 1}]), &args).is_err());
    }

    #[test]
    fn test_result_testers() {
        let mut tera = Tera::default();
        register_ansible_filters(&mut tera);
        let mut context = tera::Context::new();
        context.insert("r", &json!({"failed": false, "changed": true}));
        let out = tera
            .render_str(
                "{% if r is succeeded %}ok{% endif %}{% if r is changed %}-changed{% endif %}{% if r is failed %}-failed{% endif %}",
                &context,
            )
            .unwrap();
        assert_eq!(out, "ok-changed");
    }
}
