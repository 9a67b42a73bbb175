use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

/// Check if a parameter exists in an argument mapping.
pub fn has_param(args: &Mapping, name: &str) -> bool {
    args.contains_key(name)
}

/// Extract a required parameter of type T.
/// Returns an error if the parameter is missing or type does not match.
pub fn get_param<T: DeserializeOwned>(args: &Mapping, name: &str) -> Result<T> {
    match args.get(name) {
        Some(val) => serde_yaml::from_value(val.clone())
            .map_err(|e| anyhow!("Parameter '{}' type error: {} (value: {:?})", name, e, val)),
        None => Err(anyhow!("Missing required parameter: {}", name)),
    }
}

/// Extract an optional parameter of type T.
/// Returns None if the parameter is missing or type does not match.
pub fn get_optional_param<T: DeserializeOwned>(args: &Mapping, name: &str) -> Option<T> {
    args.get(name)
        .and_then(|val| serde_yaml::from_value(val.clone()).ok())
}

/// A parameter as text, whatever scalar type YAML gave it (`mode: 0644` arrives as a number).
pub fn get_string_param(args: &Mapping, name: &str) -> Option<String> {
    match args.get(name)? {
        Value::Null => None,
        other => Some(value_to_string(other)),
    }
}

/// Boolean parameter with Ansible's loose spellings.
pub fn get_bool_param(args: &Mapping, name: &str, default: bool) -> bool {
    args.get(name)
        .map(crate::playbook::parse_bool)
        .unwrap_or(default)
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_get_param_ok() {
        let a = args("{key: val, num: 42}");
        assert_eq!(get_param::<String>(&a, "key").unwrap(), "val");
        assert_eq!(get_param::<i64>(&a, "num").unwrap(), 42);
    }

    #[test]
    fn test_get_param_missing_and_type_error() {
        let a = args("{foo: 1}");
        assert!(get_param::<String>(&a, "notfound").is_err());
        let err = get_param::<Vec<String>>(&a, "foo").unwrap_err();
        assert!(err.to_string().contains("type error"));
    }

    #[test]
    fn test_get_optional_param() {
        let a = args("{foo: bar}");
        assert_eq!(get_optional_param::<String>(&a, "foo"), Some("bar".to_string()));
        assert_eq!(get_optional_param::<String>(&a, "none"), None);
        assert!(has_param(&a, "foo"));
        assert!(!has_param(&a, "bar"));
    }

    #[test]
    fn test_string_and_bool_params() {
        let a = args("{mode: 644, quoted: '0755', force: 'yes', empty: null}");
        assert_eq!(get_string_param(&a, "mode").as_deref(), Some("644"));
        assert_eq!(get_string_param(&a, "quoted").as_deref(), Some("0755"));
        assert_eq!(get_string_param(&a, "empty"), None);
        assert!(get_bool_param(&a, "force", false));
        assert!(get_bool_param(&a, "missing", true));
    }
}
