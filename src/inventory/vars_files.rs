use anyhow::{anyhow, Context, Result};
use log::debug;
use serde_yaml::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Read a YAML file whose top level is a mapping of variables.
///
/// An empty file yields no variables.
pub fn read_vars_file(path: &Path) -> Result<HashMap<String, Value>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read vars file: {}", path.display()))?;

    let parsed: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse vars file: {}", path.display()))?;

    let mut vars = HashMap::new();
    match parsed {
        Value::Null => {}
        Value::Mapping(map) => {
            for (key, value) in map {
                match key {
                    Value::String(k) => {
                        vars.insert(k, value);
                    }
                    other => {
                        return Err(anyhow!(
                            "Non-string variable name {:?} in {}",
                            other,
                            path.display()
                        ))
                    }
                }
            }
        }
        _ => {
            return Err(anyhow!(
                "Vars file {} must contain a mapping",
                path.display()
            ))
        }
    }

    debug!("Loaded {} variables from {}", vars.len(), path.display());
    Ok(vars)
}

/// Load `<dir>/<name>.yml`, `<dir>/<name>.yaml`, `<dir>/<name>` or every YAML
/// file below the `<dir>/<name>/` directory, in that order of preference.
pub fn load_named_vars(dir: &Path, name: &str) -> Result<HashMap<String, Value>> {
    let mut vars = HashMap::new();

    for candidate in [
        dir.join(format!("{}.yml", name)),
        dir.join(format!("{}.yaml", name)),
        dir.join(name),
    ] {
        if candidate.is_file() {
            return read_vars_file(&candidate);
        }
    }

    let nested = dir.join(name);
    if nested.is_dir() {
        let mut files: Vec<PathBuf> = WalkDir::new(&nested)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yml") | Some("yaml")
                )
            })
            .collect();
        files.sort();

        for file in files {
            vars.extend(read_vars_file(&file)?);
        }
    }

    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_named_vars_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("web.yml"), "port: 8080\nname: web\n").unwrap();

        let vars = load_named_vars(dir.path(), "web").unwrap();
        assert_eq!(vars.get("port"), Some(&Value::Number(8080.into())));
        assert_eq!(vars.get("name"), Some(&Value::String("web".to_string())));
    }

    #[test]
    fn test_load_named_vars_directory_merges_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("db");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("01-base.yml"), "engine: postgres\nport: 5432\n").unwrap();
        fs::write(nested.join("02-override.yaml"), "port: 6432\n").unwrap();
        fs::write(nested.join("README.md"), "ignored").unwrap();

        let vars = load_named_vars(dir.path(), "db").unwrap();
        assert_eq!(vars.get("engine"), Some(&Value::String("postgres".to_string())));
        assert_eq!(vars.get("port"), Some(&Value::Number(6432.into())));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_missing_vars_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_named_vars(dir.path(), "nothing").unwrap().is_empty());
    }

    #[test]
    fn test_empty_file_and_invalid_top_level() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("empty.yml"), "").unwrap();
        assert!(load_named_vars(dir.path(), "empty").unwrap().is_empty());

        fs::write(dir.path().join("list.yml"), "- a\n- b\n").unwrap();
        assert!(load_named_vars(dir.path(), "list").is_err());
    }
}
