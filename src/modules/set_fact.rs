use anyhow::{anyhow, Result};
use log::info;
use serde_yaml::{Mapping, Value};

use crate::modules::{ModuleContext, ModuleExecutor, ModuleResult};

/// Keys that configure `set_fact` itself rather than define facts.
const CONTROL_KEYS: &[&str] = &["cacheable"];

pub struct SetFactModule;

impl ModuleExecutor for SetFactModule {
    fn execute(args: &Mapping, _ctx: &ModuleContext) -> Result<ModuleResult> {
        let mut facts = Mapping::new();
        for (key, value) in args {
            let name = match key {
                Value::String(name) => name,
                other => return Err(anyhow!("set_fact keys must be strings, got {:?}", other)),
            };
            if CONTROL_KEYS.contains(&name.as_str()) {
                continue;
            }
            if name.starts_with('_') {
                return Err(anyhow!("set_fact does not accept key-less arguments: {}", name));
            }
            facts.insert(key.clone(), value.clone());
        }

        if facts.is_empty() {
            return Err(anyhow!("set_fact requires at least one key=value pair"));
        }

        info!("Setting {} fact(s)", facts.len());
        let mut result = ModuleResult::ok(format!("{} fact(s) set", facts.len()));
        result
            .data
            .insert(Value::String("ansible_facts".into()), Value::Mapping(facts.clone()));
        result.facts = facts;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::module_context;
    use std::collections::HashMap;

    #[test]
    fn test_set_fact() {
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);

        let args: Mapping = serde_yaml::from_str("{app_port: 8080, cacheable: true}").unwrap();
        let result = SetFactModule::execute(&args, &ctx).unwrap();
        assert!(!result.changed);
        assert_eq!(result.facts.len(), 1);
        assert_eq!(result.facts.get("app_port"), Some(&Value::Number(8080.into())));
    }

    #[test]
    fn test_set_fact_requires_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);

        assert!(SetFactModule::execute(&Mapping::new(), &ctx).is_err());
        let raw: Mapping = serde_yaml::from_str("{_raw_params: oops}").unwrap();
        assert!(SetFactModule::execute(&raw, &ctx).is_err());
    }
}
