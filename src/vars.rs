use anyhow::Result;
use chrono::Local;
use log::debug;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::Path;

use crate::inventory::{Host, Inventory};
use crate::options::Options;
use crate::playbook::Play;

/// Builds the variables a task sees.
///
/// Precedence, lowest first: role defaults, group_vars/all, other
/// group_vars, host_vars, play vars, role vars and params, magic variables,
/// registered results and facts, extra vars.
#[derive(Debug, Clone, Default)]
pub struct VariableManager {
    extra_vars: HashMap<String, Value>,
    magic_vars: HashMap<String, Value>,
}

impl VariableManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables seeded for every run.
    pub fn with_defaults(playbook_dir: &Path, inventory_dir: &Path, options: &Options) -> Self {
        let mut manager = Self::new();
        manager.seed_magic_vars(playbook_dir, inventory_dir, options);
        manager
    }

    pub fn seed_magic_vars(&mut self, playbook_dir: &Path, inventory_dir: &Path, options: &Options) {
        let path_value = |p: &Path| Value::String(p.display().to_string());
        self.set_magic_var("playbook_dir", path_value(playbook_dir));
        self.set_magic_var("inventory_dir", path_value(inventory_dir));
        self.set_magic_var("ansible_connection", Value::String(options.connection().to_string()));
        self.set_magic_var("ansible_check_mode", Value::Bool(options.check()));
        self.set_magic_var("ansible_forks", Value::Number(options.forks().into()));
        self.set_magic_var("ansible_verbosity", Value::Number(options.verbosity().into()));
        self.set_magic_var("ansible_date_time", date_time());
    }

    pub fn set_magic_var(&mut self, name: &str, value: Value) {
        self.magic_vars.insert(name.to_string(), value);
    }

    pub fn magic_vars(&self) -> &HashMap<String, Value> {
        &self.magic_vars
    }

    pub fn set_extra_vars(&mut self, extra: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        for (key, value) in extra {
            self.extra_vars.insert(key.clone(), json_to_yaml(value)?);
        }
        debug!("Loaded {} extra vars", self.extra_vars.len());
        Ok(())
    }

    pub fn extra_vars(&self) -> &HashMap<String, Value> {
        &self.extra_vars
    }

    /// Run-wide variables: the seeded magic variables overlaid with extra vars.
    pub fn variable_space(&self) -> HashMap<String, Value> {
        let mut vars = self.magic_vars.clone();
        vars.extend(self.extra_vars.clone());
        vars
    }

    /// Variables for `host` while running `play`. `runtime` holds the
    /// host's registered results and facts.
    pub fn get_vars(
        &self,
        play: &Play,
        host: &Host,
        inventory: &Inventory,
        runtime: &HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        let mut vars = HashMap::new();

        for role in &play.loaded_roles {
            vars.extend(role.defaults.clone());
        }
        vars.extend(inventory.group_vars_for(&host.name));
        vars.extend(host.variables.clone());
        merge_mapping(&mut vars, &play.vars);
        for role in &play.loaded_roles {
            vars.extend(role.vars.clone());
            merge_mapping(&mut vars, &role.params);
        }

        vars.extend(self.magic_vars.clone());
        vars.insert("inventory_hostname".into(), Value::String(host.name.clone()));
        vars.insert(
            "inventory_hostname_short".into(),
            Value::String(host.name.split('.').next().unwrap_or(&host.name).to_string()),
        );
        vars.insert("group_names".into(), strings(inventory.group_names(&host.name)));
        vars.insert("groups".into(), groups_value(inventory));
        vars.insert(
            "role_names".into(),
            strings(play.roles.iter().map(|r| r.name.clone()).collect()),
        );
        vars.insert("play_name".into(), Value::String(play.name.clone()));

        vars.extend(runtime.clone());
        vars.extend(self.extra_vars.clone());
        vars
    }
}

/// Convert a JSON value into the YAML value model used by playbooks.
pub fn json_to_yaml(value: &serde_json::Value) -> Result<Value> {
    Ok(serde_yaml::to_value(value)?)
}

fn merge_mapping(vars: &mut HashMap<String, Value>, mapping: &Mapping) {
    for (key, value) in mapping {
        if let Value::String(name) = key {
            vars.insert(name.clone(), value.clone());
        }
    }
}

fn strings(items: Vec<String>) -> Value {
    Value::Sequence(items.into_iter().map(Value::String).collect())
}

fn groups_value(inventory: &Inventory) -> Value {
    let mut groups = Mapping::new();
    for (name, group) in &inventory.groups {
        groups.insert(
            Value::String(name.clone()),
            strings(group.hosts.iter().cloned().collect()),
        );
    }
    Value::Mapping(groups)
}

fn date_time() -> Value {
    let now = Local::now();
    let mut map = Mapping::new();
    let fields = [
        ("date", now.format("%Y-%m-%d").to_string()),
        ("time", now.format("%H:%M:%S").to_string()),
        ("year", now.format("%Y").to_string()),
        ("month", now.format("%m").to_string()),
        ("day", now.format("%d").to_string()),
        ("hour", now.format("%H").to_string()),
        ("minute", now.format("%M").to_string()),
        ("second", now.format("%S").to_string()),
        ("weekday", now.format("%A").to_string()),
        ("epoch", now.timestamp().to_string()),
        ("iso8601", now.to_rfc3339()),
    ];
    for (key, value) in fields {
        map.insert(Value::String(key.to_string()), Value::String(value));
    }
    Value::Mapping(map)
}
