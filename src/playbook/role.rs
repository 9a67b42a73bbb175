use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::inventory::read_vars_file;
use crate::playbook::parser::{parse_handler, parse_role_refs, parse_task_list};
use crate::playbook::{Handler, RoleRef, Task};

const MAX_DEPENDENCY_DEPTH: usize = 8;

/// A role loaded from `roles/<name>/` next to the playbook.
///
/// Dependencies from `meta/main.yml` are flattened in: their tasks run first
/// and their defaults sit below the role's own.
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub path: PathBuf,
    pub params: Mapping,
    pub tasks: Vec<Task>,
    pub handlers: Vec<Handler>,
    pub defaults: HashMap<String, Value>,
    pub vars: HashMap<String, Value>,
}

impl Role {
    pub fn load(role_ref: &RoleRef, playbook_dir: &Path) -> Result<Role> {
        Self::load_with_depth(role_ref, playbook_dir, 0)
    }

    fn load_with_depth(role_ref: &RoleRef, playbook_dir: &Path, depth: usize) -> Result<Role> {
        if depth > MAX_DEPENDENCY_DEPTH {
            return Err(anyhow!(
                "Role dependency chain too deep at role '{}'",
                role_ref.name
            ));
        }

        let path = find_role(&role_ref.name, playbook_dir)?;
        info!("Loading role '{}' from {}", role_ref.name, path.display());

        let mut role = Role {
            name: role_ref.name.clone(),
            path: path.clone(),
            params: role_ref.params.clone(),
            tasks: Vec::new(),
            handlers: Vec::new(),
            defaults: HashMap::new(),
            vars: HashMap::new(),
        };

        if let Some(meta) = main_file(&path, "meta") {
            let meta_yaml = read_yaml(&meta)?;
            if let Value::Mapping(meta_map) = meta_yaml {
                for dep_ref in parse_role_refs(meta_map.get("dependencies"))? {
                    let dep = Self::load_with_depth(&dep_ref, playbook_dir, depth + 1)
                        .with_context(|| format!("Failed to load dependency of role '{}'", role.name))?;
                    debug!("Role '{}' depends on '{}'", role.name, dep.name);
                    role.tasks.extend(dep.tasks);
                    role.handlers.extend(dep.handlers);
                    role.defaults.extend(dep.defaults);
                    role.vars.extend(dep.vars);
                }
            }
        }

        if let Some(defaults) = main_file(&path, "defaults") {
            role.defaults.extend(read_vars_file(&defaults)?);
        }
        if let Some(vars) = main_file(&path, "vars") {
            role.vars.extend(read_vars_file(&vars)?);
        }

        if let Some(tasks_file) = main_file(&path, "tasks") {
            let tasks_yaml = read_yaml(&tasks_file)?;
            let mut tasks = parse_task_list(Some(&tasks_yaml), &path.join("tasks"))
                .with_context(|| format!("Failed to parse tasks of role '{}'", role.name))?;
            for task in &mut tasks {
                task.role_path = Some(path.clone());
            }
            role.tasks.extend(tasks);
        }

        if let Some(handlers_file) = main_file(&path, "handlers") {
            if let Value::Sequence(seq) = read_yaml(&handlers_file)? {
                for (index, entry) in seq.iter().enumerate() {
                    if let Value::Mapping(map) = entry {
                        let mut handler = parse_handler(map, index).with_context(|| {
                            format!("Failed to parse handler {} of role '{}'", index, role.name)
                        })?;
                        handler.task.role_path = Some(path.clone());
                        role.handlers.push(handler);
                    }
                }
            }
        }

        debug!(
            "Role '{}' loaded with {} tasks and {} handlers",
            role.name,
            role.tasks.len(),
            role.handlers.len()
        );
        Ok(role)
    }
}

fn find_role(name: &str, playbook_dir: &Path) -> Result<PathBuf> {
    let roles_dir = playbook_dir.join("roles");
    for candidate in [roles_dir.join(name), playbook_dir.join(name)] {
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }
    Err(Error::RoleNotFound {
        name: name.to_string(),
        search_path: roles_dir,
    }
    .into())
}

fn main_file(role_path: &Path, section: &str) -> Option<PathBuf> {
    ["main.yml", "main.yaml"]
        .iter()
        .map(|f| role_path.join(section).join(f))
        .find(|p| p.is_file())
}

fn read_yaml(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read role file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse role file: {}", path.display()))
}
