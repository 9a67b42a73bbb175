use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::playbook::{Handler, HostPattern, Play, Role, RoleRef, Task};

/// Keys of a task mapping that are task keywords rather than the module.
const TASK_KEYWORDS: &[&str] = &[
    "name",
    "args",
    "become",
    "become_user",
    "register",
    "when",
    "tags",
    "notify",
    "listen",
    "ignore_errors",
    "vars",
    "with_items",
    "loop",
    "loop_control",
    "changed_when",
    "failed_when",
    "check_mode",
    "no_log",
    "environment",
    "delegate_to",
    "run_once",
];

const MODULE_PREFIXES: &[&str] = &["ansible.builtin.", "ansible.legacy."];

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn read_yaml(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to open playbook file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML content of {}", path.display()))
}

/// Parse a playbook YAML file into its plays, in declaration order.
///
/// `import_playbook` entries are expanded in place.
pub fn parse_playbook(playbook_path: &Path) -> Result<Vec<Play>> {
    debug!("Parsing playbook file: {}", playbook_path.display());
    let base_dir = playbook_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let entries = match read_yaml(playbook_path)? {
        Value::Sequence(items) => items,
        Value::Mapping(map) => vec![Value::Mapping(map)],
        Value::Null => Vec::new(),
        other => {
            return Err(anyhow!(
                "Playbook {} must be a list of plays, got {:?}",
                playbook_path.display(),
                other
            ))
        }
    };

    let mut plays = Vec::new();
    for (play_index, entry) in entries.into_iter().enumerate() {
        match entry {
            Value::Mapping(play_map) => {
                if let Some(Value::String(import)) = play_map.get("import_playbook") {
                    let imported = base_dir.join(import);
                    debug!("Importing playbook {}", imported.display());
                    plays.extend(parse_playbook(&imported)?);
                    continue;
                }

                let play = parse_play(&play_map, &base_dir)
                    .with_context(|| format!("Failed to parse play {}", play_index))?;
                plays.push(play);
            }
            _ => {
                warn!("Skipping non-mapping play entry at index {}", play_index);
            }
        }
    }

    debug!("Finished parsing playbook with {} plays", plays.len());
    Ok(plays)
}

/// Parse an individual play from a YAML mapping
pub fn parse_play(play_map: &Mapping, base_dir: &Path) -> Result<Play> {
    let hosts = match play_map.get("hosts") {
        Some(value) => HostPattern::from_value(value)
            .ok_or_else(|| anyhow!("Hosts must be a string or a list of strings"))?,
        None => return Err(anyhow!("Play requires a hosts field")),
    };

    // Unnamed plays are known by their hosts pattern.
    let name = match play_map.get("name") {
        Some(Value::String(name)) => name.clone(),
        Some(_) => return Err(anyhow!("Play name must be a string")),
        None => hosts.to_string(),
    };
    debug!("Parsing play '{}'", name);

    let pre_tasks = parse_task_list(play_map.get("pre_tasks"), base_dir)?;
    let tasks = parse_task_list(play_map.get("tasks"), base_dir)?;
    let post_tasks = parse_task_list(play_map.get("post_tasks"), base_dir)?;

    let mut handlers = Vec::new();
    if let Some(Value::Sequence(handler_seq)) = play_map.get("handlers") {
        for (handler_index, handler_value) in handler_seq.iter().enumerate() {
            match handler_value {
                Value::Mapping(handler_map) => {
                    let handler = parse_handler(handler_map, handler_index)
                        .with_context(|| format!("Failed to parse handler at index {}", handler_index))?;
                    handlers.push(handler);
                }
                _ => warn!("Skipping non-mapping handler at index {}", handler_index),
            }
        }
    }

    let roles = parse_role_refs(play_map.get("roles"))?;
    let loaded_roles = roles
        .iter()
        .map(|role_ref| Role::load(role_ref, base_dir))
        .collect::<Result<Vec<_>>>()?;

    let vars = match play_map.get("vars") {
        Some(Value::Mapping(var_map)) => var_map.clone(),
        Some(Value::Null) | None => Mapping::new(),
        Some(_) => return Err(anyhow!("Play vars must be a mapping")),
    };

    let is_become = play_map
        .get("become")
        .map(parse_bool)
        .unwrap_or(false);

    let become_user = match play_map.get("become_user") {
        Some(Value::String(user)) => Some(user.clone()),
        _ => None,
    };

    debug!(
        "Finished parsing play '{}' with {} tasks, {} roles and {} handlers",
        name,
        pre_tasks.len() + tasks.len() + post_tasks.len(),
        roles.len(),
        handlers.len()
    );

    Ok(Play {
        name,
        hosts,
        roles,
        loaded_roles,
        pre_tasks,
        tasks,
        post_tasks,
        handlers,
        vars,
        is_become,
        become_user,
    })
}

pub(crate) fn parse_role_refs(value: Option<&Value>) -> Result<Vec<RoleRef>> {
    let seq = match value {
        Some(Value::Sequence(seq)) => seq,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(_) => return Err(anyhow!("Play roles must be a list")),
    };

    let mut roles = Vec::with_capacity(seq.len());
    for entry in seq {
        match entry {
            Value::String(name) => roles.push(RoleRef {
                name: name.clone(),
                params: Mapping::new(),
            }),
            Value::Mapping(map) => {
                let name = match map.get("role").or_else(|| map.get("name")) {
                    Some(Value::String(name)) => name.clone(),
                    _ => return Err(anyhow!("Role entry requires a 'role' or 'name' key")),
                };
                let mut params = map.clone();
                params.remove("role");
                params.remove("name");
                // Role params may be nested under vars as well.
                if let Some(Value::Mapping(vars)) = params.remove("vars") {
                    params.extend(vars);
                }
                roles.push(RoleRef { name, params });
            }
            other => return Err(anyhow!("Unsupported role entry: {:?}", other)),
        }
    }
    Ok(roles)
}

/// Parse a list of tasks, expanding `import_tasks`/`include_tasks` relative to `base_dir`.
pub fn parse_task_list(value: Option<&Value>, base_dir: &Path) -> Result<Vec<Task>> {
    let task_seq = match value {
        Some(Value::Sequence(seq)) => seq,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => return Err(anyhow!("Task list must be a sequence, got {:?}", other)),
    };

    let mut tasks = Vec::new();
    for (task_index, task_value) in task_seq.iter().enumerate() {
        match task_value {
            Value::Mapping(task_map) => {
                let include = task_map
                    .get("import_tasks")
                    .or_else(|| task_map.get("include_tasks"));
                if let Some(Value::String(file)) = include {
                    let path = base_dir.join(file);
                    debug!("Importing tasks from {}", path.display());
                    let included_dir = path.parent().unwrap_or(base_dir).to_path_buf();
                    let included = read_yaml(&path)?;
                    tasks.extend(parse_task_list(Some(&included), &included_dir)?);
                    continue;
                }

                let task = parse_task(task_map, task_index)
                    .with_context(|| format!("Failed to parse task at index {}", task_index))?;
                tasks.push(task);
            }
            _ => warn!("Skipping non-mapping task at index {}", task_index),
        }
    }
    Ok(tasks)
}

/// Parse a task from a YAML mapping
pub fn parse_task(task_map: &Mapping, index: usize) -> Result<Task> {
    debug!("Parsing task definition at index {}", index);

    let mut module = String::new();
    let mut args = Mapping::new();

    for (task_key, value) in task_map {
        let key_str = match task_key {
            Value::String(k) => k,
            _ => continue,
        };
        if TASK_KEYWORDS.contains(&key_str.as_str()) {
            continue;
        }

        module = MODULE_PREFIXES
            .iter()
            .find_map(|prefix| key_str.strip_prefix(prefix))
            .unwrap_or(key_str)
            .to_string();

        match value {
            Value::String(string_val) => {
                args = parse_shorthand_args(&module, string_val);
            }
            Value::Mapping(map_val) => {
                args = map_val.clone();
                if let Some(cmd) = args.remove("cmd") {
                    args.insert(key("_raw_params"), cmd);
                }
            }
            Value::Null => {}
            _ => {
                return Err(anyhow!(
                    "Unsupported value type for module '{}': {:?}",
                    module,
                    value
                ))
            }
        }

        // Only the first module key counts
        break;
    }

    if module.is_empty() {
        return Err(anyhow!("Task doesn't specify a module to execute"));
    }

    if let Some(Value::Mapping(extra)) = task_map.get("args") {
        for (k, v) in extra {
            args.insert(k.clone(), v.clone());
        }
    }

    let name = match task_map.get("name") {
        Some(Value::String(name)) => name.clone(),
        Some(_) => return Err(anyhow!("Task name must be a string")),
        None => module.clone(),
    };

    let is_become = task_map.get("become").map(parse_bool);
    let become_user = match task_map.get("become_user") {
        Some(Value::String(user)) => Some(user.clone()),
        _ => None,
    };

    let register = match task_map.get("register") {
        Some(Value::String(reg)) => Some(reg.clone()),
        _ => None,
    };

    let vars = match task_map.get("vars") {
        Some(Value::Mapping(vars)) => vars.clone(),
        _ => Mapping::new(),
    };

    let loop_items = task_map
        .get("loop")
        .or_else(|| task_map.get("with_items"))
        .cloned();

    let mut loop_var_name = None;
    let mut index_var_name = None;
    if let Some(Value::Mapping(lc_map)) = task_map.get("loop_control") {
        if let Some(Value::String(lv)) = lc_map.get("loop_var") {
            loop_var_name = Some(lv.clone());
        }
        if let Some(Value::String(iv)) = lc_map.get("index_var") {
            index_var_name = Some(iv.clone());
        }
    }

    debug!("Finished parsing task '{}' with module '{}'", name, module);

    Ok(Task {
        name,
        module,
        args,
        is_become,
        become_user,
        register,
        when: task_map.get("when").cloned(),
        changed_when: task_map.get("changed_when").cloned(),
        failed_when: task_map.get("failed_when").cloned(),
        notify: parse_string_or_list(task_map.get("notify")),
        ignore_errors: task_map
            .get("ignore_errors")
            .map(parse_bool)
            .unwrap_or(false),
        vars,
        loop_items,
        loop_var_name,
        index_var_name,
        role_path: None,
    })
}

/// Parse a handler from a YAML mapping (a task plus `listen`)
pub fn parse_handler(handler_map: &Mapping, index: usize) -> Result<Handler> {
    let task = parse_task(handler_map, index)?;
    let listen = parse_string_or_list(handler_map.get("listen"));
    Ok(Handler { task, listen })
}

/// `command`/`shell` take their string as the raw command, `debug` as `msg`;
/// everything else understands `key=value` pairs.
fn parse_shorthand_args(module: &str, raw: &str) -> Mapping {
    let mut args = Mapping::new();
    match module {
        "command" | "shell" => {
            args.insert(key("_raw_params"), Value::String(raw.to_string()));
        }
        _ => match parse_kv_args(raw) {
            Some(parsed) => args = parsed,
            None if module == "debug" => {
                args.insert(key("msg"), Value::String(raw.to_string()));
            }
            None => {
                args.insert(key("_raw_params"), Value::String(raw.to_string()));
            }
        },
    }
    args
}

/// Parse `key1=value1 key2=value2`; None when any word is not a pair.
pub fn parse_kv_args(args_str: &str) -> Option<Mapping> {
    let mut mapping = Mapping::new();
    for part in args_str.split_whitespace() {
        let (k, v) = part.split_once('=')?;
        if k.is_empty() {
            return None;
        }
        let parsed_value = if v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes") {
            Value::Bool(true)
        } else if v.eq_ignore_ascii_case("false") || v.eq_ignore_ascii_case("no") {
            Value::Bool(false)
        } else if let Some(num) = parse_int(v) {
            Value::Number(num.into())
        } else {
            Value::String(v.trim_matches(['"', '\'']).to_string())
        };
        mapping.insert(key(k), parsed_value);
    }
    if mapping.is_empty() {
        None
    } else {
        Some(mapping)
    }
}

/// Integers only; `0644` style values stay strings so file modes survive.
fn parse_int(v: &str) -> Option<i64> {
    if v.len() > 1 && v.starts_with('0') {
        return None;
    }
    v.parse().ok()
}

pub(crate) fn parse_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.to_lowercase().as_str(), "yes" | "true" | "on" | "1"),
        Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        _ => false,
    }
}

fn parse_string_or_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
