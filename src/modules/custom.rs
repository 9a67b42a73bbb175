//! Modules shipped next to the playbook as executables.
//!
//! The executable gets one argument, the path of a JSON file holding the task
//! arguments, and must print a JSON object on stdout.

use anyhow::Result;
use log::{debug, info, warn};
use serde_json::{Map as JsonMap, Value as JsonValue};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::modules::local::{become_command, run};
use crate::modules::{ModuleContext, ModuleResult};

/// Locate an executable module: `<module_path>/library/<name>`,
/// `<module_path>/<name>`, then each role's `library/<name>`.
pub fn find_module(name: &str, module_path: &Path, role_paths: &[&Path]) -> Option<PathBuf> {
    if name.is_empty() || name.contains('/') {
        return None;
    }
    let mut candidates = vec![module_path.join("library").join(name), module_path.join(name)];
    candidates.extend(role_paths.iter().map(|role| role.join("library").join(name)));
    candidates.into_iter().find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

pub fn execute(name: &str, path: &Path, args: &Mapping, ctx: &ModuleContext) -> Result<ModuleResult> {
    let mut payload: JsonMap<String, JsonValue> = match serde_json::to_value(args)? {
        JsonValue::Object(map) => map,
        _ => JsonMap::new(),
    };
    payload.insert("_ansible_check_mode".into(), JsonValue::Bool(ctx.check_mode));
    payload.insert("_ansible_verbosity".into(), JsonValue::from(ctx.verbosity));

    let args_file = write_args_file(&payload, ctx)?;

    let exe = path.to_string_lossy().into_owned();
    let args_path = args_file.path().to_string_lossy().into_owned();
    info!("Running custom module {} ({})", name, exe);
    let (code, stdout, stderr) = run(&mut become_command(&exe, &[args_path.as_str()], ctx), None)?;
    debug!("Custom module {} exited with {}: {}", name, code, stdout.trim());
    if !stderr.trim().is_empty() {
        warn!("Custom module {} stderr: {}", name, stderr.trim());
    }

    let output = stdout.trim();
    match serde_json::from_str::<JsonValue>(output) {
        Ok(JsonValue::Object(map)) => Ok(module_result(map, code, stderr)),
        Ok(_) => Err(Error::ModuleOutput {
            module: name.to_string(),
            message: "output is not a JSON object".to_string(),
        }
        .into()),
        Err(_) if code != 0 => Ok(ModuleResult {
            rc: Some(code),
            failed: true,
            msg: format!("Module {} failed (exit code: {}): {}", name, code, stderr.trim()),
            stdout,
            stderr,
            ..Default::default()
        }),
        Err(e) => Err(Error::ModuleOutput {
            module: name.to_string(),
            message: e.to_string(),
        }
        .into()),
    }
}

/// Write the JSON arguments to a temporary file. When becoming another user
/// the file is made world readable, as the module runs as that user.
fn write_args_file(payload: &JsonMap<String, JsonValue>, ctx: &ModuleContext) -> Result<NamedTempFile> {
    let mut args_file = tempfile::Builder::new().prefix("rustsible-args-").tempfile()?;
    serde_json::to_writer(&mut args_file, payload)?;
    args_file.flush()?;
    #[cfg(unix)]
    if ctx.become_enabled {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(args_file.path(), fs::Permissions::from_mode(0o644))?;
    }
    Ok(args_file)
}

fn module_result(map: JsonMap<String, JsonValue>, code: i32, stderr: String) -> ModuleResult {
    let mut result = ModuleResult {
        rc: Some(code),
        failed: code != 0,
        stderr,
        ..Default::default()
    };

    for (key, value) in map {
        match (key.as_str(), &value) {
            ("changed", v) => result.changed = json_truthy(v),
            ("failed", v) => result.failed = json_truthy(v),
            ("skipped", v) => result.skipped = json_truthy(v),
            ("msg", JsonValue::String(s)) => result.msg = s.clone(),
            ("rc", JsonValue::Number(n)) => result.rc = n.as_i64().map(|n| n as i32),
            ("stdout", JsonValue::String(s)) => result.stdout = s.clone(),
            ("stderr", JsonValue::String(s)) => result.stderr = s.clone(),
            ("ansible_facts", JsonValue::Object(_)) => {
                if let Ok(Value::Mapping(facts)) = serde_yaml::to_value(&value) {
                    result.facts = facts;
                }
            }
            _ => {
                if let Ok(v) = serde_yaml::to_value(&value) {
                    result.data.insert(Value::String(key.clone()), v);
                }
            }
        }
    }
    result
}

fn json_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::String(s) => matches!(s.to_lowercase().as_str(), "true" | "yes" | "1"),
        JsonValue::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{module_context, write_file};
    use std::collections::HashMap;

    #[cfg(unix)]
    fn write_module(dir: &Path, rel: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = write_file(dir, rel, body);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_args_file_readable_when_becoming() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::new();
        let mut ctx = module_context(dir.path(), &vars);
        let mut payload = JsonMap::new();
        payload.insert("name".into(), JsonValue::from("world"));

        let mode = |f: &NamedTempFile| f.path().metadata().unwrap().permissions().mode() & 0o777;
        let private = write_args_file(&payload, &ctx).unwrap();
        assert_eq!(mode(&private), 0o600);

        ctx.become_enabled = true;
        ctx.become_user = "deploy".to_string();
        let shared = write_args_file(&payload, &ctx).unwrap();
        assert_eq!(mode(&shared), 0o644);
        assert_eq!(std::fs::read_to_string(shared.path()).unwrap(), r#"{"name":"world"}"#);
    }

    #[cfg(unix)]
    #[test]
    fn test_find_module_search_order() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "greet", "#!/bin/sh\n");
        write_module(dir.path(), "library/greet", "#!/bin/sh\n");
        write_file(dir.path(), "library/not_exec", "#!/bin/sh\n");

        assert_eq!(find_module("greet", dir.path(), &[]), Some(dir.path().join("library/greet")));
        assert_eq!(find_module("not_exec", dir.path(), &[]), None);

        let role = dir.path().join("roles/app");
        write_module(&role, "library/role_mod", "#!/bin/sh\n");
        assert_eq!(
            find_module("role_mod", dir.path(), &[role.as_path()]),
            Some(role.join("library/role_mod"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_parses_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let module = write_module(
            dir.path(),
            "library/greet",
            r#"#!/bin/sh
if grep -q '"name":"world"' "$1"; then name=world; else name=unknown; fi
echo '{"changed": true, "msg": "hello '$name'", "ansible_facts": {"greeted": "'$name'"}, "extra": 1}'
"#,
        );
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);
        let args: Mapping = serde_yaml::from_str("{name: world}").unwrap();

        let result = execute("greet", &module, &args, &ctx).unwrap();
        assert!(result.changed);
        assert!(!result.failed);
        assert_eq!(result.msg, "hello world");
        assert_eq!(result.facts.get("greeted"), Some(&Value::String("world".into())));
        assert_eq!(result.data.get("extra"), Some(&Value::Number(1.into())));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_bad_output() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = write_module(dir.path(), "garbage", "#!/bin/sh\necho not json\n");
        let crash = write_module(dir.path(), "crash", "#!/bin/sh\necho boom >&2\nexit 4\n");
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);

        let err = execute("garbage", &garbage, &Mapping::new(), &ctx).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ModuleOutput { .. })));

        let result = execute("crash", &crash, &Mapping::new(), &ctx).unwrap();
        assert!(result.failed);
        assert_eq!(result.rc, Some(4));
    }
}
