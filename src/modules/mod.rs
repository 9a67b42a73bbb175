pub mod command;
pub mod copy;
pub mod custom;
pub mod debug;
pub mod file;
pub mod local;
pub mod param;
pub mod set_fact;
pub mod shell;
pub mod template;

use anyhow::{anyhow, Result};
use log::{debug, info};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::options::BecomeMethod;

/// Modules implemented inside this crate.
pub const BUILTIN_MODULES: &[&str] = &[
    "command", "shell", "debug", "set_fact", "file", "copy", "template",
];

/// Result structure for unified handling of module returns
#[derive(Debug, Default, Clone)]
pub struct ModuleResult {
    pub stdout: String,
    pub stderr: String,
    pub rc: Option<i32>,
    pub changed: bool,
    pub failed: bool,
    pub skipped: bool,
    pub msg: String,
    /// Facts to add to the host's variables (`set_fact`, `ansible_facts`).
    pub facts: Mapping,
    /// Other return values, exposed through `register`.
    pub data: Mapping,
}

impl ModuleResult {
    pub fn ok(msg: impl Into<String>) -> Self {
        ModuleResult {
            msg: msg.into(),
            ..Default::default()
        }
    }

    pub fn changed(msg: impl Into<String>) -> Self {
        ModuleResult {
            changed: true,
            msg: msg.into(),
            ..Default::default()
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        ModuleResult {
            failed: true,
            msg: msg.into(),
            ..Default::default()
        }
    }

    pub fn skipped(msg: impl Into<String>) -> Self {
        ModuleResult {
            skipped: true,
            msg: msg.into(),
            ..Default::default()
        }
    }
}

/// Everything a module needs to know about the invocation besides its arguments.
#[derive(Debug, Clone)]
pub struct ModuleContext<'a> {
    pub check_mode: bool,
    pub become_enabled: bool,
    pub become_method: BecomeMethod,
    pub become_user: String,
    pub verbosity: u8,
    pub module_path: PathBuf,
    pub playbook_dir: PathBuf,
    pub role_path: Option<PathBuf>,
    pub vars: &'a HashMap<String, Value>,
}

impl ModuleContext<'_> {
    /// Find a file a task refers to: absolute, or under `<role>/<subdir>`,
    /// `<playbook_dir>/<subdir>` or the playbook directory itself.
    pub fn find_file(&self, subdir: &str, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }

        let mut candidates = Vec::new();
        if let Some(role) = &self.role_path {
            candidates.push(role.join(subdir).join(name));
            candidates.push(role.join(name));
        }
        candidates.push(self.playbook_dir.join(subdir).join(name));
        candidates.push(self.playbook_dir.join(name));

        candidates.into_iter().find(|p| p.exists())
    }
}

/// Common module execution patterns.
pub trait ModuleExecutor {
    fn execute(args: &Mapping, ctx: &ModuleContext) -> Result<ModuleResult>;

    /// Run a command through `sh -c`, escalating privileges when asked.
    fn execute_command(cmd: &str, chdir: Option<&Path>, ctx: &ModuleContext) -> Result<(i32, String, String)> {
        info!("Executing command: {}", cmd);
        local::execute_local_command(cmd, chdir, ctx)
    }

    /// Turn a command's exit status into a result; non-zero exit fails the task.
    /// Trailing newlines are stripped from the captured output.
    fn process_command_result(
        exit_code: i32,
        stdout: String,
        stderr: String,
        success_msg: &str,
        error_prefix: &str,
    ) -> ModuleResult {
        let failed = exit_code != 0;
        let msg = if !failed {
            success_msg.to_string()
        } else if stderr.trim().is_empty() {
            format!("{} (exit code: {})", error_prefix, exit_code)
        } else {
            format!("{} (exit code: {}): {}", error_prefix, exit_code, stderr.trim())
        };

        ModuleResult {
            stdout: stdout.trim_end_matches(['\r', '\n']).to_string(),
            stderr: stderr.trim_end_matches(['\r', '\n']).to_string(),
            rc: Some(exit_code),
            changed: true,
            failed,
            msg,
            ..Default::default()
        }
    }

    /// The raw command of a `command`/`shell` task (`_raw_params`, or `cmd`).
    fn extract_command_arg(args: &Mapping) -> Result<String> {
        match args.get("_raw_params").or_else(|| args.get("cmd")) {
            Some(Value::String(cmd)) if !cmd.trim().is_empty() => Ok(cmd.clone()),
            Some(Value::Sequence(argv)) => Ok(argv
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => param::value_to_string(other),
                })
                .collect::<Vec<_>>()
                .join(" ")),
            _ => Err(anyhow!("Module requires a valid command string")),
        }
    }
}

/// Whether `name` can be run: a builtin, or an executable found on the module path.
pub fn module_exists(name: &str, module_path: &Path, role_paths: &[&Path]) -> bool {
    BUILTIN_MODULES.contains(&name) || custom::find_module(name, module_path, role_paths).is_some()
}

/// Dispatch a module by name.
pub fn run_module(name: &str, args: &Mapping, ctx: &ModuleContext) -> Result<ModuleResult> {
    debug!("Running module '{}' with args: {:?}", name, args);
    match name {
        "command" => command::CommandModule::execute(args, ctx),
        "shell" => shell::ShellModule::execute(args, ctx),
        "debug" => debug::DebugModule::execute(args, ctx),
        "set_fact" => set_fact::SetFactModule::execute(args, ctx),
        "file" => file::FileModule::execute(args, ctx),
        "copy" => copy::CopyModule::execute(args, ctx),
        "template" => template::TemplateModule::execute(args, ctx),
        other => {
            let role_paths: Vec<&Path> = ctx.role_path.iter().map(PathBuf::as_path).collect();
            match custom::find_module(other, &ctx.module_path, &role_paths) {
                Some(path) => custom::execute(other, &path, args, ctx),
                None => Err(Error::ModuleNotFound(other.to_string()).into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{module_context, write_file};

    struct Probe;
    impl ModuleExecutor for Probe {
        fn execute(_args: &Mapping, _ctx: &ModuleContext) -> Result<ModuleResult> {
            Ok(ModuleResult::ok("probe"))
        }
    }

    #[test]
    fn test_module_result_default() {
        let result = ModuleResult::default();
        assert_eq!(result.stdout, "");
        assert!(!result.changed);
        assert!(!result.failed);
        assert!(result.rc.is_none());
    }

    #[test]
    fn test_process_command_result() {
        let ok = Probe::process_command_result(0, "out".into(), String::new(), "done", "boom");
        assert!(ok.changed && !ok.failed);
        assert_eq!(ok.rc, Some(0));

        let failed = Probe::process_command_result(2, String::new(), "bad thing\n".into(), "done", "boom");
        assert!(failed.failed);
        assert_eq!(failed.msg, "boom (exit code: 2): bad thing");
    }

    #[test]
    fn test_extract_command_arg() {
        let mut args = Mapping::new();
        args.insert(Value::String("cmd".into()), Value::String("echo 'hello world'".into()));
        assert_eq!(Probe::extract_command_arg(&args).unwrap(), "echo 'hello world'");

        args.insert(
            Value::String("_raw_params".into()),
            serde_yaml::from_str("[echo, hi]").unwrap(),
        );
        assert_eq!(Probe::extract_command_arg(&args).unwrap(), "echo hi");

        assert!(Probe::extract_command_arg(&Mapping::new()).is_err());
    }

    #[test]
    fn test_unknown_module() {
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);
        let err = run_module("no_such_module", &Mapping::new(), &ctx).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ModuleNotFound(name)) if name == "no_such_module"));
        assert!(!module_exists("no_such_module", dir.path(), &[]));
        assert!(module_exists("copy", dir.path(), &[]));
    }

    #[test]
    fn test_find_file_prefers_role() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "files/app.conf", "play");
        write_file(dir.path(), "roles/web/files/app.conf", "role");
        let vars = HashMap::new();
        let mut ctx = module_context(dir.path(), &vars);
        assert_eq!(ctx.find_file("files", "app.conf"), Some(dir.path().join("files/app.conf")));

        ctx.role_path = Some(dir.path().join("roles/web"));
        assert_eq!(
            ctx.find_file("files", "app.conf"),
            Some(dir.path().join("roles/web/files/app.conf"))
        );
        assert_eq!(ctx.find_file("files", "missing.conf"), None);
    }
}
