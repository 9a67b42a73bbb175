use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;

use crate::modules::local::{become_command, run};
use crate::modules::param::{get_bool_param, get_string_param};
use crate::modules::{ModuleContext, ModuleExecutor, ModuleResult};

#[derive(Debug, PartialEq)]
enum FileState {
    File,
    Directory,
    Link,
    Absent,
    Touch,
}

impl FileState {
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "file" => Ok(FileState::File),
            "directory" | "dir" => Ok(FileState::Directory),
            "link" => Ok(FileState::Link),
            "absent" => Ok(FileState::Absent),
            "touch" => Ok(FileState::Touch),
            _ => Err(anyhow!("Invalid file state: {}", s)),
        }
    }

    /// State of what is on disk now, used when `state` is omitted.
    fn current(path: &Path) -> Self {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => FileState::Link,
            Ok(meta) if meta.is_dir() => FileState::Directory,
            _ => FileState::File,
        }
    }
}

pub struct FileModule;

impl ModuleExecutor for FileModule {
    /// Create/remove/touch/link files and directories and set their attributes.
    fn execute(args: &Mapping, ctx: &ModuleContext) -> Result<ModuleResult> {
        let path_str = get_string_param(args, "path")
            .or_else(|| get_string_param(args, "dest"))
            .or_else(|| get_string_param(args, "name"))
            .ok_or_else(|| anyhow!("Missing required parameter: path"))?;
        let path = Path::new(&path_str);

        let state = match get_string_param(args, "state") {
            Some(s) => FileState::from_str(&s)?,
            None => FileState::current(path),
        };
        let exists = fs::symlink_metadata(path).is_ok();
        debug!("file: path={} state={:?} exists={}", path_str, state, exists);

        let mut changed = match state {
            FileState::Absent => {
                if exists {
                    remove_path(path, ctx)?;
                }
                exists
            }
            FileState::Directory => {
                if exists && !path.is_dir() {
                    return Ok(ModuleResult::failed(format!(
                        "{} exists and is not a directory",
                        path_str
                    )));
                }
                if !exists {
                    make_dir(path, ctx)?;
                }
                !exists
            }
            FileState::Touch => {
                touch(path, ctx)?;
                true
            }
            FileState::File => {
                if !exists {
                    return Ok(ModuleResult::failed(format!(
                        "file ({}) is absent, cannot continue",
                        path_str
                    )));
                }
                false
            }
            FileState::Link => {
                let src = get_string_param(args, "src")
                    .ok_or_else(|| anyhow!("src is required for state=link"))?;
                let force = get_bool_param(args, "force", false);
                make_link(&src, path, force, ctx)?
            }
        };

        if state != FileState::Absent && state != FileState::Link {
            changed |= apply_attributes(path, args, ctx)?;
        }

        let state_str = match state {
            FileState::File => "file",
            FileState::Directory => "directory",
            FileState::Link => "link",
            FileState::Absent => "absent",
            FileState::Touch => "touch",
        };
        info!("File {} is now {} (changed={})", path_str, state_str, changed);

        let mut result = if changed {
            ModuleResult::changed(format!("File {} state changed to {}", path_str, state_str))
        } else {
            ModuleResult::ok(format!("File {} already {}", path_str, state_str))
        };
        result.data.insert(Value::String("path".into()), Value::String(path_str.clone()));
        result.data.insert(Value::String("state".into()), Value::String(state_str.into()));
        Ok(result)
    }
}

/// Parse an octal mode (`0644`, `644`, `0o755`).
pub fn parse_mode(mode: &str) -> Result<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| anyhow!("Unsupported file mode '{}': only octal modes are supported", mode))
}

/// Apply `mode`, `owner` and `group`. Returns whether anything changed.
pub fn apply_attributes(path: &Path, args: &Mapping, ctx: &ModuleContext) -> Result<bool> {
    let mut changed = false;

    if let Some(mode_str) = get_string_param(args, "mode") {
        let mode = parse_mode(&mode_str)?;
        changed |= apply_mode(path, mode, ctx)?;
    }

    let owner = get_string_param(args, "owner");
    let group = get_string_param(args, "group");
    if owner.is_some() || group.is_some() {
        changed |= apply_ownership(path, owner.as_deref(), group.as_deref(), ctx)?;
    }
    Ok(changed)
}

#[cfg(unix)]
fn current_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn current_mode(_path: &Path) -> Option<u32> {
    None
}

fn apply_mode(path: &Path, mode: u32, ctx: &ModuleContext) -> Result<bool> {
    if current_mode(path) == Some(mode) {
        return Ok(false);
    }
    if ctx.check_mode {
        return Ok(true);
    }
    info!("Set file mode: {} -> {:o}", path.display(), mode);
    if ctx.become_enabled {
        let mode_arg = format!("{:o}", mode);
        run_checked("chmod", &[mode_arg.as_str(), path.to_string_lossy().as_ref()], ctx)?;
    } else {
        set_mode(path, mode)?;
    }
    Ok(true)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set mode on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, _mode: u32) -> Result<()> {
    Err(anyhow!("Setting a file mode is not supported here: {}", path.display()))
}

fn apply_ownership(path: &Path, owner: Option<&str>, group: Option<&str>, ctx: &ModuleContext) -> Result<bool> {
    let path_arg = path.to_string_lossy();
    let (code, stdout, _) = run(&mut become_command("stat", &["-c", "%U:%G", path_arg.as_ref()], ctx), None)?;
    if code == 0 {
        let mut parts = stdout.trim().splitn(2, ':');
        let (cur_owner, cur_group) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
        if owner.map_or(true, |o| o == cur_owner) && group.map_or(true, |g| g == cur_group) {
            return Ok(false);
        }
    }
    if ctx.check_mode {
        return Ok(true);
    }

    let ownership = match (owner, group) {
        (Some(o), Some(g)) => format!("{}:{}", o, g),
        (Some(o), None) => o.to_string(),
        (None, Some(g)) => format!(":{}", g),
        (None, None) => return Ok(false),
    };
    run_checked("chown", &[ownership.as_str(), path_arg.as_ref()], ctx)?;
    info!("Set file ownership: {} -> {}", path.display(), ownership);
    Ok(true)
}

/// Create a directory and its parents.
pub fn make_dir(path: &Path, ctx: &ModuleContext) -> Result<()> {
    if ctx.check_mode {
        return Ok(());
    }
    info!("Creating directory: {}", path.display());
    if ctx.become_enabled {
        run_checked("mkdir", &["-p", path.to_string_lossy().as_ref()], ctx)
    } else {
        fs::create_dir_all(path).with_context(|| format!("Failed to create directory {}", path.display()))
    }
}

fn remove_path(path: &Path, ctx: &ModuleContext) -> Result<()> {
    if ctx.check_mode {
        return Ok(());
    }
    info!("Removing file/directory: {}", path.display());
    if ctx.become_enabled {
        return run_checked("rm", &["-rf", path.to_string_lossy().as_ref()], ctx);
    }
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("Failed to remove {}", path.display()))
}

fn touch(path: &Path, ctx: &ModuleContext) -> Result<()> {
    if ctx.check_mode {
        return Ok(());
    }
    info!("Touching file: {}", path.display());
    if ctx.become_enabled {
        return run_checked("touch", &[path.to_string_lossy().as_ref()], ctx);
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to touch {}", path.display()))?;
    file.set_modified(std::time::SystemTime::now())?;
    Ok(())
}

fn make_link(src: &str, path: &Path, force: bool, ctx: &ModuleContext) -> Result<bool> {
    if let Ok(target) = fs::read_link(path) {
        if target == Path::new(src) {
            return Ok(false);
        }
    } else if path.exists() && !force {
        return Err(anyhow!(
            "{} exists and is not a link; use force=yes to replace it",
            path.display()
        ));
    }
    if ctx.check_mode {
        return Ok(true);
    }
    info!("Creating symlink: {} -> {}", path.display(), src);
    run_checked("ln", &["-sfn", src, path.to_string_lossy().as_ref()], ctx)?;
    Ok(true)
}

fn run_checked(program: &str, args: &[&str], ctx: &ModuleContext) -> Result<()> {
    let (code, _, stderr) = run(&mut become_command(program, args, ctx), None)?;
    if code != 0 {
        return Err(anyhow!("{} failed (exit code {}): {}", program, code, stderr.trim()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{module_context, write_file};
    use std::collections::HashMap;

    fn args(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);
        let target = dir.path().join("a/b");
        let a = args(&format!("{{path: '{}', state: directory}}", target.display()));

        assert!(FileModule::execute(&a, &ctx).unwrap().changed);
        assert!(target.is_dir());
        assert!(!FileModule::execute(&a, &ctx).unwrap().changed);
    }

    #[test]
    fn test_absent_and_touch() {
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);
        let target = dir.path().join("f.txt");

        let touch = args(&format!("{{path: '{}', state: touch}}", target.display()));
        assert!(FileModule::execute(&touch, &ctx).unwrap().changed);
        assert!(target.is_file());

        let absent = args(&format!("{{path: '{}', state: absent}}", target.display()));
        assert!(FileModule::execute(&absent, &ctx).unwrap().changed);
        assert!(!target.exists());
        assert!(!FileModule::execute(&absent, &ctx).unwrap().changed);
    }

    #[test]
    fn test_file_state_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);
        let missing = args(&format!("{{path: '{}/nope', state: file}}", dir.path().display()));
        assert!(FileModule::execute(&missing, &ctx).unwrap().failed);
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_applied_once() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "script.sh", "echo hi\n");
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);
        let a = args(&format!("{{path: '{}', mode: '0750'}}", path.display()));

        assert!(FileModule::execute(&a, &ctx).unwrap().changed);
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o7777, 0o750);
        assert!(!FileModule::execute(&a, &ctx).unwrap().changed);
    }

    #[cfg(unix)]
    #[test]
    fn test_link() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "real.txt", "x");
        let link = dir.path().join("link.txt");
        let vars = HashMap::new();
        let ctx = module_context(dir.path(), &vars);
        let a = args(&format!(
            "{{path: '{}', src: '{}', state: link}}",
            link.display(),
            src.display()
        ));

        assert!(FileModule::execute(&a, &ctx).unwrap().changed);
        assert_eq!(fs::read_link(&link).unwrap(), src);
        assert!(!FileModule::execute(&a, &ctx).unwrap().changed);
    }

    #[test]
    fn test_check_mode_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let vars = HashMap::new();
        let mut ctx = module_context(dir.path(), &vars);
        ctx.check_mode = true;
        let target = dir.path().join("new_dir");
        let a = args(&format!("{{path: '{}', state: directory}}", target.display()));
        assert!(FileModule::execute(&a, &ctx).unwrap().changed);
        assert!(!target.exists());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0o600").unwrap(), 0o600);
        assert!(parse_mode("u+x").is_err());
        assert!(parse_mode("99999").is_err());
    }
}
