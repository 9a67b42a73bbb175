use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::modules::file::{apply_attributes, make_dir};
use crate::modules::local::{become_command, run};
use crate::modules::param::{get_bool_param, get_string_param, value_to_string};
use crate::modules::{ModuleContext, ModuleExecutor, ModuleResult};

pub struct CopyModule;

impl ModuleExecutor for CopyModule {
    fn execute(args: &Mapping, ctx: &ModuleContext) -> Result<ModuleResult> {
        let dest = get_string_param(args, "dest")
            .ok_or_else(|| anyhow!("Missing required parameter: dest"))?;
        let force = get_bool_param(args, "force", true);

        let (dest_path, changed) = if let Some(content) = args.get("content") {
            let text = match content {
                Value::String(s) => s.clone(),
                Value::Mapping(_) | Value::Sequence(_) => serde_json::to_string(content)?,
                other => value_to_string(other),
            };
            let dest_path = PathBuf::from(&dest);
            if dest.ends_with('/') || dest_path.is_dir() {
                return Ok(ModuleResult::failed(
                    "can not use content with a dir as dest",
                ));
            }
            let changed = write_guarded(&dest_path, text.as_bytes(), force, ctx)?;
            (dest_path, changed)
        } else {
            let src = get_string_param(args, "src")
                .ok_or_else(|| anyhow!("src (or content) is required"))?;
            let src_path = match ctx.find_file("files", &src) {
                Some(path) => path,
                None => return Ok(ModuleResult::failed(format!("Could not find or access '{}'", src))),
            };
            info!("Copying {} to {}", src_path.display(), dest);

            if src_path.is_dir() {
                let target = if src.ends_with('/') {
                    PathBuf::from(&dest)
                } else {
                    Path::new(&dest).join(file_name(&src_path)?)
                };
                let changed = copy_tree(&src_path, &target, force, ctx)?;
                (target, changed)
            } else {
                let dest_path = if dest.ends_with('/') || Path::new(&dest).is_dir() {
                    Path::new(&dest).join(file_name(&src_path)?)
                } else {
                    PathBuf::from(&dest)
                };
                let bytes = fs::read(&src_path)
                    .with_context(|| format!("Failed to read source file: {}", src_path.display()))?;
                let changed = write_guarded(&dest_path, &bytes, force, ctx)?;
                (dest_path, changed)
            }
        };

        let changed = changed | (dest_path.exists() && apply_attributes(&dest_path, args, ctx)?);

        let mut result = if changed {
            ModuleResult::changed(format!("Copied to {}", dest_path.display()))
        } else {
            ModuleResult::ok(format!("{} is up to date", dest_path.display()))
        };
        result.data.insert(
            Value::String("dest".into()),
            Value::String(dest_path.display().to_string()),
        );
        Ok(result)
    }
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| anyhow!("Cannot determine file name of {}", path.display()))
}

/// With `force: no` an existing destination is left alone.
fn write_guarded(dest: &Path, bytes: &[u8], force: bool, ctx: &ModuleContext) -> Result<bool> {
    if !force && dest.exists() {
        debug!("{} exists and force=no, leaving it", dest.display());
        return Ok(false);
    }
    write_content(dest, bytes, ctx)
}

/// Write `bytes` to `dest` if its content differs. Returns whether it changed.
pub(crate) fn write_content(dest: &Path, bytes: &[u8], ctx: &ModuleContext) -> Result<bool> {
    if let Ok(existing) = fs::read(dest) {
        if existing == bytes {
            return Ok(false);
        }
    }
    if ctx.check_mode {
        return Ok(true);
    }

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty() && !p.exists()) {
        make_dir(parent, ctx)?;
    }

    if ctx.become_enabled {
        // Stage the content as the invoking user, then copy it into place as the target user.
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(bytes)?;
        staged.flush()?;
        let staged_path = staged.path().to_string_lossy().into_owned();
        let dest_arg = dest.to_string_lossy().into_owned();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o644))?;
        }
        let (code, _, stderr) =
            run(&mut become_command("cp", &[staged_path.as_str(), dest_arg.as_str()], ctx), None)?;
        if code != 0 {
            return Err(anyhow!("Failed to write {}: {}", dest.display(), stderr.trim()));
        }
    } else {
        fs::write(dest, bytes).with_context(|| format!("Failed to write {}", dest.display()))?;
    }
    info!("Wrote {} bytes to {}", bytes.len(), dest.display());
    Ok(true)
}

fn copy_tree(src: &Path, dest: &Path, force: bool, ctx: &ModuleContext) -> Result<bool> {
    let mut changed = false;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            if !target.is_dir() {
                make_dir(&target, ctx)?;
                changed = true;
            }
        } else {
            let bytes = fs::read(entry.path())?;
            changed |= write_guarded(&target, &bytes, force, ctx)?;
        }
    }
    Ok(changed)
}
