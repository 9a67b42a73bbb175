use anyhow::Result;
use log::{info, warn};
use serde_yaml::Mapping;
use std::path::{Path, PathBuf};

use crate::modules::param::get_string_param;
use crate::modules::{ModuleContext, ModuleExecutor, ModuleResult};

pub struct CommandModule;

impl ModuleExecutor for CommandModule {
    fn execute(args: &Mapping, ctx: &ModuleContext) -> Result<ModuleResult> {
        let command_str = Self::extract_command_arg(args)?;
        run_guarded(&command_str, args, ctx, "Command executed successfully", "Command failed")
    }
}

/// Shared by `command` and `shell`: honours `chdir`, `creates`, `removes`
/// and check mode before running anything.
pub(crate) fn run_guarded(
    command_str: &str,
    args: &Mapping,
    ctx: &ModuleContext,
    success_msg: &str,
    error_prefix: &str,
) -> Result<ModuleResult> {
    let chdir = get_string_param(args, "chdir").map(PathBuf::from);
    let resolve = |p: &str| -> PathBuf {
        match &chdir {
            Some(dir) if Path::new(p).is_relative() => dir.join(p),
            _ => PathBuf::from(p),
        }
    };

    if let Some(creates) = get_string_param(args, "creates") {
        if resolve(&creates).exists() {
            return Ok(ModuleResult::skipped(format!("skipped, since {} exists", creates)));
        }
    }
    if let Some(removes) = get_string_param(args, "removes") {
        if !resolve(&removes).exists() {
            return Ok(ModuleResult::skipped(format!("skipped, since {} does not exist", removes)));
        }
    }

    if ctx.check_mode {
        info!("Check mode: not running '{}'", command_str);
        return Ok(ModuleResult::skipped("skipped, running in check mode"));
    }

    info!("Executing command: {}", command_str);
    let (exit_code, stdout, stderr) =
        CommandModule::execute_command(command_str, chdir.as_deref(), ctx)?;

    if !stderr.trim().is_empty() {
        warn!("Command stderr: {}", stderr.trim());
    }

    Ok(CommandModule::process_command_result(
        exit_code,
        stdout,
        stderr,
        success_msg,
        error_prefix,
    ))
}
