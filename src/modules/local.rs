use anyhow::{anyhow, Result};
use log::debug;
use std::path::Path;
use std::process::Command;

use crate::modules::ModuleContext;
use crate::options::BecomeMethod;

/// Build the process for `program args...`, wrapped in `sudo`/`su` when the
/// task escalates privileges.
pub fn become_command(program: &str, args: &[&str], ctx: &ModuleContext) -> Command {
    if !ctx.become_enabled {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return cmd;
    }

    match ctx.become_method {
        BecomeMethod::Sudo => {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "-H", "-u", &ctx.become_user, "--", program]);
            cmd.args(args);
            cmd
        }
        BecomeMethod::Su => {
            let line = std::iter::once(program)
                .chain(args.iter().copied())
                .map(shell_quote)
                .collect::<Vec<_>>()
                .join(" ");
            let mut cmd = Command::new("su");
            cmd.args([ctx.become_user.as_str(), "-c", &line]);
            cmd
        }
    }
}

/// Quote a word for `sh`.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\\''"))
}

/// Run a shell command line locally through `sh -c`.
pub fn execute_local_command(
    command: &str,
    chdir: Option<&Path>,
    ctx: &ModuleContext,
) -> Result<(i32, String, String)> {
    debug!("Executing local command: {}", command);
    let mut process = become_command("sh", &["-c", command], ctx);
    run(&mut process, chdir)
}

/// Run an already-built process, capturing its output.
pub fn run(process: &mut Command, chdir: Option<&Path>) -> Result<(i32, String, String)> {
    if let Some(dir) = chdir {
        process.current_dir(dir);
    }
    let output = process
        .output()
        .map_err(|e| anyhow!("Failed to execute {:?}: {}", process.get_program(), e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Ok((output.status.code().unwrap_or(1), stdout, stderr))
}
