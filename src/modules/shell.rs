use anyhow::Result;
use serde_yaml::Mapping;

use crate::modules::command::run_guarded;
use crate::modules::local::shell_quote;
use crate::modules::param::get_string_param;
use crate::modules::{ModuleContext, ModuleExecutor, ModuleResult};

pub struct ShellModule;

impl ModuleExecutor for ShellModule {
    fn execute(args: &Mapping, ctx: &ModuleContext) -> Result<ModuleResult> {
        let shell_command = Self::extract_command_arg(args)?;

        // `executable: /bin/bash` swaps the interpreter under the outer `sh -c`.
        let command_line = match get_string_param(args, "executable") {
            Some(exe) => format!("{} -c {}", shell_quote(&exe), shell_quote(&shell_command)),
            None => shell_command,
        };

        run_guarded(
            &command_line,
            args,
            ctx,
            "Shell command executed successfully",
            "Shell command failed",
        )
    }
}
