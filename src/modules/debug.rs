use anyhow::{anyhow, Result};
use log::{debug, info};
use serde_yaml::{Mapping, Value};

use crate::modules::param::get_optional_param;
use crate::modules::{ModuleContext, ModuleExecutor, ModuleResult};
use crate::playbook::templar;

const UNDEFINED_MARKER: &str = "VARIABLE IS NOT DEFINED!";

pub struct DebugModule;

impl ModuleExecutor for DebugModule {
    /// Outputs the given debug message or variable value.
    ///
    /// The printed value goes into `data` under `msg` or the variable name,
    /// which is what the callback shows.
    fn execute(args: &Mapping, ctx: &ModuleContext) -> Result<ModuleResult> {
        debug!("Debug module args: {:?}", args);

        let threshold = get_optional_param::<u8>(args, "verbosity").unwrap_or(0);
        if ctx.verbosity < threshold {
            return Ok(ModuleResult::skipped(format!(
                "verbosity threshold not met ({} < {})",
                ctx.verbosity, threshold
            )));
        }

        let mut result = ModuleResult::default();

        if let Some(msg) = args.get("msg") {
            let text = format_value(msg);
            info!("Debug message: {}", text);
            result.msg = text;
            result.data.insert(Value::String("msg".into()), msg.clone());
            return Ok(result);
        }

        if let Some(var) = args.get("var") {
            let var_name = match var {
                Value::String(s) => s.trim().to_string(),
                other => return Err(anyhow!("Invalid value type for 'var' parameter: {:?}", other)),
            };
            let value = lookup_var(&var_name, ctx);
            let text = format_value(&value);
            info!("Debug var '{}': {}", var_name, text);
            result.msg = format!("{} = {}", var_name, text);
            result.data.insert(Value::String(var_name), value);
            return Ok(result);
        }

        result.msg = "Hello world!".to_string();
        result
            .data
            .insert(Value::String("msg".into()), Value::String(result.msg.clone()));
        Ok(result)
    }
}

/// Evaluate `var` as an expression against the task variables.
fn lookup_var(name: &str, ctx: &ModuleContext) -> Value {
    let expr = if name.contains("{{") {
        name.to_string()
    } else {
        format!("{{{{ {} }}}}", name)
    };
    let mut tera = templar::new_tera();
    let context = templar::create_tera_context(ctx.vars);
    match templar::render_value(&expr, &mut tera, &context, false) {
        Ok(value) => value,
        Err(e) => {
            debug!("Debug var '{}' could not be resolved: {}", name, e);
            Value::String(UNDEFINED_MARKER.to_string())
        }
    }
}

/// Format YAML values in a human-readable way
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Tagged(tagged) => format_value(&tagged.value),
        complex => serde_json::to_string_pretty(complex)
            .unwrap_or_else(|_| format!("{:?}", complex)),
    }
}
