use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tera::{Context as TeraContext, Tera};

use crate::error::Error;
use crate::modules::{self, ModuleContext, ModuleResult};
use crate::playbook::templar;

/// Task result structure for tracking execution status
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub host: String,
    pub changed: bool,
    pub failed: bool,
    pub skipped: bool,
    /// Failed, but the task has `ignore_errors: yes`.
    pub ignored: bool,
    pub msg: String,
    pub rc: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub data: Mapping,
    pub facts: Mapping,
    /// Loop item this result belongs to.
    pub item: Option<Value>,
    /// Per-item results of a looped task.
    pub item_results: Vec<TaskResult>,
}

impl TaskResult {
    pub fn new(host: &str) -> Self {
        TaskResult {
            host: host.to_string(),
            ..Default::default()
        }
    }

    pub fn skipped(host: &str, msg: impl Into<String>) -> Self {
        TaskResult {
            skipped: true,
            msg: msg.into(),
            ..Self::new(host)
        }
    }

    pub fn failure(host: &str, msg: impl Into<String>) -> Self {
        TaskResult {
            failed: true,
            msg: msg.into(),
            ..Self::new(host)
        }
    }

    pub fn from_module_result(host: &str, module_result: ModuleResult) -> Self {
        TaskResult {
            host: host.to_string(),
            changed: module_result.changed,
            failed: module_result.failed,
            skipped: module_result.skipped,
            ignored: false,
            msg: module_result.msg,
            rc: module_result.rc,
            stdout: module_result.stdout,
            stderr: module_result.stderr,
            data: module_result.data,
            facts: module_result.facts,
            item: None,
            item_results: Vec::new(),
        }
    }

    /// Combine the per-item results of a loop.
    pub fn from_items(host: &str, results: Vec<TaskResult>) -> Self {
        let mut combined = TaskResult::new(host);
        combined.changed = results.iter().any(|r| r.changed);
        combined.failed = results.iter().any(|r| r.failed);
        combined.ignored = !combined.failed && results.iter().any(|r| r.ignored);
        combined.skipped = !results.is_empty() && results.iter().all(|r| r.skipped);
        combined.msg = match results.iter().find(|r| r.failed || r.ignored) {
            Some(failure) => format!("One or more items failed: {}", failure.msg),
            None => "All items completed".to_string(),
        };
        for result in &results {
            combined.facts.extend(result.facts.clone());
        }
        combined.item_results = results;
        combined
    }

    /// Whether the host counts as failed for this task.
    pub fn is_fatal(&self) -> bool {
        self.failed && !self.ignored
    }

    /// The value stored by `register`.
    pub fn to_register_value(&self) -> Value {
        let mut map = Mapping::new();
        let mut put = |k: &str, v: Value| {
            map.insert(Value::String(k.to_string()), v);
        };

        put("changed", Value::Bool(self.changed));
        put("failed", Value::Bool(self.failed || self.ignored));
        put("skipped", Value::Bool(self.skipped));
        if !self.msg.is_empty() {
            put("msg", Value::String(self.msg.clone()));
        }
        if let Some(rc) = self.rc {
            put("rc", Value::Number(rc.into()));
        }
        if self.rc.is_some() || !self.stdout.is_empty() || !self.stderr.is_empty() {
            put("stdout", Value::String(self.stdout.clone()));
            put("stdout_lines", lines(&self.stdout));
            put("stderr", Value::String(self.stderr.clone()));
            put("stderr_lines", lines(&self.stderr));
        }
        if let Some(item) = &self.item {
            put("item", item.clone());
        }
        if !self.item_results.is_empty() {
            put(
                "results",
                Value::Sequence(self.item_results.iter().map(|r| r.to_register_value()).collect()),
            );
        }
        for (k, v) in &self.data {
            if !map.contains_key(k) {
                map.insert(k.clone(), v.clone());
            }
        }
        Value::Mapping(map)
    }
}

fn lines(text: &str) -> Value {
    Value::Sequence(text.lines().map(|l| Value::String(l.to_string())).collect())
}

/// Task structure representing a single action in a play
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub module: String,
    pub args: Mapping,
    /// Task-level `become`, overriding the play's.
    pub is_become: Option<bool>,
    pub become_user: Option<String>,
    pub register: Option<String>,
    pub when: Option<Value>,
    pub changed_when: Option<Value>,
    pub failed_when: Option<Value>,
    pub notify: Vec<String>,
    pub ignore_errors: bool,
    pub vars: Mapping,
    pub loop_items: Option<Value>,
    pub loop_var_name: Option<String>,
    pub index_var_name: Option<String>,
    /// Directory of the role this task came from.
    pub role_path: Option<PathBuf>,
}

impl Task {
    /// Run the task for one host.
    ///
    /// Module failures, template errors and false conditions all come back
    /// as a `TaskResult`; only an unknown module is an `Err`.
    pub fn execute(
        &self,
        host: &str,
        vars: &HashMap<String, Value>,
        base: &ModuleContext,
    ) -> Result<TaskResult> {
        info!("TASK [{}] on host {}", self.name, host);
        let mut tera = templar::new_tera();

        let task_vars = match self.task_vars(vars, &mut tera) {
            Ok(v) => v,
            Err(e) => return Ok(self.finish(TaskResult::failure(host, e.to_string()))),
        };

        let Some(loop_value) = &self.loop_items else {
            return self.run_once(host, &task_vars, base, &mut tera, None);
        };

        let context = templar::create_tera_context(&task_vars);
        let items = match resolve_loop_items(loop_value, &mut tera, &context) {
            Ok(items) => items,
            Err(e) => return Ok(self.finish(TaskResult::failure(host, e.to_string()))),
        };
        if items.is_empty() {
            return Ok(TaskResult::skipped(host, "No items in loop"));
        }
        debug!("Executing task '{}' with loop: {} items", self.name, items.len());

        let loop_var = self.loop_var_name.as_deref().unwrap_or("item");
        let mut results = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let mut iter_vars = task_vars.clone();
            iter_vars.insert(loop_var.to_string(), item.clone());
            if let Some(index_var) = &self.index_var_name {
                iter_vars.insert(index_var.clone(), Value::Number(idx.into()));
            }
            results.push(self.run_once(host, &iter_vars, base, &mut tera, Some(item))?);
        }
        Ok(TaskResult::from_items(host, results))
    }

    /// Host variables plus the task's own `vars`, rendered against them.
    fn task_vars(&self, vars: &HashMap<String, Value>, tera: &mut Tera) -> Result<HashMap<String, Value>> {
        let mut task_vars = vars.clone();
        if self.vars.is_empty() {
            return Ok(task_vars);
        }
        let context = templar::create_tera_context(vars);
        for (key, value) in &self.vars {
            if let Value::String(name) = key {
                let rendered = templar::render_structure(value, tera, &context)?;
                task_vars.insert(name.clone(), rendered);
            }
        }
        Ok(task_vars)
    }

    fn run_once(
        &self,
        host: &str,
        vars: &HashMap<String, Value>,
        base: &ModuleContext,
        tera: &mut Tera,
        item: Option<&Value>,
    ) -> Result<TaskResult> {
        let context = templar::create_tera_context(vars);
        let with_item = |mut result: TaskResult| {
            result.item = item.cloned();
            result
        };

        if let Some(when) = &self.when {
            match templar::evaluate_when(when, tera, &context) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Skipping task '{}' due to when condition", self.name);
                    return Ok(with_item(TaskResult::skipped(host, "Conditional result was False")));
                }
                Err(e) => return Ok(self.finish(with_item(TaskResult::failure(host, e.to_string())))),
            }
        }

        let args = match templar::render_structure(&Value::Mapping(self.args.clone()), tera, &context) {
            Ok(Value::Mapping(args)) => args,
            Ok(_) => self.args.clone(),
            Err(e) => return Ok(self.finish(with_item(TaskResult::failure(host, e.to_string())))),
        };

        let ctx = ModuleContext {
            check_mode: base.check_mode,
            become_enabled: self.is_become.unwrap_or(base.become_enabled),
            become_method: base.become_method,
            become_user: self
                .become_user
                .clone()
                .unwrap_or_else(|| base.become_user.clone()),
            verbosity: base.verbosity,
            module_path: base.module_path.clone(),
            playbook_dir: base.playbook_dir.clone(),
            role_path: self.role_path.clone().or_else(|| base.role_path.clone()),
            vars,
        };

        let module_result = match modules::run_module(&self.module, &args, &ctx) {
            Ok(result) => result,
            Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::ModuleNotFound(_))) => {
                return Err(e)
            }
            Err(e) => {
                warn!("Module '{}' failed on {}: {:#}", self.module, host, e);
                ModuleResult::failed(format!("{:#}", e))
            }
        };

        let mut result = with_item(TaskResult::from_module_result(host, module_result));
        if !result.skipped {
            self.apply_result_conditions(&mut result, vars, tera);
        }
        Ok(self.finish(result))
    }

    /// `changed_when` and `failed_when`, evaluated with the registered result in scope.
    fn apply_result_conditions(&self, result: &mut TaskResult, vars: &HashMap<String, Value>, tera: &mut Tera) {
        if self.changed_when.is_none() && self.failed_when.is_none() {
            return;
        }
        let mut scope = vars.clone();
        if let Some(register) = &self.register {
            scope.insert(register.clone(), result.to_register_value());
        }
        let context: TeraContext = templar::create_tera_context(&scope);

        if let Some(changed_when) = &self.changed_when {
            match templar::evaluate_when(changed_when, tera, &context) {
                Ok(changed) => result.changed = changed,
                Err(e) => {
                    result.failed = true;
                    result.msg = e.to_string();
                    return;
                }
            }
        }
        if let Some(failed_when) = &self.failed_when {
            match templar::evaluate_when(failed_when, tera, &context) {
                Ok(failed) => {
                    if failed && !result.failed {
                        result.msg = format!("failed_when condition met: {}", describe(failed_when));
                    }
                    result.failed = failed;
                }
                Err(e) => {
                    result.failed = true;
                    result.msg = e.to_string();
                }
            }
        }
    }

    fn finish(&self, mut result: TaskResult) -> TaskResult {
        if result.failed && self.ignore_errors {
            debug!("Ignoring failure of task '{}'", self.name);
            result.failed = false;
            result.ignored = true;
        }
        result
    }
}

fn describe(condition: &Value) -> String {
    match condition {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
    }
}

/// Resolve `loop`/`with_items` to the list of items.
fn resolve_loop_items(items: &Value, tera: &mut Tera, context: &TeraContext) -> Result<Vec<Value>> {
    match items {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(_) => match templar::render_structure(items, tera, context)? {
            Value::Sequence(seq) => Ok(seq),
            other => Ok(vec![other]),
        },
        Value::String(expr) => match templar::render_value(expr, tera, context, false) {
            Ok(Value::Sequence(seq)) => Ok(seq),
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(Value::String(s)) if !expr.contains("{{") && !expr.contains("{%") => {
                warn!("Loop value '{}' is a plain string; using it as a single item", s);
                Ok(vec![Value::String(s)])
            }
            Ok(other) => Err(anyhow!(
                "Loop expression '{}' resolved to a non-list value: {:?}",
                expr,
                other
            )),
            Err(e) => Err(anyhow!("Failed to render loop expression '{}': {}", expr, e)),
        },
        other => Err(anyhow!("Unsupported loop type: {:?}", other)),
    }
}
