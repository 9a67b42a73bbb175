pub mod callback;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::inventory::{Host, Inventory};
use crate::modules::{self, ModuleContext};
use crate::options::Options;
use crate::playbook::{Play, Task, TaskResult};
use crate::vars::VariableManager;

/// Runs one play to completion.
#[cfg_attr(test, mockall::automock)]
pub trait PlayExecutor {
    fn run(&self, play: &Play) -> Result<PlayRecap>;
}

/// Per-host counters shown in the PLAY RECAP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
}

impl HostStats {
    fn record(&mut self, result: &TaskResult) {
        if result.is_fatal() {
            self.failed += 1;
        } else if result.ignored {
            self.ignored += 1;
        } else if result.skipped {
            self.skipped += 1;
        } else {
            self.ok += 1;
            if result.changed {
                self.changed += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayRecap {
    pub play: String,
    pub hosts: BTreeMap<String, HostStats>,
}

impl PlayRecap {
    pub fn new(play: &str) -> Self {
        PlayRecap {
            play: play.to_string(),
            hosts: BTreeMap::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        self.hosts.values().any(|s| s.failed > 0)
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|(_, s)| s.failed > 0)
            .map(|(h, _)| h.as_str())
            .collect()
    }
}

/// Run the plays one at a time, in order. The first error stops the run.
pub fn run_plays<E: PlayExecutor + ?Sized>(executor: &E, plays: &[&Play]) -> Result<Vec<PlayRecap>> {
    let mut recaps = Vec::with_capacity(plays.len());
    for (index, play) in plays.iter().enumerate() {
        info!("Running play '{}' ({}/{})", play.name, index + 1, plays.len());
        let recap = executor
            .run(play)
            .with_context(|| format!("Play '{}' failed", play.name))?;
        recaps.push(recap);
    }
    Ok(recaps)
}

/// Execution state of one host during a play.
struct HostState<'a> {
    host: &'a Host,
    /// Registered results and facts.
    runtime: HashMap<String, Value>,
    notified: Vec<String>,
    failed: bool,
    stats: HostStats,
}

/// Runs plays against the inventory with the linear strategy: every host
/// finishes a task before any host starts the next one.
pub struct TaskQueueManager {
    options: Options,
    inventory: Inventory,
    variable_manager: VariableManager,
    playbook_dir: PathBuf,
    pool: rayon::ThreadPool,
}

impl TaskQueueManager {
    pub fn new(
        options: Options,
        inventory: Inventory,
        variable_manager: VariableManager,
    ) -> Result<Self> {
        let playbook_dir = inventory
            .base_dir()
            .unwrap_or_else(|| options.module_path())
            .to_path_buf();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.forks())
            .thread_name(|i| format!("rustsible-fork-{}", i))
            .build()
            .context("Failed to create worker pool")?;

        Ok(TaskQueueManager {
            options,
            inventory,
            variable_manager,
            playbook_dir,
            pool,
        })
    }

    /// Every module a play uses must exist before anything runs.
    fn validate_modules(&self, play: &Play) -> Result<()> {
        let tasks = play
            .all_tasks()
            .into_iter()
            .chain(play.all_handlers().into_iter().map(|h| &h.task));
        for task in tasks {
            let role_paths: Vec<&Path> = task.role_path.iter().map(PathBuf::as_path).collect();
            if !modules::module_exists(&task.module, self.options.module_path(), &role_paths) {
                return Err(Error::ModuleNotFound(task.module.clone()).into());
            }
        }
        Ok(())
    }

    fn base_context<'v>(&self, play: &Play, vars: &'v HashMap<String, Value>) -> ModuleContext<'v> {
        ModuleContext {
            check_mode: self.options.check(),
            become_enabled: self.options.become_enabled() || play.is_become,
            become_method: self.options.become_method(),
            become_user: play
                .become_user
                .clone()
                .unwrap_or_else(|| self.options.become_user().to_string()),
            verbosity: self.options.verbosity(),
            module_path: self.options.module_path().to_path_buf(),
            playbook_dir: self.playbook_dir.clone(),
            role_path: None,
            vars,
        }
    }

    fn run_task_on_host(&self, play: &Play, task: &Task, state: &HostState) -> Result<TaskResult> {
        let vars = self
            .variable_manager
            .get_vars(play, state.host, &self.inventory, &state.runtime);
        let ctx = self.base_context(play, &vars);
        task.execute(&state.host.name, &vars, &ctx)
    }

    /// Run `task` on every host in `eligible`, in parallel, then fold the
    /// results back into the host states in host order.
    fn run_task(
        &self,
        play: &Play,
        task: &Task,
        states: &mut [HostState],
        eligible: impl Fn(&HostState) -> bool + Sync,
    ) -> Result<()> {
        let results: Vec<Option<Result<TaskResult>>> = self.pool.install(|| {
            states
                .par_iter()
                .map(|state| {
                    if eligible(state) {
                        Some(self.run_task_on_host(play, task, state))
                    } else {
                        None
                    }
                })
                .collect()
        });

        for (state, result) in states.iter_mut().zip(results) {
            let Some(result) = result else { continue };
            let result = result?;
            callback::host_result(&task.module, &result, self.options.verbosity());
            state.stats.record(&result);

            if let Some(register) = &task.register {
                state.runtime.insert(register.clone(), result.to_register_value());
            }
            for (key, value) in &result.facts {
                if let Value::String(name) = key {
                    state.runtime.insert(name.clone(), value.clone());
                }
            }
            if result.changed && !result.skipped {
                for name in &task.notify {
                    if !state.notified.contains(name) {
                        state.notified.push(name.clone());
                    }
                }
            }
            if result.is_fatal() {
                debug!("Host {} failed task '{}'", state.host.name, task.name);
                state.failed = true;
            }
        }
        Ok(())
    }

    fn run_handlers(&self, play: &Play, states: &mut [HostState]) -> Result<()> {
        for handler in play.all_handlers() {
            let triggered = |s: &HostState| !s.failed && s.notified.iter().any(|n| handler.answers_to(n));
            if !states.iter().any(triggered) {
                continue;
            }
            callback::handler_banner(&handler.task.name);
            self.run_task(play, &handler.task, states, triggered)?;
        }
        Ok(())
    }
}

impl PlayExecutor for TaskQueueManager {
    fn run(&self, play: &Play) -> Result<PlayRecap> {
        let hosts = self.inventory.resolve_pattern(&play.hosts.tokens());
        callback::play_banner(&play.name);
        if hosts.is_empty() {
            warn!("No hosts matched for play '{}' with pattern: {}", play.name, play.hosts);
            callback::no_hosts(&play.hosts.to_string());
            return Ok(PlayRecap::new(&play.name));
        }
        self.validate_modules(play)?;

        let mut states: Vec<HostState> = hosts
            .into_iter()
            .map(|host| HostState {
                host,
                runtime: HashMap::new(),
                notified: Vec::new(),
                failed: false,
                stats: HostStats::default(),
            })
            .collect();

        for task in play.all_tasks() {
            if states.iter().all(|s| s.failed) {
                warn!("All hosts have failed; stopping play '{}'", play.name);
                break;
            }
            callback::task_banner(&task.name);
            self.run_task(play, task, &mut states, |s| !s.failed)?;
        }

        self.run_handlers(play, &mut states)?;

        let mut recap = PlayRecap::new(&play.name);
        for state in states {
            recap.hosts.insert(state.host.name.clone(), state.stats);
        }
        callback::recap(&recap);
        Ok(recap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::build_inventory;
    use crate::playbook::Playbook;
    use crate::testing::{play, single, write_file};
    use mockall::predicate::function;
    use mockall::Sequence;
    use pretty_assertions::assert_eq;

    fn manager(dir: &Path, groups: &[&str]) -> TaskQueueManager {
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        let inventory = build_inventory(&groups, dir).unwrap();
        let options = Options::local(dir);
        let vm = VariableManager::with_defaults(dir, dir, &options);
        TaskQueueManager::new(options, inventory, vm).unwrap()
    }

    #[test]
    fn test_run_plays_in_order() {
        let plays = vec![play("a", single("web"), &[]), play("b", single("db"), &[])];
        let refs: Vec<&Play> = plays.iter().collect();

        let mut executor = MockPlayExecutor::new();
        let mut seq = Sequence::new();
        for name in ["a", "b"] {
            executor
                .expect_run()
                .with(function(move |p: &Play| p.name == name))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|p| Ok(PlayRecap::new(&p.name)));
        }

        let recaps = run_plays(&executor, &refs).unwrap();
        let names: Vec<&str> = recaps.iter().map(|r| r.play.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_run_plays_stops_at_first_error() {
        let plays = vec![play("a", single("web"), &[]), play("b", single("db"), &[])];
        let refs: Vec<&Play> = plays.iter().collect();

        let mut executor = MockPlayExecutor::new();
        executor
            .expect_run()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("engine exploded")));

        let err = run_plays(&executor, &refs).unwrap_err();
        assert!(format!("{:#}", err).contains("engine exploded"));
    }

    #[test]
    fn test_play_runs_tasks_registers_and_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("handler_ran");
        let path = write_file(
            dir.path(),
            "site.yml",
            &format!(
                r#"
- name: web
  hosts: web
  vars:
    greeting: hello
  tasks:
    - name: say
      command: echo {{{{ greeting }}}}
      register: said
      notify: record
    - name: remember
      set_fact:
        heard: "{{{{ said.stdout }}}}"
    - name: check
      command: "test '{{{{ heard }}}}' = hello"
      changed_when: false
    - name: skipped
      debug:
        msg: never
      when: heard != 'hello'
  handlers:
    - name: record
      command: touch {}
"#,
                marker.display()
            ),
        );
        let playbook = Playbook::load(&path).unwrap();
        let tqm = manager(dir.path(), &["web"]);

        let recap = tqm.run(&playbook.plays[0]).unwrap();
        let stats = &recap.hosts["localhost"];
        assert_eq!(
            stats,
            &HostStats {
                ok: 4,
                changed: 2,
                failed: 0,
                skipped: 1,
                ignored: 0
            }
        );
        assert!(!recap.has_failures());
        assert!(marker.exists());
    }

    #[test]
    fn test_failed_host_stops_and_skips_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("after_failure");
        let path = write_file(
            dir.path(),
            "site.yml",
            &format!(
                "- hosts: all\n  tasks:\n    - command: 'true'\n      notify: h\n    - command: 'false'\n    - command: touch {}\n  handlers:\n    - name: h\n      command: touch {}\n",
                marker.display(),
                marker.display()
            ),
        );
        let playbook = Playbook::load(&path).unwrap();
        let tqm = manager(dir.path(), &[]);

        let recap = tqm.run(&playbook.plays[0]).unwrap();
        assert!(recap.has_failures());
        assert_eq!(recap.failed_hosts(), vec!["localhost"]);
        assert!(!marker.exists());
    }

    #[test]
    fn test_play_without_hosts_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let tqm = manager(dir.path(), &[]);
        let recap = tqm.run(&play("nothing", single("db"), &[])).unwrap();
        assert!(recap.hosts.is_empty());
    }

    #[test]
    fn test_unknown_module_fails_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let path = write_file(
            dir.path(),
            "site.yml",
            &format!(
                "- hosts: all\n  tasks:\n    - command: touch {}\n    - no_such_module: {{}}\n",
                marker.display()
            ),
        );
        let playbook = Playbook::load(&path).unwrap();
        let tqm = manager(dir.path(), &[]);

        let err = tqm.run(&playbook.plays[0]).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ModuleNotFound(m)) if m == "no_such_module"));
        assert!(!marker.exists());
    }

    #[test]
    fn test_host_stats_record() {
        let mut stats = HostStats::default();
        let mut changed = TaskResult::new("h");
        changed.changed = true;
        stats.record(&changed);
        stats.record(&TaskResult::skipped("h", "no"));
        stats.record(&TaskResult::failure("h", "boom"));
        let mut ignored = TaskResult::new("h");
        ignored.ignored = true;
        stats.record(&ignored);
        assert_eq!(
            stats,
            HostStats {
                ok: 1,
                changed: 1,
                failed: 1,
                skipped: 1,
                ignored: 1
            }
        );
    }
}
