use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::debug;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::options::{BecomeMethod, Options};

pub fn build_cli() -> Command {
    Command::new("rustsible-local")
        .about("Run Ansible-compatible playbooks against localhost")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("playbook")
                .long("playbook")
                .help("Full filepath of the playbook")
                .required(true)
                .value_name("PLAYBOOK"),
        )
        .arg(
            Arg::new("extra-vars")
                .long("extra-vars")
                .help("JSON encoded object with extra vars")
                .value_name("JSON"),
        )
        .arg(
            Arg::new("groups")
                .long("groups")
                .help("Comma separated groups localhost belongs to")
                .value_name("GROUPS"),
        )
        .arg(
            Arg::new("plays")
                .long("plays")
                .help("Comma separated names of the plays to run")
                .value_name("PLAYS"),
        )
        .arg(
            Arg::new("hosts")
                .long("hosts")
                .help("Comma separated host groups whose plays should run")
                .value_name("HOSTS"),
        )
        .arg(
            Arg::new("roles")
                .long("roles")
                .help("Comma separated roles whose plays should run")
                .value_name("ROLES"),
        )
        .arg(
            Arg::new("module-path")
                .long("module-path")
                .help("Module search path (default: the playbook directory)")
                .value_name("PATH"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Perform a dry run without making changes")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("become")
                .short('b')
                .long("become")
                .help("Run tasks with privilege escalation")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("become-user")
                .long("become-user")
                .help("User to become (default: root)")
                .value_name("USER")
                .default_value("root"),
        )
        .arg(
            Arg::new("become-method")
                .long("become-method")
                .help("Privilege escalation method")
                .value_parser(["sudo", "su"])
                .default_value("sudo"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Increase verbosity (up to -vvvv)"),
        )
}

/// Normalized command line of one invocation.
#[derive(Debug, Clone)]
pub struct LocalArgs {
    pub playbook: PathBuf,
    pub extra_vars: serde_json::Map<String, serde_json::Value>,
    pub groups: Vec<String>,
    pub plays: Vec<String>,
    pub hosts: Vec<String>,
    pub roles: Vec<String>,
    pub module_path: Option<PathBuf>,
    pub check: bool,
    pub become_enabled: bool,
    pub become_method: BecomeMethod,
    pub become_user: String,
    pub verbosity: u8,
}

impl LocalArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let groups = list_arg(matches, "groups")?;
        let plays = list_arg(matches, "plays")?;
        let hosts = list_arg(matches, "hosts")?;
        let roles = list_arg(matches, "roles")?;

        if plays.is_empty() && hosts.is_empty() && roles.is_empty() {
            return Err(Error::NoSelection.into());
        }

        let extra_vars = match matches.get_one::<String>("extra-vars") {
            Some(raw) => parse_extra_vars(raw)?,
            None => serde_json::Map::new(),
        };

        // Presence is enforced by clap.
        let raw_playbook = matches
            .get_one::<String>("playbook")
            .map(String::as_str)
            .unwrap_or_default();
        let playbook = resolve_playbook_path(raw_playbook)?;

        let become_method = matches
            .get_one::<String>("become-method")
            .and_then(|m| BecomeMethod::parse(m))
            .unwrap_or(BecomeMethod::Sudo);

        Ok(LocalArgs {
            playbook,
            extra_vars,
            groups,
            plays,
            hosts,
            roles,
            module_path: matches.get_one::<String>("module-path").map(PathBuf::from),
            check: matches.get_flag("check"),
            become_enabled: matches.get_flag("become"),
            become_method,
            become_user: matches
                .get_one::<String>("become-user")
                .cloned()
                .unwrap_or_else(|| "root".to_string()),
            verbosity: matches.get_count("verbose"),
        })
    }

    /// Directory holding the playbook; roles, group_vars and files are found here.
    pub fn playbook_basedir(&self) -> PathBuf {
        self.playbook
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn options(&self) -> Options {
        let module_path = self
            .module_path
            .clone()
            .unwrap_or_else(|| self.playbook_basedir());

        Options::local(module_path)
            .with_become(self.become_enabled, self.become_method, &self.become_user)
            .with_verbosity(self.verbosity)
            .with_check(self.check)
    }
}

fn list_arg(matches: &ArgMatches, flag: &str) -> Result<Vec<String>> {
    match matches.get_one::<String>(flag) {
        Some(raw) => split_list(raw, flag),
        None => Ok(Vec::new()),
    }
}

/// Split a comma separated flag value.
///
/// An entirely empty value is an empty list; an empty entry between commas is
/// rejected.
pub fn split_list(raw: &str, flag: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    raw.split(',')
        .map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                Err(Error::EmptyListEntry {
                    flag: format!("--{}", flag),
                    value: raw.to_string(),
                }
                .into())
            } else {
                Ok(entry.to_string())
            }
        })
        .collect()
}

pub fn parse_extra_vars(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(Error::ExtraVarsJson)?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::ExtraVarsNotObject(other.to_string()).into()),
    }
}

/// Resolve the playbook path: `~` expansion first, then relative to the
/// current working directory.
pub fn resolve_playbook_path(path: &str) -> Result<PathBuf> {
    let cwd = std::env::current_dir().ok();

    let expanded = expand_home(path);
    if expanded.exists() {
        debug!("Playbook found at {}", expanded.display());
        return Ok(match (&cwd, expanded.is_relative()) {
            (Some(cwd), true) => cwd.join(expanded),
            _ => expanded,
        });
    }

    let relative = match &cwd {
        Some(cwd) => cwd.join(path),
        None => PathBuf::from(path),
    };
    if relative.exists() {
        return Ok(relative);
    }

    Err(Error::PlaybookNotFound(relative).into())
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
