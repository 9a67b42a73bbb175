//! Shared helpers for unit and integration tests.
//!
//! Fixtures are written into temporary directories; nothing here touches the
//! real filesystem outside of them.

use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::modules::ModuleContext;
use crate::options::BecomeMethod;
use crate::playbook::{HostPattern, Play, RoleRef};

/// Write `content` to `dir/rel`, creating parent directories.
pub fn write_file(dir: &Path, rel: &str, content: &str) -> PathBuf {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap_or_else(|e| panic!("create {}: {}", parent.display(), e));
    }
    fs::write(&path, content).unwrap_or_else(|e| panic!("write {}: {}", path.display(), e));
    path
}

/// A module context rooted at `dir`: no become, no check mode.
pub fn module_context<'a>(dir: &Path, vars: &'a HashMap<String, Value>) -> ModuleContext<'a> {
    ModuleContext {
        check_mode: false,
        become_enabled: false,
        become_method: BecomeMethod::Sudo,
        become_user: "root".to_string(),
        verbosity: 0,
        module_path: dir.to_path_buf(),
        playbook_dir: dir.to_path_buf(),
        role_path: None,
        vars,
    }
}

/// A task-less play with the given name, hosts and roles.
pub fn play(name: &str, hosts: HostPattern, roles: &[&str]) -> Play {
    Play {
        name: name.to_string(),
        hosts,
        roles: roles
            .iter()
            .map(|r| RoleRef {
                name: r.to_string(),
                params: Mapping::new(),
            })
            .collect(),
        loaded_roles: Vec::new(),
        pre_tasks: Vec::new(),
        tasks: Vec::new(),
        post_tasks: Vec::new(),
        handlers: Vec::new(),
        vars: Mapping::new(),
        is_become: false,
        become_user: None,
    }
}

pub fn single(hosts: &str) -> HostPattern {
    HostPattern::Single(hosts.to_string())
}

pub fn list(hosts: &[&str]) -> HostPattern {
    HostPattern::List(hosts.iter().map(|h| h.to_string()).collect())
}
