pub mod host;
mod vars_files;

use anyhow::Result;
use itertools::Itertools;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::error::Error;
pub use host::{Host, HostGroup};
pub use vars_files::{load_named_vars, read_vars_file};

pub const LOCALHOST: &str = "localhost";
pub const ALL_GROUP: &str = "all";

static GROUP_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid group name regex"));

pub struct Inventory {
    pub hosts: BTreeMap<String, Host>,
    pub groups: BTreeMap<String, HostGroup>,
    base_dir: Option<PathBuf>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(ALL_GROUP.to_string(), HostGroup::new(ALL_GROUP));

        Inventory {
            hosts: BTreeMap::new(),
            groups,
            base_dir: None,
        }
    }

    /// Inventory holding only `localhost`, a member of `all`.
    pub fn localhost(base_dir: &Path) -> Self {
        let mut inventory = Inventory::new();
        inventory.add_host(Host::new(LOCALHOST));
        inventory.set_base_dir(base_dir);
        inventory
    }

    pub fn add_host(&mut self, host: Host) {
        let name = host.name.clone();
        self.hosts.insert(name.clone(), host);
        if let Some(all) = self.groups.get_mut(ALL_GROUP) {
            all.add_host(&name);
        }
    }

    pub fn get_group(&self, name: &str) -> Option<&HostGroup> {
        self.groups.get(name)
    }

    pub fn set_base_dir(&mut self, base_dir: &Path) {
        debug!("Inventory base directory set to {}", base_dir.display());
        self.base_dir = Some(base_dir.to_path_buf());
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    /// Create `name` if missing. Returns true when the group was created.
    pub fn ensure_group(&mut self, name: &str) -> Result<bool> {
        if self.groups.contains_key(name) {
            return Ok(false);
        }
        if !GROUP_NAME_RE.is_match(name) {
            return Err(Error::InvalidGroupName(name.to_string()).into());
        }
        self.groups.insert(name.to_string(), HostGroup::new(name));
        Ok(true)
    }

    /// Make every inventory host a member of `group_name`.
    ///
    /// Groups that already have members are left untouched.
    pub fn attach_hosts(&mut self, group_name: &str) -> Result<()> {
        self.ensure_group(group_name)?;
        let host_names: Vec<String> = self.hosts.keys().cloned().collect();

        if let Some(group) = self.groups.get_mut(group_name) {
            if group.has_hosts() {
                debug!("Group '{}' already has members", group_name);
                return Ok(());
            }
            for host_name in host_names {
                debug!("Adding host '{}' to group '{}'", host_name, group_name);
                group.add_host(&host_name);
            }
        }
        Ok(())
    }

    /// Group names a host belongs to, `all` excluded, sorted.
    pub fn group_names(&self, host_name: &str) -> Vec<String> {
        self.groups
            .values()
            .filter(|g| g.name != ALL_GROUP && g.hosts.contains(host_name))
            .map(|g| g.name.clone())
            .collect()
    }

    /// Resolve host pattern tokens to hosts, in name order.
    ///
    /// Understands `all`, `*`, group and host names, `*` wildcards, `!name`
    /// exclusions and `&name` intersections.
    pub fn resolve_pattern(&self, tokens: &[String]) -> Vec<&Host> {
        let mut included: BTreeSet<String> = BTreeSet::new();
        let mut excluded: BTreeSet<String> = BTreeSet::new();
        let mut intersections: Vec<BTreeSet<String>> = Vec::new();

        for token in tokens {
            if let Some(name) = token.strip_prefix('!') {
                excluded.extend(self.hosts_for(name));
            } else if let Some(name) = token.strip_prefix('&') {
                intersections.push(self.hosts_for(name));
            } else {
                included.extend(self.hosts_for(token));
            }
        }

        let hosts: Vec<&Host> = included
            .iter()
            .filter(|name| !excluded.contains(*name))
            .filter(|name| intersections.iter().all(|set| set.contains(*name)))
            .filter_map(|name| self.hosts.get(name))
            .collect();

        debug!("Pattern {:?} matched {} hosts", tokens, hosts.len());
        hosts
    }

    fn hosts_for(&self, name: &str) -> BTreeSet<String> {
        if name == ALL_GROUP || name == "*" {
            return self.hosts.keys().cloned().collect();
        }
        if let Some(group) = self.groups.get(name) {
            return group.hosts.clone();
        }
        if self.hosts.contains_key(name) {
            return BTreeSet::from([name.to_string()]);
        }
        if name.contains('*') {
            let pattern = format!("^{}$", regex::escape(name).replace(r"\*", ".*"));
            if let Ok(re) = Regex::new(&pattern) {
                let mut matched: BTreeSet<String> = self
                    .groups
                    .values()
                    .filter(|g| re.is_match(&g.name))
                    .flat_map(|g| g.hosts.iter().cloned())
                    .collect();
                matched.extend(self.hosts.keys().filter(|h| re.is_match(h)).cloned());
                return matched;
            }
        }
        debug!("No host or group found matching '{}'", name);
        BTreeSet::new()
    }

    /// Load `group_vars/` and `host_vars/` found next to the playbook.
    pub fn load_vars_files(&mut self) -> Result<()> {
        let base_dir = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => return Ok(()),
        };

        let group_vars_dir = base_dir.join("group_vars");
        if group_vars_dir.is_dir() {
            for group in self.groups.values_mut() {
                let vars = load_named_vars(&group_vars_dir, &group.name)?;
                if !vars.is_empty() {
                    info!("Loaded {} group_vars for group '{}'", vars.len(), group.name);
                }
                group.variables.extend(vars);
            }
        }

        let host_vars_dir = base_dir.join("host_vars");
        if host_vars_dir.is_dir() {
            for host in self.hosts.values_mut() {
                let vars = load_named_vars(&host_vars_dir, &host.name)?;
                if !vars.is_empty() {
                    info!("Loaded {} host_vars for host '{}'", vars.len(), host.name);
                }
                host.variables.extend(vars);
            }
        }

        Ok(())
    }

    /// Group variables that apply to a host: `all` first, then its other groups by name.
    pub fn group_vars_for(&self, host_name: &str) -> HashMap<String, serde_yaml::Value> {
        let mut vars = HashMap::new();
        if let Some(all) = self.groups.get(ALL_GROUP) {
            vars.extend(all.variables.clone());
        }
        for group_name in self.group_names(host_name) {
            if let Some(group) = self.groups.get(&group_name) {
                vars.extend(group.variables.clone());
            }
        }
        vars
    }
}

/// Build the single-host inventory and attach it to every named group.
pub fn build_inventory(group_names: &[String], base_dir: &Path) -> Result<Inventory> {
    let mut inventory = Inventory::localhost(base_dir);

    for group_name in group_names {
        if inventory.ensure_group(group_name)? {
            debug!("Created group '{}'", group_name);
        }
    }

    for group_name in group_names {
        inventory.attach_hosts(group_name)?;
    }

    inventory.load_vars_files()?;

    info!(
        "Inventory has {} host(s) in {} group(s)",
        inventory.hosts.len(),
        inventory.groups.len()
    );
    if group_names.is_empty() {
        debug!("No groups given; {} is only a member of '{}'", LOCALHOST, ALL_GROUP);
    }
    Ok(inventory)
}

/// Groups attached to `localhost`: the `--groups` names and the `--hosts`
/// tokens, in order, without duplicates.
///
/// Host tokens are split on `:` and `,`. Tokens that cannot name a group stay
/// play selectors only. Play names are never added here.
pub fn inventory_groups(groups: &[String], hosts: &[String]) -> Vec<String> {
    let host_groups = hosts
        .iter()
        .flat_map(|token| token.split([':', ',']))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter(|token| {
            let valid = GROUP_NAME_RE.is_match(token);
            if !valid {
                warn!("Host token '{}' is not a group name; using it for play selection only", token);
            }
            valid
        })
        .map(str::to_string);

    groups.iter().cloned().chain(host_groups).unique().collect()
}
