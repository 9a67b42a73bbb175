use log::debug;
use serde_yaml::Value;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub variables: HashMap<String, Value>,
}

impl Host {
    pub fn new(name: &str) -> Self {
        debug!("Creating new host: {}", name);
        Host {
            name: name.to_string(),
            variables: HashMap::new(),
        }
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set_variable(&mut self, key: &str, value: Value) {
        debug!("Setting variable for host {}: {} = {:?}", self.name, key, value);
        self.variables.insert(key.to_string(), value);
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct HostGroup {
    pub name: String,
    pub hosts: BTreeSet<String>,
    pub variables: HashMap<String, Value>,
}

impl HostGroup {
    pub fn new(name: &str) -> Self {
        debug!("Creating new host group: {}", name);
        HostGroup {
            name: name.to_string(),
            hosts: BTreeSet::new(),
            variables: HashMap::new(),
        }
    }

    pub fn add_host(&mut self, host: &str) -> bool {
        self.hosts.insert(host.to_string())
    }

    pub fn has_hosts(&self) -> bool {
        !self.hosts.is_empty()
    }

    pub fn set_variable(&mut self, key: &str, value: Value) {
        self.variables.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_variables() {
        let mut host = Host::new("localhost");
        assert_eq!(host.name, "localhost");
        assert!(host.get_variable("foo").is_none());

        host.set_variable("foo", Value::String("bar".to_string()));
        assert_eq!(host.get_variable("foo"), Some(&Value::String("bar".to_string())));
    }

    #[test]
    fn test_group_membership_is_a_set() {
        let mut group = HostGroup::new("web");
        assert!(!group.has_hosts());
        assert!(group.add_host("localhost"));
        assert!(!group.add_host("localhost"));
        assert_eq!(group.hosts.len(), 1);
    }
}
