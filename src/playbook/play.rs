use serde_yaml::{Mapping, Value};
use std::fmt;

use crate::playbook::{Handler, Role, Task};

/// Target specification of a play, kept the way it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// `hosts: web` (may itself hold `web:db` or `web,db`)
    Single(String),
    /// `hosts: [web, db]`
    List(Vec<String>),
}

impl HostPattern {
    /// Individual pattern tokens, with `:` and `,` separators expanded.
    pub fn tokens(&self) -> Vec<String> {
        let split = |s: &str| -> Vec<String> {
            s.split([',', ':'])
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        };

        match self {
            HostPattern::Single(s) => split(s),
            HostPattern::List(items) => items.iter().flat_map(|s| split(s)).collect(),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(HostPattern::Single(s.clone())),
            Value::Sequence(seq) => {
                let mut items = Vec::with_capacity(seq.len());
                for item in seq {
                    match item {
                        Value::String(s) => items.push(s.clone()),
                        Value::Number(n) => items.push(n.to_string()),
                        _ => return None,
                    }
                }
                Some(HostPattern::List(items))
            }
            _ => None,
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Single(s) => write!(f, "{}", s),
            HostPattern::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

/// A role as referenced from a play's `roles:` list.
#[derive(Debug, Clone)]
pub struct RoleRef {
    pub name: String,
    /// Extra keys of the mapping form (`- role: x` `port: 80`), used as role params.
    pub params: Mapping,
}

/// Play structure representing a set of tasks to run on hosts
#[derive(Debug, Clone)]
pub struct Play {
    pub name: String,
    pub hosts: HostPattern,
    pub roles: Vec<RoleRef>,
    pub loaded_roles: Vec<Role>,
    pub pre_tasks: Vec<Task>,
    pub tasks: Vec<Task>,
    pub post_tasks: Vec<Task>,
    pub handlers: Vec<Handler>,
    pub vars: Mapping,
    pub is_become: bool, // renamed from 'become' to avoid Rust keyword
    pub become_user: Option<String>,
}

impl Play {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn has_role(&self, role_name: &str) -> bool {
        self.roles.iter().any(|r| r.name == role_name)
    }

    /// Tasks in execution order: pre_tasks, role tasks, tasks, post_tasks.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.pre_tasks
            .iter()
            .chain(self.loaded_roles.iter().flat_map(|r| r.tasks.iter()))
            .chain(self.tasks.iter())
            .chain(self.post_tasks.iter())
            .collect()
    }

    /// Play handlers followed by role handlers.
    pub fn all_handlers(&self) -> Vec<&Handler> {
        self.handlers
            .iter()
            .chain(self.loaded_roles.iter().flat_map(|r| r.handlers.iter()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_pattern_tokens() {
        assert_eq!(HostPattern::Single("web".into()).tokens(), vec!["web"]);
        assert_eq!(
            HostPattern::Single("web:db, !old".into()).tokens(),
            vec!["web", "db", "!old"]
        );
        assert_eq!(
            HostPattern::List(vec!["web".into(), "db".into()]).tokens(),
            vec!["web", "db"]
        );
    }

    #[test]
    fn test_host_pattern_from_value() {
        let single = HostPattern::from_value(&Value::String("all".into())).unwrap();
        assert_eq!(single, HostPattern::Single("all".into()));
        assert_eq!(single.to_string(), "all");

        let list = HostPattern::from_value(&serde_yaml::from_str("[web, db]").unwrap()).unwrap();
        assert_eq!(list, HostPattern::List(vec!["web".into(), "db".into()]));
        assert_eq!(list.to_string(), "web,db");

        assert!(HostPattern::from_value(&Value::Bool(true)).is_none());
        assert!(HostPattern::from_value(&serde_yaml::from_str("[{a: b}]").unwrap()).is_none());
    }
}
