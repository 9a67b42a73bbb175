use log::{debug, info};
use std::fmt;

use crate::playbook::{HostPattern, Play};

/// What the caller asked to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaySelection {
    pub plays: Vec<String>,
    pub hosts: Vec<String>,
    pub roles: Vec<String>,
}

impl PlaySelection {
    pub fn new(plays: Vec<String>, hosts: Vec<String>, roles: Vec<String>) -> Self {
        PlaySelection { plays, hosts, roles }
    }

    pub fn is_empty(&self) -> bool {
        self.plays.is_empty() && self.hosts.is_empty() && self.roles.is_empty()
    }
}

/// The first criterion a play matched on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchReason {
    Name,
    Hosts(String),
    Role(String),
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchReason::Name => write!(f, "name"),
            MatchReason::Hosts(token) => write!(f, "hosts '{}'", token),
            MatchReason::Role(role) => write!(f, "role '{}'", role),
        }
    }
}

/// Why `play` is selected, checking name, then hosts, then roles.
pub fn match_reason(play: &Play, selection: &PlaySelection) -> Option<MatchReason> {
    if selection.plays.iter().any(|name| *name == play.name) {
        return Some(MatchReason::Name);
    }

    let hosts_match = match &play.hosts {
        HostPattern::Single(target) => selection.hosts.iter().find(|h| *h == target),
        HostPattern::List(targets) => targets
            .iter()
            .find(|t| selection.hosts.contains(*t)),
    };
    if let Some(token) = hosts_match {
        return Some(MatchReason::Hosts(token.clone()));
    }

    selection
        .roles
        .iter()
        .find(|role| play.has_role(role))
        .map(|role| MatchReason::Role(role.clone()))
}

/// The plays to run, in playbook order, each at most once.
pub fn select_plays<'a>(plays: &'a [Play], selection: &PlaySelection) -> Vec<&'a Play> {
    let selected: Vec<&Play> = plays
        .iter()
        .filter(|play| match match_reason(play, selection) {
            Some(reason) => {
                info!("Selected play '{}' by {}", play.name, reason);
                true
            }
            None => {
                debug!("Play '{}' not selected", play.name);
                false
            }
        })
        .collect();

    info!("{} of {} plays selected", selected.len(), plays.len());
    selected
}
