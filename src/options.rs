use std::fmt;
use std::path::{Path, PathBuf};

/// Every run uses this many worker slots inside a play.
pub const DEFAULT_FORKS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Local,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BecomeMethod {
    Sudo,
    Su,
}

impl BecomeMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sudo" => Some(BecomeMethod::Sudo),
            "su" => Some(BecomeMethod::Su),
            _ => None,
        }
    }
}

impl fmt::Display for BecomeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BecomeMethod::Sudo => write!(f, "sudo"),
            BecomeMethod::Su => write!(f, "su"),
        }
    }
}

/// Execution options handed to the task queue manager.
///
/// The record is built once per invocation and never changes afterwards; the
/// connection is always local and the fork count is always [`DEFAULT_FORKS`].
#[derive(Debug, Clone)]
pub struct Options {
    connection: Connection,
    module_path: PathBuf,
    forks: usize,
    remote_user: Option<String>,
    private_key_file: Option<PathBuf>,
    become_enabled: bool,
    become_method: BecomeMethod,
    become_user: String,
    verbosity: u8,
    check: bool,
}

impl Options {
    pub fn local(module_path: impl Into<PathBuf>) -> Self {
        Options {
            connection: Connection::Local,
            module_path: module_path.into(),
            forks: DEFAULT_FORKS,
            remote_user: None,
            private_key_file: None,
            become_enabled: false,
            become_method: BecomeMethod::Sudo,
            become_user: "root".to_string(),
            verbosity: 0,
            check: false,
        }
    }

    pub fn with_become(mut self, enabled: bool, method: BecomeMethod, user: &str) -> Self {
        self.become_enabled = enabled;
        self.become_method = method;
        self.become_user = user.to_string();
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn connection(&self) -> Connection {
        self.connection
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    pub fn forks(&self) -> usize {
        self.forks
    }

    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    pub fn private_key_file(&self) -> Option<&Path> {
        self.private_key_file.as_deref()
    }

    pub fn become_enabled(&self) -> bool {
        self.become_enabled
    }

    pub fn become_method(&self) -> BecomeMethod {
        self.become_method
    }

    pub fn become_user(&self) -> &str {
        &self.become_user
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    pub fn check(&self) -> bool {
        self.check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_defaults() {
        let options = Options::local("/srv/playbooks");
        assert_eq!(options.connection(), Connection::Local);
        assert_eq!(options.connection().to_string(), "local");
        assert_eq!(options.forks(), 100);
        assert_eq!(options.module_path(), Path::new("/srv/playbooks"));
        assert!(options.remote_user().is_none());
        assert!(options.private_key_file().is_none());
        assert!(!options.become_enabled());
        assert_eq!(options.become_method(), BecomeMethod::Sudo);
        assert_eq!(options.become_user(), "root");
        assert!(!options.check());
    }

    #[test]
    fn test_builders_keep_connection_and_forks() {
        let options = Options::local("/tmp")
            .with_become(true, BecomeMethod::Su, "deploy")
            .with_verbosity(2)
            .with_check(true);

        assert_eq!(options.connection(), Connection::Local);
        assert_eq!(options.forks(), DEFAULT_FORKS);
        assert!(options.become_enabled());
        assert_eq!(options.become_method(), BecomeMethod::Su);
        assert_eq!(options.become_user(), "deploy");
        assert_eq!(options.verbosity(), 2);
        assert!(options.check());
    }

    #[test]
    fn test_become_method_parse() {
        assert_eq!(BecomeMethod::parse("SUDO"), Some(BecomeMethod::Sudo));
        assert_eq!(BecomeMethod::parse("su"), Some(BecomeMethod::Su));
        assert_eq!(BecomeMethod::parse("doas"), None);
    }
}
