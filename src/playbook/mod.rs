mod handlers;
mod parser;
mod play;
mod role;
mod task;
pub mod filters;
pub mod templar;

use anyhow::Result;
use log::info;
use std::path::{Path, PathBuf};

pub use handlers::Handler;
pub(crate) use parser::parse_bool;
pub use parser::{parse_kv_args, parse_play, parse_playbook};
pub use play::{HostPattern, Play, RoleRef};
pub use role::Role;
pub use task::{Task, TaskResult};

/// A loaded playbook file.
#[derive(Debug, Clone)]
pub struct Playbook {
    pub path: PathBuf,
    /// Directory holding the playbook; roles, files and templates are found from here.
    pub basedir: PathBuf,
    pub plays: Vec<Play>,
}

impl Playbook {
    pub fn load(path: &Path) -> Result<Playbook> {
        info!("Loading playbook from file: {}", path.display());
        let plays = parse_playbook(path)?;
        let basedir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        info!("Playbook contains {} plays", plays.len());

        Ok(Playbook {
            path: path.to_path_buf(),
            basedir,
            plays,
        })
    }

    pub fn get_plays(&self) -> &[Play] {
        &self.plays
    }
}
