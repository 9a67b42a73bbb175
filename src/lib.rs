pub mod cli;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod modules;
pub mod options;
pub mod playbook;
pub mod selector;
pub mod testing;
pub mod vars;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::cli::LocalArgs;
use crate::executor::{run_plays, PlayRecap, TaskQueueManager};
use crate::inventory::{build_inventory, inventory_groups};
use crate::playbook::Playbook;
use crate::selector::{select_plays, PlaySelection};
use crate::vars::VariableManager;

/// Run the plays selected by `args` against localhost.
///
/// Returns one recap per play that ran, in playbook order. Plays whose
/// targets are outside the `--groups` and `--hosts` groups find no host and
/// come back with an empty recap.
pub fn run(args: &LocalArgs) -> Result<Vec<PlayRecap>> {
    info!("Starting rustsible-local with playbook {}", args.playbook.display());
    let options = args.options();
    let basedir = args.playbook_basedir();

    let groups = inventory_groups(&args.groups, &args.hosts);
    let inventory = build_inventory(&groups, &basedir).context("Failed to build inventory")?;

    let playbook = Playbook::load(&args.playbook)
        .with_context(|| format!("Failed to load playbook {}", args.playbook.display()))?;

    let selection = PlaySelection::new(args.plays.clone(), args.hosts.clone(), args.roles.clone());
    let plays = select_plays(playbook.get_plays(), &selection);
    if plays.is_empty() {
        warn!("No plays matched the selection; nothing to run");
        return Ok(Vec::new());
    }

    let mut variable_manager = VariableManager::with_defaults(&playbook.basedir, &basedir, &options);
    variable_manager.set_extra_vars(&args.extra_vars)?;

    let tqm = TaskQueueManager::new(options, inventory, variable_manager)?;
    run_plays(&tqm, &plays)
}
