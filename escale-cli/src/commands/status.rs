//! The `status` command: report the local index state.

use std::path::Path;

use escale_core::{EngineError, Index};

/// Print a summary of what the index knows about this repository.
pub async fn run(config: &Path) -> Result<(), EngineError> {
    let config = super::load_config(config)?;
    let index = Index::load(&config.index_path()).await;

    println!("repository:  {}", config.local.root.display());
    println!("relay:       {}", config.relay.uri);
    println!("pseudonym:   {}", config.client.pseudonym);
    match index.last_full_scan {
        Some(secs) => println!("last scan:   {secs} (unix)"),
        None => println!("last scan:   never"),
    }
    println!("known paths: {}", index.entries.len());

    let present = index.entries.values().filter(|e| e.hash.is_some()).count();
    let deleted = index.entries.len() - present;
    println!("  present:   {present}");
    println!("  deleted:   {deleted}");

    let gated = index
        .entries
        .iter()
        .filter(|(_, e)| e.rights != escale_types::AccessRights::allow_all())
        .count();
    if gated > 0 {
        println!("  restricted: {gated}");
        for (path, entry) in &index.entries {
            if entry.rights != escale_types::AccessRights::allow_all() {
                println!("    {path}  {}", entry.rights);
            }
        }
    }
    Ok(())
}
