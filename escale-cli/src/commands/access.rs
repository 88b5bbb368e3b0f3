//! The `access` command: read or edit per-path rights, grant gates.

use std::path::Path;

use escale_core::{grant_access, set_access, EngineError, Index};
use escale_relay::Naming;
use escale_types::{AccessRights, LogicalPath, Pseudonym};

/// Read rights, set rights, or grant a pending gated request.
pub async fn run(
    config: &Path,
    path: &str,
    set: Option<&str>,
    grant: Option<&str>,
) -> Result<(), EngineError> {
    let config = super::load_config(config)?;
    let path = LogicalPath::new(path)
        .map_err(|e| EngineError::Config(format!("invalid path: {e}")))?;
    let pseudonym = Pseudonym::new(&config.client.pseudonym)
        .map_err(|e| EngineError::Config(format!("client.pseudonym: {e}")))?;
    let naming = Naming::new(config.relay.max_name_len);
    let store = super::open_relay(&config.relay.uri).await?;
    let mut index = Index::load(&config.index_path()).await;

    if let Some(peer) = grant {
        let peer = Pseudonym::new(peer)
            .map_err(|e| EngineError::Config(format!("invalid peer pseudonym: {e}")))?;
        grant_access(store.as_ref(), &naming, &pseudonym, &path, &peer).await?;
        println!("granted {path} to {peer}");
        return Ok(());
    }

    if let Some(rights) = set {
        let rights = AccessRights::parse(rights)
            .map_err(|e| EngineError::Config(format!("invalid access modifier: {e}")))?;
        let notified = set_access(
            store.as_ref(),
            &naming,
            &mut index,
            &config.index_path(),
            &pseudonym,
            &path,
            rights,
        )
        .await?;
        println!("{path}  {rights}  ({notified} peers notified)");
        return Ok(());
    }

    let rights = index
        .entry(&path)
        .map(|e| e.rights)
        .unwrap_or_default();
    println!("{path}  {rights}");
    Ok(())
}
