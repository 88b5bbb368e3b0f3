//! The `backup` command: archive the relay into a tarball.

use std::path::Path;
use std::time::Duration;

use escale_core::{backup, EngineError, SafetyMode};
use escale_relay::LockOptions;
use escale_types::Pseudonym;

/// Archive the configured relay's blob set into `output`.
pub async fn run(config: &Path, output: &Path, fast: bool) -> Result<(), EngineError> {
    let config = super::load_config(config)?;
    let pseudonym = Pseudonym::new(&config.client.pseudonym)
        .map_err(|e| EngineError::Config(format!("client.pseudonym: {e}")))?;
    let store = super::open_relay(&config.relay.uri).await?;

    let mode = if fast { SafetyMode::Fast } else { SafetyMode::Safe };
    let options = LockOptions {
        ttl: Duration::from_secs(config.schedule.lock_ttl_secs),
        settle: Duration::from_millis(config.schedule.lock_settle_ms),
    };
    let report = backup(store.as_ref(), output, mode, &pseudonym, &options).await?;
    println!(
        "archived {} blobs into {} ({} skipped)",
        report.copied,
        output.display(),
        report.skipped
    );
    Ok(())
}
