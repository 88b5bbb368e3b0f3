//! The `restore` command: unpack a backup archive onto the relay.

use std::path::Path;
use std::time::Duration;

use escale_core::{restore, EngineError, SafetyMode};
use escale_relay::LockOptions;
use escale_types::Pseudonym;

/// Unpack `input` onto the configured relay.
pub async fn run(config: &Path, input: &Path, fast: bool) -> Result<(), EngineError> {
    let config = super::load_config(config)?;
    let pseudonym = Pseudonym::new(&config.client.pseudonym)
        .map_err(|e| EngineError::Config(format!("client.pseudonym: {e}")))?;
    let store = super::open_relay(&config.relay.uri).await?;

    let mode = if fast { SafetyMode::Fast } else { SafetyMode::Safe };
    let options = LockOptions {
        ttl: Duration::from_secs(config.schedule.lock_ttl_secs),
        settle: Duration::from_millis(config.schedule.lock_settle_ms),
    };
    let report = restore(store.as_ref(), input, mode, &pseudonym, &options).await?;
    println!(
        "restored {} blobs from {} ({} skipped)",
        report.copied,
        input.display(),
        report.skipped
    );
    Ok(())
}
