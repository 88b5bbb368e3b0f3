//! The `migrate` command: copy the relay repository to another relay.

use std::path::Path;
use std::time::Duration;

use escale_core::{migrate, EngineError, SafetyMode};
use escale_relay::LockOptions;
use escale_types::Pseudonym;

/// Copy every blob from the configured relay to `dest`.
pub async fn run(config: &Path, dest: &str, fast: bool) -> Result<(), EngineError> {
    let config = super::load_config(config)?;
    let pseudonym = Pseudonym::new(&config.client.pseudonym)
        .map_err(|e| EngineError::Config(format!("client.pseudonym: {e}")))?;
    let src = super::open_relay(&config.relay.uri).await?;
    let dst = super::open_relay(dest).await?;

    let mode = if fast { SafetyMode::Fast } else { SafetyMode::Safe };
    let options = LockOptions {
        ttl: Duration::from_secs(config.schedule.lock_ttl_secs),
        settle: Duration::from_millis(config.schedule.lock_settle_ms),
    };
    let report = migrate(src.as_ref(), dst.as_ref(), mode, &pseudonym, &options).await?;
    println!(
        "migrated {} blobs to {dest} ({} skipped)",
        report.copied, report.skipped
    );
    Ok(())
}
