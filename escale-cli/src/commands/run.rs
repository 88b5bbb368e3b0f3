//! The `run` command: drive repository workers until interrupted.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use escale_core::{EngineError, Index, RepositoryWorker, SyncContext, SyncEngine, WorkerOptions};

/// Run one worker per configuration until ctrl-c.
pub async fn run(config: &Path, also: &[PathBuf]) -> Result<(), EngineError> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; shutting down");
                cancel.cancel();
            }
        });
    }

    let mut handles = Vec::new();
    let mut pidfiles = Vec::new();
    for path in std::iter::once(config).chain(also.iter().map(PathBuf::as_path)) {
        let config = super::load_config(path)?;
        let pidfile = acquire_pidfile(&config)?;
        let store = super::open_relay(&config.relay.uri).await?;
        let ctx = SyncContext::from_config(&config, store)?;
        let index = Index::load(&config.index_path()).await;
        let engine = SyncEngine::new(ctx, index, config.index_path());
        let worker = RepositoryWorker::new(
            engine,
            WorkerOptions::from_config(&config),
            cancel.child_token(),
        );
        tracing::info!(config = %path.display(), "starting repository worker");
        handles.push(worker.spawn());
        pidfiles.push(pidfile);
    }

    // Workers are isolated; one finishing early (e.g. a failed identity
    // probe) does not stop the others.
    for handle in handles {
        let _ = handle.await;
    }
    for pidfile in pidfiles {
        let _ = std::fs::remove_file(pidfile);
    }
    Ok(())
}

/// Take the per-repository process lockfile so two daemons never drive
/// the same repository.
fn acquire_pidfile(config: &escale_core::RepositoryConfig) -> Result<PathBuf, EngineError> {
    let path = config
        .index_path()
        .with_file_name("escale.pid");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::LocalIo {
            context: "creating state directory".into(),
            source: e,
        })?;
    }
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => {
            use std::io::Write;
            let mut file = file;
            let _ = writeln!(file, "{}", std::process::id());
            Ok(path)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(EngineError::Config(format!(
                "another escale process is driving this repository (pidfile {})",
                path.display()
            )))
        }
        Err(e) => Err(EngineError::LocalIo {
            context: format!("creating pidfile {}", path.display()),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> escale_core::RepositoryConfig {
        let toml = format!(
            r#"
[relay]
uri = "mem:"

[local]
root = "{}"

[client]
pseudonym = "tester"
"#,
            dir.display()
        );
        let path = dir.join("escale.toml");
        std::fs::write(&path, toml).unwrap();
        super::super::load_config(&path).unwrap()
    }

    #[test]
    fn pidfile_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let pidfile = acquire_pidfile(&config).unwrap();
        assert!(pidfile.is_file());

        let second = acquire_pidfile(&config);
        assert!(matches!(second, Err(EngineError::Config(_))));

        std::fs::remove_file(&pidfile).unwrap();
        acquire_pidfile(&config).unwrap();
    }
}
