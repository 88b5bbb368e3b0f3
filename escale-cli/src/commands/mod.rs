//! Command implementations.

pub mod access;
pub mod backup;
pub mod migrate;
pub mod restore;
pub mod run;
pub mod status;

use std::path::Path;
use std::sync::Arc;

use escale_core::{ConfigError, EngineError, RepositoryConfig};
use escale_relay::{DirRelay, MemoryRelay, RelayStore};

/// Load and validate the repository configuration.
pub(crate) fn load_config(path: &Path) -> Result<RepositoryConfig, EngineError> {
    RepositoryConfig::from_file(path).map_err(|e| match e {
        ConfigError::Read { .. } | ConfigError::Parse { .. } | ConfigError::Invalid(_) => {
            EngineError::Config(e.to_string())
        }
    })
}

/// Open a relay adapter from a backend URI.
///
/// `file://<path>` opens a local directory; `mem:` is an in-process
/// store for demos and tests. Network backends (FTP, WebDAV, object
/// stores) are external plug-ins behind the same contract.
pub(crate) async fn open_relay(uri: &str) -> Result<Arc<dyn RelayStore>, EngineError> {
    if let Some(path) = uri.strip_prefix("file://") {
        let relay = DirRelay::open(path).await?;
        return Ok(Arc::new(relay));
    }
    if uri == "mem:" {
        return Ok(Arc::new(MemoryRelay::new()));
    }
    Err(EngineError::Config(format!(
        "unsupported relay URI {uri:?} (expected file://<path> or mem:)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_uri_opens_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().display());
        let relay = open_relay(&uri).await.unwrap();
        assert!(relay.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_scheme_is_a_config_error() {
        let result = open_relay("ftp://host/path").await;
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
