//! Local dependency probe.

use std::path::PathBuf;

use tokio::net::UnixStream;

use super::{DependencyProbe, NetworkError};

/// Ready when a connection to a Unix socket succeeds.
///
/// Without a path there is nothing to wait for and the probe is always ready.
#[derive(Debug, Clone, Default)]
pub struct UnixSocketProbe {
    path: Option<PathBuf>,
}

impl UnixSocketProbe {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

impl DependencyProbe for UnixSocketProbe {
    async fn check(&self) -> Result<(), NetworkError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match UnixStream::connect(path).await {
            Ok(_stream) => Ok(()),
            Err(e) => Err(NetworkError::DependencyUnavailable(format!(
                "{}: {e}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_no_path_is_always_ready() {
        assert!(UnixSocketProbe::default().check().await.is_ok());
    }

    #[tokio::test]
    async fn test_ready_once_socket_listens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dep.sock");
        let probe = UnixSocketProbe::new(Some(path.clone()));

        assert!(matches!(
            probe.check().await,
            Err(NetworkError::DependencyUnavailable(_))
        ));

        let _listener = UnixListener::bind(&path).unwrap();
        assert!(probe.check().await.is_ok());
    }
}
