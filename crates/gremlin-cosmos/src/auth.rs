//! Credential providers for the SASL authentication challenge.
//!
//! A provider is consulted every time the server challenges a request, so
//! dynamic variants can rotate keys without reconnecting.

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use crate::error::{GremlinError, GremlinResult};

/// Source of the username and password used to answer a challenge.
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Username (for CosmosDB: `/dbs/<db>/colls/<graph>`).
    async fn username(&self) -> GremlinResult<String>;

    /// Password (for CosmosDB: the primary or secondary key).
    async fn password(&self) -> GremlinResult<String>;
}

/// Fixed username and password.
#[derive(Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    /// Create static credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn username(&self) -> GremlinResult<String> {
        Ok(self.username.clone())
    }

    async fn password(&self) -> GremlinResult<String> {
        Ok(self.password.clone())
    }
}

/// Credentials re-read from files on every authentication attempt.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    username_path: PathBuf,
    password_path: PathBuf,
}

impl FileCredentials {
    /// Read the username and password from two files.
    pub fn new(username_path: impl Into<PathBuf>, password_path: impl Into<PathBuf>) -> Self {
        Self {
            username_path: username_path.into(),
            password_path: password_path.into(),
        }
    }

    async fn read_trimmed(path: &PathBuf) -> GremlinResult<String> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GremlinError::auth(format!("failed to read {}: {e}", path.display()))
        })?;
        let value = content.trim();
        if value.is_empty() {
            return Err(GremlinError::auth(format!("{} is empty", path.display())));
        }
        Ok(value.to_string())
    }
}

#[async_trait]
impl CredentialProvider for FileCredentials {
    async fn username(&self) -> GremlinResult<String> {
        Self::read_trimmed(&self.username_path).await
    }

    async fn password(&self) -> GremlinResult<String> {
        Self::read_trimmed(&self.password_path).await
    }
}

type CredentialFn = dyn Fn() -> GremlinResult<(String, String)> + Send + Sync;

/// Credentials produced by a caller-supplied closure on every attempt.
#[derive(Clone)]
pub struct FnCredentials {
    source: Arc<CredentialFn>,
}

impl FnCredentials {
    /// Wrap a closure returning `(username, password)`.
    pub fn new<F>(source: F) -> Self
    where
        F: Fn() -> GremlinResult<(String, String)> + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(source),
        }
    }
}

impl fmt::Debug for FnCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCredentials").finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialProvider for FnCredentials {
    async fn username(&self) -> GremlinResult<String> {
        (self.source)().map(|(username, _)| username)
    }

    async fn password(&self) -> GremlinResult<String> {
        (self.source)().map(|(_, password)| password)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_static_credentials() {
        let creds = StaticCredentials::new("/dbs/db/colls/graph", "key");
        assert_eq!(creds.username().await.unwrap(), "/dbs/db/colls/graph");
        assert_eq!(creds.password().await.unwrap(), "key");
        assert!(!format!("{creds:?}").contains("key\""));
    }

    #[tokio::test]
    async fn test_file_credentials_reread_each_call() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user");
        let pass = dir.path().join("pass");
        std::fs::write(&user, "/dbs/db/colls/graph\n").unwrap();
        std::fs::write(&pass, "first").unwrap();

        let creds = FileCredentials::new(&user, &pass);
        assert_eq!(creds.username().await.unwrap(), "/dbs/db/colls/graph");
        assert_eq!(creds.password().await.unwrap(), "first");

        std::fs::write(&pass, "rotated").unwrap();
        assert_eq!(creds.password().await.unwrap(), "rotated");
    }

    #[tokio::test]
    async fn test_file_credentials_missing_file() {
        let creds = FileCredentials::new("/nonexistent/user", "/nonexistent/pass");
        let err = creds.username().await.unwrap_err();
        assert!(matches!(err, GremlinError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_fn_credentials_invoked_per_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let creds = FnCredentials::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(("user".to_string(), format!("key-{n}")))
        });

        assert_eq!(creds.password().await.unwrap(), "key-0");
        assert_eq!(creds.password().await.unwrap(), "key-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
