use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use constant_time_eq::constant_time_eq;
use tokio::sync::OnceCell;
use zeroize::Zeroizing;

use crate::error::ParameterError;

/// Source of named secret parameters.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get_parameter(&self, name: &str) -> Result<Zeroizing<String>, ParameterError>;
}

/// Parameters stored as files below a root directory, one file per name.
/// A leading `/` in the name is ignored, so `/replix/api-key` resolves to
/// `<root>/replix/api-key`.
#[derive(Debug, Clone)]
pub struct FileParameterStore {
    root: PathBuf,
}

impl FileParameterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ParameterError> {
        let relative = Path::new(name.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || relative.as_os_str().is_empty() {
            return Err(ParameterError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ParameterStore for FileParameterStore {
    async fn get_parameter(&self, name: &str) -> Result<Zeroizing<String>, ParameterError> {
        let path = self.path_for(name)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ParameterError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(source) => {
                return Err(ParameterError::Io {
                    name: name.to_string(),
                    path,
                    source,
                });
            }
        };
        non_empty(name, contents.trim())
    }
}

/// Parameters read from environment variables. The name is upper-cased and
/// every non-alphanumeric character becomes `_`, so `/replix/api-key` is read
/// from `REPLIX_API_KEY`.
#[derive(Debug, Clone, Default)]
pub struct EnvParameterStore;

impl EnvParameterStore {
    pub fn variable_for(name: &str) -> String {
        name.trim_start_matches('/')
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[async_trait]
impl ParameterStore for EnvParameterStore {
    async fn get_parameter(&self, name: &str) -> Result<Zeroizing<String>, ParameterError> {
        let value = std::env::var(Self::variable_for(name)).map_err(|_| {
            ParameterError::NotFound {
                name: name.to_string(),
            }
        })?;
        let value = Zeroizing::new(value);
        non_empty(name, value.trim())
    }
}

/// Fixed parameters, counting how often they are fetched.
#[derive(Default)]
pub struct InMemoryParameterStore {
    values: HashMap<String, Zeroizing<String>>,
    fetches: AtomicUsize,
}

impl InMemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), Zeroizing::new(value.into()));
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for InMemoryParameterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryParameterStore")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

#[async_trait]
impl ParameterStore for InMemoryParameterStore {
    async fn get_parameter(&self, name: &str) -> Result<Zeroizing<String>, ParameterError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let value = self.values.get(name).ok_or_else(|| ParameterError::NotFound {
            name: name.to_string(),
        })?;
        non_empty(name, value.as_str())
    }
}

fn non_empty(name: &str, value: &str) -> Result<Zeroizing<String>, ParameterError> {
    if value.is_empty() {
        return Err(ParameterError::Empty {
            name: name.to_string(),
        });
    }
    Ok(Zeroizing::new(value.to_string()))
}

/// The expected API key, fetched from the parameter store on first use and
/// cached for the life of the handle. A failed fetch is not cached.
pub struct ApiKeyHandle {
    store: Arc<dyn ParameterStore>,
    parameter_name: String,
    cached: OnceCell<Zeroizing<String>>,
}

impl ApiKeyHandle {
    pub fn new(store: Arc<dyn ParameterStore>, parameter_name: impl Into<String>) -> Self {
        Self {
            store,
            parameter_name: parameter_name.into(),
            cached: OnceCell::new(),
        }
    }

    pub fn parameter_name(&self) -> &str {
        &self.parameter_name
    }

    pub async fn expected(&self) -> Result<&str, ParameterError> {
        let key = self
            .cached
            .get_or_try_init(|| self.store.get_parameter(&self.parameter_name))
            .await?;
        Ok(key.as_str())
    }

    /// Compares `provided` against the expected key in constant time.
    pub async fn verify(&self, provided: &str) -> Result<bool, ParameterError> {
        let expected = self.expected().await?;
        Ok(constant_time_eq(provided.as_bytes(), expected.as_bytes()))
    }
}

impl fmt::Debug for ApiKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyHandle")
            .field("parameter_name", &self.parameter_name)
            .field("cached", &self.cached.initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetches_once_and_compares() {
        let store = Arc::new(
            InMemoryParameterStore::new().with_parameter("/replix/api-key", "secret-key"),
        );
        let handle = ApiKeyHandle::new(store.clone(), "/replix/api-key");

        assert!(handle.verify("secret-key").await.unwrap());
        assert!(!handle.verify("secret-kez").await.unwrap());
        assert!(!handle.verify("").await.unwrap());
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_retried_next_time() {
        let store = Arc::new(InMemoryParameterStore::new());
        let handle = ApiKeyHandle::new(store.clone(), "/missing");

        assert!(matches!(
            handle.verify("x").await,
            Err(ParameterError::NotFound { .. })
        ));
        assert!(handle.verify("x").await.is_err());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn file_store_reads_trimmed_value() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("replix")).unwrap();
        std::fs::write(dir.path().join("replix/api-key"), "abc123\n").unwrap();

        let store = FileParameterStore::new(dir.path());
        let value = store.get_parameter("/replix/api-key").await.unwrap();
        assert_eq!(value.as_str(), "abc123");

        assert!(matches!(
            store.get_parameter("/replix/other").await,
            Err(ParameterError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_parameter("../etc/passwd").await,
            Err(ParameterError::NotFound { .. })
        ));
    }

    #[test]
    fn env_variable_names() {
        assert_eq!(EnvParameterStore::variable_for("/replix/api-key"), "REPLIX_API_KEY");
        assert_eq!(EnvParameterStore::variable_for("API_KEY"), "API_KEY");
    }
}
