//! Shared service state.
//!
//! [`AppState`] owns the store behind `Arc<tokio::sync::Mutex<>>`. A mutex
//! rather than an `RwLock` because `SqliteStore` holds a
//! `rusqlite::Connection`, which is `!Sync`. Every store call goes through
//! [`AppState::with_store`], which bounds lock wait and call with the
//! configured timeout.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use kinmerge_storage::{InMemoryStore, MergeStore, SqliteStore, StorageError};

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::lock::{AggregateKey, AggregateLocks};
use crate::notifier::{Notifier, TracingNotifier};

pub struct AppState<S> {
    pub store: Arc<Mutex<S>>,
    pub locks: Arc<AggregateLocks>,
    pub notifier: Arc<dyn Notifier>,
    pub config: Arc<ServiceConfig>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            store: self.store.clone(),
            locks: self.locks.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: MergeStore + Send> AppState<S> {
    pub fn new(store: S, config: ServiceConfig, notifier: Arc<dyn Notifier>) -> Self {
        AppState {
            store: Arc::new(Mutex::new(store)),
            locks: Arc::new(AggregateLocks::new()),
            notifier,
            config: Arc::new(config),
        }
    }

    /// Runs `f` against the store, failing with [`ServiceError::Timeout`]
    /// if the store cannot be reached and used within the timeout.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&mut S) -> Result<T, StorageError> + Send,
        T: Send,
    {
        let timeout = self.config.store_timeout;
        let call = async {
            let mut store = self.store.lock().await;
            f(&mut store)
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => {
                tracing::warn!("store call exceeded {:?}", timeout);
                Err(ServiceError::Timeout {
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Takes the per-aggregate lock for `key`.
    pub async fn lock(&self, key: AggregateKey) -> OwnedMutexGuard<()> {
        self.locks.acquire(key).await
    }
}

impl AppState<SqliteStore> {
    /// Opens the SQLite database named by `config.db_path`.
    pub fn open(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store = SqliteStore::new(&config.db_path)?;
        tracing::info!("opened kinmerge store at {}", config.db_path);
        Ok(AppState::new(store, config, Arc::new(TracingNotifier)))
    }
}

impl AppState<InMemoryStore> {
    /// In-memory state with default configuration (for testing).
    pub fn in_memory() -> Self {
        AppState::new(
            InMemoryStore::new(),
            ServiceConfig::default(),
            Arc::new(TracingNotifier),
        )
    }
}
