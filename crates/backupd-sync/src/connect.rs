//! Wiring from configuration
//!
//! [`connect`] turns a validated [`Config`] into running parts: one
//! [`Backend`] per configured backend (its cache opened and, when empty,
//! bootstrapped from a full remote listing) and one [`Destination`] per
//! source. Services are built through a [`ServiceRegistry`] keyed by the
//! backend's `type` tag.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, instrument};

use backupd_cache::{DatabasePool, SqliteFileCache};
use backupd_core::config::{BackendConfig, Config};
use backupd_core::ports::{IFileCache, IRemoteService};

use crate::backend::{Backend, RetryPolicy};
use crate::destination::Destination;
use crate::folder::FolderService;
use crate::SyncError;

/// What a service factory gets to build a service from
pub struct ServiceContext<'a> {
    /// Name of the backend in the configuration
    pub backend_name: &'a str,
    /// The backend's configuration block
    pub config: &'a BackendConfig,
    /// Directory holding the configuration file
    pub config_dir: &'a Path,
    /// Directory holding caches and other state
    pub data_dir: &'a Path,
}

/// Constructor of a remote service for one backend type
pub type ServiceFactory =
    Arc<dyn Fn(&ServiceContext<'_>) -> Result<Arc<dyn IRemoteService>> + Send + Sync>;

/// Backend type tag → service constructor
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in service types
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("folder", Arc::new(folder_service));
        registry
    }

    /// Registers (or replaces) the factory for `kind`
    pub fn register(&mut self, kind: impl Into<String>, factory: ServiceFactory) {
        self.factories.insert(kind.into(), factory);
    }

    /// Returns true if a factory is registered for `kind`
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Builds the service for a backend
    ///
    /// # Errors
    /// Returns `SyncError::UnknownBackendType` if no factory is registered
    /// for the backend's type, or the factory's own error
    pub fn create(&self, ctx: &ServiceContext<'_>) -> Result<Arc<dyn IRemoteService>> {
        let factory = self
            .factories
            .get(&ctx.config.kind)
            .ok_or_else(|| SyncError::UnknownBackendType {
                backend: ctx.backend_name.to_string(),
                kind: ctx.config.kind.clone(),
            })?;
        factory(ctx).with_context(|| format!("Cannot create service for backend '{}'", ctx.backend_name))
    }
}

fn folder_service(ctx: &ServiceContext<'_>) -> Result<Arc<dyn IRemoteService>> {
    let root = ctx.config.parameter("root", "");
    if root.is_empty() {
        bail!("Backend '{}' needs a 'root' parameter", ctx.backend_name);
    }

    let root = PathBuf::from(root);
    let root = if root.is_relative() {
        ctx.config_dir.join(root)
    } else {
        root
    };

    Ok(Arc::new(FolderService::new(root)))
}

/// Everything [`connect`] built
pub struct Connection {
    /// Backends by configured name
    pub backends: BTreeMap<String, Arc<Backend>>,
    /// One destination per configured source, in configuration order
    pub destinations: Vec<Arc<Destination>>,
}

/// Builds backends and destinations from `config`
///
/// Caches live in `<data_dir>/<backend>.db`. Empty caches are bootstrapped
/// before this returns, so no dispatch loop can run concurrently with a
/// bootstrap.
///
/// # Errors
/// Fails on the first backend whose service, cache or bootstrap fails, and
/// on any source referring to an unconfigured backend
#[instrument(skip_all, fields(backends = config.backends.len(), sources = config.sources.len()))]
pub async fn connect(
    config: &Config,
    config_dir: &Path,
    data_dir: &Path,
    registry: &ServiceRegistry,
) -> Result<Connection> {
    let lock_timeout = Duration::from_millis(config.cache.lock_timeout_ms);
    let retry = RetryPolicy::from(&config.dispatch);
    let mut backends = BTreeMap::new();

    for (name, backend_config) in &config.backends {
        let service = registry.create(&ServiceContext {
            backend_name: name,
            config: backend_config,
            config_dir,
            data_dir,
        })?;

        let db_path = data_dir.join(format!("{name}.db"));
        let pool = DatabasePool::open(&db_path, lock_timeout)
            .await
            .map_err(SyncError::from)
            .with_context(|| format!("Cannot open cache for backend '{name}'"))?;
        let cache: Arc<dyn IFileCache> = Arc::new(SqliteFileCache::new(pool));

        if let Some(count) = bootstrap(cache.as_ref(), service.as_ref())
            .await
            .with_context(|| format!("Bootstrap of backend '{name}' failed"))?
        {
            info!(backend = %name, records = count, "Cache bootstrapped");
        } else {
            info!(backend = %name, path = %db_path.display(), "Cache loaded");
        }

        backends.insert(
            name.clone(),
            Arc::new(Backend::new(name.clone(), cache, service, retry)),
        );
    }

    let mut destinations = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let target = &source.destination;
        let backend = backends
            .get(&target.backend)
            .cloned()
            .ok_or_else(|| SyncError::UnknownBackend(target.backend.clone()))?;

        let destination = Destination::new(backend, source.path.clone(), &target.folder, target.encrypt)
            .map_err(SyncError::from)?;
        info!(
            local = %source.path.display(),
            backend = %target.backend,
            remote = %destination.remote_root(),
            encrypt = destination.encrypt(),
            "Destination ready"
        );
        destinations.push(Arc::new(destination));
    }

    Ok(Connection {
        backends,
        destinations,
    })
}

/// Populates `cache` from a full remote listing if it was never populated
///
/// Returns the number of records inserted, or `None` if the cache already
/// held data.
///
/// # Errors
/// Fails if the listing cannot be started or yields an error; the cache is
/// then left empty
pub async fn bootstrap(cache: &dyn IFileCache, service: &dyn IRemoteService) -> Result<Option<usize>> {
    if !cache.is_empty().await? {
        return Ok(None);
    }

    let started = Instant::now();
    info!("Cache is empty, loading remote listing");
    let listing = service.load_files().await.context("Cannot list remote files")?;
    let count = cache.bootstrap(listing).await?;

    info!(
        records = count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Remote listing cached"
    );
    Ok(Some(count))
}
