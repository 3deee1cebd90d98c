//! Backend dispatch loop
//!
//! A [`Backend`] owns one cache, one action queue and one remote service.
//! Its dispatch loop drains the queue in FIFO order and decides, per
//! message, which service call brings the remote side in line:
//!
//! - **Store / Move / Rename**: a file whose local identity is already
//!   cached is moved remotely, trashing the file it lands on; otherwise it
//!   is uploaded (directories are created as folders)
//! - **Update**: the content of the cached remote file is replaced
//! - **Trash**: the cached remote file is trashed and forgotten
//!
//! ## Retry Logic
//!
//! Transient service errors (network, rate limiting, server errors) are
//! retried with exponential backoff. Any other failure is logged and the
//! message is dropped.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use backupd_core::config::DispatchConfig;
use backupd_core::domain::{Action, LocalIdentity, Message, RemoteFileRecord, RemoteId, RemotePath};
use backupd_core::ports::{IFileCache, IRemoteService, RemoteMetadata};

use crate::queue::ActionQueue;

// ============================================================================
// Retry logic
// ============================================================================

/// How often and how long to retry transient service errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further retry
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Policy without any retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

/// Determines whether an error is transient (retryable)
///
/// Transient errors include:
/// - Network errors (connection refused, timeout, DNS)
/// - Rate limiting (HTTP 429)
/// - Server errors (HTTP 5xx)
///
/// Only the innermost error is inspected. Context layers carry file names
/// and must not influence the decision.
fn is_transient_error(err: &anyhow::Error) -> bool {
    if let Some(io) = err.chain().find_map(|e| e.downcast_ref::<std::io::Error>()) {
        return matches!(
            io.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
        );
    }

    let root = err.root_cause().to_string().to_lowercase();

    let network = ["network", "connection", "timed out", "timeout", "dns", "reset by peer", "broken pipe"];
    let throttled = ["too many requests", "rate limit"];
    let server = ["server error", "service unavailable", "bad gateway", "gateway timeout"];
    let statuses = ["429", "500", "502", "503", "504"];

    let phrase = network
        .iter()
        .chain(throttled.iter())
        .chain(server.iter())
        .any(|needle| root.contains(needle));
    let status = root
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| statuses.contains(&word));

    phrase || status
}

/// Executes an async operation, retrying transient errors with backoff
///
/// Non-transient errors are returned immediately.
async fn with_retry<F, Fut, T>(policy: RetryPolicy, operation_name: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries && is_transient_error(&err) => {
                let delay = policy.base_delay * 2u32.saturating_pow(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

/// One configured remote destination with its cache, queue and service
pub struct Backend {
    name: String,
    queue: ActionQueue,
    cache: Arc<dyn IFileCache>,
    service: Arc<dyn IRemoteService>,
    retry: RetryPolicy,
}

impl Backend {
    /// Creates a backend with an empty queue
    pub fn new(
        name: impl Into<String>,
        cache: Arc<dyn IFileCache>,
        service: Arc<dyn IRemoteService>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            queue: ActionQueue::new(),
            cache,
            service,
            retry,
        }
    }

    /// Name of the backend in the configuration
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue the destinations of this backend feed
    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    /// Cache of this backend
    pub fn cache(&self) -> &Arc<dyn IFileCache> {
        &self.cache
    }

    /// Runs the dispatch loop until `cancel` is triggered
    ///
    /// A message being dispatched when the token fires is completed first;
    /// messages still queued are abandoned.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(backend = %self.name, "Dispatch loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = self.queue.get() => self.dispatch(message).await,
            }
        }

        info!(
            backend = %self.name,
            pending = self.queue.len(),
            "Dispatch loop stopped"
        );
    }

    /// Applies one message; failures are logged and the message is dropped
    #[instrument(
        skip(self, message),
        fields(
            backend = %self.name,
            action = %message.action(),
            path = %message.local_path().display()
        )
    )]
    pub async fn dispatch(&self, message: Message) {
        let result = match message.action() {
            Action::Store | Action::Move | Action::Rename => self.store(&message).await,
            Action::Update => self.update(&message).await,
            Action::Trash => self.trash(&message).await,
        };

        if let Err(e) = result {
            error!(
                remote_path = %message.remote_path(),
                error = %format!("{e:#}"),
                "Dropping message after failure"
            );
        }
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    async fn store(&self, message: &Message) -> Result<()> {
        let local = message.local_path();
        let remote = message.remote_path();

        let Some(identity) = identify(local)? else {
            return Ok(());
        };
        let metadata = tokio::fs::metadata(local)
            .await
            .with_context(|| format!("Cannot stat {}", local.display()))?;
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        let (name, parent_path) = split(remote)?;

        // Already uploaded from this very file: move it
        if let Some(existing) = self.cache.find_by_local_id(&identity).await? {
            let current = self.cache.paths_of(&existing.remote_id).await?;
            if current.iter().any(|p| p == remote.as_str()) {
                debug!(remote_id = %existing.remote_id, "Already stored at this path");
                return Ok(());
            }

            // A rename onto an existing file replaces it
            let displaced = self
                .cache
                .find_by_path(remote)
                .await?
                .filter(|r| r.remote_id != existing.remote_id);

            let parent_id = self
                .ensure_folder(&parent_path, local.parent(), message.local_root())
                .await?;
            let mut target = RemoteMetadata::new(name, parent_id).with_local_id(identity.id());
            target.modified = modified;

            let (remote_id, target) = (&existing.remote_id, &target);
            let moved = with_retry(self.retry, "move_file", || async move {
                self.service.move_file(remote_id, target).await
            })
            .await?;
            self.remember(moved, &identity).await?;
            info!(remote_id = %existing.remote_id, to = %remote, "Moved remote file");

            if let Some(displaced) = displaced {
                self.retire(&displaced).await?;
            }
            return Ok(());
        }

        // Same path, different file (e.g. replaced by an editor): new content
        if let Some(existing) = self.cache.find_by_path(remote).await? {
            if !existing.is_folder() && metadata.is_file() {
                return self.replace_content(local, &existing, &identity).await;
            }
            if existing.is_folder() && metadata.is_dir() {
                let mut adopted = existing;
                adopted.local_id = Some(identity.id());
                self.cache.insert_or_update(&adopted).await?;
                return Ok(());
            }
        }

        let parent_id = self
            .ensure_folder(&parent_path, local.parent(), message.local_root())
            .await?;
        let mut target = RemoteMetadata::new(name, parent_id).with_local_id(identity.id());

        if metadata.is_dir() {
            let target = &target;
            let created = with_retry(self.retry, "create_folder", || async move {
                self.service.create_folder(target).await
            })
            .await?;
            info!(remote_id = %created.remote_id, path = %remote, "Created remote folder");
            self.remember(created, &identity).await?;
        } else {
            target.modified = modified;
            let target = &target;
            let uploaded = with_retry(self.retry, "upload", || async move {
                self.service.upload(local, target).await
            })
            .await?;
            info!(remote_id = %uploaded.remote_id, path = %remote, size = uploaded.size, "Uploaded file");
            self.remember(uploaded, &identity).await?;
        }

        Ok(())
    }

    async fn update(&self, message: &Message) -> Result<()> {
        let local = message.local_path();

        let Some(existing) = self.cache.find_by_path(message.remote_path()).await? else {
            debug!("Not cached yet, storing instead");
            return self.store(message).await;
        };
        if existing.is_folder() {
            debug!(remote_id = %existing.remote_id, "Ignoring change notification for a folder");
            return Ok(());
        }
        let Some(identity) = identify(local)? else {
            return Ok(());
        };

        self.replace_content(local, &existing, &identity).await
    }

    async fn trash(&self, message: &Message) -> Result<()> {
        let Some(existing) = self.cache.find_by_path(message.remote_path()).await? else {
            debug!("Not cached, nothing to trash");
            return Ok(());
        };

        let remote_id = &existing.remote_id;
        with_retry(self.retry, "trash", || async move { self.service.trash(remote_id).await })
            .await?;
        let forgotten = self.cache.remove(&existing.remote_id).await?;

        info!(
            remote_id = %existing.remote_id,
            forgotten,
            "Trashed remote file"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Trashes a record overwritten by a move and forgets it
    async fn retire(&self, displaced: &RemoteFileRecord) -> Result<()> {
        let remote_id = &displaced.remote_id;
        if let Err(e) =
            with_retry(self.retry, "trash", || async move { self.service.trash(remote_id).await }).await
        {
            warn!(
                remote_id = %remote_id,
                error = %format!("{e:#}"),
                "Cannot trash overwritten remote file"
            );
        }
        let forgotten = self.cache.remove(remote_id).await?;
        info!(remote_id = %remote_id, forgotten, "Retired overwritten remote file");
        Ok(())
    }

    async fn replace_content(
        &self,
        local: &Path,
        existing: &RemoteFileRecord,
        identity: &LocalIdentity,
    ) -> Result<()> {
        let remote_id = &existing.remote_id;
        let updated = with_retry(self.retry, "update_content", || async move {
            self.service.update_content(local, remote_id).await
        })
        .await?;

        info!(remote_id = %updated.remote_id, size = updated.size, "Updated remote content");
        self.remember(updated, identity).await
    }

    /// Caches a record returned by the service, tagged with `identity`
    async fn remember(&self, mut record: RemoteFileRecord, identity: &LocalIdentity) -> Result<()> {
        record.local_id = Some(identity.id());
        self.cache
            .insert_or_update(&record)
            .await
            .with_context(|| format!("Failed to cache remote record {}", record.remote_id))?;
        Ok(())
    }

    /// Returns the id of the folder at `path`, creating missing folders
    ///
    /// `None` stands for the remote root. `local_dir` is the local directory
    /// mirrored by `path`; created folders are tagged with the identity of
    /// the matching local directory so a later rename can be detected.
    /// Tagging stops at `local_root`: folders above the destination folder
    /// mirror nothing.
    async fn ensure_folder(
        &self,
        path: &RemotePath,
        local_dir: Option<&Path>,
        local_root: Option<&Path>,
    ) -> Result<Option<RemoteId>> {
        let mut missing = Vec::new();
        let mut current = path.clone();
        let mut current_local = local_dir.filter(|dir| within(dir, local_root));
        let mut parent_id = None;

        while !current.is_root() {
            if let Some(found) = self.cache.find_by_path(&current).await? {
                parent_id = Some(found.remote_id);
                break;
            }
            let next = current.parent().unwrap_or_else(RemotePath::root);
            missing.push((current, current_local));
            current = next;
            current_local = current_local
                .and_then(Path::parent)
                .filter(|dir| within(dir, local_root));
        }

        for (folder, folder_local) in missing.into_iter().rev() {
            let name = folder.file_name().unwrap_or_default();
            let mut target = RemoteMetadata::new(name, parent_id.clone());
            target.local_id = folder_local
                .and_then(|dir| LocalIdentity::identify(dir).ok())
                .map(|identity| identity.id());

            let target = &target;
            let created = with_retry(self.retry, "create_folder", || async move {
                self.service.create_folder(target).await
            })
            .await?;
            self.cache.insert_or_update(&created).await?;

            info!(remote_id = %created.remote_id, path = %folder, "Created remote folder");
            parent_id = Some(created.remote_id);
        }

        Ok(parent_id)
    }
}

/// Identifies a local file; `None` if it vanished in the meantime
fn identify(local: &Path) -> Result<Option<LocalIdentity>> {
    match LocalIdentity::identify(local) {
        Ok(identity) => Ok(Some(identity)),
        Err(e) if e.is_not_found() => {
            debug!(path = %local.display(), "File vanished before dispatch");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Returns true if `dir` is `root` or below it; anything goes without a root
fn within(dir: &Path, root: Option<&Path>) -> bool {
    root.map_or(true, |root| dir.starts_with(root))
}

/// Splits a remote path into its name and parent folder path
fn split(remote: &RemotePath) -> Result<(&str, RemotePath)> {
    let name = remote
        .file_name()
        .with_context(|| format!("Cannot store at the remote root: {remote}"))?;
    let parent = remote.parent().unwrap_or_else(RemotePath::root);
    Ok((name, parent))
}
