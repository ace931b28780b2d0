//! Script plugin loading.
//!
//! A script source is a remote piece of code that, once evaluated, publishes
//! a `get<Platform>Url(songId)` function.  [`ScriptPluginLoader`] runs one
//! complete cycle per call:
//!
//! ```text
//!   fetch code ─► host.inject ─► host.has_capability ─► host.invoke
//!                     │                                      │
//!                     └──────────── InjectedScript drop ◄────┘  (host.remove)
//! ```
//!
//! The injected script is detached on every exit path because removal lives
//! in a drop guard.  Only one cycle may own the host at a time; see
//! [`ExclusionPolicy`].

#[cfg(feature = "js")]
pub mod js;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use songfall_proto::config::ExclusionPolicy;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ResolveError, ScriptError};

/// Code fetched from a script source.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    pub url: String,
    pub code: String,
}

/// Proof that a script is attached to a host.  Not `Clone`, so exactly one
/// owner is responsible for calling [`ScriptHost::remove`].
#[derive(Debug, PartialEq, Eq)]
pub struct ScriptHandle {
    id: u64,
    url: String,
}

impl ScriptHandle {
    pub fn new(id: u64, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// The execution environment scripts are injected into.
///
/// Implementations that share one global namespace between scripts rely on
/// the loader's exclusion lock; implementations may also scope globals to the
/// handle.  If a caller stops waiting on `inject`, the host must not leave the
/// script attached.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Evaluate the script.  Fails when the code does not load.
    async fn inject(&self, script: ScriptSource) -> Result<ScriptHandle, ScriptError>;

    async fn has_capability(&self, handle: &ScriptHandle, name: &str) -> bool;

    /// Call the capability with `song_id` and wait for it to settle.
    /// `Ok(None)` means it returned something that is not a URL.
    async fn invoke(
        &self,
        handle: &ScriptHandle,
        name: &str,
        song_id: &str,
    ) -> Result<Option<String>, ScriptError>;

    /// Detach the script.  Synchronous so it can run from `Drop`.
    fn remove(&self, handle: &ScriptHandle);

    /// Number of scripts currently attached.
    fn attached(&self) -> usize;
}

/// Scoped attachment: removes the script from the host when dropped.
struct InjectedScript<'a> {
    host: &'a dyn ScriptHost,
    handle: ScriptHandle,
}

impl<'a> InjectedScript<'a> {
    fn new(host: &'a dyn ScriptHost, handle: ScriptHandle) -> Self {
        Self { host, handle }
    }

    fn handle(&self) -> &ScriptHandle {
        &self.handle
    }
}

impl Drop for InjectedScript<'_> {
    fn drop(&mut self) {
        debug!(
            "plugin: removing script {} ({})",
            self.handle.id(),
            self.handle.url()
        );
        self.host.remove(&self.handle);
    }
}

/// Loads script plugins one at a time and calls their capability.
pub struct ScriptPluginLoader {
    client: reqwest::Client,
    host: Arc<dyn ScriptHost>,
    slot: Mutex<()>,
    policy: ExclusionPolicy,
    timeout: Duration,
}

impl ScriptPluginLoader {
    pub fn new(
        client: reqwest::Client,
        host: Arc<dyn ScriptHost>,
        policy: ExclusionPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            host,
            slot: Mutex::new(()),
            policy,
            timeout,
        }
    }

    /// Fetch the script at `url`, inject it, call `capability(song_id)` and
    /// return the URL it resolves to.
    pub async fn load(
        &self,
        url: &str,
        capability: &str,
        song_id: &str,
    ) -> Result<String, ResolveError> {
        let _slot = match self.policy {
            ExclusionPolicy::Queue => self.slot.lock().await,
            ExclusionPolicy::FailFast => self.slot.try_lock().map_err(|_| {
                warn!("plugin: namespace busy, refusing load of {}", url);
                ResolveError::PluginLoad("another plugin load is in flight".to_string())
            })?,
        };

        let code = self.fetch_script(url).await?;

        let handle = tokio::time::timeout(
            self.timeout,
            self.host.inject(ScriptSource {
                url: url.to_string(),
                code,
            }),
        )
        .await
        .map_err(|_| ResolveError::PluginLoad(format!("{} did not load in time", url)))?
        .map_err(|e| ResolveError::PluginLoad(e.to_string()))?;

        let script = InjectedScript::new(self.host.as_ref(), handle);
        debug!("plugin: injected {} as script {}", url, script.handle().id());

        if !self.host.has_capability(script.handle(), capability).await {
            return Err(ResolveError::PluginMethodMissing(capability.to_string()));
        }

        let result = tokio::time::timeout(
            self.timeout,
            self.host.invoke(script.handle(), capability, song_id),
        )
        .await
        .map_err(|_| ResolveError::PluginResolution(format!("{} timed out", capability)))?;

        match result {
            Ok(Some(audio_url)) if !audio_url.trim().is_empty() => Ok(audio_url),
            Ok(_) => Err(ResolveError::PluginResolution(format!(
                "{} returned no URL for {}",
                capability, song_id
            ))),
            Err(ScriptError::MissingCapability(name)) => {
                Err(ResolveError::PluginMethodMissing(name))
            }
            Err(e) => Err(ResolveError::PluginResolution(e.to_string())),
        }
    }

    async fn fetch_script(&self, url: &str) -> Result<String, ResolveError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::PluginLoad(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(ResolveError::PluginLoad(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| ResolveError::PluginLoad(format!("{}: {}", url, e)))
    }
}
