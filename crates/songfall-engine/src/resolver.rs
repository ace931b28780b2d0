use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use songfall_proto::config::ResolverConfig;
use songfall_proto::source::{SourceDescriptor, SourceKind};
use tracing::debug;

use crate::error::ResolveError;
use crate::plugin::{ScriptHost, ScriptPluginLoader};

/// A playable location handed to the playback sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAudio {
    pub url: String,
}

/// Turns one source + song id into a URL.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(
        &self,
        source: &SourceDescriptor,
        song_id: &str,
    ) -> Result<ResolvedAudio, ResolveError>;
}

/// Dispatches on [`SourceKind`]: JSON listings are fetched and searched
/// directly, script sources go through the [`ScriptPluginLoader`].
pub struct SourceResolver {
    client: reqwest::Client,
    plugins: ScriptPluginLoader,
}

impl SourceResolver {
    pub fn new(config: &ResolverConfig, host: Arc<dyn ScriptHost>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        let plugins = ScriptPluginLoader::new(
            client.clone(),
            host,
            config.exclusive,
            config.script_timeout(),
        );
        Ok(Self { client, plugins })
    }
}

#[async_trait]
impl Resolve for SourceResolver {
    async fn resolve(
        &self,
        source: &SourceDescriptor,
        song_id: &str,
    ) -> Result<ResolvedAudio, ResolveError> {
        debug!(
            "resolver: {} ({}) for song {}",
            source.name,
            source.kind.label(),
            song_id
        );
        let url = match source.kind {
            SourceKind::Json => fetch_json_source(&self.client, &source.url, song_id).await?,
            SourceKind::Script => {
                self.plugins
                    .load(&source.url, &source.capability_name(), song_id)
                    .await?
            }
        };
        Ok(ResolvedAudio { url })
    }
}

/// `GET url`, then look the song up in the returned listing.
pub async fn fetch_json_source(
    client: &reqwest::Client,
    url: &str,
    song_id: &str,
) -> Result<String, ResolveError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ResolveError::Network(format!("{}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(ResolveError::Network(format!(
            "{}: HTTP {}",
            url,
            response.status()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|e| ResolveError::Network(format!("{}: {}", url, e)))?;
    find_song_url(&body, song_id)
}

/// Find the item whose `id` equals `song_id` in a JSON array of
/// `{ id, url, ... }` items.  Ids compare as strings only: a numeric `42` does
/// not match `"42"`.  Any shape mismatch is reported as not found.
pub fn find_song_url(body: &str, song_id: &str) -> Result<String, ResolveError> {
    let listing: Value = serde_json::from_str(body)
        .map_err(|e| ResolveError::NotFound(format!("listing is not JSON: {}", e)))?;
    let items = listing
        .as_array()
        .ok_or_else(|| ResolveError::NotFound("listing is not a JSON array".to_string()))?;

    let item = items
        .iter()
        .find(|item| item.get("id").and_then(Value::as_str) == Some(song_id))
        .ok_or_else(|| ResolveError::NotFound(format!("song {} not listed", song_id)))?;

    item.get("url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ResolveError::NotFound(format!("song {} has no url", song_id)))
}
