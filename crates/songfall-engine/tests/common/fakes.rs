use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use songfall_engine::plugin::{ScriptHandle, ScriptHost, ScriptSource};
use songfall_engine::{
    PlaybackSink, Resolve, ResolveError, ResolvedAudio, ScriptError, SinkError, SourceRegistry,
};
use songfall_proto::source::SourceDescriptor;
use tokio::sync::Notify;

/// `n` JSON sources named `s0..s{n-1}`.
pub fn registry(n: usize) -> SourceRegistry {
    let sources = (0..n)
        .map(|i| SourceDescriptor::json(format!("s{}", i), format!("http://s{}/list.json", i)))
        .collect();
    SourceRegistry::new(sources).expect("registry should not be empty")
}

#[derive(Clone)]
pub enum Behavior {
    Url(String),
    Fail(ResolveError),
    /// Signal `entered`, wait for `release`, then return the URL.
    Gated {
        url: String,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    },
}

/// Resolver scripted per source name.  Unknown sources fail with `NotFound`.
#[derive(Default)]
pub struct FakeResolver {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, source: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(source.to_string(), behavior);
    }

    pub fn ok(&self, source: &str, url: &str) {
        self.set(source, Behavior::Url(url.to_string()));
    }

    pub fn fail(&self, source: &str) {
        self.set(
            source,
            Behavior::Fail(ResolveError::Network(format!("{} is down", source))),
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Resolve for FakeResolver {
    async fn resolve(
        &self,
        source: &SourceDescriptor,
        song_id: &str,
    ) -> Result<ResolvedAudio, ResolveError> {
        self.calls.lock().unwrap().push(source.name.clone());
        let behavior = self.behaviors.lock().unwrap().get(&source.name).cloned();
        match behavior {
            Some(Behavior::Url(url)) => Ok(ResolvedAudio { url }),
            Some(Behavior::Fail(e)) => Err(e),
            Some(Behavior::Gated {
                url,
                entered,
                release,
            }) => {
                entered.notify_one();
                release.notified().await;
                Ok(ResolvedAudio { url })
            }
            None => Err(ResolveError::NotFound(format!(
                "song {} not on {}",
                song_id, source.name
            ))),
        }
    }
}

/// Sink that records every accepted start and rejects configured URLs.
#[derive(Default)]
pub struct RecordingSink {
    started: Mutex<Vec<(String, String)>>,
    rejected_urls: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, url: &str) {
        self.rejected_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn started(&self) -> Vec<(String, String)> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    async fn start(&self, song_id: &str, audio: &ResolvedAudio) -> Result<(), SinkError> {
        if self.rejected_urls.lock().unwrap().contains(&audio.url) {
            return Err(SinkError::Rejected(audio.url.clone()));
        }
        self.started
            .lock()
            .unwrap()
            .push((song_id.to_string(), audio.url.clone()));
        Ok(())
    }
}

/// Script host that never runs code.  Tracks how many scripts are attached
/// and the highest number attached at once.
pub struct FakeHost {
    capability: Option<String>,
    result: Result<Option<String>, ScriptError>,
    fail_inject: bool,
    invoke_delay: Duration,
    next_id: AtomicUsize,
    attached: AtomicUsize,
    max_attached: AtomicUsize,
    removed: Mutex<Vec<u64>>,
    pub injected: Notify,
}

impl FakeHost {
    pub fn resolving(capability: &str, url: &str) -> Self {
        Self {
            capability: Some(capability.to_string()),
            result: Ok(Some(url.to_string())),
            fail_inject: false,
            invoke_delay: Duration::ZERO,
            next_id: AtomicUsize::new(1),
            attached: AtomicUsize::new(0),
            max_attached: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
            injected: Notify::new(),
        }
    }

    pub fn without_capability(mut self) -> Self {
        self.capability = None;
        self
    }

    pub fn failing_inject(mut self) -> Self {
        self.fail_inject = true;
        self
    }

    pub fn with_result(mut self, result: Result<Option<String>, ScriptError>) -> Self {
        self.result = result;
        self
    }

    pub fn with_invoke_delay(mut self, delay: Duration) -> Self {
        self.invoke_delay = delay;
        self
    }

    pub fn max_attached(&self) -> usize {
        self.max_attached.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<u64> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptHost for FakeHost {
    async fn inject(&self, script: ScriptSource) -> Result<ScriptHandle, ScriptError> {
        if self.fail_inject {
            return Err(ScriptError::Evaluation("unexpected token".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
        let now = self.attached.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_attached.fetch_max(now, Ordering::SeqCst);
        self.injected.notify_one();
        Ok(ScriptHandle::new(id, script.url))
    }

    async fn has_capability(&self, _handle: &ScriptHandle, name: &str) -> bool {
        self.capability.as_deref() == Some(name)
    }

    async fn invoke(
        &self,
        _handle: &ScriptHandle,
        _name: &str,
        _song_id: &str,
    ) -> Result<Option<String>, ScriptError> {
        if !self.invoke_delay.is_zero() {
            tokio::time::sleep(self.invoke_delay).await;
        }
        self.result.clone()
    }

    fn remove(&self, handle: &ScriptHandle) {
        self.attached.fetch_sub(1, Ordering::SeqCst);
        self.removed.lock().unwrap().push(handle.id());
    }

    fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }
}

/// Host for resolvers that only ever see JSON sources.
pub struct NoScripts;

#[async_trait]
impl ScriptHost for NoScripts {
    async fn inject(&self, _script: ScriptSource) -> Result<ScriptHandle, ScriptError> {
        Err(ScriptError::HostGone)
    }

    async fn has_capability(&self, _handle: &ScriptHandle, _name: &str) -> bool {
        false
    }

    async fn invoke(
        &self,
        _handle: &ScriptHandle,
        _name: &str,
        _song_id: &str,
    ) -> Result<Option<String>, ScriptError> {
        Err(ScriptError::HostGone)
    }

    fn remove(&self, _handle: &ScriptHandle) {}

    fn attached(&self) -> usize {
        0
    }
}
