//! FallbackController — bounded resolve/advance loop for one song at a time.
//!
//! State machine:
//!
//! ```text
//!   Idle ──play──► Resolving ──ok──► Succeeded ──sink error──► Resolving (next uncharged source)
//!                   │   ▲
//!                   └───┘ failure: charge cursor, cursor = next uncharged
//!                   │
//!                   └── all N charged ──► Exhausted (terminal for the request)
//! ```
//!
//! A source is charged once it fails for the request, whether the resolver,
//! the sink's start, or a later playback failure gave up on it.  Charges
//! survive post-success restarts and are only cleared by `play` or a manual
//! switch, so one request resolves each source at most once.
//!
//! Every request carries a token.  `play`, `switch_source`, `stop` and a
//! post-success sink failure all mint a new one, and a cycle checks its token
//! before touching the session or the sink, so a late result for a replaced
//! request is dropped.
use std::sync::Arc;

use async_trait::async_trait;
use songfall_proto::protocol::ResolutionPhase;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::{AttemptError, PlayError, SinkError};
use crate::registry::SourceRegistry;
use crate::resolver::{Resolve, ResolvedAudio};

/// The audio output.  `start` is the success acknowledgement; failures that
/// surface later are reported through [`FallbackController::playback_failed`].
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn start(&self, song_id: &str, audio: &ResolvedAudio) -> Result<(), SinkError>;
}

/// Bounded-attempt state for one play request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSession {
    token: u64,
    song_id: String,
    cursor: usize,
    attempts: usize,
    charged: Vec<bool>,
}

impl PlaybackSession {
    pub fn song_id(&self) -> &str {
        &self.song_id
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Whether `index` has already failed for this request.
    pub fn is_charged(&self, index: usize) -> bool {
        self.charged.get(index).copied().unwrap_or(false)
    }

    /// Record a failure of the source under the cursor.  Returns `false`
    /// once every source has been charged.
    fn charge_cursor(&mut self) -> bool {
        if let Some(slot) = self.charged.get_mut(self.cursor) {
            if !*slot {
                *slot = true;
                self.attempts += 1;
            }
        }
        self.attempts < self.charged.len()
    }

    /// First uncharged source after the cursor, wrapping.
    fn next_uncharged(&self) -> Option<usize> {
        let total = self.charged.len();
        (1..=total)
            .map(|step| (self.cursor + step) % total)
            .find(|&index| !self.charged[index])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Resolving {
        song_id: String,
        source: usize,
        attempt: usize,
    },
    SourceFailed {
        song_id: String,
        source: usize,
        error: AttemptError,
    },
    Playing {
        song_id: String,
        source: usize,
        url: String,
    },
    Exhausted {
        song_id: String,
        attempts: usize,
    },
    Superseded {
        song_id: String,
    },
}

#[derive(Debug)]
struct ControllerState {
    phase: ResolutionPhase,
    session: Option<PlaybackSession>,
    /// Where the next `play` starts.  Follows manual switches and the last
    /// source that worked.
    default_index: usize,
    next_token: u64,
}

impl ControllerState {
    fn begin(&mut self, song_id: String, cursor: usize, total: usize) -> u64 {
        self.next_token += 1;
        self.session = Some(PlaybackSession {
            token: self.next_token,
            song_id,
            cursor,
            attempts: 0,
            charged: vec![false; total],
        });
        self.phase = ResolutionPhase::Resolving;
        self.next_token
    }

    /// Re-enter `Resolving` for the same request under a new token, keeping
    /// its charges.
    fn resume(&mut self, cursor: usize) -> Option<u64> {
        self.next_token += 1;
        let token = self.next_token;
        let session = self.session.as_mut()?;
        session.token = token;
        session.cursor = cursor;
        self.phase = ResolutionPhase::Resolving;
        Some(token)
    }

    fn current(&self, token: u64) -> Option<&PlaybackSession> {
        self.session.as_ref().filter(|s| s.token == token)
    }

    fn current_mut(&mut self, token: u64) -> Option<&mut PlaybackSession> {
        self.session.as_mut().filter(|s| s.token == token)
    }
}

pub struct FallbackController {
    registry: SourceRegistry,
    resolver: Arc<dyn Resolve>,
    sink: Arc<dyn PlaybackSink>,
    state: Mutex<ControllerState>,
    events: broadcast::Sender<ControllerEvent>,
}

impl FallbackController {
    pub fn new(
        registry: SourceRegistry,
        resolver: Arc<dyn Resolve>,
        sink: Arc<dyn PlaybackSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            registry,
            resolver,
            sink,
            state: Mutex::new(ControllerState {
                phase: ResolutionPhase::Idle,
                session: None,
                default_index: 0,
                next_token: 0,
            }),
            events,
        }
    }

    /// Start position for the first `play`.  Out-of-range values fall back to 0.
    pub fn with_default_source(mut self, index: usize) -> Self {
        let index = if index < self.registry.size() { index } else { 0 };
        self.state.get_mut().default_index = index;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> ResolutionPhase {
        self.state.lock().await.phase
    }

    pub async fn session(&self) -> Option<PlaybackSession> {
        self.state.lock().await.session.clone()
    }

    pub async fn default_source(&self) -> usize {
        self.state.lock().await.default_index
    }

    /// Resolve and start `song_id`, replacing any request in flight.
    pub async fn play(&self, song_id: &str) -> Result<ResolvedAudio, PlayError> {
        let token = {
            let mut state = self.state.lock().await;
            let cursor = state.default_index;
            info!(
                "controller: play {} starting at source {}",
                song_id, cursor
            );
            state.begin(song_id.to_string(), cursor, self.registry.size())
        };
        self.run_cycle(token, song_id.to_string()).await
    }

    /// Manual source selection.  Becomes the default and, when a song is
    /// active, retries it from `index` with a fresh attempt budget.
    /// Returns `Ok(None)` when there is no song to retry.
    pub async fn switch_source(&self, index: usize) -> Result<Option<ResolvedAudio>, PlayError> {
        let len = self.registry.size();
        if index >= len {
            return Err(PlayError::InvalidSource { index, len });
        }

        let (token, song_id) = {
            let mut state = self.state.lock().await;
            state.default_index = index;
            let song_id = match state.session.as_ref() {
                Some(session) => session.song_id.clone(),
                None => {
                    info!("controller: default source set to {}, nothing to replay", index);
                    return Ok(None);
                }
            };
            info!("controller: manual switch to source {} for {}", index, song_id);
            (state.begin(song_id.clone(), index, len), song_id)
        };
        self.run_cycle(token, song_id).await.map(Some)
    }

    /// Manual switch to the source after the current default.
    pub async fn next_source(&self) -> Result<Option<ResolvedAudio>, PlayError> {
        let next = {
            let state = self.state.lock().await;
            self.registry.next(state.default_index)
        };
        self.switch_source(next).await
    }

    /// Asynchronous failure reported by the sink after a successful start.
    /// Only honoured while `song_id` is the active, succeeded song; anything
    /// else is a stale signal and returns `Ok(None)`.
    ///
    /// The failed source is charged to the request and resolution continues
    /// with the next source that has not failed yet.  When none is left the
    /// request ends as [`PlayError::Exhausted`].
    pub async fn playback_failed(&self, song_id: &str) -> Result<Option<ResolvedAudio>, PlayError> {
        let token = {
            let mut state = self.state.lock().await;
            if state.phase != ResolutionPhase::Succeeded {
                debug!("controller: ignoring stale playback failure for {}", song_id);
                return Ok(None);
            }
            let session = match state.session.as_mut() {
                Some(session) if session.song_id == song_id => session,
                _ => {
                    debug!("controller: ignoring stale playback failure for {}", song_id);
                    return Ok(None);
                }
            };

            let cursor = session.cursor;
            let remaining = session.charge_cursor();
            let attempts = session.attempts;
            self.emit(ControllerEvent::SourceFailed {
                song_id: song_id.to_string(),
                source: cursor,
                error: SinkError::Interrupted.into(),
            });

            let next = if remaining { session.next_uncharged() } else { None };
            let Some(next) = next else {
                state.phase = ResolutionPhase::Exhausted;
                warn!(
                    "controller: playback of {} failed on source {}, all {} sources spent",
                    song_id, cursor, attempts
                );
                self.emit(ControllerEvent::Exhausted {
                    song_id: song_id.to_string(),
                    attempts,
                });
                return Err(PlayError::Exhausted {
                    song_id: song_id.to_string(),
                    attempts,
                });
            };
            warn!(
                "controller: playback of {} failed on source {}, retrying from {}",
                song_id, cursor, next
            );
            match state.resume(next) {
                Some(token) => token,
                None => return Ok(None),
            }
        };
        self.run_cycle(token, song_id.to_string()).await.map(Some)
    }

    /// Drop the active request.  Any resolution still in flight is discarded.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.next_token += 1;
        state.session = None;
        state.phase = ResolutionPhase::Idle;
    }

    async fn run_cycle(&self, token: u64, song_id: String) -> Result<ResolvedAudio, PlayError> {
        let total = self.registry.size();

        loop {
            let (cursor, attempts) = {
                let state = self.state.lock().await;
                match state.current(token) {
                    Some(s) => (s.cursor, s.attempts),
                    None => return Err(self.superseded(token, song_id)),
                }
            };
            let Some(source) = self.registry.get(cursor) else {
                // The cursor is always reduced modulo the registry size.
                return Err(PlayError::InvalidSource { index: cursor, len: total });
            };

            self.emit(ControllerEvent::Resolving {
                song_id: song_id.clone(),
                source: cursor,
                attempt: attempts + 1,
            });
            debug!(
                "controller: attempt {}/{} for {} via {}",
                attempts + 1,
                total,
                song_id,
                source.name
            );

            let resolved = self.resolver.resolve(source, &song_id).await;

            // Held across the sink start so a newer request cannot slip in
            // between the token check and the hand-off.
            let mut state = self.state.lock().await;
            if state.current(token).is_none() {
                return Err(self.superseded(token, song_id));
            }

            let outcome: Result<ResolvedAudio, AttemptError> = match resolved {
                Ok(audio) => match self.sink.start(&song_id, &audio).await {
                    Ok(()) => Ok(audio),
                    Err(e) => Err(e.into()),
                },
                Err(e) => Err(e.into()),
            };

            match outcome {
                Ok(audio) => {
                    info!(
                        "controller: playing {} from {} ({})",
                        song_id, source.name, audio.url
                    );
                    state.phase = ResolutionPhase::Succeeded;
                    state.default_index = cursor;
                    self.emit(ControllerEvent::Playing {
                        song_id: song_id.clone(),
                        source: cursor,
                        url: audio.url.clone(),
                    });
                    return Ok(audio);
                }
                Err(error) => {
                    warn!("controller: source {} failed for {}: {}", source.name, song_id, error);
                    self.emit(ControllerEvent::SourceFailed {
                        song_id: song_id.clone(),
                        source: cursor,
                        error,
                    });

                    let Some(session) = state.current_mut(token) else {
                        return Err(self.superseded(token, song_id));
                    };
                    let remaining = session.charge_cursor();
                    let attempts = session.attempts;
                    let next = if remaining { session.next_uncharged() } else { None };
                    match next {
                        Some(next) => session.cursor = next,
                        None => {
                            state.phase = ResolutionPhase::Exhausted;
                            warn!(
                                "controller: all {} sources failed for {}",
                                attempts, song_id
                            );
                            self.emit(ControllerEvent::Exhausted {
                                song_id: song_id.clone(),
                                attempts,
                            });
                            return Err(PlayError::Exhausted { song_id, attempts });
                        }
                    }
                }
            }
        }
    }

    fn superseded(&self, token: u64, song_id: String) -> PlayError {
        debug!("controller: request {} for {} superseded", token, song_id);
        self.emit(ControllerEvent::Superseded {
            song_id: song_id.clone(),
        });
        PlayError::Superseded(song_id)
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
