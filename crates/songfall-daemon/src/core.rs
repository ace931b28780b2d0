//! DaemonCore: single-owner event loop for mpv and daemon state.
//!
//! Every input (client commands, mpv events, controller progress, sink
//! requests, heartbeats) arrives as a [`DaemonEvent`].  Fallback requests run
//! on their own tasks because the controller calls back into this loop
//! through [`crate::sink::CoreSink`]; the loop never waits on the controller.
//!
//! ```text
//!   socket / http ──ClientCommand──►┐
//!   mpv reader ─────MpvEvent───────►│
//!   controller ─────Controller─────►├──► DaemonCore ──► StateManager + broadcast
//!   CoreSink ───────LoadAudio──────►│        │
//!   heartbeat ──────HeartbeatTick──►┘        └──spawn──► FallbackController
//! ```
use std::sync::Arc;

use songfall_engine::{ControllerEvent, FallbackController, PlayError, ResolvedAudio, SinkError};
use songfall_proto::config::Config;
use songfall_proto::protocol::{Command, MpvHealth, PlaybackStatus};
use songfall_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::mpv::{MpvDriver, MpvEvent, MpvHandle, OBS_CORE_IDLE, OBS_PAUSE};
use crate::BroadcastMessage;

#[derive(Debug)]
pub enum DaemonEvent {
    /// From a socket client or the HTTP API.
    ClientCommand(Command),
    /// The playback sink wants `url` started for `song_id`.
    LoadAudio {
        song_id: String,
        url: String,
        reply: oneshot::Sender<Result<(), SinkError>>,
    },
    /// Progress reported by the fallback controller.
    Controller(ControllerEvent),
    /// The controller has dropped its request; silence mpv.
    PlaybackHalted,
    HeartbeatTick,
    MpvEvent(MpvEvent),
    Shutdown,
}

pub struct DaemonCore {
    config: Config,
    state_manager: Arc<StateManager>,
    controller: Arc<FallbackController>,
    mpv_driver: MpvDriver,
    mpv_handle: Option<MpvHandle>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// Song whose URL mpv is playing.  Taken when its failure is reported so
    /// one stream death triggers one retry.
    current_song: Option<String>,
    /// mpv playlist entry of the loaded song, when mpv reports it.
    current_entry: Option<i64>,
    intend_playing: bool,
    mpv_health: MpvHealth,
    obs_core_idle: Option<bool>,
    obs_pause: bool,
    connecting_since: Option<tokio::time::Instant>,
    last_status: PlaybackStatus,
}

impl DaemonCore {
    pub async fn new(
        config: Config,
        state_manager: Arc<StateManager>,
        controller: Arc<FallbackController>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let volume = state_manager.get_state().await.volume;

        // Subscribe before any request runs so no progress is missed.
        let mut controller_rx = controller.subscribe();
        let forward_tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                match controller_rx.recv().await {
                    Ok(evt) => {
                        if forward_tx.send(DaemonEvent::Controller(evt)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("DaemonCore: dropped {} controller events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            config,
            state_manager,
            controller,
            mpv_driver: MpvDriver::new(volume),
            mpv_handle: None,
            event_tx,
            broadcast_tx,
            current_song: None,
            current_entry: None,
            intend_playing: false,
            mpv_health: MpvHealth::Absent,
            obs_core_idle: None,
            obs_pause: false,
            connecting_since: None,
            last_status: PlaybackStatus::Idle,
        }
    }

    /// Returns on `Shutdown` or when every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");

        let heartbeat_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
                if heartbeat_tx.send(DaemonEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        while let Some(evt) = event_rx.recv().await {
            match evt {
                DaemonEvent::Shutdown => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }
                DaemonEvent::ClientCommand(cmd) => {
                    info!("DaemonCore: command {:?}", cmd);
                    if let Err(e) = self.handle_command(cmd).await {
                        error!("DaemonCore: command error: {}", e);
                        let _ = self.broadcast_tx.send(BroadcastMessage::Error(e.to_string()));
                    }
                }
                DaemonEvent::LoadAudio {
                    song_id,
                    url,
                    reply,
                } => {
                    let result = self.load_audio(song_id, &url).await;
                    let _ = reply.send(result);
                }
                DaemonEvent::Controller(evt) => {
                    if let Err(e) = self.handle_controller_event(evt).await {
                        warn!("DaemonCore: failed to persist state: {}", e);
                    }
                }
                DaemonEvent::PlaybackHalted => self.halt_playback().await,
                DaemonEvent::MpvEvent(evt) => self.handle_mpv_event(evt).await,
                DaemonEvent::HeartbeatTick => self.heartbeat().await,
            }
        }

        // Pending sink requests fail instead of waiting on a loop that is gone.
        drop(event_rx);
        self.cleanup().await;
        Ok(())
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Play { song_id } => {
                let controller = self.controller.clone();
                tokio::spawn(async move {
                    let result = controller.play(&song_id).await.map(Some);
                    log_outcome(&format!("play {}", song_id), result);
                });
            }
            Command::SwitchSource { index } => self.switch_source(index).await?,
            Command::NextSource => {
                let current = self.state_manager.get_state().await.default_source;
                let next = self.controller.registry().next(current);
                self.switch_source(next).await?;
            }
            Command::Stop => {
                let controller = self.controller.clone();
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    controller.stop().await;
                    let _ = tx.send(DaemonEvent::PlaybackHalted).await;
                });
            }
            Command::TogglePause => {
                if self.current_song.is_none() {
                    return Ok(());
                }
                if let Some(handle) = self.mpv_handle.as_ref() {
                    handle.set_pause(!self.obs_pause).await?;
                }
            }
            Command::Volume { value } => {
                self.state_manager.set_volume(value).await?;
                self.mpv_driver.last_volume = value;
                if let Some(handle) = self.mpv_handle.as_ref() {
                    handle.set_volume(value).await?;
                }
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            Command::GetState => {}
        }
        Ok(())
    }

    async fn switch_source(&mut self, index: usize) -> anyhow::Result<()> {
        self.state_manager.set_default_source(index).await?;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);

        let controller = self.controller.clone();
        tokio::spawn(async move {
            let result = controller.switch_source(index).await;
            log_outcome(&format!("switch to source {}", index), result);
        });
        Ok(())
    }

    // ── sink side ─────────────────────────────────────────────────────────────

    async fn load_audio(&mut self, song_id: String, url: &str) -> Result<(), SinkError> {
        let volume = self.state_manager.get_state().await.volume;
        self.connecting_since = None;
        self.obs_core_idle = None;

        let Some(handle) = self.ensure_mpv_handle().await else {
            self.intend_playing = false;
            return Err(SinkError::Unavailable);
        };
        let entry = match handle.load_stream(url, volume).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("DaemonCore: mpv refused {}: {}", url, e);
                self.intend_playing = false;
                self.current_entry = None;
                return Err(SinkError::Rejected(e.to_string()));
            }
        };

        info!("DaemonCore: loaded {} for song {} (entry {:?})", url, song_id, entry);
        self.current_entry = entry;
        self.intend_playing = true;
        self.current_song = Some(song_id);
        Ok(())
    }

    async fn halt_playback(&mut self) {
        info!("DaemonCore: stopping playback");
        self.intend_playing = false;
        self.current_song = None;
        self.current_entry = None;
        self.connecting_since = None;
        if let Some(handle) = self.mpv_handle.as_ref() {
            if let Err(e) = handle.stop().await {
                warn!("DaemonCore: mpv stop failed: {}", e);
            }
        }
        self.state_manager.set_stopped().await;
        self.last_status = PlaybackStatus::Idle;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    /// The stream for the current song died after it was started.  Hands the
    /// song back to the controller, which begins a new cycle at the next source.
    async fn report_playback_failure(&mut self, reason: &str) {
        self.intend_playing = false;
        self.connecting_since = None;
        let Some(song_id) = self.current_song.take() else {
            return;
        };
        warn!("DaemonCore: playback of {} failed ({})", song_id, reason);

        self.state_manager
            .set_playback_status(PlaybackStatus::Error)
            .await;
        self.last_status = PlaybackStatus::Error;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);

        let controller = self.controller.clone();
        tokio::spawn(async move {
            let result = controller.playback_failed(&song_id).await;
            log_outcome(&format!("retry {}", song_id), result);
        });
    }

    // ── controller progress ───────────────────────────────────────────────────

    async fn handle_controller_event(&mut self, evt: ControllerEvent) -> anyhow::Result<()> {
        match evt {
            ControllerEvent::Resolving {
                song_id,
                source,
                attempt,
            } => {
                self.last_status = PlaybackStatus::Connecting;
                self.state_manager
                    .set_resolving(&song_id, source, attempt)
                    .await?;
            }
            ControllerEvent::SourceFailed { source, error, .. } => {
                let name = self
                    .controller
                    .registry()
                    .get(source)
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                self.state_manager
                    .set_source_failed(format!("{}: {}", name, error))
                    .await;
            }
            ControllerEvent::Playing { source, url, .. } => {
                self.state_manager.set_succeeded(source, url).await?;
            }
            ControllerEvent::Exhausted { song_id, attempts } => {
                self.intend_playing = false;
                self.current_song = None;
                self.last_status = PlaybackStatus::Error;
                self.state_manager.set_exhausted(attempts).await;
                let _ = self
                    .broadcast_tx
                    .send(BroadcastMessage::Exhausted { song_id, attempts });
            }
            ControllerEvent::Superseded { song_id } => {
                debug!("DaemonCore: request for {} superseded", song_id);
                return Ok(());
            }
        }
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        Ok(())
    }

    // ── mpv ───────────────────────────────────────────────────────────────────

    async fn handle_mpv_event(&mut self, evt: MpvEvent) {
        if let Some((id, data)) = evt.as_property_change() {
            match id {
                OBS_CORE_IDLE => {
                    let val = data.as_bool();
                    if val != self.obs_core_idle {
                        debug!("mpv: core-idle → {:?}", val);
                        self.obs_core_idle = val;
                        self.maybe_update_status().await;
                    }
                }
                OBS_PAUSE => {
                    let val = data.as_bool().unwrap_or(false);
                    if val != self.obs_pause {
                        debug!("mpv: pause → {}", val);
                        self.obs_pause = val;
                        self.maybe_update_status().await;
                    }
                }
                _ => {}
            }
            return;
        }

        match evt.event_name() {
            Some("end-file") => {
                let reason = evt.end_reason().unwrap_or("unknown");
                if !evt.concerns_entry(self.current_entry) {
                    debug!(
                        "mpv: ignoring end-file ({}) for replaced entry {:?}",
                        reason,
                        evt.playlist_entry_id()
                    );
                    return;
                }
                info!("mpv: end-file reason={}", reason);
                if evt.is_failed_end() {
                    if self.intend_playing {
                        self.report_playback_failure(reason).await;
                    }
                } else if reason == "eof" {
                    self.intend_playing = false;
                    self.current_song = None;
                    self.maybe_update_status().await;
                }
            }
            Some("start-file") => {
                if self.current_entry.is_none() {
                    self.current_entry = evt.playlist_entry_id();
                }
                self.connecting_since = None;
                self.obs_core_idle = Some(true);
                self.maybe_update_status().await;
            }
            _ => {}
        }
    }

    /// Derive the playback status from observed mpv state.  A stream that has
    /// not produced audio within the start timeout counts as failed.
    async fn maybe_update_status(&mut self) {
        let status = if !self.intend_playing {
            self.connecting_since = None;
            return;
        } else if self.obs_pause {
            self.connecting_since = None;
            PlaybackStatus::Paused
        } else if self.obs_core_idle == Some(false) {
            self.connecting_since = None;
            PlaybackStatus::Playing
        } else {
            let since = self
                .connecting_since
                .get_or_insert_with(tokio::time::Instant::now);
            let elapsed = since.elapsed().as_secs();
            if elapsed >= self.config.mpv.start_timeout_secs {
                self.report_playback_failure(&format!("no audio after {}s", elapsed))
                    .await;
                return;
            }
            PlaybackStatus::Connecting
        };

        if status != self.last_status {
            info!("DaemonCore: status {:?} → {:?}", self.last_status, status);
            self.last_status = status.clone();
            self.state_manager.set_playback_status(status).await;
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    async fn heartbeat(&mut self) {
        if self.mpv_handle.is_some() && !self.mpv_driver.process_alive() {
            warn!("DaemonCore: heartbeat: mpv process died");
            self.drop_mpv_handle().await;
            if self.intend_playing {
                self.report_playback_failure("mpv exited").await;
            }
        }
        if self.intend_playing && !self.obs_pause {
            self.maybe_update_status().await;
        }
    }

    async fn set_mpv_health(&mut self, health: MpvHealth) {
        if self.mpv_health != health {
            info!("DaemonCore: mpv health {:?} → {:?}", self.mpv_health, health);
            self.mpv_health = health.clone();
            self.state_manager.set_mpv_health(health).await;
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    async fn drop_mpv_handle(&mut self) {
        self.mpv_handle = None;
        self.obs_core_idle = None;
        self.obs_pause = false;
        self.connecting_since = None;
        self.set_mpv_health(MpvHealth::Dead).await;
    }

    async fn ensure_mpv_handle(&mut self) -> Option<MpvHandle> {
        if self.mpv_handle.is_some() && !self.mpv_driver.process_alive() {
            warn!("DaemonCore: mpv process died, dropping handle");
            self.drop_mpv_handle().await;
        }
        if let Some(handle) = self.mpv_handle.clone() {
            return Some(handle);
        }

        // One forwarder per connection, shared by reconnect and spawn.
        let (mpv_tx, mut mpv_rx) = mpsc::channel::<MpvEvent>(64);
        let core_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = mpv_rx.recv().await {
                if core_tx.send(DaemonEvent::MpvEvent(evt)).await.is_err() {
                    break;
                }
            }
        });

        let handle = match self.mpv_driver.try_reconnect(mpv_tx.clone()).await {
            Some(h) => h,
            None => {
                self.set_mpv_health(MpvHealth::Starting).await;
                match self.mpv_driver.spawn_and_connect(mpv_tx).await {
                    Ok(h) => h,
                    Err(e) => {
                        warn!("DaemonCore: failed to start mpv: {}", e);
                        self.set_mpv_health(MpvHealth::Dead).await;
                        return None;
                    }
                }
            }
        };
        self.set_mpv_health(MpvHealth::Running).await;
        handle.observe_properties().await;

        self.mpv_handle = Some(handle.clone());
        Some(handle)
    }

    async fn cleanup(&mut self) {
        info!("DaemonCore: cleanup, stopping mpv");
        self.controller.stop().await;
        if let Some(handle) = self.mpv_handle.take() {
            let _ = handle.stop().await;
        }
        self.mpv_driver.kill().await;
    }
}

fn log_outcome(what: &str, result: Result<Option<ResolvedAudio>, PlayError>) {
    match result {
        Ok(Some(audio)) => info!("{}: playing {}", what, audio.url),
        Ok(None) => debug!("{}: nothing to do", what),
        Err(PlayError::Superseded(_)) => debug!("{}: superseded", what),
        Err(e) => warn!("{}: {}", what, e),
    }
}
