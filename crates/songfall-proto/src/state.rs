use crate::protocol::{DaemonState, MpvHealth, PlaybackStatus, ResolutionPhase, SourceInfo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub default_source: usize,
    #[serde(default)]
    pub last_song_id: Option<String>,
    pub volume: f32,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            default_source: 0,
            last_song_id: None,
            volume: 0.5,
        }
    }
}

pub struct StateManager {
    state: Arc<RwLock<DaemonState>>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf, sources: Vec<SourceInfo>) -> Self {
        let persistent = Self::load_persistent(&state_file);

        // A shorter source list in the config invalidates the saved position.
        let default_source = if persistent.default_source < sources.len() {
            persistent.default_source
        } else {
            0
        };

        let state = DaemonState {
            rev: 1,
            sources,
            default_source,
            song_id: persistent.last_song_id,
            phase: ResolutionPhase::Idle,
            active_source: None,
            attempts: 0,
            audio_url: None,
            last_error: None,
            volume: persistent.volume,
            playback_status: PlaybackStatus::Idle,
            mpv_health: MpvHealth::Absent,
            is_paused: false,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            state_file,
        }
    }

    pub fn arc(&self) -> Arc<RwLock<DaemonState>> {
        Arc::clone(&self.state)
    }

    pub async fn get_state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    pub async fn set_default_source(&self, idx: usize) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            if idx >= state.sources.len() {
                anyhow::bail!("source index {} out of range", idx);
            }
            state.default_source = idx;
            state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_resolving(
        &self,
        song_id: &str,
        source: usize,
        attempt: usize,
    ) -> anyhow::Result<()> {
        let song_changed = {
            let mut state = self.state.write().await;
            let changed = state.song_id.as_deref() != Some(song_id);
            state.song_id = Some(song_id.to_string());
            state.phase = ResolutionPhase::Resolving;
            state.active_source = Some(source);
            state.attempts = attempt;
            state.audio_url = None;
            state.playback_status = PlaybackStatus::Connecting;
            state.rev += 1;
            changed
        };
        if song_changed {
            self.save().await?;
        }
        Ok(())
    }

    pub async fn set_source_failed(&self, error: String) {
        let mut state = self.state.write().await;
        state.last_error = Some(error);
        state.rev += 1;
    }

    pub async fn set_succeeded(&self, source: usize, url: String) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.phase = ResolutionPhase::Succeeded;
            state.active_source = Some(source);
            state.default_source = source;
            state.audio_url = Some(url);
            state.last_error = None;
            state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_exhausted(&self, attempts: usize) {
        let mut state = self.state.write().await;
        state.phase = ResolutionPhase::Exhausted;
        state.attempts = attempts;
        state.active_source = None;
        state.audio_url = None;
        state.playback_status = PlaybackStatus::Error;
        state.rev += 1;
    }

    pub async fn set_stopped(&self) {
        let mut state = self.state.write().await;
        state.phase = ResolutionPhase::Idle;
        state.active_source = None;
        state.audio_url = None;
        state.playback_status = PlaybackStatus::Idle;
        state.is_paused = false;
        state.rev += 1;
    }

    pub async fn set_playback_status(&self, status: PlaybackStatus) {
        let mut state = self.state.write().await;
        state.is_paused = status == PlaybackStatus::Paused;
        state.playback_status = status;
        state.rev += 1;
    }

    pub async fn set_mpv_health(&self, health: MpvHealth) {
        let mut state = self.state.write().await;
        state.mpv_health = health;
        state.rev += 1;
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.volume = volume.clamp(0.0, 1.0);
            state.rev += 1;
        }
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = {
            let state = self.state.read().await;
            PersistentState {
                default_source: state.default_source,
                last_song_id: state.song_id.clone(),
                volume: state.volume,
            }
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}
