use serde::{Deserialize, Serialize};

use crate::source::{SourceDescriptor, SourceKind};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame body a peer may announce.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    Play { song_id: String },
    /// Manual source selection; resets the attempt budget.
    SwitchSource { index: usize },
    /// Manual switch to the source after the current default.
    NextSource,
    Stop,
    TogglePause,
    Volume { value: f32 },
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
    /// Every source failed for this song.
    Exhausted {
        song_id: String,
        attempts: usize,
    },
}

/// Where the fallback engine is for the current song.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ResolutionPhase {
    #[default]
    Idle,
    Resolving,
    Succeeded,
    Exhausted,
}

/// Detailed playback status — reflects actual mpv state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle, // nothing loaded / explicitly stopped
    Connecting, // loadfile sent, mpv buffering/connecting
    Playing,    // core-idle=false, audio flowing
    Paused,     // explicitly paused
    Error,      // failed to play (timeout or mpv error)
}

/// Health of the mpv process as observed by the daemon.
///
/// Transitions:
///   Absent -> Starting -> Running -> Dead -> Restarting -> Starting ...
///   Running -> Degraded(reason) -> Running | Dead
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum MpvHealth {
    #[default]
    Absent,
    Starting,
    Running,
    Degraded(String),
    Dead,
    Restarting,
}

impl MpvHealth {
    /// True when mpv is in an error/non-running state that users should notice.
    pub fn is_unhealthy(&self) -> bool {
        matches!(
            self,
            MpvHealth::Degraded(_) | MpvHealth::Dead | MpvHealth::Restarting
        )
    }
}

/// Wire view of one configured source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceInfo {
    pub name: String,
    pub kind: SourceKind,
    pub platform: String,
}

impl From<&SourceDescriptor> for SourceInfo {
    fn from(d: &SourceDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            kind: d.kind,
            platform: d.platform.clone(),
        }
    }
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonState {
    #[serde(default)]
    pub rev: u64,
    pub sources: Vec<SourceInfo>,
    /// Source the next `Play` starts from.
    pub default_source: usize,
    pub song_id: Option<String>,
    pub phase: ResolutionPhase,
    /// Source currently being tried, or the one that succeeded.
    pub active_source: Option<usize>,
    pub attempts: usize,
    pub audio_url: Option<String>,
    pub last_error: Option<String>,
    pub volume: f32,
    pub playback_status: PlaybackStatus,
    #[serde(default)]
    pub mpv_health: MpvHealth,
    #[serde(default)]
    pub is_paused: bool,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode the frame at the front of `data`.  `Ok(None)` means more bytes
    /// are needed; an error means the stream cannot be resynchronised.
    pub fn decode(data: &[u8]) -> anyhow::Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN);
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok(Some((msg, 4 + len)))
    }
}
