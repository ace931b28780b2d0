//! Playback sink that hands resolved URLs to the core loop, which owns mpv.
use async_trait::async_trait;
use songfall_engine::{PlaybackSink, ResolvedAudio, SinkError};
use tokio::sync::{mpsc, oneshot};

use crate::core::DaemonEvent;

pub struct CoreSink {
    event_tx: mpsc::Sender<DaemonEvent>,
}

impl CoreSink {
    pub fn new(event_tx: mpsc::Sender<DaemonEvent>) -> Self {
        Self { event_tx }
    }
}

#[async_trait]
impl PlaybackSink for CoreSink {
    async fn start(&self, song_id: &str, audio: &ResolvedAudio) -> Result<(), SinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.event_tx
            .send(DaemonEvent::LoadAudio {
                song_id: song_id.to_string(),
                url: audio.url.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| SinkError::Unavailable)?;
        reply_rx.await.map_err(|_| SinkError::Unavailable)?
    }
}
