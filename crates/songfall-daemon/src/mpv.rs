//! mpv IPC driver.
//!
//! ```text
//!   MpvDriver::spawn_and_connect()
//!         │
//!         ├── writer_task   ← MpvRequest via mpsc, one JSON line each
//!         └── reader_task   ← JSON lines from mpv
//!                                ├── has request_id → matching oneshot
//!                                └── otherwise      → event channel
//! ```
//!
//! Unix uses a domain socket, Windows a named pipe `\\.\pipe\<name>`.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// observe_property ids, matched in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct MpvRequest {
    req_id: u64,
    /// Serialised JSON line, newline included.
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Unsolicited mpv output: events and property changes.
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// `(observe id, data)` for property-change events.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.event_name()? != "property-change" {
            return None;
        }
        let id = self.raw.get("id")?.as_u64()?;
        Some((id, self.raw.get("data").unwrap_or(&Value::Null)))
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `reason` of an end-file event.
    pub fn end_reason(&self) -> Option<&str> {
        if self.event_name()? != "end-file" {
            return None;
        }
        Some(self.raw.get("reason").and_then(Value::as_str).unwrap_or("unknown"))
    }

    /// The stream died rather than being stopped or replaced.
    pub fn is_failed_end(&self) -> bool {
        matches!(self.end_reason(), Some("error" | "network"))
    }

    /// Playlist entry a start-file or end-file event refers to.
    pub fn playlist_entry_id(&self) -> Option<i64> {
        self.raw.get("playlist_entry_id")?.as_i64()
    }

    /// Whether the event is about `entry`.  Unknown ids on either side match,
    /// since older mpv builds omit them.
    pub fn concerns_entry(&self, entry: Option<i64>) -> bool {
        match (self.playlist_entry_id(), entry) {
            (Some(got), Some(expected)) => got == expected,
            _ => true,
        }
    }
}

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<MpvRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
        payload.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MpvRequest {
                req_id,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(REPLY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Replace the current file.  Returns the new playlist entry id when
    /// mpv reports one.
    pub async fn load_stream(&self, url: &str, volume: f32) -> anyhow::Result<Option<i64>> {
        let reply = self.send(json!(["loadfile", url, "replace"])).await?;
        let entry = reply
            .get("data")
            .and_then(|data| data.get("playlist_entry_id"))
            .and_then(Value::as_i64);
        let _ = self.set_volume(volume).await;
        Ok(entry)
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        let pct = (volume * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", pct])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// Must be re-issued on every fresh connection.
    pub async fn observe_properties(&self) {
        for (id, name) in [(OBS_CORE_IDLE, "core-idle"), (OBS_PAUSE, "pause")] {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observing {} as {}", name, id),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: songfall_proto::platform::mpv_socket_name(),
            process: None,
            last_volume: volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.kill().await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        self.kill().await;

        let binary = songfall_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let volume = (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64;

        info!("mpv: spawning {}", binary.display());
        let child = tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg(songfall_proto::platform::mpv_socket_arg())
            .arg(format!("--volume={}", volume))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process().await?;

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to {}", socket_path.display());
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    /// Attach to an mpv left running by a previous daemon.
    #[cfg(unix)]
    pub async fn try_reconnect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        if !socket_path.exists() {
            return None;
        }
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                info!("mpv: reconnected to existing IPC socket");
                let (read_half, write_half) = stream.into_split();
                Some(start_io_tasks(read_half, write_half, event_tx))
            }
            Err(e) => {
                warn!("mpv: failed to reconnect: {}", e);
                None
            }
        }
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process().await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }

    #[cfg(windows)]
    pub async fn try_reconnect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        match ClientOptions::new().open(&pipe_path) {
            Ok(client) => {
                info!("mpv: reconnected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                Some(start_io_tasks(read_half, write_half, event_tx))
            }
            Err(e) => {
                warn!("mpv: failed to reconnect to named pipe: {}", e);
                None
            }
        }
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<MpvRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(Value::as_u64) else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                    continue;
                };

                let Some(tx) = pending.lock().await.remove(&req_id) else {
                    debug!("mpv reader: response for unknown req={}", req_id);
                    continue;
                };
                let result = if val["error"].as_str() == Some("success") {
                    Ok(val)
                } else {
                    let err = val["error"].as_str().unwrap_or("unknown error");
                    debug!("mpv reader: req={} failed: {}", req_id, err);
                    Err(anyhow::anyhow!("mpv error: {}", err))
                };
                let _ = tx.send(result);
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<MpvRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Registered first so the reader can always match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}
