//! JavaScript script host backed by `boa_engine`.
//!
//! Architecture:
//!
//! ```text
//!   JsScriptHost (Send + Sync, cloneable sender)
//!         │  HostCommand via mpsc
//!         ▼
//!   host thread ── owns every boa Context (they are !Send)
//!         │  one Context per injected script, keyed by script id
//!         └── replies via oneshot::Sender
//! ```
//!
//! Each injected script gets its own realm, so `remove` drops every global
//! the script published.  The loader's exclusion lock still serialises
//! cycles, which keeps the thread's queue short.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use boa_engine::{Context, JsResult, Source};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ScriptHandle, ScriptHost, ScriptSource};
use crate::error::ScriptError;

/// Loop iterations a single evaluation may run before it is aborted.
const LOOP_ITERATION_LIMIT: u64 = 10_000_000;

/// Global the invocation shim writes its settled outcome into.
const OUTCOME_SLOT: &str = "__songfallOutcome";

enum HostCommand {
    Inject {
        id: u64,
        code: String,
        reply: oneshot::Sender<Result<(), ScriptError>>,
    },
    HasCapability {
        id: u64,
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Invoke {
        id: u64,
        name: String,
        song_id: String,
        reply: oneshot::Sender<Result<Option<String>, ScriptError>>,
    },
    Remove {
        id: u64,
    },
}

/// Settled result of a capability call, as serialised by the shim.
#[derive(Debug, Deserialize)]
struct InvokeOutcome {
    ok: bool,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct JsScriptHost {
    tx: mpsc::UnboundedSender<HostCommand>,
    next_id: AtomicU64,
    attached: Arc<AtomicUsize>,
}

impl JsScriptHost {
    /// Start the host thread.
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("songfall-js".to_string())
            .spawn(move || host_thread(rx))?;
        info!("js host: thread started");
        Ok(Self {
            tx,
            next_id: AtomicU64::new(1),
            attached: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// Sends `Remove` unless disarmed, so an abandoned `inject` future cannot
/// leave its script attached.
struct PendingInjection<'a> {
    tx: &'a mpsc::UnboundedSender<HostCommand>,
    id: u64,
    armed: bool,
}

impl Drop for PendingInjection<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.tx.send(HostCommand::Remove { id: self.id });
        }
    }
}

#[async_trait]
impl ScriptHost for JsScriptHost {
    async fn inject(&self, script: ScriptSource) -> Result<ScriptHandle, ScriptError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pending = PendingInjection {
            tx: &self.tx,
            id,
            armed: true,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Inject {
                id,
                code: script.code,
                reply: reply_tx,
            })
            .map_err(|_| ScriptError::HostGone)?;

        let result = reply_rx.await.map_err(|_| ScriptError::HostGone)?;
        pending.armed = false;
        result?;

        self.attached.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptHandle::new(id, script.url))
    }

    async fn has_capability(&self, handle: &ScriptHandle, name: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.tx.send(HostCommand::HasCapability {
            id: handle.id(),
            name: name.to_string(),
            reply: reply_tx,
        });
        if sent.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    async fn invoke(
        &self,
        handle: &ScriptHandle,
        name: &str,
        song_id: &str,
    ) -> Result<Option<String>, ScriptError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HostCommand::Invoke {
                id: handle.id(),
                name: name.to_string(),
                song_id: song_id.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| ScriptError::HostGone)?;
        reply_rx.await.map_err(|_| ScriptError::HostGone)?
    }

    fn remove(&self, handle: &ScriptHandle) {
        // Commands are processed in order, so anything sent after this sees
        // the script gone even if the thread has not dropped it yet.
        if self.tx.send(HostCommand::Remove { id: handle.id() }).is_err() {
            warn!("js host: thread gone while removing script {}", handle.id());
        }
        self.attached.fetch_sub(1, Ordering::SeqCst);
    }

    fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }
}

// ── host thread ───────────────────────────────────────────────────────────────

fn host_thread(mut rx: mpsc::UnboundedReceiver<HostCommand>) {
    let mut scripts: HashMap<u64, Context> = HashMap::new();

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            HostCommand::Inject { id, code, reply } => {
                let loaded = new_context().and_then(|mut context| {
                    context.eval(Source::from_bytes(code.as_bytes()))?;
                    Ok(context)
                });
                let result = match loaded {
                    Ok(mut context) => {
                        let _ = context.run_jobs();
                        scripts.insert(id, context);
                        debug!("js host: script {} attached ({} live)", id, scripts.len());
                        Ok(())
                    }
                    Err(e) => Err(ScriptError::Evaluation(e.to_string())),
                };
                let _ = reply.send(result);
            }
            HostCommand::HasCapability { id, name, reply } => {
                let found = scripts
                    .get_mut(&id)
                    .map(|context| capability_is_function(context, &name))
                    .unwrap_or(false);
                let _ = reply.send(found);
            }
            HostCommand::Invoke {
                id,
                name,
                song_id,
                reply,
            } => {
                let result = match scripts.get_mut(&id) {
                    Some(context) => invoke_capability(context, &name, &song_id),
                    None => Err(ScriptError::MissingCapability(name)),
                };
                let _ = reply.send(result);
            }
            HostCommand::Remove { id } => {
                if scripts.remove(&id).is_some() {
                    debug!("js host: script {} removed ({} live)", id, scripts.len());
                }
            }
        }
    }

    debug!("js host: channel closed, thread exiting");
}

/// Plugins written for a browser publish onto `window` or `self`.
const BROWSER_GLOBALS: &str = "globalThis.window = globalThis; globalThis.self = globalThis;";

fn new_context() -> JsResult<Context> {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
    context.eval(Source::from_bytes(BROWSER_GLOBALS))?;
    Ok(context)
}

/// JSON string literals are valid JS string literals, which keeps names and
/// song ids from being interpreted as code.
fn js_literal(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn capability_is_function(context: &mut Context, name: &str) -> bool {
    let probe = format!("typeof globalThis[{}] === \"function\"", js_literal(name));
    match context.eval(Source::from_bytes(probe.as_bytes())) {
        Ok(value) => value.as_boolean().unwrap_or(false),
        Err(e) => {
            debug!("js host: capability probe for {} failed: {}", name, e);
            false
        }
    }
}

fn invoke_capability(
    context: &mut Context,
    name: &str,
    song_id: &str,
) -> Result<Option<String>, ScriptError> {
    if !capability_is_function(context, name) {
        return Err(ScriptError::MissingCapability(name.to_string()));
    }

    // Sync returns and promises settle the same way.  A plain `{ url }`
    // object is accepted as well as a bare string.
    let shim = format!(
        r#"(() => {{
  globalThis.{slot} = undefined;
  Promise.resolve()
    .then(() => globalThis[{name}]({arg}))
    .then(
      (value) => {{
        const url = typeof value === "string"
          ? value
          : (value && typeof value.url === "string" ? value.url : null);
        globalThis.{slot} = {{ ok: true, value: url }};
      }},
      (error) => {{
        globalThis.{slot} = {{ ok: false, error: String(error) }};
      }}
    );
}})();"#,
        slot = OUTCOME_SLOT,
        name = js_literal(name),
        arg = js_literal(song_id),
    );
    context
        .eval(Source::from_bytes(shim.as_bytes()))
        .map_err(|e| ScriptError::Invocation(e.to_string()))?;
    let _ = context.run_jobs();

    let read = format!("JSON.stringify(globalThis.{} ?? null)", OUTCOME_SLOT);
    let raw = context
        .eval(Source::from_bytes(read.as_bytes()))
        .map_err(|e| ScriptError::Invocation(e.to_string()))?;
    let json = raw
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|| "null".to_string());

    let outcome: Option<InvokeOutcome> = serde_json::from_str(&json)
        .map_err(|e| ScriptError::Invocation(format!("unreadable outcome: {}", e)))?;
    match outcome {
        Some(InvokeOutcome { ok: true, value, .. }) => Ok(value),
        Some(InvokeOutcome { error, .. }) => Err(ScriptError::Invocation(
            error.unwrap_or_else(|| "unknown error".to_string()),
        )),
        None => Err(ScriptError::Invocation(format!(
            "{} never settled",
            name
        ))),
    }
}
