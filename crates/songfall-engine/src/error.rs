//! Error types for the fallback engine.
//!
//! Everything except [`PlayError`] is recoverable: the controller turns it
//! into a cursor advance and never lets it cross the component boundary.

/// Why a single source could not produce a URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Transport failure or non-success HTTP status
    #[error("network error: {0}")]
    Network(String),

    /// Song missing from the listing, entry without URL, or unreadable listing
    #[error("not found: {0}")]
    NotFound(String),

    /// Script could not be fetched or evaluated, or the namespace was busy
    #[error("plugin load failed: {0}")]
    PluginLoad(String),

    /// Script loaded but never published the expected function
    #[error("plugin does not publish {0}")]
    PluginMethodMissing(String),

    /// Capability raised, timed out, or returned no usable URL
    #[error("plugin resolution failed: {0}")]
    PluginResolution(String),
}

/// Failures reported by a [`crate::plugin::ScriptHost`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    #[error("capability {0} is not published")]
    MissingCapability(String),

    #[error("capability raised: {0}")]
    Invocation(String),

    #[error("script host is not running")]
    HostGone,
}

/// The playback device refused a URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("playback rejected: {0}")]
    Rejected(String),

    #[error("playback device unavailable")]
    Unavailable,

    /// Playback started, then stopped with an error
    #[error("playback failed after it started")]
    Interrupted,
}

/// One failed attempt, whichever side it failed on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Outcome of a play request that did not end in playback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlayError {
    /// Every source was tried once for this request
    #[error("no source could play song {song_id} after {attempts} attempts")]
    Exhausted { song_id: String, attempts: usize },

    /// A newer request replaced this one before it finished
    #[error("request for song {0} was superseded")]
    Superseded(String),

    #[error("source index {index} out of range (registry has {len} sources)")]
    InvalidSource { index: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("source registry needs at least one source")]
    Empty,
}
