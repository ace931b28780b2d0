//! Fallback audio URL resolution.
//!
//! A [`SourceRegistry`] lists candidate sources in priority order.  The
//! [`FallbackController`] walks that list for one song at a time, asking the
//! [`SourceResolver`] for a URL and handing the first one that works to a
//! [`PlaybackSink`].  Script sources run through [`plugin::ScriptPluginLoader`].

pub mod controller;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod resolver;

pub use controller::{ControllerEvent, FallbackController, PlaybackSession, PlaybackSink};
pub use error::{AttemptError, PlayError, RegistryError, ResolveError, ScriptError, SinkError};
pub use registry::SourceRegistry;
pub use resolver::{Resolve, ResolvedAudio, SourceResolver};
