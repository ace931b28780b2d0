use serde::{Deserialize, Serialize};

/// Protocol a source speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A single HTTP fetch of a JSON listing of `{ id, url }` items.
    Json,
    /// Remote script that publishes a `get<Platform>Url` function when loaded.
    #[serde(alias = "js")]
    Script,
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Script => "script",
        }
    }
}

/// Static record identifying one resolver.  Built once from configuration and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    pub url: String,
    pub kind: SourceKind,
    /// Platform tag (e.g. "kuwo").  Only script sources use it, to derive the
    /// capability name.
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_platform() -> String {
    "general".to_string()
}

impl SourceDescriptor {
    pub fn json(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind: SourceKind::Json,
            platform: default_platform(),
        }
    }

    pub fn script(
        name: impl Into<String>,
        url: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind: SourceKind::Script,
            platform: platform.into(),
        }
    }

    /// Name of the function a script source is expected to publish.
    pub fn capability_name(&self) -> String {
        capability_name(&self.platform)
    }
}

/// `kuwo` → `getKuwoUrl`.  Only the first character is upper-cased; the rest
/// of the platform tag is kept verbatim.
pub fn capability_name(platform: &str) -> String {
    let mut chars = platform.chars();
    let mut name = String::with_capacity(platform.len() + 6);
    name.push_str("get");
    if let Some(first) = chars.next() {
        name.extend(first.to_uppercase());
        name.push_str(chars.as_str());
    }
    name.push_str("Url");
    name
}

/// Built-in fallback chain, in priority order.
pub fn default_sources() -> Vec<SourceDescriptor> {
    vec![
        SourceDescriptor::json(
            "general-1",
            "https://musicfreepluginshub.2020818.xyz/plugins.json",
        ),
        SourceDescriptor::json(
            "general-2",
            "https://fastly.jsdelivr.net/gh/Huibq/keep-alive/Music_Free/myPlugins.json",
        ),
        SourceDescriptor::json(
            "general-3",
            "https://gitlab.com/acoolbook/musicfree/-/raw/main/music.json",
        ),
        SourceDescriptor::script(
            "kuwo",
            "https://cdn.jsdelivr.net/gh/maotoumao/MusicFreePlugins@master/kuwo.js",
            "kuwo",
        ),
        SourceDescriptor::script(
            "netease",
            "https://cdn.jsdelivr.net/gh/maotoumao/MusicFreePlugins@master/netease.js",
            "netease",
        ),
        SourceDescriptor::script(
            "qq",
            "https://cdn.jsdelivr.net/gh/maotoumao/MusicFreePlugins@master/qq.js",
            "qq",
        ),
        SourceDescriptor::json(
            "general-7",
            "https://raw.githubusercontent.com/maotoumao/MusicFreePlugins/master/plugins.json",
        ),
    ]
}
