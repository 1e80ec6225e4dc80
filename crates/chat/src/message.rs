use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// How the rendering side should interpret message content.
///
/// Plain text is treated as markdown by the client; markup is inserted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContentKind {
    #[default]
    #[serde(rename = "markdown")]
    Text,
    #[serde(rename = "html")]
    Markup,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderableContent {
    kind: ContentKind,
    value: String,
}

impl RenderableContent {
    pub fn new(kind: ContentKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::new(ContentKind::Text, value)
    }

    pub fn markup(value: impl Into<String>) -> Self {
        Self::new(ContentKind::Markup, value)
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

/// Pre-rendered markup that must not be interpreted as markdown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Markup(pub String);

impl Markup {
    pub fn new(html: impl Into<String>) -> Self {
        Self(html.into())
    }
}

/// A client-side dependency (script/stylesheet bundle) needed to render content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Asset {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Insertion-ordered set of assets, unique by name and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct AssetSet(Vec<Asset>);

impl AssetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset: Asset) -> bool {
        let exists = self
            .0
            .iter()
            .any(|known| known.name == asset.name && known.version == asset.version);
        if exists {
            return false;
        }
        self.0.push(asset);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Asset> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for AssetSet {
    type Item = Asset;
    type IntoIter = std::vec::IntoIter<Asset>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Extend<Asset> for AssetSet {
    fn extend<I: IntoIterator<Item = Asset>>(&mut self, iter: I) {
        for asset in iter {
            self.insert(asset);
        }
    }
}

impl FromIterator<Asset> for AssetSet {
    fn from_iter<I: IntoIterator<Item = Asset>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

/// Output of rendering a UI object into markup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedHtml {
    pub html: String,
    pub assets: Vec<Asset>,
}

/// Anything that can render itself into markup for the chat widget.
pub trait Renderable: fmt::Debug + Send + Sync {
    fn render(&self) -> RenderedHtml;
}

/// Shared handle to a renderable UI object, used as a chunk or message value.
#[derive(Debug, Clone)]
pub struct Ui(Arc<dyn Renderable>);

impl Ui {
    pub fn new(renderable: impl Renderable + 'static) -> Self {
        Self(Arc::new(renderable))
    }

    pub fn render(&self) -> RenderedHtml {
        self.0.render()
    }
}

/// Normalized, role-tagged message as stored in history.
///
/// Once built, a message is never mutated; history entries are replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CanonicalMessage {
    role: Role,
    content: RenderableContent,
    assets: AssetSet,
}

impl CanonicalMessage {
    pub fn new(role: Role, content: RenderableContent) -> Self {
        Self {
            role,
            content,
            assets: AssetSet::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, RenderableContent::text(content))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, RenderableContent::text(content))
    }

    pub fn with_assets(mut self, assets: impl IntoIterator<Item = Asset>) -> Self {
        self.assets.extend(assets);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &RenderableContent {
        &self.content
    }

    pub fn text(&self) -> &str {
        self.content.as_str()
    }

    pub fn assets(&self) -> &AssetSet {
        &self.assets
    }

    pub fn to_dict(&self) -> MessageDict {
        MessageDict {
            content: self.content.as_str().to_string(),
            role: self.role,
        }
    }
}

/// History entry as exposed to readers and persisted by bookmarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDict {
    pub content: String,
    #[serde(default)]
    pub role: Role,
}

impl MessageDict {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role,
        }
    }
}
