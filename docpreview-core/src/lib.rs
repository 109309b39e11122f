use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bus;
pub mod config;
pub mod controller;
pub mod links;
pub mod options;
pub mod viewport;

pub use bus::{BusEvent, BusEventKind, EventBus, FindCommand, SubscriptionId};
pub use config::{ConfigError, PreviewConfig};
pub use controller::{
    ControllerMessage, EngineFactory, EngineInit, EngineOptions, LoadState, RenderEngine,
    ViewerEvent, ViewportController,
};
pub use links::LinkService;
pub use options::{RenderMode, ViewerInput, ViewerProps, ZoomFactor, ZoomFit};
pub use viewport::{ContainerSize, PageSurface, ResizeObserver, ViewportContainer};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0e5a9c-61d2-5b7e-9c4a-1d8e2b7f6a90").expect("valid namespace UUID")
});

/// Stable identifier for a document location; the same location always maps
/// to the same id.
pub fn document_id_for_location(location: &str) -> DocumentId {
    Uuid::new_v5(&*DOCUMENT_NAMESPACE, location.trim().as_bytes())
}

/// Normalizes a rotation in degrees to one of `0`, `90`, `180` or `270`.
///
/// Returns `None` when the value is not a multiple of 90.
pub fn normalize_rotation(degrees: i32) -> Option<u16> {
    if degrees % 90 != 0 {
        return None;
    }
    Some(degrees.rem_euclid(360) as u16)
}

/// Where a document comes from. Opaque to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentSource {
    Location(String),
    Reference {
        location: String,
        #[serde(default)]
        password: Option<String>,
    },
}

impl DocumentSource {
    pub fn location(&self) -> &str {
        match self {
            DocumentSource::Location(location) => location,
            DocumentSource::Reference { location, .. } => location,
        }
    }

    pub fn password(&self) -> Option<&str> {
        match self {
            DocumentSource::Location(_) => None,
            DocumentSource::Reference { password, .. } => password.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.location().trim().is_empty()
    }
}

impl From<&str> for DocumentSource {
    fn from(location: &str) -> Self {
        DocumentSource::Location(location.to_owned())
    }
}

impl From<String> for DocumentSource {
    fn from(location: String) -> Self {
        DocumentSource::Location(location)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub location: String,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

/// Intrinsic page dimensions in points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    /// Dimensions as laid out under the given rotation.
    pub fn rotated(self, rotation: u16) -> Self {
        if rotation == 90 || rotation == 270 {
            Self {
                width: self.height,
                height: self.width,
            }
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    pub scale: f32,
    pub rotation: u16,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: 1.0,
            rotation: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Rectangle in page space, `0.0..=1.0` on both axes with a top-left origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl NormalizedRect {
    pub fn clamp(self) -> Self {
        let (left, right) = order(self.left.clamp(0.0, 1.0), self.right.clamp(0.0, 1.0));
        let (top, bottom) = order(self.top.clamp(0.0, 1.0), self.bottom.clamp(0.0, 1.0));
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }

    /// The same area after the page is turned clockwise by `rotation` degrees.
    pub fn rotated(self, rotation: u16) -> Self {
        let Self {
            left,
            top,
            right,
            bottom,
        } = self;
        match rotation {
            90 => Self {
                left: 1.0 - bottom,
                top: left,
                right: 1.0 - top,
                bottom: right,
            },
            180 => Self {
                left: 1.0 - right,
                top: 1.0 - bottom,
                right: 1.0 - left,
                bottom: 1.0 - top,
            },
            270 => Self {
                left: top,
                top: 1.0 - right,
                right: bottom,
                bottom: 1.0 - left,
            },
            _ => self,
        }
    }
}

fn order(a: f32, b: f32) -> (f32, f32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    GoTo { page_index: usize },
    Named { name: String },
    Uri { uri: String },
}

#[derive(Debug, Clone)]
pub struct LinkDefinition {
    pub rects: Vec<NormalizedRect>,
    pub action: LinkAction,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("document source is empty")]
    EmptySource,
    #[error("document not found at {location}")]
    NotFound { location: String },
    #[error("document at {location} requires a password")]
    PasswordRequired { location: String },
    #[error("incorrect password for document at {location}")]
    IncorrectPassword { location: String },
    #[error("document at {location} is corrupt or unsupported: {reason}")]
    Corrupt { location: String, reason: String },
    #[error("no async runtime available to load {location}")]
    NoRuntime { location: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A parsed document the rendering engine can paint from.
pub trait LoadedDocument: Send + Sync {
    fn info(&self) -> &DocumentInfo;

    fn page_count(&self) -> usize {
        self.info().page_count
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize>;

    fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;

    /// Every occurrence of `term` on the page, one entry per match, each match
    /// made of one or more line segments.
    fn search_page(
        &self,
        page_index: usize,
        term: &str,
        match_case: bool,
    ) -> Result<Vec<Vec<NormalizedRect>>>;

    fn page_links(&self, _page_index: usize) -> Result<Vec<LinkDefinition>> {
        Ok(Vec::new())
    }

    /// Zero-based page index a named destination points at.
    fn named_destination(&self, _name: &str) -> Option<usize> {
        None
    }
}

impl fmt::Debug for dyn LoadedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedDocument")
            .field("id", &self.info().id)
            .field("location", &self.info().location)
            .field("page_count", &self.page_count())
            .finish()
    }
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn LoadedDocument>, LoadError>;
}
