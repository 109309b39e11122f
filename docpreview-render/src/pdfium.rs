use std::convert::TryFrom;
use std::env;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use docpreview_core::{
    document_id_for_location, DocumentInfo, DocumentMetadata, DocumentProvider, DocumentSource,
    LinkAction, LinkDefinition, LoadError, LoadedDocument, NormalizedRect, PageSize, RenderImage,
    RenderRequest,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

/// Overrides where the pdfium shared library is loaded from.
pub const PDFIUM_LIBRARY_ENV: &str = "DOCPREVIEW_PDFIUM_LIBRARY_PATH";

/// Opens PDF documents through a dynamically bound pdfium library.
pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumProvider {
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn LoadedDocument>, LoadError> {
        if source.is_empty() {
            return Err(LoadError::EmptySource);
        }
        let location = source.location().trim();
        let absolute = Path::new(location).canonicalize().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                LoadError::NotFound {
                    location: location.to_owned(),
                }
            } else {
                LoadError::Backend(
                    anyhow::Error::new(err).context(format!("failed to resolve {location}")),
                )
            }
        })?;
        let password = source.password().map(str::to_owned);

        let info = build_document_info(&self.pdfium, &absolute, password.as_deref())
            .map_err(|err| classify_open_error(location, password.is_some(), err))?;
        debug!(location, page_count = info.page_count, "opened pdf");
        Ok(Arc::new(PdfiumDocument::new(
            Arc::clone(&self.pdfium),
            absolute,
            password,
            info,
        )))
    }
}

fn classify_open_error(location: &str, password_supplied: bool, err: PdfiumError) -> LoadError {
    let location = location.to_owned();
    match err {
        // pdfium reports a missing and a wrong password identically
        PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError) => {
            if password_supplied {
                LoadError::IncorrectPassword { location }
            } else {
                LoadError::PasswordRequired { location }
            }
        }
        PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::FileError) => {
            LoadError::NotFound { location }
        }
        PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::FormatError) => {
            LoadError::Corrupt {
                location,
                reason: "not a valid PDF".to_owned(),
            }
        }
        other => LoadError::Backend(anyhow!("failed to open {location}: {other}")),
    }
}

struct PdfiumDocument {
    document: Mutex<Option<PdfDocument<'static>>>,
    cache: Mutex<Option<RenderCacheEntry>>,
    pdfium: Arc<Pdfium>,
    path: PathBuf,
    password: Option<String>,
    info: DocumentInfo,
}

struct RenderCacheEntry {
    page_index: usize,
    scale: f32,
    rotation: u16,
    image: RenderImage,
}

impl PdfiumDocument {
    fn new(
        pdfium: Arc<Pdfium>,
        path: PathBuf,
        password: Option<String>,
        info: DocumentInfo,
    ) -> Self {
        Self {
            document: Mutex::new(None),
            cache: Mutex::new(None),
            pdfium,
            path,
            password,
            info,
        }
    }

    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, self.password.as_deref())
            .with_context(|| format!("failed to open {:?}", self.path))?;
        // SAFETY: the document borrows the bindings owned by `self.pdfium`. It is
        // stored in `self.document`, which is declared before `pdfium` and so is
        // dropped first.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_page<R, F>(&self, page_index: usize, f: F) -> Result<R>
    where
        F: FnOnce(&PdfPage<'_>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        let document = match guard.take() {
            Some(document) => document,
            None => self.open_document()?,
        };
        let document = guard.insert(document);

        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        let page = document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))?;
        f(&page)
    }
}

fn render_rotation(rotation: u16) -> PdfPageRenderRotation {
    match rotation {
        90 => PdfPageRenderRotation::Degrees90,
        180 => PdfPageRenderRotation::Degrees180,
        270 => PdfPageRenderRotation::Degrees270,
        _ => PdfPageRenderRotation::None,
    }
}

/// Converts a rectangle in PDF points (bottom-left origin) into page-relative
/// coordinates.
fn normalize(rect: &PdfRect, page_width: f32, page_height: f32) -> NormalizedRect {
    NormalizedRect {
        left: rect.left().value / page_width,
        top: 1.0 - rect.top().value / page_height,
        right: rect.right().value / page_width,
        bottom: 1.0 - rect.bottom().value / page_height,
    }
    .clamp()
}

impl LoadedDocument for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        self.with_page(page_index, |page| {
            Ok(PageSize {
                width: page.width().value,
                height: page.height().value,
            })
        })
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.as_ref() {
                if entry.page_index == request.page_index
                    && (entry.scale - request.scale).abs() < f32::EPSILON
                    && entry.rotation == request.rotation
                {
                    return Ok(entry.image.clone());
                }
            }
        }

        let image = self.with_page(request.page_index, |page| {
            let config = PdfRenderConfig::new()
                .scale_page_by_factor(request.scale.max(0.1))
                .rotate(render_rotation(request.rotation), true);
            let bitmap = page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", request.page_index))?;
            let pixels = bitmap.as_image().to_rgba8().into_raw();
            Ok(RenderImage {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels,
            })
        })?;

        *self.cache.lock() = Some(RenderCacheEntry {
            page_index: request.page_index,
            scale: request.scale,
            rotation: request.rotation,
            image: image.clone(),
        });
        Ok(image)
    }

    fn search_page(
        &self,
        page_index: usize,
        term: &str,
        match_case: bool,
    ) -> Result<Vec<Vec<NormalizedRect>>> {
        if term.trim().is_empty() {
            return Ok(Vec::new());
        }

        self.with_page(page_index, |page| {
            let page_width = page.width().value;
            let page_height = page.height().value;
            if page_width <= 0.0 || page_height <= 0.0 {
                return Ok(Vec::new());
            }

            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let options = PdfSearchOptions::new().match_case(match_case);
            let search = text
                .search(term, &options)
                .with_context(|| format!("failed to search page {}", page_index))?;

            let mut results = Vec::new();
            while let Some(segments) = search.find_next() {
                let rects: Vec<NormalizedRect> = segments
                    .iter()
                    .map(|segment| normalize(&segment.bounds(), page_width, page_height))
                    .filter(NormalizedRect::is_valid)
                    .collect();
                if !rects.is_empty() {
                    results.push(rects);
                }
            }
            Ok(results)
        })
    }

    fn page_links(&self, page_index: usize) -> Result<Vec<LinkDefinition>> {
        self.with_page(page_index, |page| {
            let page_width = page.width().value;
            let page_height = page.height().value;
            if page_width <= 0.0 || page_height <= 0.0 {
                return Ok(Vec::new());
            }

            let mut definitions = Vec::new();
            for link in page.links().iter() {
                let rect = match link.rect() {
                    Ok(rect) => normalize(&rect, page_width, page_height),
                    Err(err) => {
                        warn!(?err, page = page_index, "failed to resolve link rectangle");
                        continue;
                    }
                };
                if !rect.is_valid() {
                    continue;
                }
                let Some(action) = link_action(&link) else {
                    continue;
                };
                definitions.push(LinkDefinition {
                    rects: vec![rect],
                    action,
                });
            }
            Ok(definitions)
        })
    }
}

fn link_action(link: &PdfLink<'_>) -> Option<LinkAction> {
    if let Some(action) = link.action() {
        match action.action_type() {
            PdfActionType::GoToDestinationInSameDocument => {
                let page_index = action
                    .as_local_destination_action()
                    .and_then(|local| local.destination().ok())
                    .and_then(|destination| destination.page_index().ok());
                if let Some(page_index) = page_index {
                    return Some(LinkAction::GoTo {
                        page_index: page_index as usize,
                    });
                }
            }
            PdfActionType::Uri => {
                let uri = action
                    .as_uri_action()
                    .and_then(|uri_action| uri_action.uri().ok())
                    .filter(|uri| !uri.is_empty());
                if let Some(uri) = uri {
                    return Some(LinkAction::Uri { uri });
                }
            }
            _ => {}
        }
    }

    link.destination()
        .and_then(|destination| destination.page_index().ok())
        .map(|page_index| LinkAction::GoTo {
            page_index: page_index as usize,
        })
}

fn build_document_info(
    pdfium: &Pdfium,
    path: &Path,
    password: Option<&str>,
) -> Result<DocumentInfo, PdfiumError> {
    let document = pdfium.load_pdf_from_file(path, password)?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = document.metadata();

    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|tag| tag.value().to_owned());
    let author = metadata
        .get(PdfDocumentMetadataTagType::Author)
        .map(|tag| tag.value().to_owned());
    let keywords = metadata
        .get(PdfDocumentMetadataTagType::Keywords)
        .map(|tag| {
            tag.value()
                .split(',')
                .map(|keyword| keyword.trim().to_owned())
                .filter(|keyword| !keyword.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let location = path.display().to_string();
    Ok(DocumentInfo {
        id: document_id_for_location(&location),
        location,
        page_count,
        metadata: DocumentMetadata {
            title,
            author,
            keywords,
        },
    })
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    let path = env::var(PDFIUM_LIBRARY_ENV).ok().filter(|path| !path.is_empty())?;
    match Pdfium::bind_to_library(&path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!(%path, %err, "failed to load pdfium from {PDFIUM_LIBRARY_ENV}");
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; install it or set {} ({})",
                PDFIUM_LIBRARY_ENV,
                errors.join(", ")
            ))
        }
    }
}
