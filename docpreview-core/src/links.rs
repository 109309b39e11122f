use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::{LinkAction, LoadedDocument};

#[derive(Default)]
struct LinkState {
    document: Option<Arc<dyn LoadedDocument>>,
    viewer: Option<u64>,
}

/// Resolves in-document links to page numbers for the engine that owns it.
#[derive(Clone, Default)]
pub struct LinkService {
    inner: Arc<Mutex<LinkState>>,
}

impl LinkService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_document(&self, document: Option<Arc<dyn LoadedDocument>>) {
        self.inner.lock().document = document;
    }

    pub fn has_document(&self) -> bool {
        self.inner.lock().document.is_some()
    }

    /// Binds the service to the engine instance identified by `epoch`.
    pub fn attach_viewer(&self, epoch: u64) {
        self.inner.lock().viewer = Some(epoch);
    }

    pub fn detach_viewer(&self) {
        self.inner.lock().viewer = None;
    }

    pub fn viewer(&self) -> Option<u64> {
        self.inner.lock().viewer
    }

    /// One-based target page of `action`, or `None` for external links and
    /// destinations outside the document.
    pub fn resolve(&self, action: &LinkAction) -> Option<usize> {
        let state = self.inner.lock();
        let document = state.document.as_ref()?;
        let page_index = match action {
            LinkAction::GoTo { page_index } => *page_index,
            LinkAction::Named { name } => document.named_destination(name)?,
            LinkAction::Uri { uri } => {
                debug!(%uri, "external link is not resolvable in-document");
                return None;
            }
        };
        (page_index < document.page_count()).then_some(page_index + 1)
    }
}

impl std::fmt::Debug for LinkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("LinkService")
            .field("document", &state.document.is_some())
            .field("viewer", &state.viewer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        document_id_for_location, DocumentInfo, DocumentMetadata, NormalizedRect, PageSize,
        RenderImage, RenderRequest,
    };
    use anyhow::Result;

    struct Outline {
        info: DocumentInfo,
    }

    impl LoadedDocument for Outline {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn page_size(&self, _page_index: usize) -> Result<PageSize> {
            Ok(PageSize {
                width: 100.0,
                height: 100.0,
            })
        }

        fn render_page(&self, _request: RenderRequest) -> Result<RenderImage> {
            anyhow::bail!("not rendered in tests")
        }

        fn search_page(
            &self,
            _page_index: usize,
            _term: &str,
            _match_case: bool,
        ) -> Result<Vec<Vec<NormalizedRect>>> {
            Ok(Vec::new())
        }

        fn named_destination(&self, name: &str) -> Option<usize> {
            (name == "appendix").then_some(3)
        }
    }

    fn service_with_pages(page_count: usize) -> LinkService {
        let service = LinkService::new();
        service.set_document(Some(Arc::new(Outline {
            info: DocumentInfo {
                id: document_id_for_location("outline.pdf"),
                location: "outline.pdf".into(),
                page_count,
                metadata: DocumentMetadata::default(),
            },
        })));
        service
    }

    #[test]
    fn resolves_internal_destinations_to_page_numbers() {
        let service = service_with_pages(5);
        assert_eq!(service.resolve(&LinkAction::GoTo { page_index: 0 }), Some(1));
        assert_eq!(
            service.resolve(&LinkAction::Named {
                name: "appendix".into()
            }),
            Some(4)
        );
        assert_eq!(
            service.resolve(&LinkAction::Named {
                name: "missing".into()
            }),
            None
        );
        assert_eq!(service.resolve(&LinkAction::GoTo { page_index: 5 }), None);
    }

    #[test]
    fn external_links_and_detached_documents_do_not_resolve() {
        let service = service_with_pages(5);
        assert_eq!(
            service.resolve(&LinkAction::Uri {
                uri: "https://example.com".into()
            }),
            None
        );
        service.set_document(None);
        assert_eq!(service.resolve(&LinkAction::GoTo { page_index: 0 }), None);
    }
}
