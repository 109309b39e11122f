use std::sync::Arc;

use docpreview_core::{
    normalize_rotation, BusEvent, BusEventKind, EngineFactory, EngineInit, EngineOptions,
    EventBus, FindCommand, LinkAction, LinkService, LoadedDocument, NormalizedRect, PageSurface,
    RenderEngine, RenderMode, RenderRequest, SubscriptionId, ViewportContainer, ZoomFit,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, instrument, warn};

/// Blank space kept around pages, in pixels.
pub const PAGE_GAP: f32 = 10.0;
pub const MIN_SCALE: f32 = 0.1;
pub const MAX_SCALE: f32 = 10.0;
/// Upper bound on pages painted at once in continuous mode.
pub const MAX_VISIBLE_PAGES: usize = 4;

#[derive(Debug, Default, Clone, Copy)]
pub struct PageViewerFactory;

impl EngineFactory for PageViewerFactory {
    fn create(&self, init: EngineInit) -> Box<dyn RenderEngine> {
        Box::new(PageViewer::new(init))
    }
}

/// Paints the pages of a loaded document into a [`ViewportContainer`].
pub struct PageViewer {
    container: ViewportContainer,
    bus: EventBus,
    links: LinkService,
    options: EngineOptions,
    document: Option<Arc<dyn LoadedDocument>>,
    current_page: usize,
    scale: f32,
    rotation: u16,
    pending_find: Arc<Mutex<Option<FindCommand>>>,
    active_find: Option<FindCommand>,
    find_subscription: Option<SubscriptionId>,
    report_visible: bool,
    visible: Vec<usize>,
    dirty: bool,
}

impl PageViewer {
    pub fn new(init: EngineInit) -> Self {
        let EngineInit {
            container,
            bus,
            links,
            options,
        } = init;

        let pending_find = Arc::new(Mutex::new(None));
        let find_subscription = options.text_layer.then(|| {
            let pending = Arc::clone(&pending_find);
            bus.subscribe(BusEventKind::Find, move |event| {
                if let BusEvent::Find(command) = event {
                    *pending.lock() = Some(command.clone());
                }
            })
        });

        Self {
            container,
            bus,
            links,
            options,
            document: None,
            current_page: 1,
            scale: 1.0,
            rotation: 0,
            pending_find,
            active_find: None,
            find_subscription,
            report_visible: false,
            visible: Vec::new(),
            dirty: false,
        }
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    fn go_to(&mut self, page: usize) {
        if page == self.current_page {
            return;
        }
        let previous = self.current_page;
        self.current_page = page;
        self.dirty = true;
        self.bus.dispatch(BusEvent::PageChanging { page, previous });
    }

    fn visible_pages(&self, document: &dyn LoadedDocument) -> Vec<usize> {
        let page_count = document.page_count();
        if self.options.render_mode == RenderMode::Single {
            return vec![self.current_page];
        }

        let available = self.container.size().height as f32;
        let mut used = 0.0;
        let mut pages = Vec::new();
        for page in self.current_page..=page_count {
            if pages.len() == MAX_VISIBLE_PAGES || (!pages.is_empty() && used >= available) {
                break;
            }
            let height = document
                .page_size(page - 1)
                .map(|size| size.rotated(self.rotation).height * self.scale)
                .unwrap_or(0.0);
            pages.push(page);
            used += height + PAGE_GAP;
        }
        pages
    }

    fn highlights(&self, document: &dyn LoadedDocument, page: usize) -> Vec<NormalizedRect> {
        if !self.options.text_layer {
            return Vec::new();
        }
        let Some(find) = &self.active_find else {
            return Vec::new();
        };
        if find.query.is_empty() {
            return Vec::new();
        }

        let terms: Vec<&str> = if find.phrase_search {
            vec![find.query.as_str()]
        } else {
            find.query.split_whitespace().collect()
        };

        let mut rects = Vec::new();
        for term in terms {
            match document.search_page(page - 1, term, find.case_sensitive) {
                Ok(matches) => {
                    for segments in matches {
                        rects.extend(segments.into_iter().map(|rect| rect.rotated(self.rotation)));
                        if !find.highlight_all {
                            return rects;
                        }
                    }
                }
                Err(err) => warn!(?err, page, term, "search failed"),
            }
        }
        rects
    }
}

impl RenderEngine for PageViewer {
    fn set_document(&mut self, document: Option<Arc<dyn LoadedDocument>>) {
        self.document = document;
        self.current_page = 1;
        self.active_find = None;
        self.visible.clear();
        self.dirty = true;
        match &self.document {
            Some(document) => {
                let page_count = document.page_count();
                self.bus
                    .dispatch(BusEvent::PagesInitialized { page_count });
            }
            None => self.container.clear(),
        }
    }

    fn pages_count(&self) -> usize {
        self.document
            .as_ref()
            .map(|document| document.page_count())
            .unwrap_or(0)
    }

    fn current_page(&self) -> usize {
        self.current_page
    }

    fn set_current_page(&mut self, page: usize) {
        let page_count = self.pages_count();
        if page_count == 0 {
            self.current_page = page.max(1);
            return;
        }
        if page < 1 || page > page_count {
            warn!(page, page_count, "ignoring out-of-range page");
            return;
        }
        self.go_to(page);
    }

    fn current_scale(&self) -> f32 {
        self.scale
    }

    fn set_current_scale(&mut self, scale: f32) {
        if !scale.is_finite() || scale <= 0.0 {
            warn!(scale, "ignoring invalid scale");
            return;
        }
        let scale = scale.clamp(MIN_SCALE, MAX_SCALE);
        if (scale - self.scale).abs() > f32::EPSILON {
            self.scale = scale;
            self.dirty = true;
        }
    }

    fn set_scale_value(&mut self, fit: ZoomFit) -> bool {
        let Some(document) = self.document.clone() else {
            return false;
        };
        let size = self.container.size();
        let measurable = match fit {
            ZoomFit::PageWidth => size.width > 0,
            ZoomFit::PageFit => !size.is_empty(),
        };
        if !measurable {
            debug!(fit = fit.as_str(), ?size, "container has no usable size yet");
            return false;
        }
        let page = match document.page_size(self.current_page - 1) {
            Ok(page) => page.rotated(self.rotation),
            Err(err) => {
                warn!(?err, page = self.current_page, "failed to read page size");
                return false;
            }
        };
        if page.width <= 0.0 || page.height <= 0.0 {
            return false;
        }

        let width_scale = (size.width as f32 - 2.0 * PAGE_GAP).max(1.0) / page.width;
        let scale = match fit {
            ZoomFit::PageWidth => width_scale,
            ZoomFit::PageFit => {
                let height_scale = (size.height as f32 - 2.0 * PAGE_GAP).max(1.0) / page.height;
                width_scale.min(height_scale)
            }
        };
        self.set_current_scale(scale);
        true
    }

    fn rotation(&self) -> u16 {
        self.rotation
    }

    fn set_rotation(&mut self, degrees: i32) {
        match normalize_rotation(degrees) {
            Some(rotation) if rotation != self.rotation => {
                self.rotation = rotation;
                self.dirty = true;
            }
            Some(_) => {}
            None => warn!(degrees, "rotation must be a multiple of 90 degrees"),
        }
    }

    fn report_visible_pages(&mut self, enabled: bool) {
        self.report_visible = enabled;
        if !enabled {
            self.visible.clear();
        }
    }

    fn scroll_by(&mut self, pages: isize) {
        let page_count = self.pages_count();
        if page_count == 0 {
            return;
        }
        let target = (self.current_page as isize)
            .saturating_add(pages)
            .clamp(1, page_count as isize);
        self.go_to(target as usize);
    }

    fn follow_link(&mut self, action: &LinkAction) -> bool {
        match self.links.resolve(action) {
            Some(page) => {
                self.go_to(page);
                true
            }
            None => false,
        }
    }

    #[instrument(skip(self), fields(page = self.current_page, scale = self.scale))]
    fn update(&mut self) {
        if let Some(command) = self.pending_find.lock().take() {
            if self.active_find.as_ref() != Some(&command) {
                self.active_find = Some(command);
                self.dirty = true;
            }
        }
        if !self.dirty {
            return;
        }
        let Some(document) = self.document.clone() else {
            return;
        };
        self.dirty = false;

        let pages = self.visible_pages(document.as_ref());
        let scale = self.scale;
        let rotation = self.rotation;
        let rendered: Vec<_> = pages
            .par_iter()
            .map(|&page| {
                let request = RenderRequest {
                    page_index: page - 1,
                    scale,
                    rotation,
                };
                (page, document.render_page(request))
            })
            .collect();

        let mut surfaces = Vec::with_capacity(rendered.len());
        for (page, result) in rendered {
            match result {
                Ok(image) => surfaces.push(PageSurface {
                    page,
                    image,
                    highlights: self.highlights(document.as_ref(), page),
                    text_selectable: self.options.text_layer,
                }),
                Err(err) => warn!(?err, page, "failed to render page"),
            }
        }

        let painted: Vec<usize> = surfaces.iter().map(|surface| surface.page).collect();
        self.container.present(surfaces);
        for &page in &painted {
            self.bus.dispatch(BusEvent::PageRendered { page });
        }
        if self.report_visible && painted != self.visible {
            self.visible = painted.clone();
            self.bus.dispatch(BusEvent::PagesVisible { pages: painted });
        }
    }

    fn cleanup(&mut self) {
        if let Some(id) = self.find_subscription.take() {
            self.bus.unsubscribe(id);
        }
        self.container.clear();
        self.document = None;
        self.active_find = None;
        self.pending_find.lock().take();
        self.visible.clear();
        self.dirty = false;
    }
}
