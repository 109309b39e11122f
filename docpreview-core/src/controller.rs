//! Drives a rendering engine from declarative viewer inputs.
//!
//! Asynchronous boundaries (document loads, engine notifications, container
//! resizes) never touch controller state directly: they post a
//! [`ControllerMessage`] to the controller's inbox, and the host applies them
//! with [`ViewportController::drain`] or [`ViewportController::tick`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::bus::{BusEvent, BusEventKind, EventBus, FindCommand, SubscriptionId};
use crate::links::LinkService;
use crate::options::{RenderMode, ViewerInput, ViewerProps, ZoomFactor, ZoomFit};
use crate::viewport::{ContainerSize, ResizeObserver, ViewportContainer};
use crate::{DocumentProvider, DocumentSource, LinkAction, LoadError, LoadedDocument};

/// Construction-time options; changing either requires a new engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub render_mode: RenderMode,
    /// Whether a selectable, searchable text layer is produced.
    pub text_layer: bool,
}

pub struct EngineInit {
    pub container: ViewportContainer,
    pub bus: EventBus,
    pub links: LinkService,
    pub options: EngineOptions,
}

/// The stateful page-rendering engine, as seen by the controller.
///
/// Pages are one-based. Implementations publish `PagesInitialized` when a
/// document is attached, `PageChanging` whenever the current page actually
/// changes, and `PageRendered` for every page painted by [`update`].
///
/// [`update`]: RenderEngine::update
pub trait RenderEngine: Send {
    fn set_document(&mut self, document: Option<Arc<dyn LoadedDocument>>);
    fn pages_count(&self) -> usize;
    fn current_page(&self) -> usize;
    fn set_current_page(&mut self, page: usize);
    fn current_scale(&self) -> f32;
    fn set_current_scale(&mut self, scale: f32);
    /// Recomputes the scale from the container and current page dimensions.
    /// Returns `false` and leaves the scale untouched when no fit scale can
    /// be derived, e.g. for a container without width.
    fn set_scale_value(&mut self, fit: ZoomFit) -> bool;
    fn rotation(&self) -> u16;
    fn set_rotation(&mut self, degrees: i32);
    /// Toggles publishing `PagesVisible` after each paint.
    fn report_visible_pages(&mut self, enabled: bool);
    /// User scrolling inside the container.
    fn scroll_by(&mut self, pages: isize);
    /// Returns whether the link led somewhere inside the document.
    fn follow_link(&mut self, action: &LinkAction) -> bool;
    /// Paints every page invalidated since the last update.
    fn update(&mut self);
    fn cleanup(&mut self);
}

pub trait EngineFactory: Send + Sync {
    fn create(&self, init: EngineInit) -> Box<dyn RenderEngine>;
}

#[derive(Debug, Clone)]
pub enum LoadState {
    NoSource,
    Loading { generation: u64 },
    Loaded { document: Arc<dyn LoadedDocument> },
    Failed { error: Arc<LoadError> },
}

impl LoadState {
    /// A load has been initiated for the current source.
    pub fn has_loaded(&self) -> bool {
        !matches!(self, LoadState::NoSource)
    }

    pub fn document(&self) -> Option<&Arc<dyn LoadedDocument>> {
        match self {
            LoadState::Loaded { document } => Some(document),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ViewerEvent {
    Loaded { page_count: usize },
    FirstPaint,
    LoadFailed(Arc<LoadError>),
    /// Navigation that originated in the engine (scrolling, links).
    PageChanged { page: usize },
}

#[derive(Debug)]
pub enum ControllerMessage {
    LoadSettled {
        generation: u64,
        result: Result<Arc<dyn LoadedDocument>, LoadError>,
    },
    Engine {
        epoch: u64,
        event: BusEvent,
    },
    Resized(ContainerSize),
}

const ENGINE_NOTIFICATIONS: [BusEventKind; 3] = [
    BusEventKind::PageRendered,
    BusEventKind::PagesInitialized,
    BusEventKind::PageChanging,
];

pub struct ViewportController {
    props: ViewerProps,
    provider: Arc<dyn DocumentProvider>,
    factory: Arc<dyn EngineFactory>,
    bus: EventBus,
    links: LinkService,
    container: Option<ViewportContainer>,
    engine: Option<Box<dyn RenderEngine>>,
    engine_epoch: u64,
    subscriptions: Vec<SubscriptionId>,
    resize_observer: Option<ResizeObserver>,
    state: LoadState,
    generation: u64,
    runtime: Option<Handle>,
    load_task: Option<JoinHandle<()>>,
    has_rendered_page: bool,
    last_viewer_page: Option<usize>,
    last_find_query: String,
    commanded_pages: VecDeque<usize>,
    torn_down: bool,
    inbox_tx: UnboundedSender<ControllerMessage>,
    inbox_rx: UnboundedReceiver<ControllerMessage>,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
}

impl ViewportController {
    /// Loads run on the runtime current at construction, if any.
    pub fn new(provider: Arc<dyn DocumentProvider>, factory: Arc<dyn EngineFactory>) -> Self {
        Self::build(provider, factory, Handle::try_current().ok())
    }

    pub fn with_runtime(
        provider: Arc<dyn DocumentProvider>,
        factory: Arc<dyn EngineFactory>,
        runtime: Handle,
    ) -> Self {
        Self::build(provider, factory, Some(runtime))
    }

    fn build(
        provider: Arc<dyn DocumentProvider>,
        factory: Arc<dyn EngineFactory>,
        runtime: Option<Handle>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            props: ViewerProps::default(),
            provider,
            factory,
            bus: EventBus::new(),
            links: LinkService::new(),
            container: None,
            engine: None,
            engine_epoch: 0,
            subscriptions: Vec::new(),
            resize_observer: None,
            state: LoadState::NoSource,
            generation: 0,
            runtime,
            load_task: None,
            has_rendered_page: false,
            last_viewer_page: None,
            last_find_query: String::new(),
            commanded_pages: VecDeque::new(),
            torn_down: false,
            inbox_tx,
            inbox_rx,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn props(&self) -> &ViewerProps {
        &self.props
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    pub fn page_count(&self) -> Option<usize> {
        self.state.document().map(|document| document.page_count())
    }

    pub fn engine(&self) -> Option<&dyn RenderEngine> {
        self.engine.as_deref()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn links(&self) -> &LinkService {
        &self.links
    }

    pub fn has_rendered_page(&self) -> bool {
        self.has_rendered_page
    }

    pub fn last_viewer_page(&self) -> Option<usize> {
        self.last_viewer_page
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn take_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Binds the controller to its container: starts observing resizes,
    /// builds the engine and starts a pending load.
    pub fn attach(&mut self, container: ViewportContainer) {
        self.container = Some(container);
        self.observe_resizes();
        self.init_engine();
        self.load_document();
    }

    pub fn apply(&mut self, input: ViewerInput) {
        match input {
            ViewerInput::SetSource(source) => self.set_source(source),
            ViewerInput::SetPage(page) => self.set_page(page),
            ViewerInput::SetRotation(rotation) => self.set_rotation(rotation),
            ViewerInput::SetRenderMode(mode) => self.set_render_mode(mode),
            ViewerInput::SetSelectable(selectable) => self.set_selectable(selectable),
            ViewerInput::SetSearch(query) => self.set_search(query),
            ViewerInput::SetZoom(zoom) => self.set_zoom(zoom),
            ViewerInput::SetZoomFit(fit) => self.set_zoom_fit(fit),
        }
    }

    pub fn set_source(&mut self, source: Option<DocumentSource>) {
        if self.props.source == source {
            return;
        }
        self.props.source = source;
        self.reset_document_state();
        self.load_document();
    }

    pub fn set_page(&mut self, page: Option<usize>) {
        if self.props.page == page {
            return;
        }
        self.props.page = page;
        self.apply_viewer_state();
    }

    pub fn set_rotation(&mut self, rotation: Option<i32>) {
        if self.props.rotation == rotation {
            return;
        }
        self.props.rotation = rotation;
        self.apply_viewer_state();
    }

    pub fn set_zoom(&mut self, zoom: ZoomFactor) {
        if self.props.zoom == zoom {
            return;
        }
        self.props.zoom = zoom;
        self.apply_viewer_state();
    }

    pub fn set_zoom_fit(&mut self, fit: ZoomFit) {
        if self.props.zoom_fit == fit {
            return;
        }
        self.props.zoom_fit = fit;
        self.observe_resizes();
        self.apply_viewer_state();
    }

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        if self.props.render_mode == mode {
            return;
        }
        self.props.render_mode = mode;
        self.init_engine();
    }

    pub fn set_selectable(&mut self, selectable: bool) {
        if self.props.selectable == selectable {
            return;
        }
        self.props.selectable = selectable;
        self.init_engine();
    }

    pub fn set_search(&mut self, query: String) {
        if self.props.search == query {
            return;
        }
        self.props.search = query;
        self.dispatch_find();
    }

    /// Asks the engine to paint pages invalidated since the last call.
    pub fn render(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.update();
        }
    }

    pub fn scroll_by(&mut self, pages: isize) {
        if let Some(engine) = self.engine.as_mut() {
            engine.scroll_by(pages);
        }
    }

    pub fn follow_link(&mut self, action: &LinkAction) -> bool {
        self.engine
            .as_mut()
            .map(|engine| engine.follow_link(action))
            .unwrap_or(false)
    }

    /// Follows the `ordinal`-th (one-based) link on the engine's current page.
    pub fn follow_page_link(&mut self, ordinal: usize) -> bool {
        let (Some(document), Some(engine)) = (self.state.document(), self.engine.as_ref()) else {
            return false;
        };
        let page = engine.current_page();
        let links = match document.page_links(page.saturating_sub(1)) {
            Ok(links) => links,
            Err(err) => {
                warn!(?err, page, "failed to read page links");
                return false;
            }
        };
        let Some(link) = ordinal.checked_sub(1).and_then(|index| links.get(index)) else {
            debug!(page, ordinal, available = links.len(), "no such link on page");
            return false;
        };
        let action = link.action.clone();
        self.follow_link(&action)
    }

    /// Applies every queued message without waiting; returns how many were
    /// handled.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.inbox_rx.try_recv() {
            self.handle(message);
            handled += 1;
        }
        handled
    }

    /// Waits for the next message and applies it.
    pub async fn tick(&mut self) -> bool {
        match self.inbox_rx.recv().await {
            Some(message) => {
                self.handle(message);
                true
            }
            None => false,
        }
    }

    pub fn handle(&mut self, message: ControllerMessage) {
        if self.torn_down {
            return;
        }
        match message {
            ControllerMessage::LoadSettled { generation, result } => {
                self.on_load_settled(generation, result)
            }
            ControllerMessage::Engine { epoch, event } => {
                if epoch != self.engine_epoch || self.engine.is_none() {
                    debug!(epoch, "ignoring notification from a replaced engine");
                    return;
                }
                match event {
                    BusEvent::PageRendered { page } => self.on_page_rendered(page),
                    BusEvent::PagesInitialized { .. } => self.apply_viewer_state(),
                    BusEvent::PageChanging { page, .. } => self.on_page_changing(page),
                    BusEvent::PagesVisible { .. } | BusEvent::Find(_) => {}
                }
            }
            ControllerMessage::Resized(size) => {
                debug!(?size, "container resized");
                self.apply_scale();
            }
        }
    }

    /// Releases subscriptions, the resize observer, the load task and the
    /// engine, in that order. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        self.torn_down = true;
        self.detach_subscriptions();
        if let Some(mut observer) = self.resize_observer.take() {
            observer.disconnect();
        }
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        if let Some(mut engine) = self.engine.take() {
            engine.cleanup();
            self.links.detach_viewer();
        }
    }

    fn reset_document_state(&mut self) {
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        self.state = LoadState::NoSource;
        self.has_rendered_page = false;
        self.last_find_query.clear();
        self.last_viewer_page = None;
        self.commanded_pages.clear();
        self.links.set_document(None);
        if let Some(engine) = self.engine.as_mut() {
            engine.set_document(None);
            engine.set_current_page(1);
        }
    }

    #[instrument(skip(self))]
    fn load_document(&mut self) {
        if self.state.has_loaded() {
            return;
        }
        let Some(source) = self.props.source.clone().filter(|source| !source.is_empty()) else {
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            let error = Arc::new(LoadError::NoRuntime {
                location: source.location().to_owned(),
            });
            warn!(%error, "cannot start document load");
            self.state = LoadState::Failed {
                error: Arc::clone(&error),
            };
            self.emit(ViewerEvent::LoadFailed(error));
            return;
        };
        self.state = LoadState::Loading { generation };
        info!(location = source.location(), generation, "loading document");

        let provider = Arc::clone(&self.provider);
        let inbox = self.inbox_tx.clone();
        self.load_task = Some(runtime.spawn(async move {
            let result = provider.open(&source).await;
            let _ = inbox.send(ControllerMessage::LoadSettled { generation, result });
        }));
    }

    fn on_load_settled(
        &mut self,
        generation: u64,
        result: Result<Arc<dyn LoadedDocument>, LoadError>,
    ) {
        let active = matches!(self.state, LoadState::Loading { generation: current } if current == generation);
        if !active {
            debug!(generation, "discarding result of a superseded load");
            return;
        }

        match result {
            Ok(document) => {
                let page_count = document.page_count();
                info!(page_count, location = %document.info().location, "document loaded");
                self.links.set_document(Some(Arc::clone(&document)));
                if let Some(engine) = self.engine.as_mut() {
                    engine.report_visible_pages(true);
                    engine.set_document(Some(Arc::clone(&document)));
                }
                self.state = LoadState::Loaded { document };
                self.apply_viewer_state();
                self.emit(ViewerEvent::Loaded { page_count });
            }
            Err(error) => {
                warn!(%error, "document failed to load");
                let error = Arc::new(error);
                self.state = LoadState::Failed {
                    error: Arc::clone(&error),
                };
                self.emit(ViewerEvent::LoadFailed(error));
            }
        }
    }

    fn init_engine(&mut self) {
        let Some(container) = self.container.clone() else {
            return;
        };
        container.clear();
        self.detach_subscriptions();
        if let Some(mut engine) = self.engine.take() {
            engine.cleanup();
        }
        self.links.detach_viewer();
        self.has_rendered_page = false;
        self.last_find_query.clear();
        self.last_viewer_page = None;
        self.commanded_pages.clear();

        self.engine_epoch += 1;
        let epoch = self.engine_epoch;
        let options = EngineOptions {
            render_mode: self.props.render_mode,
            text_layer: self.props.selectable,
        };
        info!(epoch, ?options, "initializing rendering engine");
        let mut engine = self.factory.create(EngineInit {
            container,
            bus: self.bus.clone(),
            links: self.links.clone(),
            options,
        });
        self.links.attach_viewer(epoch);
        self.subscribe_engine_notifications(epoch);

        let document = self.state.document().cloned();
        if let Some(document) = &document {
            engine.report_visible_pages(true);
            engine.set_document(Some(Arc::clone(document)));
        }
        self.engine = Some(engine);
        if document.is_some() {
            self.apply_viewer_state();
        }
    }

    fn subscribe_engine_notifications(&mut self, epoch: u64) {
        for kind in ENGINE_NOTIFICATIONS {
            let inbox = self.inbox_tx.clone();
            let id = self.bus.subscribe(kind, move |event| {
                let _ = inbox.send(ControllerMessage::Engine {
                    epoch,
                    event: event.clone(),
                });
            });
            self.subscriptions.push(id);
        }
    }

    fn detach_subscriptions(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
    }

    fn observe_resizes(&mut self) {
        if let Some(mut observer) = self.resize_observer.take() {
            observer.disconnect();
        }
        let Some(container) = &self.container else {
            return;
        };
        let inbox = self.inbox_tx.clone();
        self.resize_observer = Some(container.observe(move |size| {
            let _ = inbox.send(ControllerMessage::Resized(size));
        }));
    }

    fn apply_viewer_state(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let page_count = engine.pages_count();
        if page_count == 0 {
            return;
        }

        if let Some(rotation) = self.props.rotation {
            engine.set_rotation(rotation);
        }

        if let Some(requested) = self.props.page {
            if self.last_viewer_page == Some(requested) {
                debug!(page = requested, "page input echoes engine navigation");
                self.last_viewer_page = None;
            } else {
                let target = requested.clamp(1, page_count);
                if engine.current_page() != target {
                    self.commanded_pages.push_back(target);
                }
                engine.set_current_page(target);
            }
        }

        self.apply_scale();
        self.dispatch_find();
    }

    fn apply_scale(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if engine.pages_count() == 0 {
            return;
        }
        if !engine.set_scale_value(self.props.zoom_fit) {
            debug!("no fit scale available, keeping the current scale");
            return;
        }
        let multiplier = self.props.zoom.multiplier();
        if multiplier != 1.0 {
            let base = engine.current_scale();
            engine.set_current_scale(base * multiplier);
        }
    }

    fn dispatch_find(&mut self) {
        if !self.has_rendered_page {
            return;
        }
        let query = self.props.search.trim();
        if query == self.last_find_query {
            return;
        }
        self.last_find_query = query.to_owned();
        debug!(query, "dispatching find");
        self.bus.dispatch(BusEvent::Find(FindCommand {
            query: query.to_owned(),
            case_sensitive: false,
            highlight_all: !query.is_empty(),
            phrase_search: true,
        }));
    }

    fn on_page_rendered(&mut self, page: usize) {
        if !self.has_rendered_page {
            debug!(page, "first page painted");
            self.has_rendered_page = true;
            self.emit(ViewerEvent::FirstPaint);
        }
        self.dispatch_find();
    }

    fn on_page_changing(&mut self, page: usize) {
        self.last_viewer_page = Some(page);
        if let Some(position) = self.commanded_pages.iter().position(|p| *p == page) {
            self.commanded_pages.drain(..=position);
            return;
        }
        self.emit(ViewerEvent::PageChanged { page });
    }

    fn emit(&self, event: ViewerEvent) {
        self.events.lock().push(event);
    }
}

impl Drop for ViewportController {
    fn drop(&mut self) {
        self.teardown();
    }
}
