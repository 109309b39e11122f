use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use docpreview_core::{
    ContainerSize, DocumentSource, PreviewConfig, RenderImage, RenderMode, ViewerEvent,
    ViewerProps, ViewportContainer, ViewportController, ZoomFactor, ZoomFit,
};
use docpreview_render::{PageViewerFactory, PdfiumProvider};
use docpreview_tty::{
    compose_surfaces, write_status_line, DrawParams, EventMapper, KittyRenderer, UiEvent,
};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;

/// Fallback cell size in pixels for terminals that do not report one.
const FALLBACK_CELL: (u32, u32) = (8, 16);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Parser)]
#[command(
    name = "docpreview",
    version,
    about = "Terminal document preview driven by a declarative viewport controller"
)]
struct Args {
    /// Document to open: a path or a file:// URL
    file: String,

    /// Page to open on (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Password for encrypted documents
    #[arg(long)]
    password: Option<String>,

    /// Zoom multiplier applied on top of the fit mode
    #[arg(short = 'z', long)]
    zoom: Option<ZoomFactor>,

    /// Fit mode: page-fit or page-width
    #[arg(long)]
    fit: Option<ZoomFit>,

    /// Render mode: single or continuous
    #[arg(long)]
    mode: Option<RenderMode>,

    /// Disable the text layer (no search highlights)
    #[arg(long = "no-select")]
    no_select: bool,

    /// Initial search query
    #[arg(short = 's', long)]
    search: Option<String>,

    /// Config file to use instead of the platform default
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn viewer_props(&self, config: &PreviewConfig) -> Result<ViewerProps> {
        let location = resolve_location(&self.file)?;
        let mut props = config.viewer_props();
        props.source = Some(match &self.password {
            Some(password) => DocumentSource::Reference {
                location,
                password: Some(password.clone()),
            },
            None => DocumentSource::Location(location),
        });
        props.page = self.page;
        if let Some(zoom) = &self.zoom {
            props.zoom = zoom.clone();
        }
        if let Some(fit) = self.fit {
            props.zoom_fit = fit;
        }
        if let Some(mode) = self.mode {
            props.render_mode = mode;
        }
        if self.no_select {
            props.selectable = false;
        }
        if let Some(search) = &self.search {
            props.search = search.clone();
        }
        Ok(props)
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "docpreview", "docpreview")
        .ok_or_else(|| anyhow!("unable to resolve platform directories"))?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PreviewConfig::default_path(&project_dirs));
    let config = PreviewConfig::load(&config_path)?;
    let _log_guard = init_logging(&project_dirs, &config.log_filter)?;
    let props = args.viewer_props(&config)?;

    let provider = PdfiumProvider::new()?;
    let container = ViewportContainer::new(container_size()?);
    let mut controller = ViewportController::new(Arc::new(provider), Arc::new(PageViewerFactory));
    apply_props(&mut controller, props);
    controller.attach(container.clone());
    info!(file = %args.file, "preview started");

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide, Clear(ClearType::All))?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut event_mapper = EventMapper::new();
    let mut error: Option<String> = None;
    let mut dirty = true;

    loop {
        if controller.drain() > 0 {
            dirty = true;
        }
        controller.render();
        if controller.drain() > 0 {
            dirty = true;
        }

        for viewer_event in controller.take_events() {
            match viewer_event {
                ViewerEvent::Loaded { page_count } => info!(page_count, "document ready"),
                ViewerEvent::FirstPaint => {}
                ViewerEvent::LoadFailed(err) => error = Some(err.to_string()),
                // the host owns the page input, so engine navigation is fed back in
                ViewerEvent::PageChanged { page } => controller.set_page(Some(page)),
            }
            dirty = true;
        }

        if dirty {
            let status = combine_status(
                format_status(&args.file, &controller, error.as_deref()),
                event_mapper.pending_input().as_deref(),
            );
            redraw(&mut renderer, &container, &status)?;
            dirty = false;
        }

        if !event::poll(POLL_INTERVAL)? {
            continue;
        }
        match event::read()? {
            Event::Resize(_, _) => {
                container.resize(container_size()?);
                dirty = true;
            }
            ev => {
                let ui_event = event_mapper.map_event(ev);
                if ui_event == UiEvent::Quit {
                    break;
                }
                handle_event(ui_event, &mut controller);
                dirty = true;
            }
        }
    }

    controller.teardown();
    renderer.delete_image()?;
    renderer.clear_all()?;
    Ok(())
}

fn apply_props(controller: &mut ViewportController, props: ViewerProps) {
    controller.set_render_mode(props.render_mode);
    controller.set_selectable(props.selectable);
    controller.set_zoom_fit(props.zoom_fit);
    controller.set_zoom(props.zoom);
    controller.set_rotation(props.rotation);
    controller.set_page(props.page);
    controller.set_search(props.search);
    controller.set_source(props.source);
}

fn handle_event(event: UiEvent, controller: &mut ViewportController) {
    match event {
        UiEvent::Scroll { pages } => controller.scroll_by(pages),
        UiEvent::GotoPage { page } => controller.set_page(Some(page)),
        UiEvent::ZoomIn => {
            let zoom = controller.props().zoom.stepped(1);
            controller.set_zoom(zoom);
        }
        UiEvent::ZoomOut => {
            let zoom = controller.props().zoom.stepped(-1);
            controller.set_zoom(zoom);
        }
        UiEvent::ResetZoom => controller.set_zoom(ZoomFactor::default()),
        UiEvent::Rotate => {
            let rotation = controller.props().rotation.unwrap_or(0);
            controller.set_rotation(Some((rotation + 90).rem_euclid(360)));
        }
        UiEvent::ToggleFit => {
            let fit = controller.props().zoom_fit.toggled();
            controller.set_zoom_fit(fit);
        }
        UiEvent::ToggleRenderMode => {
            let mode = controller.props().render_mode.toggled();
            controller.set_render_mode(mode);
        }
        UiEvent::ToggleSelectable => {
            let selectable = !controller.props().selectable;
            controller.set_selectable(selectable);
        }
        UiEvent::FollowLink { ordinal } => {
            if !controller.follow_page_link(ordinal) {
                debug!(ordinal, "link not followed");
            }
        }
        UiEvent::SearchSubmit { query } => controller.set_search(query),
        UiEvent::ClearSearch => controller.set_search(String::new()),
        UiEvent::BeginSearch
        | UiEvent::SearchQueryChanged { .. }
        | UiEvent::SearchCancel
        | UiEvent::Quit
        | UiEvent::None => {}
    }
}

/// Accepts plain paths as well as `file://` URLs.
fn resolve_location(input: &str) -> Result<String> {
    if !input.starts_with("file://") {
        return Ok(input.to_owned());
    }
    let url = Url::parse(input).with_context(|| format!("invalid file URL {input}"))?;
    let path = url
        .to_file_path()
        .map_err(|_| anyhow!("{input} does not name a local file"))?;
    Ok(path.display().to_string())
}

/// Pixel area available to pages: the window minus the status row.
fn container_size() -> Result<ContainerSize> {
    let window = terminal::window_size()?;
    let (cell_width, cell_height) = cell_size(&window);
    let rows = u32::from(window.rows).saturating_sub(1);
    Ok(ContainerSize::new(
        u32::from(window.columns) * cell_width,
        rows * cell_height,
    ))
}

fn cell_size(window: &terminal::WindowSize) -> (u32, u32) {
    if window.width == 0 || window.height == 0 || window.columns == 0 || window.rows == 0 {
        return FALLBACK_CELL;
    }
    (
        (u32::from(window.width) / u32::from(window.columns)).max(1),
        (u32::from(window.height) / u32::from(window.rows)).max(1),
    )
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    container: &ViewportContainer,
    status: &str,
) -> Result<()> {
    let window = terminal::window_size()?;
    let (cell_width, cell_height) = cell_size(&window);
    let total_cols = u32::from(window.columns).max(1);
    let image_rows = u32::from(window.rows).saturating_sub(1).max(1);

    renderer.begin_sync_update()?;
    renderer.delete_image()?;
    if let Some(image) = compose_surfaces(&container.surfaces()) {
        let image = crop_to_height(image, container.size().height);
        let columns = image.width.div_ceil(cell_width).min(total_cols);
        let rows = image.height.div_ceil(cell_height).min(image_rows);
        let offset = (total_cols - columns) / 2;
        {
            let mut writer = renderer.writer();
            crossterm::execute!(&mut writer, cursor::MoveTo(offset as u16, 0))?;
        }
        renderer.draw(&image, DrawParams::clamped(columns, rows))?;
    }
    draw_status_line(renderer, image_rows, status)?;
    renderer.end_sync_update()?;
    Ok(())
}

/// Drops rows past `max_height`; pages below the fold are not shown.
fn crop_to_height(mut image: RenderImage, max_height: u32) -> RenderImage {
    if max_height == 0 || image.height <= max_height {
        return image;
    }
    image.pixels.truncate((image.width * max_height * 4) as usize);
    image.height = max_height;
    image
}

fn draw_status_line(
    renderer: &mut KittyRenderer<io::Stdout>,
    row: u32,
    status: &str,
) -> Result<()> {
    let mut writer = renderer.writer();
    crossterm::execute!(
        &mut writer,
        cursor::MoveTo(0, row as u16),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(&mut writer, status)?;
    Ok(())
}

fn format_status(file: &str, controller: &ViewportController, error: Option<&str>) -> String {
    let name = Path::new(file)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(file);
    if let Some(error) = error {
        return format!("{name} | error: {error}");
    }
    let Some(page_count) = controller.page_count() else {
        return format!("{name} | loading");
    };

    let props = controller.props();
    let page = controller
        .engine()
        .map(|engine| engine.current_page())
        .unwrap_or(1);
    let scale = controller
        .engine()
        .map(|engine| engine.current_scale() * 100.0)
        .unwrap_or(100.0);
    let mode = match props.render_mode {
        RenderMode::Single => "single",
        RenderMode::Continuous => "continuous",
    };

    let mut status = format!(
        "{name} | page {page}/{page_count} | {scale:.0}% ({}) | {mode}",
        props.zoom_fit.as_str()
    );
    if props.rotation.unwrap_or(0) != 0 {
        status.push_str(&format!(" | {}°", props.rotation.unwrap_or(0)));
    }
    if !props.search.trim().is_empty() {
        status.push_str(" | /");
        status.push_str(props.search.trim());
    }
    status
}

fn combine_status(base: String, pending_input: Option<&str>) -> String {
    match pending_input.filter(|pending| !pending.is_empty()) {
        Some(pending) => format!("{base} | {pending}"),
        None => base,
    }
}

fn init_logging(project_dirs: &ProjectDirs, default_filter: &str) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "docpreview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_urls_resolve_to_paths() {
        assert_eq!(resolve_location("notes.pdf").unwrap(), "notes.pdf");
        assert_eq!(
            resolve_location("file:///tmp/report.pdf").unwrap(),
            "/tmp/report.pdf"
        );
        assert!(resolve_location("file://remote-host/report.pdf").is_err());
    }

    #[test]
    fn arguments_override_config_defaults() {
        let args = Args::try_parse_from([
            "docpreview",
            "report.pdf",
            "--page",
            "3",
            "--fit",
            "page-fit",
            "--mode",
            "single",
            "--no-select",
            "--password",
            "pw",
        ])
        .unwrap();
        let config = PreviewConfig {
            zoom: ZoomFactor::new("1.5"),
            ..PreviewConfig::default()
        };

        let props = args.viewer_props(&config).unwrap();
        assert_eq!(props.page, Some(3));
        assert_eq!(props.zoom_fit, ZoomFit::PageFit);
        assert_eq!(props.render_mode, RenderMode::Single);
        assert_eq!(props.zoom.as_str(), "1.5");
        assert!(!props.selectable);
        let source = props.source.unwrap();
        assert_eq!(source.location(), "report.pdf");
        assert_eq!(source.password(), Some("pw"));
    }

    #[test]
    fn unknown_fit_is_rejected() {
        assert!(Args::try_parse_from(["docpreview", "a.pdf", "--fit", "sideways"]).is_err());
    }

    #[test]
    fn crop_keeps_whole_rows() {
        let image = RenderImage {
            width: 2,
            height: 4,
            pixels: vec![0; 32],
        };
        let cropped = crop_to_height(image, 3);
        assert_eq!(cropped.height, 3);
        assert_eq!(cropped.pixels.len(), 24);
    }

    #[test]
    fn cell_size_falls_back_without_pixel_dimensions() {
        let window = terminal::WindowSize {
            rows: 24,
            columns: 80,
            width: 0,
            height: 0,
        };
        assert_eq!(cell_size(&window), FALLBACK_CELL);

        let window = terminal::WindowSize {
            rows: 24,
            columns: 80,
            width: 800,
            height: 480,
        };
        assert_eq!(cell_size(&window), (10, 20));
    }

    #[test]
    fn pending_input_is_appended_to_status() {
        assert_eq!(combine_status("a.pdf".into(), Some("12")), "a.pdf | 12");
        assert_eq!(combine_status("a.pdf".into(), Some("")), "a.pdf");
    }
}
