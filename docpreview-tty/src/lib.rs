use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    terminal::{Clear, ClearType},
};
use docpreview_core::{PageSurface, RenderImage};
use png::{BitDepth, ColorType, Encoder};
use tracing::warn;

/// Vertical space between stacked pages, in pixels.
pub const SURFACE_GAP: u32 = 8;
const BACKGROUND: [u8; 4] = [48, 48, 48, 255];
const HIGHLIGHT: [u8; 3] = [255, 214, 0];
const HIGHLIGHT_ALPHA: f32 = 0.4;

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    u8::from(more)
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", u8::from(more))?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes the placed image without clearing text.
    pub fn delete_image(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=i,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Disables synchronized updates.
    /// The terminal will render all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

/// Stacks the painted pages top to bottom into a single image, centering
/// narrower pages and tinting search highlights.
pub fn compose_surfaces(surfaces: &[PageSurface]) -> Option<RenderImage> {
    let width = surfaces.iter().map(|surface| surface.image.width).max()?;
    let height = surfaces
        .iter()
        .map(|surface| surface.image.height)
        .sum::<u32>()
        + SURFACE_GAP * (surfaces.len() as u32).saturating_sub(1);
    if width == 0 || height == 0 {
        return None;
    }

    let mut pixels = BACKGROUND.repeat((width * height) as usize);
    let mut offset_y = 0;
    for surface in surfaces {
        let image = &surface.image;
        let offset_x = (width - image.width) / 2;
        let row_bytes = (image.width * 4) as usize;
        for row in 0..image.height {
            let src = (row * image.width * 4) as usize;
            let dst = (((offset_y + row) * width + offset_x) * 4) as usize;
            match image.pixels.get(src..src + row_bytes) {
                Some(line) => pixels[dst..dst + row_bytes].copy_from_slice(line),
                None => {
                    warn!(page = surface.page, row, "page image is shorter than its dimensions");
                    break;
                }
            }
        }

        for rect in surface.highlights.iter().filter(|rect| rect.is_valid()) {
            let left = (rect.left * image.width as f32) as u32;
            let right = ((rect.right * image.width as f32).ceil() as u32).min(image.width);
            let top = (rect.top * image.height as f32) as u32;
            let bottom = ((rect.bottom * image.height as f32).ceil() as u32).min(image.height);
            for y in top..bottom {
                for x in left..right {
                    let index = (((offset_y + y) * width + offset_x + x) * 4) as usize;
                    blend(&mut pixels[index..index + 3], HIGHLIGHT, HIGHLIGHT_ALPHA);
                }
            }
        }

        offset_y += image.height + SURFACE_GAP;
    }

    Some(RenderImage {
        width,
        height,
        pixels,
    })
}

fn blend(pixel: &mut [u8], color: [u8; 3], alpha: f32) {
    for (channel, tint) in pixel.iter_mut().zip(color) {
        let mixed = *channel as f32 * (1.0 - alpha) + tint as f32 * alpha;
        *channel = mixed.round().clamp(0.0, 255.0) as u8;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Relative page movement; negative values scroll up.
    Scroll { pages: isize },
    GotoPage { page: usize },
    ZoomIn,
    ZoomOut,
    ResetZoom,
    Rotate,
    ToggleFit,
    ToggleRenderMode,
    ToggleSelectable,
    /// Follow the n-th link on the current page.
    FollowLink { ordinal: usize },
    BeginSearch,
    SearchQueryChanged { query: String },
    SearchSubmit { query: String },
    SearchCancel,
    ClearSearch,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Search,
}

/// Turns terminal key presses into viewer events, tracking numeric count
/// prefixes and the search prompt.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    search_buffer: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.search_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Search => self.map_event_search(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };

        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Scroll {
                    pages: count as isize,
                }
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Scroll {
                    pages: -(count as isize),
                }
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) => {
                let page = self.take_count();
                UiEvent::GotoPage { page }
            }
            (KeyCode::Char('l'), KeyModifiers::NONE) => {
                let ordinal = self.take_count();
                UiEvent::FollowLink { ordinal }
            }
            (KeyCode::Char('+'), _) => self.plain(UiEvent::ZoomIn),
            (KeyCode::Char('-'), _) => self.plain(UiEvent::ZoomOut),
            (KeyCode::Char('='), _) => self.plain(UiEvent::ResetZoom),
            (KeyCode::Char('r'), KeyModifiers::NONE) => self.plain(UiEvent::Rotate),
            (KeyCode::Char('f'), KeyModifiers::NONE) => self.plain(UiEvent::ToggleFit),
            (KeyCode::Char('m'), KeyModifiers::NONE) => self.plain(UiEvent::ToggleRenderMode),
            (KeyCode::Char('s'), KeyModifiers::NONE) => self.plain(UiEvent::ToggleSelectable),
            (KeyCode::Char('/'), KeyModifiers::NONE) => {
                self.set_mode(InputMode::Search);
                UiEvent::BeginSearch
            }
            (KeyCode::Esc, _) => self.plain(UiEvent::ClearSearch),
            (KeyCode::Char('q'), _) => self.plain(UiEvent::Quit),
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.plain(UiEvent::Quit)
            }
            _ => self.plain(UiEvent::None),
        }
    }

    fn map_event_search(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };

        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::SearchCancel
            }
            (KeyCode::Enter, _) => {
                let query = std::mem::take(&mut self.search_buffer);
                self.set_mode(InputMode::Normal);
                UiEvent::SearchSubmit { query }
            }
            (KeyCode::Backspace, _) => {
                self.search_buffer.pop();
                UiEvent::SearchQueryChanged {
                    query: self.search_buffer.clone(),
                }
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.search_buffer.push(c);
                UiEvent::SearchQueryChanged {
                    query: self.search_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn plain(&mut self, event: UiEvent) -> UiEvent {
        self.reset_count();
        event
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        self.pending_count = Some(current.saturating_mul(10).saturating_add(digit));
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        match self.mode {
            InputMode::Search => Some(format!("/{}", self.search_buffer)),
            InputMode::Normal if !self.pending_digits.is_empty() => {
                Some(self.pending_digits.clone())
            }
            InputMode::Normal => None,
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventKind, KeyEventState};
    use docpreview_core::NormalizedRect;

    #[test]
    fn kitty_draw_places_image_inside_sync_update() {
        let mut renderer = KittyRenderer::new(Vec::new());
        let image = RenderImage {
            width: 2,
            height: 3,
            pixels: vec![255; 2 * 3 * 4],
        };

        renderer.begin_sync_update().unwrap();
        renderer.draw(&image, DrawParams::clamped(0, 5)).unwrap();
        renderer.end_sync_update().unwrap();

        let output = String::from_utf8(renderer.writer.clone()).unwrap();
        assert!(output.starts_with("\u{1b}[?2026h\u{1b}_Ga=T,f=100"));
        assert!(output.contains("i=1,p=1,c=1,r=5,s=2,v=3,"));
        assert!(output.ends_with("\u{1b}\\\u{1b}[?2026l"));
    }

    #[test]
    fn kitty_delete_targets_the_placed_image() {
        let mut renderer = KittyRenderer::new(Vec::new());
        renderer.delete_image().unwrap();
        assert_eq!(renderer.writer.as_slice(), b"\x1b_Ga=d,d=i,i=1,q=2\x1b\\");

        renderer.writer.clear();
        renderer.clear_all().unwrap();
        let output = String::from_utf8(renderer.writer.clone()).unwrap();
        assert!(output.contains("\u{1b}[2J"));
        assert!(!output.contains("_G"));
    }

    fn surface(page: usize, width: u32, height: u32, highlights: Vec<NormalizedRect>) -> PageSurface {
        PageSurface {
            page,
            image: RenderImage {
                width,
                height,
                pixels: vec![255; (width * height * 4) as usize],
            },
            highlights,
            text_selectable: true,
        }
    }

    fn pixel(image: &RenderImage, x: u32, y: u32) -> &[u8] {
        let index = ((y * image.width + x) * 4) as usize;
        &image.pixels[index..index + 4]
    }

    #[test]
    fn compose_stacks_pages_with_gap_and_centering() {
        let composed = compose_surfaces(&[surface(1, 4, 2, Vec::new()), surface(2, 2, 2, Vec::new())])
            .unwrap();
        assert_eq!(composed.width, 4);
        assert_eq!(composed.height, 2 + SURFACE_GAP + 2);

        assert_eq!(pixel(&composed, 0, 0), &[255, 255, 255, 255]);
        assert_eq!(pixel(&composed, 0, 2), &BACKGROUND);
        let second_top = 2 + SURFACE_GAP;
        assert_eq!(pixel(&composed, 0, second_top), &BACKGROUND);
        assert_eq!(pixel(&composed, 1, second_top), &[255, 255, 255, 255]);
    }

    #[test]
    fn compose_tints_highlighted_region_only() {
        let highlight = NormalizedRect {
            left: 0.0,
            top: 0.0,
            right: 0.5,
            bottom: 0.5,
        };
        let composed = compose_surfaces(&[surface(1, 4, 4, vec![highlight])]).unwrap();

        let tinted = pixel(&composed, 1, 1);
        assert_eq!(tinted[0], 255);
        assert!(tinted[2] < 255);
        assert_eq!(pixel(&composed, 3, 3), &[255, 255, 255, 255]);
    }

    #[test]
    fn compose_without_surfaces_is_empty() {
        assert!(compose_surfaces(&[]).is_none());
    }

    fn key_event(code: KeyCode) -> Event {
        key_event_with_modifiers(code, KeyModifiers::NONE)
    }

    fn key_event_with_modifiers(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    #[test]
    fn event_mapper_uses_numeric_prefix_for_scrolling() {
        let mut mapper = EventMapper::new();
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('1'))), UiEvent::None);
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('2'))), UiEvent::None);
        assert_eq!(mapper.pending_input().as_deref(), Some("12"));

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('j'))),
            UiEvent::Scroll { pages: 12 }
        );
        assert!(mapper.pending_input().is_none());
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('k'))),
            UiEvent::Scroll { pages: -1 }
        );
    }

    #[test]
    fn event_mapper_count_before_g_selects_page() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('4')));
        mapper.map_event(key_event(KeyCode::Char('2')));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('g'))),
            UiEvent::GotoPage { page: 42 }
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('g'))),
            UiEvent::GotoPage { page: 1 }
        );
    }

    #[test]
    fn event_mapper_drops_prefix_on_other_command() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('4')));
        assert_eq!(mapper.map_event(key_event(KeyCode::Char('+'))), UiEvent::ZoomIn);
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('j'))),
            UiEvent::Scroll { pages: 1 }
        );
    }

    #[test]
    fn event_mapper_follows_links_by_count() {
        let mut mapper = EventMapper::new();
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('l'))),
            UiEvent::FollowLink { ordinal: 1 }
        );
        mapper.map_event(key_event(KeyCode::Char('3')));
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('l'))),
            UiEvent::FollowLink { ordinal: 3 }
        );
    }

    #[test]
    fn event_mapper_maps_view_toggles() {
        let mut mapper = EventMapper::new();
        let cases = [
            ('-', UiEvent::ZoomOut),
            ('=', UiEvent::ResetZoom),
            ('r', UiEvent::Rotate),
            ('f', UiEvent::ToggleFit),
            ('m', UiEvent::ToggleRenderMode),
            ('s', UiEvent::ToggleSelectable),
            ('q', UiEvent::Quit),
        ];
        for (key, expected) in cases {
            assert_eq!(mapper.map_event(key_event(KeyCode::Char(key))), expected);
        }
        assert_eq!(mapper.map_event(key_event(KeyCode::Esc)), UiEvent::ClearSearch);
        assert_eq!(
            mapper.map_event(key_event_with_modifiers(
                KeyCode::Char('c'),
                KeyModifiers::CONTROL
            )),
            UiEvent::Quit
        );
    }

    #[test]
    fn event_mapper_slash_enters_search_mode_and_collects_input() {
        let mut mapper = EventMapper::new();

        assert_eq!(mapper.map_event(key_event(KeyCode::Char('/'))), UiEvent::BeginSearch);
        assert_eq!(mapper.mode(), InputMode::Search);
        assert_eq!(mapper.pending_input().as_deref(), Some("/"));

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Char('f'))),
            UiEvent::SearchQueryChanged { query: "f".into() }
        );
        assert_eq!(
            mapper.map_event(key_event(KeyCode::Backspace)),
            UiEvent::SearchQueryChanged {
                query: String::new()
            }
        );
        mapper.map_event(key_event_with_modifiers(KeyCode::Char('G'), KeyModifiers::SHIFT));
        assert_eq!(mapper.pending_input().as_deref(), Some("/G"));

        assert_eq!(
            mapper.map_event(key_event(KeyCode::Enter)),
            UiEvent::SearchSubmit { query: "G".into() }
        );
        assert_eq!(mapper.mode(), InputMode::Normal);
        assert!(mapper.pending_input().is_none());
    }

    #[test]
    fn event_mapper_escape_cancels_search_prompt() {
        let mut mapper = EventMapper::new();
        mapper.map_event(key_event(KeyCode::Char('/')));
        mapper.map_event(key_event(KeyCode::Char('x')));
        assert_eq!(mapper.map_event(key_event(KeyCode::Esc)), UiEvent::SearchCancel);
        assert_eq!(mapper.mode(), InputMode::Normal);

        mapper.map_event(key_event(KeyCode::Char('/')));
        assert_eq!(mapper.pending_input().as_deref(), Some("/"));
    }
}
