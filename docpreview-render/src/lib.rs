pub mod viewer;

#[cfg(feature = "pdf")]
mod pdfium;

#[cfg(feature = "pdf")]
pub use pdfium::{PdfiumProvider, PDFIUM_LIBRARY_ENV};
pub use viewer::{PageViewer, PageViewerFactory, MAX_SCALE, MAX_VISIBLE_PAGES, MIN_SCALE, PAGE_GAP};
