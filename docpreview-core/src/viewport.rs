//! The scrollable container pages are painted into, and its resize observers.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{NormalizedRect, RenderImage};

/// Container dimensions in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerSize {
    pub width: u32,
    pub height: u32,
}

impl ContainerSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// One painted page as presented in the container.
#[derive(Debug, Clone)]
pub struct PageSurface {
    /// One-based page number.
    pub page: usize,
    pub image: RenderImage,
    pub highlights: Vec<NormalizedRect>,
    pub text_selectable: bool,
}

type ResizeHandler = Arc<dyn Fn(ContainerSize) + Send + Sync>;

#[derive(Default)]
struct ContainerState {
    size: ContainerSize,
    surfaces: Vec<PageSurface>,
    observers: Vec<(u64, ResizeHandler)>,
    next_observer: u64,
}

#[derive(Clone, Default)]
pub struct ViewportContainer {
    inner: Arc<Mutex<ContainerState>>,
}

impl ViewportContainer {
    pub fn new(size: ContainerSize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContainerState {
                size,
                ..ContainerState::default()
            })),
        }
    }

    pub fn size(&self) -> ContainerSize {
        self.inner.lock().size
    }

    /// Updates the size and notifies observers when it actually changed.
    pub fn resize(&self, size: ContainerSize) {
        let handlers: Vec<ResizeHandler> = {
            let mut state = self.inner.lock();
            if state.size == size {
                return;
            }
            state.size = size;
            state
                .observers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in handlers {
            handler(size);
        }
    }

    pub fn observe<F>(&self, handler: F) -> ResizeObserver
    where
        F: Fn(ContainerSize) + Send + Sync + 'static,
    {
        let mut state = self.inner.lock();
        state.next_observer += 1;
        let id = state.next_observer;
        state.observers.push((id, Arc::new(handler)));
        ResizeObserver {
            id,
            container: Some(Arc::downgrade(&self.inner)),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Replaces every painted surface.
    pub fn present(&self, surfaces: Vec<PageSurface>) {
        self.inner.lock().surfaces = surfaces;
    }

    pub fn surfaces(&self) -> Vec<PageSurface> {
        self.inner.lock().surfaces.clone()
    }

    /// Removes all painted content.
    pub fn clear(&self) {
        self.inner.lock().surfaces.clear();
    }
}

impl std::fmt::Debug for ViewportContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ViewportContainer")
            .field("size", &state.size)
            .field("surfaces", &state.surfaces.len())
            .field("observers", &state.observers.len())
            .finish()
    }
}

/// Registration of a resize handler; unregisters on disconnect or drop.
#[derive(Debug)]
pub struct ResizeObserver {
    id: u64,
    container: Option<Weak<Mutex<ContainerState>>>,
}

impl ResizeObserver {
    pub fn disconnect(&mut self) {
        if let Some(container) = self.container.take().and_then(|weak| weak.upgrade()) {
            container.lock().observers.retain(|(id, _)| *id != self.id);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.container.is_some()
    }
}

impl Drop for ResizeObserver {
    fn drop(&mut self) {
        self.disconnect();
    }
}
