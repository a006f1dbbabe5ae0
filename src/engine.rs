use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use eframe::egui::{self, TextureHandle, TextureOptions};
use perspecta_compare::dicom::{decode_slice, DecodedSlice};
use perspecta_compare::{Camera, RenderingEngine, ViewerSession, WindowLevel};

use crate::renderer::render_slice;

type SliceCache = Arc<Mutex<Vec<Option<Arc<DecodedSlice>>>>>;

/// Sent by decode workers for every image they finish, successfully or not.
struct DecodeUpdate {
    series_id: String,
    index: usize,
    error: Option<String>,
}

struct SeriesImages {
    paths: Vec<PathBuf>,
    slices: SliceCache,
    finished: usize,
}

/// A marker drawn on one viewport for the slice shown in another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceMarker {
    pub source_viewport_id: String,
    pub source_index: usize,
}

pub struct ViewportView {
    pub viewport_id: String,
    pub series_id: Option<String>,
    pub index: usize,
    pub camera: Camera,
    window_level: Option<WindowLevel>,
    pub reference: Option<ReferenceMarker>,
    pub texture: Option<TextureHandle>,
    pub scroll_accum: f32,
    dirty: bool,
}

impl ViewportView {
    fn new(viewport_id: &str) -> Self {
        Self {
            viewport_id: viewport_id.to_string(),
            series_id: None,
            index: 0,
            camera: Camera::default(),
            window_level: None,
            reference: None,
            texture: None,
            scroll_accum: 0.0,
            dirty: true,
        }
    }

    fn show_series(&mut self, series_id: Option<&str>) {
        self.series_id = series_id.map(str::to_string);
        self.index = 0;
        self.camera = Camera::default();
        self.window_level = None;
        self.reference = None;
        self.texture = None;
        self.scroll_accum = 0.0;
        self.dirty = true;
    }

    pub fn reset_view(&mut self) {
        self.camera = Camera::default();
        self.window_level = None;
        self.dirty = true;
    }
}

/// Rendering engine backed by egui textures. Images are decoded on a small
/// worker pool per series and drawn as they arrive.
pub struct EguiEngine {
    ctx: egui::Context,
    views: Vec<ViewportView>,
    series: HashMap<String, SeriesImages>,
    update_tx: Sender<DecodeUpdate>,
    update_rx: Receiver<DecodeUpdate>,
}

impl EguiEngine {
    pub fn new(ctx: egui::Context) -> Self {
        let (update_tx, update_rx) = mpsc::channel();
        Self {
            ctx,
            views: Vec::new(),
            series: HashMap::new(),
            update_tx,
            update_rx,
        }
    }

    pub fn view(&self, viewport_id: &str) -> Option<&ViewportView> {
        self.views.iter().find(|view| view.viewport_id == viewport_id)
    }

    pub fn view_mut(&mut self, viewport_id: &str) -> Option<&mut ViewportView> {
        self.views
            .iter_mut()
            .find(|view| view.viewport_id == viewport_id)
    }

    fn require_view(&self, viewport_id: &str) -> Result<&ViewportView> {
        self.view(viewport_id)
            .ok_or_else(|| anyhow!("Viewport {viewport_id} does not exist"))
    }

    fn require_view_mut(&mut self, viewport_id: &str) -> Result<&mut ViewportView> {
        self.view_mut(viewport_id)
            .ok_or_else(|| anyhow!("Viewport {viewport_id} does not exist"))
    }

    /// Makes the views match the session's layout and assignments.
    pub fn reconcile(&mut self, session: &ViewerSession) {
        let ids = session.viewport_ids();
        self.views.retain(|view| ids.contains(&view.viewport_id));
        for (position, viewport_id) in ids.iter().enumerate() {
            if self.view(viewport_id).is_none() {
                self.views
                    .insert(position.min(self.views.len()), ViewportView::new(viewport_id));
            }
        }

        let mut to_preload = Vec::new();
        for view in &mut self.views {
            let assigned = session
                .registry()
                .get_assignment(&view.viewport_id)
                .map(|assignment| assignment.series_id.as_str());
            if view.series_id.as_deref() != assigned {
                view.show_series(assigned);
                if let Some(series_id) = assigned {
                    to_preload.push(series_id.to_string());
                }
            }
        }
        for series_id in to_preload {
            if let Some(series) = session.catalog().find_series(&series_id) {
                let paths = series.image_ids.iter().map(PathBuf::from).collect();
                self.preload_series(&series_id, paths);
            }
        }

        let loaded = session
            .catalog()
            .get_all_series()
            .iter()
            .map(|listing| listing.series.id.clone())
            .collect::<Vec<_>>();
        self.series.retain(|series_id, _| loaded.contains(series_id));
    }

    fn preload_series(&mut self, series_id: &str, paths: Vec<PathBuf>) {
        if self.series.contains_key(series_id) {
            return;
        }
        let slices: SliceCache = Arc::new(Mutex::new(vec![None; paths.len()]));
        let worker_count = decode_worker_count(paths.len());
        log::debug!(
            "Decoding {} image(s) of {series_id} on {worker_count} worker(s)",
            paths.len()
        );

        for worker_id in 0..worker_count {
            let paths = paths.clone();
            let slices = Arc::clone(&slices);
            let tx = self.update_tx.clone();
            let series_id = series_id.to_string();
            let ctx = self.ctx.clone();
            thread::spawn(move || {
                for index in (worker_id..paths.len()).step_by(worker_count) {
                    let error = match decode_slice(&paths[index]) {
                        Ok(slice) => match slices.lock() {
                            Ok(mut guard) => {
                                if let Some(slot) = guard.get_mut(index) {
                                    *slot = Some(Arc::new(slice));
                                }
                                None
                            }
                            Err(err) => Some(format!("Slice cache lock poisoned: {err}")),
                        },
                        Err(err) => Some(format!("{err:#}")),
                    };
                    let update = DecodeUpdate {
                        series_id: series_id.clone(),
                        index,
                        error,
                    };
                    if tx.send(update).is_err() {
                        return;
                    }
                    ctx.request_repaint();
                }
            });
        }

        self.series.insert(
            series_id.to_string(),
            SeriesImages {
                paths,
                slices,
                finished: 0,
            },
        );
    }

    /// Drains decode progress. Returns `(series, finished, total)` for every
    /// series that advanced.
    pub fn poll_decodes(&mut self) -> Vec<(String, usize, usize)> {
        let mut advanced: Vec<(String, usize, usize)> = Vec::new();
        loop {
            let update = match self.update_rx.try_recv() {
                Ok(update) => update,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            };
            let Some(images) = self.series.get_mut(&update.series_id) else {
                continue;
            };
            images.finished += 1;
            if let Some(err) = &update.error {
                log::warn!(
                    "Could not decode {}: {err}",
                    images.paths[update.index].display()
                );
            }
            let progress = (update.series_id.clone(), images.finished, images.paths.len());
            match advanced.iter_mut().find(|(id, _, _)| *id == update.series_id) {
                Some(entry) => *entry = progress,
                None => advanced.push(progress),
            }
            for view in &mut self.views {
                if view.series_id.as_deref() == Some(update.series_id.as_str())
                    && view.index == update.index
                {
                    view.dirty = true;
                }
            }
        }
        advanced
    }

    fn slice_at(&self, series_id: &str, index: usize) -> Option<Arc<DecodedSlice>> {
        let images = self.series.get(series_id)?;
        let guard = images.slices.lock().ok()?;
        guard.get(index).cloned().flatten()
    }

    pub fn current_slice(&self, viewport_id: &str) -> Option<Arc<DecodedSlice>> {
        let view = self.view(viewport_id)?;
        self.slice_at(view.series_id.as_deref()?, view.index)
    }

    pub fn image_count(&self, viewport_id: &str) -> usize {
        self.view(viewport_id)
            .and_then(|view| view.series_id.as_deref())
            .and_then(|series_id| self.series.get(series_id))
            .map_or(0, |images| images.paths.len())
    }

    /// Uploads textures for every view whose image or display settings
    /// changed since the last frame.
    pub fn render_dirty(&mut self) {
        let ctx = self.ctx.clone();
        let dirty = self
            .views
            .iter()
            .filter(|view| view.dirty)
            .map(|view| view.viewport_id.clone())
            .collect::<Vec<_>>();
        for viewport_id in dirty {
            let slice = self.current_slice(&viewport_id);
            let Some(view) = self.view_mut(&viewport_id) else {
                continue;
            };
            let Some(slice) = slice else {
                // keep the previous image up until the new one is decoded
                continue;
            };
            view.dirty = false;
            let window_level = view.window_level.unwrap_or(slice.default_window);
            let image = render_slice(&slice, window_level);
            match view.texture.as_mut() {
                Some(texture) => texture.set(image, TextureOptions::LINEAR),
                None => {
                    view.texture = Some(ctx.load_texture(
                        format!("viewport-texture-{viewport_id}"),
                        image,
                        TextureOptions::LINEAR,
                    ));
                }
            }
        }
    }
}

impl RenderingEngine for EguiEngine {
    fn viewport_ids(&self) -> Vec<String> {
        self.views
            .iter()
            .map(|view| view.viewport_id.clone())
            .collect()
    }

    fn camera(&self, viewport_id: &str) -> Result<Camera> {
        Ok(self.require_view(viewport_id)?.camera)
    }

    fn set_camera(&mut self, viewport_id: &str, camera: Camera) -> Result<()> {
        self.require_view_mut(viewport_id)?.camera = camera;
        Ok(())
    }

    fn window_level(&self, viewport_id: &str) -> Result<WindowLevel> {
        let view = self.require_view(viewport_id)?;
        match view.window_level {
            Some(window_level) => Ok(window_level),
            None => self
                .current_slice(viewport_id)
                .map(|slice| slice.default_window)
                .with_context(|| format!("Viewport {viewport_id} has no decoded image yet")),
        }
    }

    fn set_window_level(&mut self, viewport_id: &str, window_level: WindowLevel) -> Result<()> {
        let view = self.require_view_mut(viewport_id)?;
        view.window_level = Some(WindowLevel {
            center: window_level.center,
            width: window_level.width.max(1.0),
        });
        view.dirty = true;
        Ok(())
    }

    fn scroll_index(&self, viewport_id: &str) -> Result<usize> {
        let view = self.require_view(viewport_id)?;
        if view.series_id.is_none() {
            bail!("Viewport {viewport_id} shows no series");
        }
        Ok(view.index)
    }

    fn set_scroll_index(&mut self, viewport_id: &str, index: usize) -> Result<()> {
        let count = self.image_count(viewport_id);
        let view = self.require_view_mut(viewport_id)?;
        if count == 0 {
            bail!("Viewport {viewport_id} shows no images");
        }
        let clamped = index.min(count - 1);
        if clamped != view.index {
            view.index = clamped;
            view.dirty = true;
        }
        Ok(())
    }

    fn show_reference(
        &mut self,
        viewport_id: &str,
        source_viewport_id: &str,
        source_index: usize,
    ) -> Result<()> {
        self.require_view_mut(viewport_id)?.reference = Some(ReferenceMarker {
            source_viewport_id: source_viewport_id.to_string(),
            source_index,
        });
        Ok(())
    }

    fn request_render(&mut self, viewport_id: &str) {
        if let Some(view) = self.view_mut(viewport_id) {
            view.dirty = true;
        }
        self.ctx.request_repaint();
    }
}

fn decode_worker_count(image_count: usize) -> usize {
    let auto_workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(1, 4);

    let configured = configured_decode_workers().unwrap_or(auto_workers);
    configured.clamp(1, 32).min(image_count.max(1))
}

fn configured_decode_workers() -> Option<usize> {
    static CONFIG: OnceLock<Option<usize>> = OnceLock::new();

    *CONFIG.get_or_init(|| {
        let raw = std::env::var("PERSPECTA_PRELOAD_WORKERS").ok()?;
        let value = raw.trim().parse::<usize>().ok()?;
        if value == 0 {
            return None;
        }
        Some(value)
    })
}
