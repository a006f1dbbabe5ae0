use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAttribute {
    Camera,
    WindowLevel,
    Scroll,
    CrossReference,
}

impl SyncAttribute {
    pub const ALL: [SyncAttribute; 4] = [
        SyncAttribute::Camera,
        SyncAttribute::WindowLevel,
        SyncAttribute::Scroll,
        SyncAttribute::CrossReference,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SyncAttribute::Camera => "Pan/Zoom",
            SyncAttribute::WindowLevel => "W/L",
            SyncAttribute::Scroll => "Scroll",
            SyncAttribute::CrossReference => "Reference lines",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncFlags {
    pub camera: bool,
    pub window_level: bool,
    pub scroll: bool,
    pub cross_reference: bool,
}

impl Default for SyncFlags {
    fn default() -> Self {
        Self {
            camera: false,
            window_level: false,
            scroll: true,
            cross_reference: false,
        }
    }
}

impl SyncFlags {
    pub fn get(&self, attribute: SyncAttribute) -> bool {
        match attribute {
            SyncAttribute::Camera => self.camera,
            SyncAttribute::WindowLevel => self.window_level,
            SyncAttribute::Scroll => self.scroll,
            SyncAttribute::CrossReference => self.cross_reference,
        }
    }

    pub fn set(&mut self, attribute: SyncAttribute, enabled: bool) {
        match attribute {
            SyncAttribute::Camera => self.camera = enabled,
            SyncAttribute::WindowLevel => self.window_level = enabled,
            SyncAttribute::Scroll => self.scroll = enabled,
            SyncAttribute::CrossReference => self.cross_reference = enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub zoom: f32,
    pub pan: [f32; 2],
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan: [0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowLevel {
    pub center: f32,
    pub width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewportChange {
    Camera(Camera),
    WindowLevel(WindowLevel),
    Scroll(usize),
}

impl ViewportChange {
    pub fn attribute(&self) -> SyncAttribute {
        match self {
            ViewportChange::Camera(_) => SyncAttribute::Camera,
            ViewportChange::WindowLevel(_) => SyncAttribute::WindowLevel,
            ViewportChange::Scroll(_) => SyncAttribute::Scroll,
        }
    }
}

/// The slice of the rendering engine that synchronization needs.
pub trait RenderingEngine {
    fn viewport_ids(&self) -> Vec<String>;
    fn camera(&self, viewport_id: &str) -> Result<Camera>;
    fn set_camera(&mut self, viewport_id: &str, camera: Camera) -> Result<()>;
    fn window_level(&self, viewport_id: &str) -> Result<WindowLevel>;
    fn set_window_level(&mut self, viewport_id: &str, window_level: WindowLevel) -> Result<()>;
    fn scroll_index(&self, viewport_id: &str) -> Result<usize>;
    fn set_scroll_index(&mut self, viewport_id: &str, index: usize) -> Result<()>;
    /// Marks on `viewport_id` where `source_viewport_id` currently is.
    fn show_reference(
        &mut self,
        viewport_id: &str,
        source_viewport_id: &str,
        source_index: usize,
    ) -> Result<()>;
    fn request_render(&mut self, viewport_id: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynchronizationPolicy {
    pub flags: SyncFlags,
    pub linked: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub updated: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// The change was our own write coming back and was not propagated.
    pub suppressed: bool,
}

impl SyncReport {
    fn suppressed() -> Self {
        Self {
            suppressed: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncController {
    policy: SynchronizationPolicy,
    active: Vec<String>,
    pending_echoes: HashMap<(String, SyncAttribute), ViewportChange>,
}

impl SyncController {
    pub fn new(flags: SyncFlags) -> Self {
        Self {
            policy: SynchronizationPolicy {
                flags,
                linked: Vec::new(),
            },
            ..Default::default()
        }
    }

    pub fn policy(&self) -> &SynchronizationPolicy {
        &self.policy
    }

    pub fn flags(&self) -> SyncFlags {
        self.policy.flags
    }

    pub fn set_flag(&mut self, attribute: SyncAttribute, enabled: bool) {
        self.policy.flags.set(attribute, enabled);
        if !enabled {
            self.pending_echoes.retain(|(_, attr), _| *attr != attribute);
        }
    }

    pub fn set_flags(&mut self, flags: SyncFlags) {
        for attribute in SyncAttribute::ALL {
            self.set_flag(attribute, flags.get(attribute));
        }
    }

    pub fn linked(&self) -> &[String] {
        &self.policy.linked
    }

    pub fn is_linked(&self, viewport_id: &str) -> bool {
        self.policy.linked.iter().any(|id| id == viewport_id)
    }

    pub fn is_active(&self) -> bool {
        self.policy.linked.len() >= 2
    }

    /// Replaces the viewport set. Everything keyed by the old viewports is
    /// dropped before the new set is linked.
    pub fn set_layout(&mut self, viewport_ids: &[String]) {
        self.pending_echoes.clear();
        self.policy.linked.clear();
        self.active = viewport_ids.to_vec();
        self.policy.linked = viewport_ids.to_vec();
        log::debug!("Sync linked set rebuilt: {:?}", self.policy.linked);
    }

    pub fn set_layout_from_engine(&mut self, engine: &dyn RenderingEngine) {
        self.set_layout(&engine.viewport_ids());
    }

    /// Adds a viewport of the active layout back to the linked set.
    pub fn link(&mut self, viewport_id: &str) -> bool {
        if !self.active.iter().any(|id| id == viewport_id) || self.is_linked(viewport_id) {
            return false;
        }
        // keep layout order
        self.policy.linked = self
            .active
            .iter()
            .filter(|id| id.as_str() == viewport_id || self.policy.linked.contains(*id))
            .cloned()
            .collect();
        true
    }

    pub fn unlink(&mut self, viewport_id: &str) -> bool {
        let before = self.policy.linked.len();
        self.policy.linked.retain(|id| id != viewport_id);
        self.pending_echoes.retain(|(id, _), _| id != viewport_id);
        self.policy.linked.len() != before
    }

    /// Replicates a change observed on `source` to every other linked
    /// viewport. One failing viewport does not stop the others.
    pub fn on_viewport_changed(
        &mut self,
        engine: &mut dyn RenderingEngine,
        source: &str,
        change: ViewportChange,
    ) -> SyncReport {
        let key = (source.to_string(), change.attribute());
        match self.pending_echoes.remove(&key) {
            Some(expected) if expected == change => return SyncReport::suppressed(),
            _ => {}
        }

        if !self.is_active() || !self.is_linked(source) {
            return SyncReport::default();
        }

        let flags = self.policy.flags;
        let replicate = flags.get(change.attribute());
        let reference = matches!(change, ViewportChange::Scroll(_)) && flags.cross_reference;
        if !replicate && !reference {
            return SyncReport::default();
        }

        let targets = self
            .policy
            .linked
            .iter()
            .filter(|id| id.as_str() != source)
            .cloned()
            .collect::<Vec<_>>();

        let mut report = SyncReport::default();
        for target in targets {
            let mut outcome = Ok(());
            if replicate {
                outcome = write_change(engine, &target, change);
                if outcome.is_ok() {
                    self.pending_echoes
                        .insert((target.clone(), change.attribute()), change);
                }
            }
            if let (Ok(()), true, ViewportChange::Scroll(index)) = (&outcome, reference, change) {
                outcome = engine.show_reference(&target, source, index);
            }

            match outcome {
                Ok(()) => {
                    engine.request_render(&target);
                    report.updated.push(target);
                }
                Err(err) => {
                    log::warn!(
                        "Sync of {:?} from {source} to {target} failed: {err:#}",
                        change.attribute()
                    );
                    report.failed.push((target, format!("{err:#}")));
                }
            }
        }
        log::debug!(
            "Propagated {:?} from {source}: {} updated, {} failed",
            change.attribute(),
            report.updated.len(),
            report.failed.len()
        );
        report
    }

    /// Pushes the current state of `source` to the other linked viewports for
    /// every enabled attribute, e.g. right after a flag is switched on.
    pub fn sync_all_from(
        &mut self,
        engine: &mut dyn RenderingEngine,
        source: &str,
    ) -> Vec<SyncReport> {
        let flags = self.policy.flags;
        let mut changes = Vec::new();
        if flags.camera {
            match engine.camera(source) {
                Ok(camera) => changes.push(ViewportChange::Camera(camera)),
                Err(err) => log::warn!("Could not read camera of {source}: {err:#}"),
            }
        }
        if flags.window_level {
            match engine.window_level(source) {
                Ok(window_level) => changes.push(ViewportChange::WindowLevel(window_level)),
                Err(err) => log::warn!("Could not read window/level of {source}: {err:#}"),
            }
        }
        if flags.scroll || flags.cross_reference {
            match engine.scroll_index(source) {
                Ok(index) => changes.push(ViewportChange::Scroll(index)),
                Err(err) => log::warn!("Could not read scroll index of {source}: {err:#}"),
            }
        }
        let mut reports = Vec::with_capacity(changes.len());
        for change in changes {
            self.pending_echoes
                .remove(&(source.to_string(), change.attribute()));
            reports.push(self.on_viewport_changed(engine, source, change));
        }
        reports
    }
}

fn write_change(
    engine: &mut dyn RenderingEngine,
    target: &str,
    change: ViewportChange,
) -> Result<()> {
    match change {
        ViewportChange::Camera(camera) => engine.set_camera(target, camera),
        ViewportChange::WindowLevel(window_level) => engine.set_window_level(target, window_level),
        ViewportChange::Scroll(index) => engine.set_scroll_index(target, index),
    }
}
