use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use eframe::egui::{self, Sense, ViewportCommand};
use perspecta_compare::color::Rgb;
use perspecta_compare::config::settings_file_path;
use perspecta_compare::dnd::{DragPayload, ZoneRect};
use perspecta_compare::filter::available_modalities;
use perspecta_compare::scan::{scan_paths, ScanReport};
use perspecta_compare::{
    Camera, DragPreview, DragToken, HoverState, RenderingEngine, SeriesSharing, SortKey,
    SortOrder, StateChange, SyncAttribute, ViewerConfig, ViewerEvent, ViewerSession,
    ViewportChange, ViewportLayout, WindowLevel,
};

use crate::engine::EguiEngine;
use crate::launch::LaunchRequest;

const APP_TITLE: &str = "Perspecta Compare";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const STATUS_LOG_MAX_ENTRIES: usize = 64;
const VIEW_GRID_GAP: f32 = 2.0;
const VIEW_INNER_MARGIN: f32 = 3.0;

type StatusLog = Rc<RefCell<VecDeque<String>>>;

/// A series row as the list shows it, detached from the session borrow.
struct SeriesRow {
    series_id: String,
    label: String,
    color: Rgb,
    progress: Option<f32>,
    payload: Option<String>,
}

pub struct CompareApp {
    session: ViewerSession,
    engine: EguiEngine,
    settings_path: Option<PathBuf>,
    /// What the settings file holds.
    stored_config: ViewerConfig,
    /// Effective settings at startup, overrides included.
    startup_config: ViewerConfig,
    last_config: ViewerConfig,
    status_log: StatusLog,
    scan_receiver: Option<Receiver<ScanReport>>,
    pending_launch_request: Option<LaunchRequest>,
    drag_token: Option<DragToken>,
    active_viewport: Option<String>,
    show_log: bool,
}

impl CompareApp {
    pub fn new(
        ctx: egui::Context,
        initial_request: Option<LaunchRequest>,
        initial_status: Option<String>,
    ) -> Self {
        let settings_path = settings_file_path();
        let stored_config = ViewerConfig::load_stored_or_default(settings_path.as_deref());
        let mut config = stored_config.clone().with_env_overrides();
        if let Some(request) = &initial_request {
            if let Some(layout) = request.layout {
                config.layout = layout;
            }
            if let Some(sharing) = request.sharing {
                config.series_sharing = sharing;
            }
        }

        let startup_config = config.clone();
        let session = ViewerSession::new(&config);
        let status_log: StatusLog = Rc::new(RefCell::new(VecDeque::new()));
        if let Some(status) = initial_status {
            status_log.borrow_mut().push_back(status);
        }
        let sink = Rc::clone(&status_log);
        session.bus().subscribe_all(move |event| {
            if let Some(message) = describe_event(event) {
                let mut log = sink.borrow_mut();
                log.push_back(message);
                while log.len() > STATUS_LOG_MAX_ENTRIES {
                    log.pop_front();
                }
            }
        });

        let engine = EguiEngine::new(ctx);
        Self {
            session,
            engine,
            settings_path,
            stored_config,
            last_config: startup_config.clone(),
            startup_config,
            status_log,
            scan_receiver: None,
            pending_launch_request: initial_request,
            drag_token: None,
            active_viewport: None,
            show_log: false,
        }
    }

    fn apply_black_background(ctx: &egui::Context) {
        let mut visuals = egui::Visuals::dark();
        let line_base = egui::Color32::from_gray(28);
        let line_hover = egui::Color32::from_gray(42);
        let line_active = egui::Color32::from_gray(56);

        visuals.panel_fill = egui::Color32::BLACK;
        visuals.window_fill = egui::Color32::BLACK;
        visuals.faint_bg_color = egui::Color32::BLACK;
        visuals.extreme_bg_color = egui::Color32::BLACK;
        visuals.window_stroke = egui::Stroke::new(1.0, line_base);
        visuals.widgets.noninteractive.bg_stroke = egui::Stroke::new(1.0, line_base);
        visuals.widgets.inactive.bg_stroke = egui::Stroke::new(1.0, line_base);
        visuals.widgets.hovered.bg_stroke = egui::Stroke::new(1.0, line_hover);
        visuals.widgets.active.bg_stroke = egui::Stroke::new(1.0, line_active);
        ctx.set_visuals(visuals);
    }

    fn is_loading(&self) -> bool {
        self.scan_receiver.is_some()
    }

    fn status_line(&self) -> String {
        self.status_log.borrow().back().cloned().unwrap_or_default()
    }

    fn open_dicoms(&mut self) {
        let picked = rfd::FileDialog::new()
            .add_filter("DICOM", &["dcm"])
            .pick_files();
        if let Some(paths) = picked {
            self.start_scan(paths);
        }
    }

    fn open_folder(&mut self) {
        if let Some(folder) = rfd::FileDialog::new().pick_folder() {
            self.start_scan(vec![folder]);
        }
    }

    fn start_scan(&mut self, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }
        let (tx, rx) = mpsc::channel::<ScanReport>();
        thread::spawn(move || {
            let _ = tx.send(scan_paths(&paths));
        });
        self.scan_receiver = Some(rx);
        self.push_status("Scanning for DICOM files...".to_string());
    }

    fn push_status(&self, message: String) {
        let mut log = self.status_log.borrow_mut();
        log.push_back(message);
        while log.len() > STATUS_LOG_MAX_ENTRIES {
            log.pop_front();
        }
    }

    fn poll_scan(&mut self) {
        let Some(receiver) = self.scan_receiver.take() else {
            return;
        };
        let report = match receiver.try_recv() {
            Ok(report) => report,
            Err(TryRecvError::Empty) => {
                self.scan_receiver = Some(receiver);
                return;
            }
            Err(TryRecvError::Disconnected) => {
                log::error!("Scan thread ended without a result");
                self.push_status("Scan failed.".to_string());
                return;
            }
        };

        if report.studies.is_empty() {
            log::error!(
                "No DICOM studies found ({} unreadable file(s))",
                report.failures.len()
            );
            self.push_status(format!(
                "No DICOM studies found ({} unreadable file(s)).",
                report.failures.len()
            ));
            return;
        }
        if !report.failures.is_empty() {
            self.push_status(format!("Skipped {} unreadable file(s).", report.failures.len()));
        }

        let mut first_series = Vec::new();
        for study in report.studies {
            let first = study.series.first().map(|series| series.id.clone());
            if self.session.load_study(study).is_ok() {
                first_series.extend(first);
            }
        }
        self.hang_into_empty_viewports(&first_series);
    }

    /// Puts each series into the next empty viewport, in layout order.
    fn hang_into_empty_viewports(&mut self, series_ids: &[String]) {
        let empty = self
            .session
            .viewport_ids()
            .iter()
            .filter(|id| self.session.registry().get_assignment(id).is_none())
            .cloned()
            .collect::<Vec<_>>();
        for (viewport_id, series_id) in empty.iter().zip(series_ids) {
            let _ = self.session.assign_series(series_id, viewport_id);
        }
    }

    fn handle_launch_request(&mut self, request: LaunchRequest) {
        self.start_scan(request.paths);
    }

    fn begin_drag(&mut self, series_id: &str, source_viewport_id: Option<&str>) {
        self.drag_token = self.session.start_drag(series_id, source_viewport_id);
    }

    /// Pointer release or an egui-side cancel ends the drag. A drop in this
    /// frame has already consumed the session; otherwise the next frame's
    /// settle clears it.
    fn finish_drag_if_released(&mut self, ctx: &egui::Context) {
        let Some(token) = self.drag_token else {
            return;
        };
        let released = ctx.input(|input| input.pointer.any_released());
        if released || !egui::DragAndDrop::has_any_payload(ctx) {
            self.session.end_drag(token);
            self.drag_token = None;
        }
    }

    fn propagate(&mut self, viewport_id: &str, change: ViewportChange) {
        self.session
            .on_viewport_changed(&mut self.engine, viewport_id, change);
    }

    fn set_sync_flag(&mut self, attribute: SyncAttribute, enabled: bool) {
        self.session.set_sync_flag(attribute, enabled);
        if !enabled {
            return;
        }
        let source = self
            .active_viewport
            .clone()
            .or_else(|| self.session.viewport_ids().first().cloned());
        if let Some(source) = source {
            self.session.sync_all_from(&mut self.engine, &source);
        }
    }

    fn persist_settings_if_changed(&mut self) {
        let config = self.session.config();
        if config == self.last_config {
            return;
        }
        let persisted = config.to_persist(&self.startup_config, &self.stored_config);
        self.last_config = config;
        if persisted == self.stored_config {
            return;
        }
        if let Some(path) = &self.settings_path {
            if let Err(err) = persisted.save(path) {
                log::warn!("{err:#}");
                return;
            }
        }
        self.stored_config = persisted;
    }

    fn apply_window_level_drag(
        window_level: &mut WindowLevel,
        min_value: i32,
        max_value: i32,
        drag_delta: egui::Vec2,
    ) -> bool {
        if drag_delta == egui::Vec2::ZERO {
            return false;
        }

        let span = (max_value as i64 - min_value as i64).unsigned_abs() as f32;
        let sensitivity = (span / 512.0).clamp(0.25, 256.0);
        let old = *window_level;

        window_level.center += -drag_delta.y * sensitivity;
        window_level.width = (window_level.width + drag_delta.x * sensitivity).max(1.0);

        (window_level.center - old.center).abs() > f32::EPSILON
            || (window_level.width - old.width).abs() > f32::EPSILON
    }

    fn frame_step_from_scroll(scroll_accum: &mut f32, scroll: f32) -> i32 {
        const DEAD_ZONE: f32 = 0.5;
        const PIXELS_PER_FRAME_STEP: f32 = 30.0;

        if scroll.abs() <= DEAD_ZONE {
            return 0;
        }

        // reset stale residuals when the scroll direction flips
        if *scroll_accum != 0.0 && scroll.signum() != scroll_accum.signum() {
            *scroll_accum = 0.0;
        }
        *scroll_accum += scroll;

        let raw_steps = (*scroll_accum / PIXELS_PER_FRAME_STEP).trunc() as i32;
        if raw_steps == 0 {
            return 0;
        }

        *scroll_accum -= raw_steps as f32 * PIXELS_PER_FRAME_STEP;
        -raw_steps
    }

    fn dominant_scroll_axis(raw_scroll: egui::Vec2, smooth_scroll: egui::Vec2) -> f32 {
        let pick = |delta: egui::Vec2| {
            if delta.y.abs() >= delta.x.abs() {
                delta.y
            } else {
                delta.x
            }
        };

        if smooth_scroll != egui::Vec2::ZERO {
            pick(smooth_scroll)
        } else {
            pick(raw_scroll)
        }
    }

    fn show_top_bar(&mut self, ctx: &egui::Context) {
        let mut open_files = false;
        let mut open_folder = false;
        let mut layout = self.session.layout();
        let mut exclusive = self.session.registry().sharing() == SeriesSharing::Exclusive;
        let flags = self.session.sync_flags();
        let mut toggled = None;
        let status = self.status_line();

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.label(format!("{APP_TITLE} v{APP_VERSION}"));
                ui.separator();
                if ui.button("Open DICOM(s)").clicked() {
                    open_files = true;
                }
                if ui.button("Open Folder").clicked() {
                    open_folder = true;
                }
                ui.separator();
                egui::ComboBox::from_label("Layout")
                    .selected_text(layout.to_string())
                    .show_ui(ui, |ui| {
                        for preset in ViewportLayout::PRESETS {
                            ui.selectable_value(&mut layout, preset, preset.to_string());
                        }
                    });
                ui.checkbox(&mut exclusive, "One viewport per series");
                ui.separator();
                ui.label("Sync:");
                for attribute in SyncAttribute::ALL {
                    let mut enabled = flags.get(attribute);
                    if ui.checkbox(&mut enabled, attribute.label()).changed() {
                        toggled = Some((attribute, enabled));
                    }
                }
                ui.separator();
                if ui
                    .selectable_label(self.show_log, "Log")
                    .on_hover_text("Show session events")
                    .clicked()
                {
                    self.show_log = !self.show_log;
                }
                ui.label(status);
            });
        });

        if open_files {
            self.open_dicoms();
        }
        if open_folder {
            self.open_folder();
        }
        if layout != self.session.layout() {
            self.session.set_layout(layout);
        }
        let sharing = if exclusive {
            SeriesSharing::Exclusive
        } else {
            SeriesSharing::Shared
        };
        if sharing != self.session.registry().sharing() {
            self.session.set_sharing(sharing);
        }
        if let Some((attribute, enabled)) = toggled {
            self.set_sync_flag(attribute, enabled);
        }
    }

    fn show_series_panel(&mut self, ctx: &egui::Context) {
        let mut query = self.session.series_query().clone();
        let mut unload = None;
        let mut drag_started = None;

        let all = self.session.catalog().get_all_series();
        let modalities = available_modalities(&all);
        drop(all);
        let studies = self
            .session
            .catalog()
            .studies()
            .iter()
            .map(|study| {
                let name = study
                    .patient_name
                    .clone()
                    .or_else(|| study.description.clone())
                    .unwrap_or_else(|| study.id.clone());
                let color = study.color.map_or(Rgb(128, 128, 128), |c| c.primary);
                let summary = format!(
                    "{} series, {} images{}",
                    study.series_count,
                    study.image_count,
                    study
                        .study_date
                        .as_deref()
                        .map(|date| format!(", {date}"))
                        .unwrap_or_default()
                );
                (study.id.clone(), name, summary, color)
            })
            .collect::<Vec<_>>();
        let rows = self
            .session
            .filtered_series()
            .iter()
            .map(|listing| {
                let series = listing.series;
                let label = format!(
                    "#{} {} {} ({})",
                    series
                        .series_number
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    series.modality.as_deref().unwrap_or("??"),
                    series.description.as_deref().unwrap_or("(no description)"),
                    series.number_of_instances
                );
                let payload = DragPayload {
                    series_id: series.id.clone(),
                    preview: DragPreview::from_series(series, None),
                }
                .to_json()
                .map_err(|err| log::warn!("{err}"))
                .ok();
                SeriesRow {
                    series_id: series.id.clone(),
                    label,
                    color: listing.color.primary,
                    progress: (!series.is_loaded && series.loading_progress > 0.0)
                        .then_some(series.loading_progress),
                    payload,
                }
            })
            .collect::<Vec<_>>();

        egui::SidePanel::left("series-panel")
            .resizable(true)
            .default_width(320.0)
            .show(ctx, |ui| {
                ui.heading("Studies");
                if studies.is_empty() {
                    ui.label("Open DICOM files or a folder to begin.");
                }
                for (study_id, name, summary, color) in &studies {
                    ui.horizontal(|ui| {
                        color_chip(ui, *color);
                        ui.vertical(|ui| {
                            ui.label(name.as_str());
                            ui.small(summary.as_str());
                        });
                        ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                            if ui.small_button("✕").on_hover_text("Unload study").clicked() {
                                unload = Some(study_id.clone());
                            }
                        });
                    });
                }
                ui.separator();

                ui.horizontal(|ui| {
                    egui::ComboBox::from_id_salt("modality-filter")
                        .selected_text(query.modality.clone().unwrap_or_else(|| "All".into()))
                        .show_ui(ui, |ui| {
                            ui.selectable_value(&mut query.modality, None, "All");
                            for modality in &modalities {
                                ui.selectable_value(
                                    &mut query.modality,
                                    Some(modality.clone()),
                                    modality.as_str(),
                                );
                            }
                        });
                    egui::ComboBox::from_id_salt("study-filter")
                        .selected_text(
                            query
                                .study_id
                                .as_ref()
                                .and_then(|id| studies.iter().find(|s| &s.0 == id))
                                .map_or("All studies".to_string(), |s| s.1.clone()),
                        )
                        .show_ui(ui, |ui| {
                            ui.selectable_value(&mut query.study_id, None, "All studies");
                            for (study_id, name, _, _) in &studies {
                                ui.selectable_value(
                                    &mut query.study_id,
                                    Some(study_id.clone()),
                                    name.as_str(),
                                );
                            }
                        });
                });
                ui.add(egui::TextEdit::singleline(&mut query.search).hint_text("Search series"));
                ui.horizontal(|ui| {
                    egui::ComboBox::from_id_salt("sort-key")
                        .selected_text(query.sort_key.label())
                        .show_ui(ui, |ui| {
                            for key in SortKey::ALL {
                                ui.selectable_value(&mut query.sort_key, key, key.label());
                            }
                        });
                    let order_label = match query.sort_order {
                        SortOrder::Ascending => "⬆",
                        SortOrder::Descending => "⬇",
                    };
                    if ui.button(order_label).on_hover_text("Sort order").clicked() {
                        query.sort_order = match query.sort_order {
                            SortOrder::Ascending => SortOrder::Descending,
                            SortOrder::Descending => SortOrder::Ascending,
                        };
                    }
                    ui.checkbox(&mut query.group_by_study, "Group by study");
                });
                ui.separator();

                egui::ScrollArea::vertical().show(ui, |ui| {
                    for row in &rows {
                        let id = egui::Id::new(("series-row", &row.series_id));
                        let show_row = |ui: &mut egui::Ui| {
                            ui.horizontal(|ui| {
                                color_chip(ui, row.color);
                                ui.label(row.label.as_str());
                                if let Some(progress) = row.progress {
                                    ui.add(
                                        egui::ProgressBar::new(progress)
                                            .desired_width(60.0)
                                            .show_percentage(),
                                    );
                                }
                            });
                        };
                        match &row.payload {
                            Some(payload) => {
                                let response =
                                    ui.dnd_drag_source(id, payload.clone(), show_row).response;
                                if response.drag_started() {
                                    drag_started = Some(row.series_id.clone());
                                }
                            }
                            None => show_row(ui),
                        }
                    }
                });
            });

        if query != *self.session.series_query() {
            self.session.set_series_query(query);
        }
        if let Some(study_id) = unload {
            self.session.unload_study(&study_id);
        }
        if let Some(series_id) = drag_started {
            self.begin_drag(&series_id, None);
        }
    }

    fn show_viewport_grid(&mut self, ctx: &egui::Context) {
        let layout = self.session.layout();
        let viewport_ids = self.session.viewport_ids().to_vec();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.spacing_mut().item_spacing = egui::vec2(VIEW_GRID_GAP, VIEW_GRID_GAP);
            let available = ui.available_size();
            let cols = layout.cols as f32;
            let rows = layout.rows as f32;
            let cell_size = egui::vec2(
                ((available.x - VIEW_GRID_GAP * (cols - 1.0)).max(2.0)) / cols,
                ((available.y - VIEW_GRID_GAP * (rows - 1.0)).max(2.0)) / rows,
            );

            for row in viewport_ids.chunks(layout.cols as usize) {
                ui.horizontal(|ui| {
                    for viewport_id in row {
                        ui.allocate_ui_with_layout(
                            cell_size,
                            egui::Layout::top_down(egui::Align::Min),
                            |ui| self.show_viewport_cell(ui, viewport_id),
                        );
                    }
                });
            }
        });
    }

    fn show_viewport_cell(&mut self, ui: &mut egui::Ui, viewport_id: &str) {
        let series = self.session.viewport_series(viewport_id).cloned();
        let study_color = series
            .as_ref()
            .and_then(|series| self.session.catalog().get_study(&series.study_id))
            .and_then(|study| study.color)
            .map(|color| to_color32(color.primary));
        let is_active = self.active_viewport.as_deref() == Some(viewport_id);
        let hover_state = self.session.drag().hovered_zone().filter(|id| *id == viewport_id).map(
            |_| self.session.can_drop(viewport_id),
        );
        let stroke_color = match hover_state {
            Some(HoverState::Accept) => egui::Color32::from_rgb(80, 200, 120),
            Some(HoverState::Reject) => egui::Color32::from_rgb(220, 70, 70),
            _ if is_active => egui::Color32::from_rgb(90, 140, 220),
            _ => study_color.unwrap_or(egui::Color32::from_gray(28)),
        };

        let frame = egui::Frame::none()
            .stroke(egui::Stroke::new(1.5, stroke_color))
            .inner_margin(egui::Margin::same(VIEW_INNER_MARGIN));
        let frame_response = frame.show(ui, |ui| {
            let mut clear_clicked = false;
            let mut link_toggle = None;
            let mut drag_started = false;

            ui.horizontal(|ui| {
                match &series {
                    Some(series) => {
                        let payload = DragPayload {
                            series_id: series.id.clone(),
                            preview: DragPreview::from_series(series, Some(viewport_id)),
                        }
                        .to_json()
                        .ok();
                        let title = format!(
                            "⠿ {} {}",
                            series.modality.as_deref().unwrap_or("??"),
                            series.description.as_deref().unwrap_or("")
                        );
                        match payload {
                            Some(payload) => {
                                let id = egui::Id::new(("viewport-handle", viewport_id));
                                let response = ui
                                    .dnd_drag_source(id, payload, |ui| ui.label(title.as_str()))
                                    .response;
                                drag_started = response.drag_started();
                            }
                            None => {
                                ui.label(title.as_str());
                            }
                        }
                    }
                    None => {
                        ui.weak("Drop a series here");
                    }
                }
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if series.is_some() && ui.small_button("✕").on_hover_text("Clear").clicked()
                    {
                        clear_clicked = true;
                    }
                    let mut linked = self.session.sync().is_linked(viewport_id);
                    if ui
                        .checkbox(&mut linked, "")
                        .on_hover_text("Linked for sync")
                        .changed()
                    {
                        link_toggle = Some(linked);
                    }
                });
            });

            let remaining = ui.available_size();
            let (viewport_rect, response) =
                ui.allocate_exact_size(remaining, Sense::click_and_drag());
            self.session.drag_mut().set_zone_bounds(
                viewport_id,
                ZoneRect {
                    min: [viewport_rect.min.x, viewport_rect.min.y],
                    max: [viewport_rect.max.x, viewport_rect.max.y],
                },
            );
            if response.clicked() || response.drag_started() {
                self.active_viewport = Some(viewport_id.to_string());
            }
            self.handle_viewport_input(ui, viewport_id, viewport_rect, &response);
            self.paint_viewport(ui, viewport_id, viewport_rect);

            if clear_clicked {
                self.session.clear_viewport(viewport_id);
            }
            if let Some(linked) = link_toggle {
                self.session.set_viewport_linked(viewport_id, linked);
            }
            if drag_started {
                if let Some(series) = &series {
                    self.begin_drag(&series.id, Some(viewport_id));
                }
            }
        });

        let response = frame_response.response;
        if response.dnd_hover_payload::<String>().is_some() {
            self.session.hover_viewport(viewport_id);
        } else if self.session.drag().hovered_zone() == Some(viewport_id) {
            self.session.leave_viewport(viewport_id);
        }
        if let Some(payload) = response.dnd_release_payload::<String>() {
            self.drag_token = None;
            // failures are already on the event bus
            let _ = self.session.drop_payload_on_viewport(viewport_id, &payload);
            self.active_viewport = Some(viewport_id.to_string());
        }
    }

    fn handle_viewport_input(
        &mut self,
        ui: &egui::Ui,
        viewport_id: &str,
        viewport_rect: egui::Rect,
        response: &egui::Response,
    ) {
        if self.engine.view(viewport_id).is_none() || egui::DragAndDrop::has_any_payload(ui.ctx())
        {
            return;
        }

        if response.double_clicked() {
            if let Some(view) = self.engine.view_mut(viewport_id) {
                view.reset_view();
            }
            self.propagate(viewport_id, ViewportChange::Camera(Camera::default()));
            return;
        }

        if response.dragged() {
            let (delta, shift_held) =
                ui.input(|input| (input.pointer.delta(), input.modifiers.shift));
            let slice = self.engine.current_slice(viewport_id);
            if shift_held {
                if let (Some(slice), Ok(mut window_level)) =
                    (slice, self.engine.window_level(viewport_id))
                {
                    if slice.is_monochrome()
                        && Self::apply_window_level_drag(
                            &mut window_level,
                            slice.min_value,
                            slice.max_value,
                            delta,
                        )
                        && self
                            .engine
                            .set_window_level(viewport_id, window_level)
                            .is_ok()
                    {
                        self.propagate(viewport_id, ViewportChange::WindowLevel(window_level));
                    }
                }
            } else if let Ok(mut camera) = self.engine.camera(viewport_id) {
                if camera.zoom > 1.0 && delta != egui::Vec2::ZERO {
                    camera.pan[0] += delta.x;
                    camera.pan[1] += delta.y;
                    if self.engine.set_camera(viewport_id, camera).is_ok() {
                        self.propagate(viewport_id, ViewportChange::Camera(camera));
                    }
                }
            }
        }

        if !response.hovered() {
            return;
        }
        let (modifiers, raw_scroll, smooth_scroll, zoom_delta) = ui.input(|input| {
            (
                input.modifiers,
                input.raw_scroll_delta,
                input.smooth_scroll_delta,
                input.zoom_delta(),
            )
        });
        let scroll = Self::dominant_scroll_axis(raw_scroll, smooth_scroll);

        if modifiers.shift {
            let count = self.engine.image_count(viewport_id);
            let Some(view) = self.engine.view_mut(viewport_id) else {
                return;
            };
            if count <= 1 {
                return;
            }
            let step = Self::frame_step_from_scroll(&mut view.scroll_accum, scroll);
            if step == 0 {
                return;
            }
            let next = (view.index as i64 + step as i64).clamp(0, count as i64 - 1) as usize;
            if next != view.index && self.engine.set_scroll_index(viewport_id, next).is_ok() {
                self.propagate(viewport_id, ViewportChange::Scroll(next));
            }
            return;
        }

        let Ok(mut camera) = self.engine.camera(viewport_id) else {
            return;
        };
        let wheel_zoom = (scroll * 0.0015).exp();
        let mut next_zoom = camera.zoom;
        if (zoom_delta - 1.0).abs() > f32::EPSILON {
            next_zoom *= zoom_delta;
        } else if (wheel_zoom - 1.0).abs() > f32::EPSILON {
            next_zoom *= wheel_zoom;
        }
        next_zoom = next_zoom.clamp(1.0, 12.0);
        if (next_zoom - camera.zoom).abs() <= f32::EPSILON {
            return;
        }
        if let Some(pointer_pos) = response.hover_pos() {
            let old_center = viewport_rect.center() + egui::vec2(camera.pan[0], camera.pan[1]);
            let offset = pointer_pos - old_center;
            let ratio = next_zoom / camera.zoom;
            camera.pan[0] += offset.x * (1.0 - ratio);
            camera.pan[1] += offset.y * (1.0 - ratio);
        }
        camera.zoom = next_zoom;
        if self.engine.set_camera(viewport_id, camera).is_ok() {
            self.propagate(viewport_id, ViewportChange::Camera(camera));
        }
    }

    fn paint_viewport(&mut self, ui: &egui::Ui, viewport_id: &str, viewport_rect: egui::Rect) {
        let image_count = self.engine.image_count(viewport_id);
        let slice = self.engine.current_slice(viewport_id);
        let window_level = self.engine.window_level(viewport_id).ok();
        let Some(view) = self.engine.view_mut(viewport_id) else {
            return;
        };
        let painter = ui.painter().with_clip_rect(viewport_rect);
        painter.rect_filled(viewport_rect, 0.0, egui::Color32::BLACK);

        if let Some(texture) = &view.texture {
            let texture_size = texture.size_vec2();
            if texture_size.x > 0.0 && texture_size.y > 0.0 && viewport_rect.is_positive() {
                let fit_scale = (viewport_rect.width() / texture_size.x)
                    .min(viewport_rect.height() / texture_size.y)
                    .max(0.01);
                let draw_size = texture_size * fit_scale * view.camera.zoom;
                let max_pan_x = ((draw_size.x - viewport_rect.width()) * 0.5).max(0.0);
                let max_pan_y = ((draw_size.y - viewport_rect.height()) * 0.5).max(0.0);
                view.camera.pan[0] = view.camera.pan[0].clamp(-max_pan_x, max_pan_x);
                view.camera.pan[1] = view.camera.pan[1].clamp(-max_pan_y, max_pan_y);
                if view.camera.zoom <= 1.0 {
                    view.camera.pan = [0.0, 0.0];
                }
                let image_rect = egui::Rect::from_center_size(
                    viewport_rect.center() + egui::vec2(view.camera.pan[0], view.camera.pan[1]),
                    draw_size,
                );
                painter.image(
                    texture.id(),
                    image_rect,
                    egui::Rect::from_min_max(egui::Pos2::ZERO, egui::pos2(1.0, 1.0)),
                    egui::Color32::WHITE,
                );
            }
        } else if view.series_id.is_some() {
            painter.text(
                viewport_rect.center(),
                egui::Align2::CENTER_CENTER,
                "Loading...",
                egui::FontId::proportional(14.0),
                egui::Color32::from_gray(160),
            );
        }

        if view.series_id.is_none() {
            return;
        }
        let text_color = egui::Color32::from_gray(210);
        let font = egui::FontId::monospace(12.0);
        let mut lines = vec![format!("{}/{}", view.index + 1, image_count.max(1))];
        if let (Some(slice), Some(window_level)) = (&slice, window_level) {
            if slice.is_monochrome() {
                lines.push(format!(
                    "C {:.0} W {:.0}",
                    window_level.center, window_level.width
                ));
            }
        }
        if (view.camera.zoom - 1.0).abs() > f32::EPSILON {
            lines.push(format!("{:.1}x", view.camera.zoom));
        }
        if let Some(reference) = &view.reference {
            lines.push(format!(
                "ref {} @ {}",
                reference.source_viewport_id,
                reference.source_index + 1
            ));
        }
        painter.text(
            viewport_rect.left_bottom() + egui::vec2(6.0, -6.0),
            egui::Align2::LEFT_BOTTOM,
            lines.join("\n"),
            font,
            text_color,
        );
    }

    fn show_log_window(&mut self, ctx: &egui::Context) {
        let mut open = self.show_log;
        egui::Window::new("Session log")
            .open(&mut open)
            .default_width(420.0)
            .show(ctx, |ui| {
                egui::ScrollArea::vertical()
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        for entry in self.status_log.borrow().iter() {
                            ui.label(entry.as_str());
                        }
                    });
            });
        self.show_log = open;
    }
}

impl eframe::App for CompareApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        Self::apply_black_background(ctx);
        if self.is_loading() {
            ctx.set_cursor_icon(egui::CursorIcon::Progress);
        }

        self.session.settle_drag();
        if let Some(request) = self.pending_launch_request.take() {
            self.handle_launch_request(request);
        }
        self.poll_scan();
        for (series_id, finished, total) in self.engine.poll_decodes() {
            self.session
                .update_series_progress(&series_id, finished, total);
        }
        self.engine.reconcile(&self.session);
        self.engine.render_dirty();

        let mut close_requested = false;
        let mut escape_pressed = false;
        ctx.input_mut(|input| {
            close_requested = input.consume_key(egui::Modifiers::COMMAND, egui::Key::W);
            escape_pressed = input.key_pressed(egui::Key::Escape);
        });
        if close_requested {
            ctx.send_viewport_cmd(ViewportCommand::Close);
            return;
        }
        if escape_pressed && self.drag_token.take().is_some() {
            self.session.cancel_drag();
        }

        self.show_top_bar(ctx);
        self.show_series_panel(ctx);
        self.show_viewport_grid(ctx);
        if self.show_log {
            self.show_log_window(ctx);
        }

        self.finish_drag_if_released(ctx);
        self.persist_settings_if_changed();
        if self.is_loading() {
            ctx.request_repaint_after(std::time::Duration::from_millis(50));
        }
    }
}

fn to_color32(rgb: Rgb) -> egui::Color32 {
    egui::Color32::from_rgb(rgb.0, rgb.1, rgb.2)
}

fn color_chip(ui: &mut egui::Ui, rgb: Rgb) {
    let (rect, _) = ui.allocate_exact_size(egui::vec2(10.0, 10.0), Sense::hover());
    ui.painter().rect_filled(rect, 2.0, to_color32(rgb));
}

/// One status-log line per event worth telling the user about.
fn describe_event(event: &ViewerEvent) -> Option<String> {
    match event {
        ViewerEvent::StudyLoaded {
            study_id,
            series_count,
            image_count,
        } => Some(format!(
            "Loaded study {study_id} ({series_count} series, {image_count} images)."
        )),
        ViewerEvent::StudyUnloaded {
            study_id,
            cleared_viewports,
        } => Some(if cleared_viewports.is_empty() {
            format!("Unloaded study {study_id}.")
        } else {
            format!(
                "Unloaded study {study_id}; cleared {}.",
                cleared_viewports.join(", ")
            )
        }),
        ViewerEvent::SeriesAssigned {
            viewport_id,
            series_id,
            previous_series_id,
            ..
        } => Some(match previous_series_id {
            Some(previous) => format!("{viewport_id}: {series_id} (replaced {previous})."),
            None => format!("{viewport_id}: {series_id}."),
        }),
        ViewerEvent::Error { message } => Some(format!("Error: {message}")),
        ViewerEvent::StateChanged(StateChange::LayoutChanged { viewport_ids }) => {
            Some(format!("Layout has {} viewport(s).", viewport_ids.len()))
        }
        ViewerEvent::StateChanged(StateChange::SyncChanged(flags)) => {
            let enabled = SyncAttribute::ALL
                .into_iter()
                .filter(|attribute| flags.get(*attribute))
                .map(SyncAttribute::label)
                .collect::<Vec<_>>();
            Some(if enabled.is_empty() {
                "Sync off.".to_string()
            } else {
                format!("Sync: {}.", enabled.join(", "))
            })
        }
        ViewerEvent::StateChanged(_) => None,
    }
}
