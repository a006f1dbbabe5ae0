use crate::assignment::{AssignmentChange, AssignmentRegistry, SeriesSharing, ViewportAssignment};
use crate::config::ViewerConfig;
use crate::dnd::{DragCoordinator, DragPreview, DragToken, DropOutcome, DropZone, HoverState};
use crate::error::ViewerError;
use crate::events::{EventBus, StateChange, ViewerEvent};
use crate::filter::{filter_and_sort, SeriesQuery};
use crate::layout::ViewportLayout;
use crate::model::{LoadingState, Series, SeriesListing, Study, StudyCatalog};
use crate::sync::{
    RenderingEngine, SyncAttribute, SyncController, SyncFlags, SyncReport, ViewportChange,
};

/// Everything one running viewer owns: loaded studies, what each viewport
/// shows, the drag in flight and the sync links.
///
/// Every mutation goes through here so that the matching event is published
/// after the state it describes is already in place.
pub struct ViewerSession {
    catalog: StudyCatalog,
    registry: AssignmentRegistry,
    drag: DragCoordinator,
    sync: SyncController,
    bus: EventBus,
    layout: ViewportLayout,
    viewport_ids: Vec<String>,
    series_query: SeriesQuery,
}

impl Default for ViewerSession {
    fn default() -> Self {
        Self::new(&ViewerConfig::default())
    }
}

impl ViewerSession {
    pub fn new(config: &ViewerConfig) -> Self {
        let mut session = Self {
            catalog: StudyCatalog::default(),
            registry: AssignmentRegistry::new(config.series_sharing),
            drag: DragCoordinator::default(),
            sync: SyncController::new(config.sync),
            bus: EventBus::default(),
            layout: config.layout,
            viewport_ids: Vec::new(),
            series_query: config.series_query.clone(),
        };
        session.apply_viewports(config.layout.viewport_ids());
        session
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn catalog(&self) -> &StudyCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &AssignmentRegistry {
        &self.registry
    }

    pub fn drag(&self) -> &DragCoordinator {
        &self.drag
    }

    pub fn sync(&self) -> &SyncController {
        &self.sync
    }

    pub fn layout(&self) -> ViewportLayout {
        self.layout
    }

    pub fn viewport_ids(&self) -> &[String] {
        &self.viewport_ids
    }

    pub fn has_viewport(&self, viewport_id: &str) -> bool {
        self.viewport_ids.iter().any(|id| id == viewport_id)
    }

    /// Current preferences, ready to be written back to the settings file.
    pub fn config(&self) -> ViewerConfig {
        ViewerConfig {
            series_sharing: self.registry.sharing(),
            layout: self.layout,
            sync: self.sync.flags(),
            series_query: self.series_query.clone(),
        }
    }

    fn publish(&self, event: ViewerEvent) {
        self.bus.publish(&event);
    }

    fn report(&self, err: &ViewerError) {
        log::warn!("{err}");
        if err.is_user_visible() {
            self.publish(ViewerEvent::Error {
                message: err.to_string(),
            });
        }
    }

    pub fn load_study(&mut self, study: Study) -> Result<(), ViewerError> {
        let (study_id, series_count, image_count) = match self.catalog.load_study(study) {
            Ok(loaded) => (loaded.id.clone(), loaded.series_count, loaded.image_count),
            Err(err) => {
                self.report(&err);
                return Err(err);
            }
        };
        log::info!("Loaded study {study_id}: {series_count} series, {image_count} images");

        // a reload may have dropped series that are still on screen
        let orphaned = self
            .registry
            .assignments()
            .filter(|assignment| assignment.study_id == study_id)
            .filter(|assignment| self.catalog.find_series(&assignment.series_id).is_none())
            .map(|assignment| assignment.viewport_id.clone())
            .collect::<Vec<_>>();
        for viewport_id in orphaned {
            self.clear_viewport(&viewport_id);
        }

        self.publish(ViewerEvent::StudyLoaded {
            study_id,
            series_count,
            image_count,
        });
        Ok(())
    }

    /// Removes a study and empties every viewport showing one of its series.
    /// Unloading an unknown study is a no-op.
    pub fn unload_study(&mut self, study_id: &str) -> Option<Study> {
        let study = self.catalog.unload_study(study_id)?;
        let mut cleared_viewports = self
            .registry
            .clear_study(study_id)
            .into_iter()
            .map(|assignment| assignment.viewport_id)
            .collect::<Vec<_>>();
        cleared_viewports.sort();

        if self
            .drag
            .session()
            .is_some_and(|session| study.series.iter().any(|s| s.id == session.series_id))
        {
            self.cancel_drag();
        }

        log::info!(
            "Unloaded study {study_id}, cleared {} viewport(s)",
            cleared_viewports.len()
        );
        self.publish(ViewerEvent::StudyUnloaded {
            study_id: study_id.to_string(),
            cleared_viewports,
        });
        Some(study)
    }

    pub fn clear_studies(&mut self) {
        let ids = self
            .catalog
            .studies()
            .iter()
            .map(|study| study.id.clone())
            .collect::<Vec<_>>();
        for study_id in ids {
            self.unload_study(&study_id);
        }
    }

    pub fn set_study_state(&mut self, study_id: &str, state: LoadingState) -> bool {
        self.catalog.set_study_state(study_id, state)
    }

    pub fn update_series_progress(
        &mut self,
        series_id: &str,
        loaded: usize,
        total: usize,
    ) -> Option<f32> {
        let progress = self.catalog.update_series_progress(series_id, loaded, total)?;
        self.publish(ViewerEvent::StateChanged(StateChange::SeriesProgress {
            series_id: series_id.to_string(),
            progress,
        }));
        Some(progress)
    }

    pub fn series_query(&self) -> &SeriesQuery {
        &self.series_query
    }

    pub fn set_series_query(&mut self, query: SeriesQuery) {
        self.series_query = query;
    }

    pub fn filtered_series(&self) -> Vec<SeriesListing<'_>> {
        filter_and_sort(self.catalog.get_all_series(), &self.series_query)
    }

    pub fn set_sharing(&mut self, sharing: SeriesSharing) {
        self.registry.set_sharing(sharing);
    }

    /// Shows `series_id` in `viewport_id`. Any failure is also published as
    /// an error event.
    pub fn assign_series(
        &mut self,
        series_id: &str,
        viewport_id: &str,
    ) -> Result<Option<AssignmentChange>, ViewerError> {
        if !self.has_viewport(viewport_id) {
            let err = ViewerError::UnknownViewport(viewport_id.to_string());
            self.report(&err);
            return Err(err);
        }
        let change = match self.registry.assign(&self.catalog, series_id, viewport_id) {
            Ok(Some(change)) => change,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.report(&err);
                return Err(err);
            }
        };

        for evicted in &change.evicted_viewports {
            self.publish(ViewerEvent::StateChanged(StateChange::ViewportCleared {
                viewport_id: evicted.clone(),
                series_id: change.series_id.clone(),
            }));
        }
        log::info!("Viewport {viewport_id} now shows series {series_id}");
        self.publish(ViewerEvent::SeriesAssigned {
            viewport_id: change.viewport_id.clone(),
            series_id: change.series_id.clone(),
            study_id: change.study_id.clone(),
            previous_series_id: change.previous_series_id.clone(),
        });
        Ok(Some(change))
    }

    pub fn clear_viewport(&mut self, viewport_id: &str) -> Option<ViewportAssignment> {
        let removed = self.registry.clear(viewport_id)?;
        self.publish(ViewerEvent::StateChanged(StateChange::ViewportCleared {
            viewport_id: removed.viewport_id.clone(),
            series_id: removed.series_id.clone(),
        }));
        Some(removed)
    }

    pub fn viewport_series(&self, viewport_id: &str) -> Option<&Series> {
        let assignment = self.registry.get_assignment(viewport_id)?;
        self.catalog.find_series(&assignment.series_id)
    }

    /// Starts dragging a loaded series, optionally out of a viewport.
    /// Unknown series do not start a drag.
    pub fn start_drag(
        &mut self,
        series_id: &str,
        source_viewport_id: Option<&str>,
    ) -> Option<DragToken> {
        let Some(series) = self.catalog.find_series(series_id) else {
            log::warn!("Drag requested for series {series_id} which is not loaded");
            return None;
        };
        let preview = DragPreview::from_series(series, source_viewport_id);
        let previous = self.drag.session().map(|session| session.token);
        let token = self.drag.start_drag(series_id, preview);
        if previous != Some(token) {
            self.publish(ViewerEvent::StateChanged(StateChange::DragStarted {
                series_id: series_id.to_string(),
            }));
        }
        Some(token)
    }

    pub fn end_drag(&mut self, token: DragToken) -> bool {
        self.drag.end_drag(token)
    }

    /// Drops the current drag without assigning anything.
    pub fn cancel_drag(&mut self) {
        let Some(token) = self.drag.session().map(|session| session.token) else {
            return;
        };
        if let Some(session) = self.drag.cancel(token) {
            self.publish(ViewerEvent::StateChanged(StateChange::DragFinished {
                series_id: session.series_id,
                dropped_on: None,
            }));
        }
    }

    /// Call once at the start of every event-loop turn.
    pub fn settle_drag(&mut self) {
        if let Some(session) = self.drag.settle() {
            self.publish(ViewerEvent::StateChanged(StateChange::DragFinished {
                series_id: session.series_id,
                dropped_on: None,
            }));
        }
    }

    pub fn hover_viewport(&mut self, viewport_id: &str) -> HoverState {
        self.drag.drag_over(viewport_id)
    }

    pub fn leave_viewport(&mut self, viewport_id: &str) {
        self.drag.drag_leave(viewport_id);
    }

    pub fn can_drop(&self, viewport_id: &str) -> HoverState {
        self.drag.can_drop(viewport_id)
    }

    /// Completes the drag on `viewport_id` and applies the assignment it
    /// asks for.
    pub fn drop_on_viewport(&mut self, viewport_id: &str) -> Result<DropOutcome, ViewerError> {
        let series_id = self.drag.dragged_series().map(str::to_string);
        let outcome = self.drag.drop_on(viewport_id);
        self.apply_drop(series_id, viewport_id, outcome)
    }

    /// Same as [`Self::drop_on_viewport`] for a JSON payload delivered by the
    /// platform drag event.
    pub fn drop_payload_on_viewport(
        &mut self,
        viewport_id: &str,
        raw: &str,
    ) -> Result<DropOutcome, ViewerError> {
        let series_id = self.drag.dragged_series().map(str::to_string);
        let outcome = self.drag.drop_payload(viewport_id, raw);
        self.apply_drop(series_id, viewport_id, outcome)
    }

    fn apply_drop(
        &mut self,
        series_id: Option<String>,
        viewport_id: &str,
        outcome: DropOutcome,
    ) -> Result<DropOutcome, ViewerError> {
        if matches!(outcome, DropOutcome::NoSession) {
            return Ok(outcome);
        }
        let assigned = match &outcome {
            DropOutcome::Assign(request) => {
                self.assign_series(&request.series_id, &request.viewport_id)
                    .map(|_| ())
            }
            _ => Ok(()),
        };
        if let Some(series_id) = series_id {
            let dropped_on = match (&outcome, &assigned) {
                (DropOutcome::Assign(_), Ok(())) => Some(viewport_id.to_string()),
                _ => None,
            };
            self.publish(ViewerEvent::StateChanged(StateChange::DragFinished {
                series_id,
                dropped_on,
            }));
        }
        assigned.map(|()| outcome)
    }

    /// Restricts what `viewport_id` accepts. `None` accepts every modality.
    pub fn set_zone_modalities(
        &mut self,
        viewport_id: &str,
        modalities: Option<&[&str]>,
    ) -> Result<(), ViewerError> {
        let Some(existing) = self.drag.zone(viewport_id).cloned() else {
            return Err(ViewerError::UnknownViewport(viewport_id.to_string()));
        };
        let zone = match modalities {
            Some(modalities) => DropZone {
                accepted_modalities: None,
                ..existing
            }
            .accepting(modalities.iter().copied()),
            None => DropZone {
                accepted_modalities: None,
                ..existing
            },
        };
        self.drag.register_drop_zone(zone);
        Ok(())
    }

    pub fn set_zone_disabled(&mut self, viewport_id: &str, disabled: bool) -> bool {
        self.drag.set_zone_disabled(viewport_id, disabled)
    }

    pub fn drag_mut(&mut self) -> &mut DragCoordinator {
        &mut self.drag
    }

    pub fn set_layout(&mut self, layout: ViewportLayout) {
        self.layout = layout;
        log::info!("Layout set to {layout}");
        self.set_viewports(layout.viewport_ids());
    }

    /// Replaces the viewport set with explicit ids, for hosts that name their
    /// viewports themselves. Assignments, drop zones and sync links of
    /// viewports that disappear are dropped; surviving zones keep their
    /// settings.
    pub fn set_viewports(&mut self, viewport_ids: Vec<String>) {
        let removed = self.apply_viewports(viewport_ids);
        for assignment in removed {
            self.publish(ViewerEvent::StateChanged(StateChange::ViewportCleared {
                viewport_id: assignment.viewport_id,
                series_id: assignment.series_id,
            }));
        }
        self.publish(ViewerEvent::StateChanged(StateChange::LayoutChanged {
            viewport_ids: self.viewport_ids.clone(),
        }));
    }

    fn apply_viewports(&mut self, viewport_ids: Vec<String>) -> Vec<ViewportAssignment> {
        self.viewport_ids = viewport_ids;

        let stale = self
            .drag
            .zones()
            .filter(|zone| !self.viewport_ids.contains(&zone.viewport_id))
            .map(|zone| zone.viewport_id.clone())
            .collect::<Vec<_>>();
        for viewport_id in stale {
            self.drag.unregister_drop_zone(&viewport_id);
        }
        for viewport_id in &self.viewport_ids {
            if self.drag.zone(viewport_id).is_none() {
                self.drag.register_drop_zone(DropZone::new(viewport_id.clone()));
            }
        }

        self.sync.set_layout(&self.viewport_ids);
        self.registry.retain_viewports(&self.viewport_ids)
    }

    pub fn sync_flags(&self) -> SyncFlags {
        self.sync.flags()
    }

    pub fn set_sync_flag(&mut self, attribute: SyncAttribute, enabled: bool) {
        if self.sync.flags().get(attribute) == enabled {
            return;
        }
        self.sync.set_flag(attribute, enabled);
        log::debug!("Sync {} {}", attribute.label(), if enabled { "on" } else { "off" });
        self.publish(ViewerEvent::StateChanged(StateChange::SyncChanged(
            self.sync.flags(),
        )));
    }

    pub fn set_viewport_linked(&mut self, viewport_id: &str, linked: bool) -> bool {
        if linked {
            self.sync.link(viewport_id)
        } else {
            self.sync.unlink(viewport_id)
        }
    }

    pub fn on_viewport_changed(
        &mut self,
        engine: &mut dyn RenderingEngine,
        viewport_id: &str,
        change: ViewportChange,
    ) -> SyncReport {
        self.sync.on_viewport_changed(engine, viewport_id, change)
    }

    pub fn sync_all_from(
        &mut self,
        engine: &mut dyn RenderingEngine,
        viewport_id: &str,
    ) -> Vec<SyncReport> {
        self.sync.sync_all_from(engine, viewport_id)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::dnd::DragState;
    use crate::events::EventKind;

    fn series(id: &str, modality: &str, instances: usize) -> Series {
        Series {
            id: id.to_string(),
            modality: Some(modality.to_string()),
            number_of_instances: instances,
            ..Default::default()
        }
    }

    fn study(id: &str, series_list: Vec<Series>) -> Study {
        Study {
            id: id.to_string(),
            series: series_list,
            ..Default::default()
        }
    }

    fn recorded(session: &ViewerSession) -> Rc<RefCell<Vec<ViewerEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        session
            .bus()
            .subscribe_all(move |event| sink.borrow_mut().push(event.clone()));
        events
    }

    fn session_with_two_studies() -> ViewerSession {
        let mut session = ViewerSession::default();
        session
            .load_study(study("a", vec![series("a1", "CT", 10), series("a2", "CT", 5)]))
            .expect("a loads");
        session
            .load_study(study("b", vec![series("b1", "MR", 7)]))
            .expect("b loads");
        session
    }

    #[test]
    fn failed_load_publishes_error() {
        let mut session = ViewerSession::default();
        let events = recorded(&session);
        assert!(session.load_study(study("", vec![])).is_err());
        assert!(matches!(
            events.borrow().as_slice(),
            [ViewerEvent::Error { .. }]
        ));
    }

    #[test]
    fn assign_to_missing_viewport_fails() {
        let mut session = session_with_two_studies();
        let err = session
            .assign_series("a1", "viewport-9")
            .expect_err("outside the layout");
        assert_eq!(err, ViewerError::UnknownViewport("viewport-9".to_string()));
    }

    #[test]
    fn reassigning_same_series_publishes_nothing() {
        let mut session = session_with_two_studies();
        session.assign_series("a1", "viewport-0").expect("assigns");
        let events = recorded(&session);
        assert_eq!(session.assign_series("a1", "viewport-0"), Ok(None));
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn drop_assigns_and_reports_finish() {
        let mut session = session_with_two_studies();
        let events = recorded(&session);
        let token = session.start_drag("b1", None).expect("drag starts");
        assert!(session.end_drag(token));
        assert_eq!(session.drag().state(), DragState::PendingClear);

        let outcome = session.drop_on_viewport("viewport-1").expect("drop applies");
        assert!(matches!(outcome, DropOutcome::Assign(_)));
        assert_eq!(session.drag().state(), DragState::Idle);
        assert_eq!(
            session.viewport_series("viewport-1").map(|s| s.id.as_str()),
            Some("b1")
        );
        assert!(events.borrow().iter().any(|event| matches!(
            event,
            ViewerEvent::StateChanged(StateChange::DragFinished { dropped_on: Some(vp), .. })
                if vp == "viewport-1"
        )));
    }

    #[test]
    fn settle_without_drop_cancels() {
        let mut session = session_with_two_studies();
        let token = session.start_drag("a1", None).expect("drag starts");
        session.end_drag(token);
        session.settle_drag();
        assert_eq!(session.drag().state(), DragState::Idle);
        assert_eq!(
            session.drop_on_viewport("viewport-0"),
            Ok(DropOutcome::NoSession)
        );
        assert!(session.registry().get_assignment("viewport-0").is_none());
    }

    #[test]
    fn rejected_modality_leaves_viewport_alone() {
        let mut session = session_with_two_studies();
        session
            .set_zone_modalities("viewport-0", Some(&["MR"][..]))
            .expect("zone exists");
        session.start_drag("a1", None);
        assert_eq!(session.can_drop("viewport-0"), HoverState::Reject);
        let outcome = session.drop_on_viewport("viewport-0").expect("no error");
        assert!(matches!(outcome, DropOutcome::Rejected { .. }));
        assert!(session.registry().get_assignment("viewport-0").is_none());
    }

    #[test]
    fn drag_from_viewport_back_onto_itself_is_noop() {
        let mut session = session_with_two_studies();
        session.assign_series("a1", "viewport-0").expect("assigns");
        session.start_drag("a1", Some("viewport-0"));
        assert_eq!(
            session.drop_on_viewport("viewport-0"),
            Ok(DropOutcome::SameViewport)
        );
    }

    #[test]
    fn shrinking_layout_clears_dropped_viewports() {
        let mut session = session_with_two_studies();
        session.set_layout(ViewportLayout::new(2, 2));
        session.assign_series("a1", "viewport-3").expect("assigns");
        session
            .set_zone_modalities("viewport-0", Some(&["CT"][..]))
            .expect("zone exists");

        let events = recorded(&session);
        session.set_layout(ViewportLayout::new(1, 2));

        assert!(session.registry().get_assignment("viewport-3").is_none());
        assert!(session.drag().zone("viewport-3").is_none());
        assert!(session
            .drag()
            .zone("viewport-0")
            .is_some_and(|zone| zone.accepted_modalities.is_some()));
        assert_eq!(session.sync().linked(), session.viewport_ids());
        let kinds = events.borrow().iter().map(ViewerEvent::kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EventKind::StateChanged, EventKind::StateChanged]);
    }

    #[test]
    fn reload_without_series_clears_its_viewport() {
        let mut session = session_with_two_studies();
        session.assign_series("a2", "viewport-0").expect("assigns");
        session
            .load_study(study("a", vec![series("a1", "CT", 10)]))
            .expect("a reloads");
        assert!(session.registry().get_assignment("viewport-0").is_none());
        assert!(session.registry().index().is_consistent());
    }

    #[test]
    fn sync_toggle_publishes_only_on_change() {
        let mut session = ViewerSession::default();
        let events = recorded(&session);
        session.set_sync_flag(SyncAttribute::Scroll, true);
        session.set_sync_flag(SyncAttribute::Camera, true);
        assert_eq!(events.borrow().len(), 1);
        assert!(session.config().sync.camera);
    }

    #[test]
    fn progress_is_published() {
        let mut session = session_with_two_studies();
        let events = recorded(&session);
        assert_eq!(session.update_series_progress("a1", 5, 10), Some(0.5));
        assert_eq!(session.update_series_progress("ghost", 1, 1), None);
        assert_eq!(events.borrow().len(), 1);
    }
}
