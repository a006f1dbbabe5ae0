use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ViewerError;
use crate::model::Series;

/// What a drop target needs to know about the dragged series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragPreview {
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub number_of_instances: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_viewport_id: Option<String>,
}

impl DragPreview {
    pub fn from_series(series: &Series, source_viewport_id: Option<&str>) -> Self {
        Self {
            modality: series.modality.clone(),
            description: series.description.clone(),
            number_of_instances: series.number_of_instances,
            source_viewport_id: source_viewport_id.map(str::to_string),
        }
    }
}

/// Flat JSON object carried by the platform drag event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragPayload {
    pub series_id: String,
    #[serde(flatten)]
    pub preview: DragPreview,
}

impl DragPayload {
    pub fn to_json(&self) -> Result<String, ViewerError> {
        serde_json::to_string(self).map_err(|err| ViewerError::InvalidDragPayload(err.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ViewerError> {
        let payload: Self = serde_json::from_str(raw)
            .map_err(|err| ViewerError::InvalidDragPayload(err.to_string()))?;
        if payload.series_id.trim().is_empty() {
            return Err(ViewerError::InvalidDragPayload(
                "seriesId is empty".to_string(),
            ));
        }
        Ok(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DragToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragState {
    Idle,
    Dragging,
    /// The pointer was released; the session stays readable until a drop
    /// acknowledges it or the next event-loop turn settles it.
    PendingClear,
}

#[derive(Debug, Clone)]
pub struct DragSession {
    pub token: DragToken,
    pub series_id: String,
    pub preview: DragPreview,
    pub started_at: Instant,
    ended: bool,
}

impl DragSession {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn payload(&self) -> DragPayload {
        DragPayload {
            series_id: self.series_id.clone(),
            preview: self.preview.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneRect {
    pub min: [f32; 2],
    pub max: [f32; 2],
}

impl ZoneRect {
    pub fn contains(&self, point: [f32; 2]) -> bool {
        point[0] >= self.min[0]
            && point[0] <= self.max[0]
            && point[1] >= self.min[1]
            && point[1] <= self.max[1]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropZone {
    pub viewport_id: String,
    /// `None` accepts every modality.
    pub accepted_modalities: Option<BTreeSet<String>>,
    pub disabled: bool,
    pub bounds: Option<ZoneRect>,
}

impl DropZone {
    pub fn new(viewport_id: impl Into<String>) -> Self {
        Self {
            viewport_id: viewport_id.into(),
            accepted_modalities: None,
            disabled: false,
            bounds: None,
        }
    }

    pub fn accepting<I, S>(mut self, modalities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.accepted_modalities = Some(
            modalities
                .into_iter()
                .map(|modality| normalize_modality(modality.as_ref()))
                .collect(),
        );
        self
    }

    /// Pure acceptability check, evaluated fresh on every hover.
    pub fn accepts(&self, modality: Option<&str>) -> bool {
        if self.disabled {
            return false;
        }
        match &self.accepted_modalities {
            None => true,
            Some(accepted) => modality
                .map(normalize_modality)
                .is_some_and(|modality| accepted.contains(&modality)),
        }
    }
}

fn normalize_modality(value: &str) -> String {
    value.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoverState {
    NoDrag,
    UnknownZone,
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignRequest {
    pub series_id: String,
    pub viewport_id: String,
    pub source_viewport_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropOutcome {
    /// The host should hand this to the assignment registry.
    Assign(AssignRequest),
    Rejected {
        series_id: String,
        viewport_id: String,
    },
    /// Dropped back onto the viewport it was dragged from.
    SameViewport,
    UnknownZone(String),
    /// No drag was in flight, e.g. it was already settled.
    NoSession,
}

/// Owns the one in-flight drag and the catalog of drop targets.
#[derive(Debug, Default)]
pub struct DragCoordinator {
    session: Option<DragSession>,
    next_token: u64,
    zones: BTreeMap<String, DropZone>,
    hovered: Option<String>,
}

impl DragCoordinator {
    /// Begins dragging `series_id`. An unfinished drag of another series is
    /// superseded and its token stops working; dragging the same series again
    /// only refreshes the preview.
    pub fn start_drag(&mut self, series_id: &str, preview: DragPreview) -> DragToken {
        if let Some(session) = self.session.as_mut() {
            if session.series_id == series_id && !session.ended {
                session.preview = preview;
                return session.token;
            }
            log::debug!(
                "Drag of {} superseded by {series_id} after {:?}",
                session.series_id,
                session.elapsed()
            );
        }

        self.next_token = self.next_token.saturating_add(1);
        let token = DragToken(self.next_token);
        self.session = Some(DragSession {
            token,
            series_id: series_id.to_string(),
            preview,
            started_at: Instant::now(),
            ended: false,
        });
        self.hovered = None;
        log::debug!("Drag started for {series_id}");
        token
    }

    fn owned_session_mut(&mut self, token: DragToken) -> Option<&mut DragSession> {
        self.session
            .as_mut()
            .filter(|session| session.token == token)
    }

    pub fn update_preview(&mut self, token: DragToken, preview: DragPreview) -> bool {
        match self.owned_session_mut(token) {
            Some(session) => {
                session.preview = preview;
                true
            }
            None => false,
        }
    }

    /// Marks the drag finished without clearing it, so a drop delivered after
    /// the drag-end still sees the dragged series.
    pub fn end_drag(&mut self, token: DragToken) -> bool {
        match self.owned_session_mut(token) {
            Some(session) => {
                session.ended = true;
                true
            }
            None => false,
        }
    }

    /// Drops the session right away, e.g. on Escape.
    pub fn cancel(&mut self, token: DragToken) -> Option<DragSession> {
        self.owned_session_mut(token)?;
        self.hovered = None;
        self.session.take()
    }

    /// Runs once per event-loop turn. A drag that ended without a drop in an
    /// earlier turn is cleared here and returned as cancelled.
    pub fn settle(&mut self) -> Option<DragSession> {
        if !self.session.as_ref().is_some_and(|session| session.ended) {
            return None;
        }
        self.hovered = None;
        let session = self.session.take();
        if let Some(session) = &session {
            log::debug!("Drag of {} ended without a drop", session.series_id);
        }
        session
    }

    pub fn state(&self) -> DragState {
        match &self.session {
            None => DragState::Idle,
            Some(session) if session.ended => DragState::PendingClear,
            Some(_) => DragState::Dragging,
        }
    }

    pub fn session(&self) -> Option<&DragSession> {
        self.session.as_ref()
    }

    pub fn dragged_series(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.series_id.as_str())
    }

    pub fn preview(&self) -> Option<&DragPreview> {
        self.session.as_ref().map(|session| &session.preview)
    }

    pub fn register_drop_zone(&mut self, zone: DropZone) {
        self.zones.insert(zone.viewport_id.clone(), zone);
    }

    pub fn unregister_drop_zone(&mut self, viewport_id: &str) -> Option<DropZone> {
        if self.hovered.as_deref() == Some(viewport_id) {
            self.hovered = None;
        }
        self.zones.remove(viewport_id)
    }

    pub fn zone(&self, viewport_id: &str) -> Option<&DropZone> {
        self.zones.get(viewport_id)
    }

    pub fn zones(&self) -> impl Iterator<Item = &DropZone> {
        self.zones.values()
    }

    pub fn set_zone_bounds(&mut self, viewport_id: &str, bounds: ZoneRect) -> bool {
        match self.zones.get_mut(viewport_id) {
            Some(zone) => {
                zone.bounds = Some(bounds);
                true
            }
            None => false,
        }
    }

    pub fn set_zone_disabled(&mut self, viewport_id: &str, disabled: bool) -> bool {
        match self.zones.get_mut(viewport_id) {
            Some(zone) => {
                zone.disabled = disabled;
                true
            }
            None => false,
        }
    }

    pub fn zone_at(&self, point: [f32; 2]) -> Option<&str> {
        self.zones
            .values()
            .find(|zone| zone.bounds.is_some_and(|bounds| bounds.contains(point)))
            .map(|zone| zone.viewport_id.as_str())
    }

    pub fn can_drop(&self, viewport_id: &str) -> HoverState {
        let Some(session) = &self.session else {
            return HoverState::NoDrag;
        };
        let Some(zone) = self.zones.get(viewport_id) else {
            return HoverState::UnknownZone;
        };
        if zone.accepts(session.preview.modality.as_deref()) {
            HoverState::Accept
        } else {
            HoverState::Reject
        }
    }

    pub fn drag_enter(&mut self, viewport_id: &str) -> HoverState {
        let state = self.can_drop(viewport_id);
        if state != HoverState::NoDrag && state != HoverState::UnknownZone {
            self.hovered = Some(viewport_id.to_string());
        }
        state
    }

    pub fn drag_over(&mut self, viewport_id: &str) -> HoverState {
        self.drag_enter(viewport_id)
    }

    pub fn drag_leave(&mut self, viewport_id: &str) {
        if self.hovered.as_deref() == Some(viewport_id) {
            self.hovered = None;
        }
    }

    pub fn hovered_zone(&self) -> Option<&str> {
        self.hovered.as_deref()
    }

    /// Completes the drag on `viewport_id`. Whatever the outcome, the session
    /// is acknowledged and cleared.
    pub fn drop_on(&mut self, viewport_id: &str) -> DropOutcome {
        let Some(session) = self.session.take() else {
            log::warn!("Drop on {viewport_id} arrived after the drag was cleared; ignoring");
            return DropOutcome::NoSession;
        };
        self.hovered = None;

        let Some(zone) = self.zones.get(viewport_id) else {
            log::warn!("Drop on unregistered viewport {viewport_id}");
            return DropOutcome::UnknownZone(viewport_id.to_string());
        };
        if session.preview.source_viewport_id.as_deref() == Some(viewport_id) {
            return DropOutcome::SameViewport;
        }
        if !zone.accepts(session.preview.modality.as_deref()) {
            log::debug!(
                "Viewport {viewport_id} rejected {} ({:?})",
                session.series_id,
                session.preview.modality
            );
            return DropOutcome::Rejected {
                series_id: session.series_id,
                viewport_id: viewport_id.to_string(),
            };
        }

        DropOutcome::Assign(AssignRequest {
            series_id: session.series_id,
            viewport_id: viewport_id.to_string(),
            source_viewport_id: session.preview.source_viewport_id,
        })
    }

    /// Drop handler for payloads that come in over the platform drag event.
    /// The payload must describe the session this coordinator owns.
    pub fn drop_payload(&mut self, viewport_id: &str, raw: &str) -> DropOutcome {
        let payload = match DragPayload::from_json(raw) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("Ignoring drop on {viewport_id}: {err}");
                return DropOutcome::NoSession;
            }
        };
        let active = self.dragged_series().map(str::to_string);
        match active.as_deref() {
            Some(series_id) if series_id == payload.series_id => self.drop_on(viewport_id),
            Some(series_id) => {
                log::warn!(
                    "Drop payload for {} does not match active drag of {series_id}; ignoring",
                    payload.series_id
                );
                DropOutcome::NoSession
            }
            None => {
                log::warn!(
                    "Drop of {} on {viewport_id} arrived after the drag was cleared; ignoring",
                    payload.series_id
                );
                DropOutcome::NoSession
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preview(modality: &str) -> DragPreview {
        DragPreview {
            modality: Some(modality.to_string()),
            description: Some(format!("{modality} series")),
            number_of_instances: 10,
            source_viewport_id: None,
        }
    }

    #[test]
    fn second_drag_supersedes_first() {
        let mut dnd = DragCoordinator::default();
        let first = dnd.start_drag("s1", preview("CT"));
        let second = dnd.start_drag("s2", preview("MR"));

        assert_ne!(first, second);
        assert_eq!(dnd.dragged_series(), Some("s2"));
        assert_eq!(
            dnd.preview().and_then(|p| p.modality.as_deref()),
            Some("MR")
        );
        // the superseded owner can no longer touch the session
        assert!(!dnd.end_drag(first));
        assert!(!dnd.update_preview(first, preview("US")));
        assert_eq!(dnd.state(), DragState::Dragging);
    }

    #[test]
    fn restarting_same_series_refreshes_preview() {
        let mut dnd = DragCoordinator::default();
        let first = dnd.start_drag("s1", preview("CT"));
        let again = dnd.start_drag("s1", preview("CT"));
        assert_eq!(first, again);
    }

    #[test]
    fn modality_restriction_is_enforced() {
        let zone = DropZone::new("v1").accepting(["CT"]);
        assert!(!zone.accepts(Some("MR")));
        assert!(zone.accepts(Some("CT")));
        assert!(zone.accepts(Some(" ct ")));
        assert!(!zone.accepts(None));

        let open = DropZone::new("v2");
        assert!(open.accepts(None));

        let mut disabled = DropZone::new("v3");
        disabled.disabled = true;
        assert!(!disabled.accepts(Some("CT")));
    }

    #[test]
    fn hover_is_recomputed_per_drag() {
        let mut dnd = DragCoordinator::default();
        dnd.register_drop_zone(DropZone::new("v1").accepting(["CT"]));
        assert_eq!(dnd.can_drop("v1"), HoverState::NoDrag);

        let token = dnd.start_drag("s1", preview("MR"));
        assert_eq!(dnd.drag_enter("v1"), HoverState::Reject);
        assert_eq!(dnd.drag_over("v9"), HoverState::UnknownZone);
        dnd.cancel(token);

        dnd.start_drag("s2", preview("CT"));
        assert_eq!(dnd.drag_enter("v1"), HoverState::Accept);
        assert_eq!(dnd.hovered_zone(), Some("v1"));
        dnd.drag_leave("v1");
        assert_eq!(dnd.hovered_zone(), None);
    }

    #[test]
    fn drop_after_end_still_sees_drag_state() {
        let mut dnd = DragCoordinator::default();
        dnd.register_drop_zone(DropZone::new("v1"));
        let token = dnd.start_drag("s1", preview("CT"));

        assert!(dnd.end_drag(token));
        assert_eq!(dnd.state(), DragState::PendingClear);
        assert_eq!(dnd.dragged_series(), Some("s1"));

        let outcome = dnd.drop_on("v1");
        assert_eq!(
            outcome,
            DropOutcome::Assign(AssignRequest {
                series_id: "s1".to_string(),
                viewport_id: "v1".to_string(),
                source_viewport_id: None,
            })
        );
        assert_eq!(dnd.state(), DragState::Idle);
        assert!(dnd.settle().is_none());
    }

    #[test]
    fn drop_after_settle_is_ignored() {
        let mut dnd = DragCoordinator::default();
        dnd.register_drop_zone(DropZone::new("v1"));
        let token = dnd.start_drag("s1", preview("CT"));
        dnd.end_drag(token);

        let cancelled = dnd.settle().expect("ended drag settles");
        assert_eq!(cancelled.series_id, "s1");
        assert_eq!(dnd.drop_on("v1"), DropOutcome::NoSession);
    }

    #[test]
    fn settle_leaves_active_drag_alone() {
        let mut dnd = DragCoordinator::default();
        dnd.start_drag("s1", preview("CT"));
        assert!(dnd.settle().is_none());
        assert_eq!(dnd.state(), DragState::Dragging);
    }

    #[test]
    fn rejected_drop_clears_session() {
        let mut dnd = DragCoordinator::default();
        dnd.register_drop_zone(DropZone::new("v1").accepting(["CT"]));
        dnd.start_drag("s1", preview("MR"));
        assert_eq!(
            dnd.drop_on("v1"),
            DropOutcome::Rejected {
                series_id: "s1".to_string(),
                viewport_id: "v1".to_string(),
            }
        );
        assert_eq!(dnd.state(), DragState::Idle);
    }

    #[test]
    fn drop_on_source_viewport_is_noop() {
        let mut dnd = DragCoordinator::default();
        dnd.register_drop_zone(DropZone::new("v1"));
        let mut from_viewport = preview("CT");
        from_viewport.source_viewport_id = Some("v1".to_string());
        dnd.start_drag("s1", from_viewport);
        assert_eq!(dnd.drop_on("v1"), DropOutcome::SameViewport);
    }

    #[test]
    fn zones_exist_before_any_drag_and_hit_test() {
        let mut dnd = DragCoordinator::default();
        dnd.register_drop_zone(DropZone::new("left"));
        dnd.register_drop_zone(DropZone::new("right"));
        dnd.set_zone_bounds(
            "left",
            ZoneRect {
                min: [0.0, 0.0],
                max: [100.0, 100.0],
            },
        );
        dnd.set_zone_bounds(
            "right",
            ZoneRect {
                min: [100.5, 0.0],
                max: [200.0, 100.0],
            },
        );
        assert_eq!(dnd.zone_at([150.0, 50.0]), Some("right"));
        assert_eq!(dnd.zone_at([50.0, 50.0]), Some("left"));
        assert_eq!(dnd.zone_at([250.0, 50.0]), None);

        assert!(dnd.unregister_drop_zone("left").is_some());
        assert!(dnd.zone("left").is_none());
    }

    #[test]
    fn payload_json_is_flat_camel_case() {
        let payload = DragPayload {
            series_id: "1.2.3".to_string(),
            preview: DragPreview {
                modality: Some("CT".to_string()),
                description: None,
                number_of_instances: 120,
                source_viewport_id: Some("viewport-0".to_string()),
            },
        };
        let json = payload.to_json().expect("payload serializes");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
        assert_eq!(value["seriesId"], "1.2.3");
        assert_eq!(value["modality"], "CT");
        assert_eq!(value["numberOfInstances"], 120);
        assert_eq!(value["sourceViewportId"], "viewport-0");
    }

    #[test]
    fn payload_without_series_is_rejected() {
        assert!(DragPayload::from_json("{\"seriesId\":\"\"}").is_err());
        assert!(DragPayload::from_json("not json").is_err());
        let parsed = DragPayload::from_json("{\"seriesId\":\"s\",\"numberOfInstances\":3}")
            .expect("minimal payload parses");
        assert_eq!(parsed.preview.number_of_instances, 3);
    }

    #[test]
    fn stale_payload_drop_is_ignored() {
        let mut dnd = DragCoordinator::default();
        dnd.register_drop_zone(DropZone::new("v1"));
        let raw = DragPayload {
            series_id: "s1".to_string(),
            preview: preview("CT"),
        }
        .to_json()
        .expect("serializes");

        assert_eq!(dnd.drop_payload("v1", &raw), DropOutcome::NoSession);

        dnd.start_drag("s2", preview("CT"));
        assert_eq!(dnd.drop_payload("v1", &raw), DropOutcome::NoSession);
        assert_eq!(dnd.dragged_series(), Some("s2"));
    }
}
