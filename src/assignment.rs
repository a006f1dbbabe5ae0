use std::collections::{BTreeSet, HashMap};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::ViewerError;
use crate::model::StudyCatalog;

#[derive(Debug, Clone, PartialEq)]
pub struct ViewportAssignment {
    pub viewport_id: String,
    pub series_id: String,
    pub study_id: String,
    pub assigned_at: SystemTime,
}

/// Whether one series may be on screen in several viewports at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesSharing {
    #[default]
    Shared,
    Exclusive,
}

/// Forward (viewport -> assignment) and reverse (series -> viewports) maps.
///
/// `insert` and `remove` are the only mutation paths and always touch both
/// sides, so `viewport ∈ reverse[series] ⇔ forward[viewport].series == series`
/// holds after every call.
#[derive(Debug, Default)]
pub struct AssignmentIndex {
    forward: HashMap<String, ViewportAssignment>,
    reverse: HashMap<String, BTreeSet<String>>,
}

impl AssignmentIndex {
    /// Puts `assignment` in its viewport, returning whatever was there.
    pub fn insert(&mut self, assignment: ViewportAssignment) -> Option<ViewportAssignment> {
        let previous = self.remove(&assignment.viewport_id);
        self.reverse
            .entry(assignment.series_id.clone())
            .or_default()
            .insert(assignment.viewport_id.clone());
        self.forward
            .insert(assignment.viewport_id.clone(), assignment);
        previous
    }

    pub fn remove(&mut self, viewport_id: &str) -> Option<ViewportAssignment> {
        let removed = self.forward.remove(viewport_id)?;
        if let Some(viewports) = self.reverse.get_mut(&removed.series_id) {
            viewports.remove(viewport_id);
            if viewports.is_empty() {
                self.reverse.remove(&removed.series_id);
            }
        }
        Some(removed)
    }

    pub fn get(&self, viewport_id: &str) -> Option<&ViewportAssignment> {
        self.forward.get(viewport_id)
    }

    pub fn viewports_for(&self, series_id: &str) -> impl Iterator<Item = &str> {
        self.reverse
            .get(series_id)
            .into_iter()
            .flat_map(|viewports| viewports.iter().map(String::as_str))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViewportAssignment> {
        self.forward.values()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.forward.iter().all(|(viewport, assignment)| {
            assignment.viewport_id == *viewport
                && self
                    .reverse
                    .get(&assignment.series_id)
                    .is_some_and(|viewports| viewports.contains(viewport))
        });
        let reverse_ok = self.reverse.iter().all(|(series, viewports)| {
            !viewports.is_empty()
                && viewports.iter().all(|viewport| {
                    self.forward
                        .get(viewport)
                        .is_some_and(|assignment| assignment.series_id == *series)
                })
        });
        forward_ok && reverse_ok
    }
}

/// Result of a committed `assign` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentChange {
    pub viewport_id: String,
    pub series_id: String,
    pub study_id: String,
    /// Series that occupied the viewport before, if it was a different one.
    pub previous_series_id: Option<String>,
    /// Other viewports emptied because the series moved under the exclusive
    /// sharing policy.
    pub evicted_viewports: Vec<String>,
}

#[derive(Debug, Default)]
pub struct AssignmentRegistry {
    index: AssignmentIndex,
    sharing: SeriesSharing,
}

impl AssignmentRegistry {
    pub fn new(sharing: SeriesSharing) -> Self {
        Self {
            index: AssignmentIndex::default(),
            sharing,
        }
    }

    pub fn sharing(&self) -> SeriesSharing {
        self.sharing
    }

    pub fn set_sharing(&mut self, sharing: SeriesSharing) {
        self.sharing = sharing;
    }

    /// Shows `series_id` in `viewport_id`.
    ///
    /// Returns `Ok(None)` when the viewport already shows that series.
    pub fn assign(
        &mut self,
        catalog: &StudyCatalog,
        series_id: &str,
        viewport_id: &str,
    ) -> Result<Option<AssignmentChange>, ViewerError> {
        let series = catalog
            .find_series(series_id)
            .ok_or_else(|| ViewerError::UnknownSeries(series_id.to_string()))?;

        if self
            .index
            .get(viewport_id)
            .is_some_and(|current| current.series_id == series_id)
        {
            return Ok(None);
        }

        let evicted_viewports = match self.sharing {
            SeriesSharing::Shared => Vec::new(),
            SeriesSharing::Exclusive => {
                let others = self
                    .index
                    .viewports_for(series_id)
                    .filter(|viewport| *viewport != viewport_id)
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                for viewport in &others {
                    self.index.remove(viewport);
                }
                others
            }
        };

        let previous = self.index.insert(ViewportAssignment {
            viewport_id: viewport_id.to_string(),
            series_id: series.id.clone(),
            study_id: series.study_id.clone(),
            assigned_at: SystemTime::now(),
        });

        Ok(Some(AssignmentChange {
            viewport_id: viewport_id.to_string(),
            series_id: series.id.clone(),
            study_id: series.study_id.clone(),
            previous_series_id: previous.map(|assignment| assignment.series_id),
            evicted_viewports,
        }))
    }

    pub fn clear(&mut self, viewport_id: &str) -> Option<ViewportAssignment> {
        self.index.remove(viewport_id)
    }

    /// Drops every assignment that shows a series of `study_id`.
    pub fn clear_study(&mut self, study_id: &str) -> Vec<ViewportAssignment> {
        let viewports = self
            .index
            .iter()
            .filter(|assignment| assignment.study_id == study_id)
            .map(|assignment| assignment.viewport_id.clone())
            .collect::<Vec<_>>();
        viewports
            .iter()
            .filter_map(|viewport| self.index.remove(viewport))
            .collect()
    }

    /// Drops assignments for viewports not in `viewport_ids`.
    pub fn retain_viewports(&mut self, viewport_ids: &[String]) -> Vec<ViewportAssignment> {
        let stale = self
            .index
            .iter()
            .filter(|assignment| !viewport_ids.contains(&assignment.viewport_id))
            .map(|assignment| assignment.viewport_id.clone())
            .collect::<Vec<_>>();
        stale
            .iter()
            .filter_map(|viewport| self.index.remove(viewport))
            .collect()
    }

    pub fn get_assignment(&self, viewport_id: &str) -> Option<&ViewportAssignment> {
        self.index.get(viewport_id)
    }

    pub fn get_assignments_for_series(&self, series_id: &str) -> Vec<&str> {
        self.index.viewports_for(series_id).collect()
    }

    pub fn assignments(&self) -> impl Iterator<Item = &ViewportAssignment> {
        self.index.iter()
    }

    pub fn index(&self) -> &AssignmentIndex {
        &self.index
    }
}
