use crate::color::{ColorAssigner, StudyColorScheme};
use crate::error::ViewerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadingState {
    #[default]
    Idle,
    Loading,
    Loaded,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub id: String,
    /// Owning study. Filled in by the catalog on load.
    pub study_id: String,
    pub modality: Option<String>,
    pub description: Option<String>,
    pub series_number: Option<i32>,
    pub series_date: Option<String>,
    pub body_part: Option<String>,
    pub protocol_name: Option<String>,
    pub number_of_instances: usize,
    /// Opaque image references in display order.
    pub image_ids: Vec<String>,
    pub is_loaded: bool,
    pub loading_progress: f32,
}

impl Series {
    /// `(image_ids, declared)` when a fully loaded series disagrees with its
    /// declared instance count.
    pub fn instance_count_mismatch(&self) -> Option<(usize, usize)> {
        if self.is_loaded && self.image_ids.len() != self.number_of_instances {
            Some((self.image_ids.len(), self.number_of_instances))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Study {
    pub id: String,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub study_date: Option<String>,
    pub accession_number: Option<String>,
    pub description: Option<String>,
    pub series: Vec<Series>,
    pub color: Option<StudyColorScheme>,
    pub loading_state: LoadingState,
    pub series_count: usize,
    pub image_count: usize,
}

impl Study {
    fn recompute_counts(&mut self) {
        self.series_count = self.series.len();
        self.image_count = self
            .series
            .iter()
            .map(|series| series.number_of_instances)
            .sum();
    }
}

/// One row of the flattened series list.
#[derive(Debug, Clone, Copy)]
pub struct SeriesListing<'a> {
    pub series: &'a Series,
    pub study: &'a Study,
    pub color: StudyColorScheme,
}

impl<'a> SeriesListing<'a> {
    pub fn study_id(&self) -> &'a str {
        &self.study.id
    }
}

/// All studies loaded into one viewer session, in load order.
#[derive(Debug, Default)]
pub struct StudyCatalog {
    studies: Vec<Study>,
    colors: ColorAssigner,
}

impl StudyCatalog {
    /// Inserts or replaces a study keyed by its id. A replaced study keeps its
    /// position in the list and its color.
    pub fn load_study(&mut self, mut study: Study) -> Result<&Study, ViewerError> {
        study.id = study.id.trim().to_string();
        if study.id.is_empty() {
            return Err(ViewerError::MissingStudyId);
        }
        if study.series.iter().any(|series| series.id.trim().is_empty()) {
            return Err(ViewerError::MissingSeriesId { study_id: study.id });
        }
        if let Some(err) = self.duplicate_series(&study) {
            return Err(err);
        }

        study.color = Some(self.colors.color_for(&study.id));
        for series in &mut study.series {
            series.study_id = study.id.clone();
            if let Some((actual, declared)) = series.instance_count_mismatch() {
                log::warn!(
                    "Series {} declares {declared} instances but has {actual} image references",
                    series.id
                );
            }
        }
        study.recompute_counts();
        if study.loading_state == LoadingState::Idle {
            study.loading_state = LoadingState::Loaded;
        }

        let index = match self.studies.iter().position(|s| s.id == study.id) {
            Some(index) => {
                self.studies[index] = study;
                index
            }
            None => {
                self.studies.push(study);
                self.studies.len() - 1
            }
        };
        Ok(&self.studies[index])
    }

    /// Series ids resolve across every loaded study, so one id may not appear
    /// twice, within `study` or in another study. A reload of the same study
    /// may keep its own ids.
    fn duplicate_series(&self, study: &Study) -> Option<ViewerError> {
        for (index, series) in study.series.iter().enumerate() {
            if study.series[..index].iter().any(|other| other.id == series.id) {
                return Some(ViewerError::DuplicateSeries {
                    series_id: series.id.clone(),
                    owner_study_id: study.id.clone(),
                });
            }
            let owner = self
                .studies
                .iter()
                .filter(|loaded| loaded.id != study.id)
                .find(|loaded| loaded.series.iter().any(|other| other.id == series.id));
            if let Some(owner) = owner {
                return Some(ViewerError::DuplicateSeries {
                    series_id: series.id.clone(),
                    owner_study_id: owner.id.clone(),
                });
            }
        }
        None
    }

    pub fn unload_study(&mut self, study_id: &str) -> Option<Study> {
        let index = self.studies.iter().position(|s| s.id == study_id)?;
        Some(self.studies.remove(index))
    }

    pub fn clear(&mut self) -> Vec<Study> {
        std::mem::take(&mut self.studies)
    }

    pub fn get_study(&self, study_id: &str) -> Option<&Study> {
        self.studies.iter().find(|s| s.id == study_id)
    }

    pub fn get_series_by_study(&self, study_id: &str) -> &[Series] {
        self.get_study(study_id)
            .map(|study| study.series.as_slice())
            .unwrap_or_default()
    }

    pub fn find_series(&self, series_id: &str) -> Option<&Series> {
        self.studies
            .iter()
            .flat_map(|study| study.series.iter())
            .find(|series| series.id == series_id)
    }

    pub fn studies(&self) -> &[Study] {
        &self.studies
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    /// Every series of every study, study load order first and then series
    /// order within the study.
    pub fn get_all_series(&self) -> Vec<SeriesListing<'_>> {
        self.studies
            .iter()
            .flat_map(|study| {
                let color = study
                    .color
                    .or_else(|| self.colors.get(&study.id))
                    .unwrap_or(crate::color::STUDY_PALETTE[0]);
                study.series.iter().map(move |series| SeriesListing {
                    series,
                    study,
                    color,
                })
            })
            .collect()
    }

    pub fn set_study_state(&mut self, study_id: &str, state: LoadingState) -> bool {
        match self.studies.iter_mut().find(|s| s.id == study_id) {
            Some(study) => {
                study.loading_state = state;
                true
            }
            None => false,
        }
    }

    /// Records image retrieval progress for a series. Returns the new progress
    /// fraction, or `None` if the series is unknown.
    pub fn update_series_progress(
        &mut self,
        series_id: &str,
        loaded: usize,
        total: usize,
    ) -> Option<f32> {
        let series = self
            .studies
            .iter_mut()
            .flat_map(|study| study.series.iter_mut())
            .find(|series| series.id == series_id)?;

        let progress = if total == 0 {
            1.0
        } else {
            (loaded.min(total) as f32 / total as f32).clamp(0.0, 1.0)
        };
        series.loading_progress = progress;
        series.is_loaded = loaded >= total;
        if let Some((actual, declared)) = series.instance_count_mismatch() {
            log::warn!(
                "Series {series_id} finished loading with {actual} images, expected {declared}"
            );
        }
        Some(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::STUDY_PALETTE;

    fn series(id: &str, modality: &str, instances: usize) -> Series {
        Series {
            id: id.to_string(),
            modality: Some(modality.to_string()),
            number_of_instances: instances,
            image_ids: (0..instances).map(|i| format!("{id}/{i}")).collect(),
            is_loaded: true,
            loading_progress: 1.0,
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

    #[test]
    fn load_computes_aggregate_counts() {
        let mut catalog = StudyCatalog::default();
        catalog
            .load_study(study(
                "1.2.3",
                vec![series("s1", "CT", 120), series("s2", "CT", 30)],
            ))
            .expect("study should load");

        let loaded = catalog.get_study("1.2.3").expect("study should exist");
        assert_eq!(loaded.series_count, 2);
        assert_eq!(loaded.image_count, 150);
        assert_eq!(loaded.loading_state, LoadingState::Loaded);
        assert!(loaded.series.iter().all(|s| s.study_id == "1.2.3"));
    }

    #[test]
    fn load_without_id_is_rejected() {
        let mut catalog = StudyCatalog::default();
        let err = catalog
            .load_study(study("  ", vec![series("s1", "CT", 1)]))
            .expect_err("blank id should fail");
        assert_eq!(err, ViewerError::MissingStudyId);
        assert!(catalog.is_empty());
    }

    #[test]
    fn load_with_blank_series_id_is_rejected() {
        let mut catalog = StudyCatalog::default();
        let err = catalog
            .load_study(study("a", vec![series("", "CT", 1)]))
            .expect_err("blank series id should fail");
        assert!(matches!(err, ViewerError::MissingSeriesId { .. }));
    }

    #[test]
    fn series_id_owned_by_another_study_is_rejected() {
        let mut catalog = StudyCatalog::default();
        catalog
            .load_study(study("a", vec![series("s1", "CT", 10)]))
            .expect("a loads");

        let err = catalog
            .load_study(study("b", vec![series("s1", "MR", 3)]))
            .expect_err("shared series id should fail");
        assert_eq!(
            err,
            ViewerError::DuplicateSeries {
                series_id: "s1".to_string(),
                owner_study_id: "a".to_string(),
            }
        );
        assert!(catalog.get_study("b").is_none());
        assert_eq!(catalog.find_series("s1").map(|s| s.study_id.as_str()), Some("a"));

        let err = catalog
            .load_study(study("c", vec![series("x", "CT", 1), series("x", "CT", 1)]))
            .expect_err("repeated series id should fail");
        assert!(matches!(err, ViewerError::DuplicateSeries { .. }));

        catalog
            .load_study(study("a", vec![series("s1", "CT", 12)]))
            .expect("reload keeps its own ids");
        assert_eq!(catalog.get_study("a").map(|s| s.image_count), Some(12));
    }

    #[test]
    fn reload_replaces_in_place_and_keeps_color() {
        let mut catalog = StudyCatalog::default();
        catalog.load_study(study("a", vec![])).expect("a loads");
        catalog.load_study(study("b", vec![])).expect("b loads");
        let color_a = catalog.get_study("a").and_then(|s| s.color);

        catalog
            .load_study(study("a", vec![series("s1", "MR", 4)]))
            .expect("a reloads");

        let ids = catalog
            .studies()
            .iter()
            .map(|s| s.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(catalog.get_study("a").and_then(|s| s.color), color_a);
        assert_eq!(catalog.get_study("a").map(|s| s.image_count), Some(4));
    }

    #[test]
    fn unload_missing_study_is_noop() {
        let mut catalog = StudyCatalog::default();
        assert!(catalog.unload_study("nope").is_none());
        assert!(catalog.get_series_by_study("nope").is_empty());
    }

    #[test]
    fn colors_survive_unload_of_other_studies() {
        let mut catalog = StudyCatalog::default();
        for id in ["a", "b", "c"] {
            catalog.load_study(study(id, vec![])).expect("study loads");
        }
        catalog.unload_study("b");
        catalog.load_study(study("d", vec![])).expect("d loads");

        assert_eq!(catalog.get_study("a").and_then(|s| s.color), Some(STUDY_PALETTE[0]));
        assert_eq!(catalog.get_study("c").and_then(|s| s.color), Some(STUDY_PALETTE[2]));
        assert_eq!(catalog.get_study("d").and_then(|s| s.color), Some(STUDY_PALETTE[3]));
    }

    #[test]
    fn all_series_are_flattened_in_load_order() {
        let mut catalog = StudyCatalog::default();
        catalog
            .load_study(study("a", vec![series("a1", "CT", 1), series("a2", "CT", 1)]))
            .expect("a loads");
        catalog
            .load_study(study("b", vec![series("b1", "MR", 1)]))
            .expect("b loads");

        let listing = catalog.get_all_series();
        let ids = listing
            .iter()
            .map(|row| (row.study_id(), row.series.id.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![("a", "a1"), ("a", "a2"), ("b", "b1")]);
        assert_eq!(listing[2].color, STUDY_PALETTE[1]);
    }

    #[test]
    fn progress_marks_series_loaded_when_complete() {
        let mut catalog = StudyCatalog::default();
        let mut pending = series("s1", "CT", 4);
        pending.is_loaded = false;
        pending.loading_progress = 0.0;
        catalog.load_study(study("a", vec![pending])).expect("a loads");

        assert_eq!(catalog.update_series_progress("s1", 2, 4), Some(0.5));
        assert_eq!(catalog.find_series("s1").map(|s| s.is_loaded), Some(false));
        assert_eq!(catalog.update_series_progress("s1", 4, 4), Some(1.0));
        assert_eq!(catalog.find_series("s1").map(|s| s.is_loaded), Some(true));
        assert_eq!(catalog.update_series_progress("missing", 1, 1), None);
    }
}
