/// Validation failures surfaced by the session core.
///
/// Lookups never produce these; absence is reported as `None` or an empty
/// slice instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewerError {
    #[error("study is missing a Study Instance UID")]
    MissingStudyId,
    #[error("series in study {study_id} is missing a Series Instance UID")]
    MissingSeriesId { study_id: String },
    #[error("series {series_id} is already loaded as part of study {owner_study_id}")]
    DuplicateSeries {
        series_id: String,
        owner_study_id: String,
    },
    #[error("series {0} is not loaded")]
    UnknownSeries(String),
    #[error("viewport {0} is not part of the active layout")]
    UnknownViewport(String),
    #[error("drag payload could not be decoded: {0}")]
    InvalidDragPayload(String),
}

impl ViewerError {
    /// Whether this failure should reach the user-facing error state.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::InvalidDragPayload(_))
    }
}
