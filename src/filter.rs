use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::SeriesListing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    SeriesNumber,
    Description,
    Modality,
    Date,
    InstanceCount,
}

impl SortKey {
    pub const ALL: [SortKey; 5] = [
        SortKey::SeriesNumber,
        SortKey::Description,
        SortKey::Modality,
        SortKey::Date,
        SortKey::InstanceCount,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SortKey::SeriesNumber => "Series #",
            SortKey::Description => "Description",
            SortKey::Modality => "Modality",
            SortKey::Date => "Date",
            SortKey::InstanceCount => "Images",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// List preferences for the series browser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesQuery {
    pub modality: Option<String>,
    pub study_id: Option<String>,
    pub search: String,
    pub sort_key: SortKey,
    pub sort_order: SortOrder,
    pub group_by_study: bool,
}

fn compare(key: SortKey, a: &SeriesListing<'_>, b: &SeriesListing<'_>) -> Ordering {
    let (a, b) = (a.series, b.series);
    match key {
        SortKey::SeriesNumber => a
            .series_number
            .unwrap_or(0)
            .cmp(&b.series_number.unwrap_or(0)),
        SortKey::Description => text(&a.description).cmp(text(&b.description)),
        SortKey::Modality => text(&a.modality).cmp(text(&b.modality)),
        SortKey::Date => text(&a.series_date).cmp(text(&b.series_date)),
        SortKey::InstanceCount => a.number_of_instances.cmp(&b.number_of_instances),
    }
}

fn text(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

fn matches_search(listing: &SeriesListing<'_>, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    let series = listing.series;
    let number = series.series_number.map(|n| n.to_string());
    let found = [
        series.description.as_deref(),
        series.modality.as_deref(),
        series.body_part.as_deref(),
        series.protocol_name.as_deref(),
        number.as_deref(),
        listing.study.patient_name.as_deref(),
        listing.study.description.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|field| field.to_lowercase().contains(needle));
    found
}

/// Filters and orders `all` for display. Ties keep their input order.
pub fn filter_and_sort<'a>(
    all: Vec<SeriesListing<'a>>,
    query: &SeriesQuery,
) -> Vec<SeriesListing<'a>> {
    let needle = query.search.trim().to_lowercase();
    let modality = query
        .modality
        .as_deref()
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty());

    let mut rows = all
        .into_iter()
        .filter(|row| {
            modality.as_deref().map_or(true, |wanted| {
                row.series
                    .modality
                    .as_deref()
                    .is_some_and(|m| m.trim().eq_ignore_ascii_case(wanted))
            })
        })
        .filter(|row| {
            query
                .study_id
                .as_deref()
                .map_or(true, |study| row.study_id() == study)
        })
        .filter(|row| matches_search(row, &needle))
        .collect::<Vec<_>>();

    // slice::sort_by is stable, which both passes rely on
    rows.sort_by(|a, b| {
        let ordering = compare(query.sort_key, a, b);
        match query.sort_order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    });
    if query.group_by_study {
        rows.sort_by(|a, b| a.study_id().cmp(b.study_id()));
    }
    rows
}

/// Distinct modalities in `all`, sorted, for the filter dropdown.
pub fn available_modalities(all: &[SeriesListing<'_>]) -> Vec<String> {
    let mut modalities = all
        .iter()
        .filter_map(|row| row.series.modality.as_deref())
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>();
    modalities.sort();
    modalities.dedup();
    modalities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Series, Study, StudyCatalog};

    fn series(id: &str, modality: &str, number: Option<i32>, instances: usize) -> Series {
        Series {
            id: id.to_string(),
            modality: Some(modality.to_string()),
            description: Some(format!("{modality} {id}")),
            series_number: number,
            number_of_instances: instances,
            ..Default::default()
        }
    }

    fn catalog() -> StudyCatalog {
        let mut catalog = StudyCatalog::default();
        catalog
            .load_study(Study {
                id: "study-b".to_string(),
                patient_name: Some("Doe^Jane".to_string()),
                series: vec![
                    series("b1", "CT", Some(3), 100),
                    series("b2", "MR", Some(1), 20),
                    series("b3", "CT", Some(1), 50),
                ],
                ..Default::default()
            })
            .expect("b loads");
        catalog
            .load_study(Study {
                id: "study-a".to_string(),
                series: vec![series("a1", "CT", None, 10), series("a2", "US", Some(1), 5)],
                ..Default::default()
            })
            .expect("a loads");
        catalog
    }

    fn ids(rows: &[SeriesListing<'_>]) -> Vec<String> {
        rows.iter().map(|row| row.series.id.clone()).collect()
    }

    #[test]
    fn series_number_sort_is_stable_for_ties() {
        let catalog = catalog();
        let rows = filter_and_sort(catalog.get_all_series(), &SeriesQuery::default());
        // missing series number sorts as 0; b2, b3 and a2 tie at 1
        assert_eq!(ids(&rows), vec!["a1", "b2", "b3", "a2", "b1"]);
    }

    #[test]
    fn descending_keeps_tie_order() {
        let catalog = catalog();
        let query = SeriesQuery {
            sort_order: SortOrder::Descending,
            ..Default::default()
        };
        let rows = filter_and_sort(catalog.get_all_series(), &query);
        assert_eq!(ids(&rows), vec!["b1", "b2", "b3", "a2", "a1"]);
    }

    #[test]
    fn group_by_study_preserves_order_within_study() {
        let catalog = catalog();
        let query = SeriesQuery {
            sort_key: SortKey::InstanceCount,
            group_by_study: true,
            ..Default::default()
        };
        let rows = filter_and_sort(catalog.get_all_series(), &query);
        assert_eq!(ids(&rows), vec!["a2", "a1", "b2", "b3", "b1"]);
    }

    #[test]
    fn modality_filter_is_case_insensitive() {
        let catalog = catalog();
        let query = SeriesQuery {
            modality: Some("ct".to_string()),
            ..Default::default()
        };
        let rows = filter_and_sort(catalog.get_all_series(), &query);
        assert_eq!(ids(&rows), vec!["a1", "b3", "b1"]);
    }

    #[test]
    fn study_and_search_filters_combine() {
        let catalog = catalog();
        let query = SeriesQuery {
            study_id: Some("study-b".to_string()),
            search: "jane".to_string(),
            sort_key: SortKey::Modality,
            ..Default::default()
        };
        let rows = filter_and_sort(catalog.get_all_series(), &query);
        assert_eq!(ids(&rows), vec!["b1", "b3", "b2"]);

        let query = SeriesQuery {
            search: " MR b2 ".to_string(),
            ..Default::default()
        };
        let rows = filter_and_sort(catalog.get_all_series(), &query);
        assert_eq!(ids(&rows), vec!["b2"]);
    }

    #[test]
    fn search_matches_series_number() {
        let catalog = catalog();
        let query = SeriesQuery {
            search: "3".to_string(),
            ..Default::default()
        };
        let rows = filter_and_sort(catalog.get_all_series(), &query);
        // b1 by its number, b3 by its description
        assert_eq!(ids(&rows), vec!["b3", "b1"]);
    }

    #[test]
    fn missing_text_sorts_first() {
        let mut catalog = StudyCatalog::default();
        let mut undescribed = series("x1", "CT", None, 1);
        undescribed.description = None;
        catalog
            .load_study(Study {
                id: "s".to_string(),
                series: vec![series("x0", "CT", None, 1), undescribed],
                ..Default::default()
            })
            .expect("loads");
        let query = SeriesQuery {
            sort_key: SortKey::Description,
            ..Default::default()
        };
        let rows = filter_and_sort(catalog.get_all_series(), &query);
        assert_eq!(ids(&rows), vec!["x1", "x0"]);
    }

    #[test]
    fn modalities_are_distinct_and_sorted() {
        let catalog = catalog();
        assert_eq!(
            available_modalities(&catalog.get_all_series()),
            vec!["CT", "MR", "US"]
        );
    }
}
