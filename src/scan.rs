use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::{DirEntry, WalkDir};

use crate::dicom::{open_header_only, read_int_first, read_string};
use crate::model::{LoadingState, Series, Study};

/// Identifying attributes of one DICOM instance on disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceRecord {
    pub path: PathBuf,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: Option<String>,
    pub instance_number: Option<i32>,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub study_date: Option<String>,
    pub accession_number: Option<String>,
    pub study_description: Option<String>,
    pub modality: Option<String>,
    pub series_description: Option<String>,
    pub series_number: Option<i32>,
    pub series_date: Option<String>,
    pub body_part: Option<String>,
    pub protocol_name: Option<String>,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub studies: Vec<Study>,
    pub failures: Vec<(PathBuf, String)>,
}

pub fn read_instance(path: &Path) -> Result<InstanceRecord> {
    let obj = open_header_only(path)?;
    let study_uid = read_string(&obj, "StudyInstanceUID").context("Missing StudyInstanceUID")?;
    let series_uid =
        read_string(&obj, "SeriesInstanceUID").context("Missing SeriesInstanceUID")?;

    Ok(InstanceRecord {
        path: path.to_path_buf(),
        study_uid,
        series_uid,
        sop_uid: read_string(&obj, "SOPInstanceUID"),
        instance_number: read_int_first(&obj, "InstanceNumber"),
        patient_name: read_string(&obj, "PatientName"),
        patient_id: read_string(&obj, "PatientID"),
        study_date: read_string(&obj, "StudyDate"),
        accession_number: read_string(&obj, "AccessionNumber"),
        study_description: read_string(&obj, "StudyDescription"),
        modality: read_string(&obj, "Modality").map(|m| m.to_ascii_uppercase()),
        series_description: read_string(&obj, "SeriesDescription"),
        series_number: read_int_first(&obj, "SeriesNumber"),
        series_date: read_string(&obj, "SeriesDate"),
        body_part: read_string(&obj, "BodyPartExamined"),
        protocol_name: read_string(&obj, "ProtocolName"),
    })
}

/// Expands directories recursively in file-name order. Hidden entries are
/// skipped and directory symlinks below a root are not followed.
pub fn collect_dicom_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in paths {
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Could not list {}: {err}", root.display());
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_file() || (file_type.is_symlink() && entry.path().is_file()) {
                files.push(entry.into_path());
            }
        }
    }
    files
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

pub fn scan_paths(paths: &[PathBuf]) -> ScanReport {
    let files = collect_dicom_files(paths);
    log::info!("Scanning {} file(s)", files.len());

    let mut records = Vec::with_capacity(files.len());
    let mut failures = Vec::new();
    for file in files {
        match read_instance(&file) {
            Ok(record) => records.push(record),
            Err(err) => {
                log::warn!("Skipping {}: {err:#}", file.display());
                failures.push((file, format!("{err:#}")));
            }
        }
    }

    ScanReport {
        studies: group_instances(records),
        failures,
    }
}

/// Builds studies from loose instances. Studies and series keep the order in
/// which they were first seen; images are ordered by instance number, then
/// path.
pub fn group_instances(records: Vec<InstanceRecord>) -> Vec<Study> {
    let mut studies: Vec<Study> = Vec::new();
    let mut study_index: HashMap<String, usize> = HashMap::new();
    let mut series_images: HashMap<(usize, usize), Vec<(Option<i32>, PathBuf)>> = HashMap::new();

    for record in records {
        let si = *study_index
            .entry(record.study_uid.clone())
            .or_insert_with(|| {
                studies.push(Study {
                    id: record.study_uid.clone(),
                    patient_name: record.patient_name.clone(),
                    patient_id: record.patient_id.clone(),
                    study_date: record.study_date.clone(),
                    accession_number: record.accession_number.clone(),
                    description: record.study_description.clone(),
                    loading_state: LoadingState::Loaded,
                    ..Default::default()
                });
                studies.len() - 1
            });

        let study = &mut studies[si];
        let series_pos = match study.series.iter().position(|s| s.id == record.series_uid) {
            Some(pos) => pos,
            None => {
                study.series.push(Series {
                    id: record.series_uid.clone(),
                    study_id: record.study_uid.clone(),
                    modality: record.modality.clone(),
                    description: record.series_description.clone(),
                    series_number: record.series_number,
                    series_date: record.series_date.clone(),
                    body_part: record.body_part.clone(),
                    protocol_name: record.protocol_name.clone(),
                    ..Default::default()
                });
                study.series.len() - 1
            }
        };
        series_images
            .entry((si, series_pos))
            .or_default()
            .push((record.instance_number, record.path));
    }

    for ((si, series_pos), mut images) in series_images {
        images.sort_by(|(a_num, a_path), (b_num, b_path)| {
            a_num
                .unwrap_or(i32::MAX)
                .cmp(&b_num.unwrap_or(i32::MAX))
                .then_with(|| a_path.cmp(b_path))
        });
        let series = &mut studies[si].series[series_pos];
        series.number_of_instances = images.len();
        series.image_ids = images
            .into_iter()
            .map(|(_, path)| path.to_string_lossy().into_owned())
            .collect();
    }
    studies
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn record(study: &str, series: &str, number: Option<i32>, path: &str) -> InstanceRecord {
        InstanceRecord {
            path: PathBuf::from(path),
            study_uid: study.to_string(),
            series_uid: series.to_string(),
            instance_number: number,
            modality: Some("CT".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn instances_group_into_studies_and_series() {
        let studies = group_instances(vec![
            record("st2", "se2", Some(2), "b/2.dcm"),
            record("st1", "se1", Some(1), "a/1.dcm"),
            record("st2", "se2", Some(1), "b/1.dcm"),
            record("st2", "se3", None, "b/x.dcm"),
        ]);

        let ids = studies.iter().map(|s| s.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["st2", "st1"]);
        assert_eq!(studies[0].series.len(), 2);
        assert_eq!(studies[0].series[0].image_ids, vec!["b/1.dcm", "b/2.dcm"]);
        assert_eq!(studies[0].series[0].number_of_instances, 2);
        assert_eq!(studies[0].series[0].study_id, "st2");
        assert_eq!(studies[1].series[0].number_of_instances, 1);
    }

    #[test]
    fn missing_instance_numbers_sort_last_by_path() {
        let studies = group_instances(vec![
            record("st", "se", None, "z.dcm"),
            record("st", "se", None, "m.dcm"),
            record("st", "se", Some(5), "q.dcm"),
        ]);
        assert_eq!(
            studies[0].series[0].image_ids,
            vec!["q.dcm", "m.dcm", "z.dcm"]
        );
    }

    fn temp_scan_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "perspecta-compare-scan-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ))
    }

    #[test]
    fn unreadable_files_are_reported_not_fatal() {
        let dir = temp_scan_dir("junk");
        fs::create_dir_all(dir.join("nested")).expect("should create temp dir");
        fs::write(dir.join("nested").join("junk.dcm"), b"not dicom").expect("should write");
        fs::write(dir.join(".hidden"), b"ignored").expect("should write");

        let report = scan_paths(&[dir.clone()]);
        assert!(report.studies.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].0.ends_with("nested/junk.dcm"));

        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loops_are_walked_once() {
        let dir = temp_scan_dir("loop");
        let sub = dir.join("sub");
        fs::create_dir_all(&sub).expect("should create temp dir");
        fs::write(sub.join("a.dcm"), b"not dicom").expect("should write");
        std::os::unix::fs::symlink("..", sub.join("loop")).expect("should link");
        std::os::unix::fs::symlink(".", sub.join("self")).expect("should link");

        let files = collect_dicom_files(&[dir.clone()]);
        assert_eq!(files, vec![sub.join("a.dcm")]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn files_come_out_in_name_order() {
        let dir = temp_scan_dir("order");
        fs::create_dir_all(dir.join("b")).expect("should create temp dir");
        fs::write(dir.join("b").join("2.dcm"), b"x").expect("should write");
        fs::write(dir.join("b").join("1.dcm"), b"x").expect("should write");
        fs::write(dir.join("a.dcm"), b"x").expect("should write");
        fs::write(dir.join(".skip.dcm"), b"x").expect("should write");

        let files = collect_dicom_files(&[dir.clone()]);
        assert_eq!(
            files,
            vec![
                dir.join("a.dcm"),
                dir.join("b").join("1.dcm"),
                dir.join("b").join("2.dcm"),
            ]
        );

        let _ = fs::remove_dir_all(dir);
    }
}
