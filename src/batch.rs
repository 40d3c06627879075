//! Converting many sessions, one after another.
//!
//! A failing session does not stop the batch. Its request and error chain
//! are written to an `ERROR_*.txt` file next to where its output would
//! have gone.

use log::{error, info};
use std::error::Error;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::container::ContainerWriter;
use crate::session::{convert_session, SessionRequest};
use crate::types::ConversionError;

/// Outcome of a batch run.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Containers written, in request order
    pub converted: Vec<PathBuf>,
    /// Error file written for each failed session
    pub failed: Vec<PathBuf>,
}

/// Reads a YAML list of session requests.
pub fn load_requests<P: AsRef<Path>>(path: P) -> Result<Vec<SessionRequest>, ConversionError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Name of the error file for a failed session.
pub fn error_file_name(request: &SessionRequest) -> String {
    format!(
        "ERROR_sub-{}_ses-{}.txt",
        request.config.subject.subject_id,
        request.config.protocol_type.session_id()
    )
}

/// Converts every request in order.
///
/// Only failures to write an error file are returned as errors.
pub fn convert_batch<W: ContainerWriter + ?Sized>(
    requests: &[SessionRequest],
    writer: &W,
) -> Result<BatchReport, ConversionError> {
    let mut report = BatchReport::default();

    for (index, request) in requests.iter().enumerate() {
        info!(
            "[{}/{}] subject {}",
            index + 1,
            requests.len(),
            request.config.subject.subject_id
        );
        match convert_session(request, writer) {
            Ok(path) => report.converted.push(path),
            Err(err) => {
                error!(
                    "Could not convert subject {}: {}",
                    request.config.subject.subject_id, err
                );
                report.failed.push(write_error_file(request, &err)?);
            }
        }
    }

    info!(
        "Batch finished: {} converted, {} failed",
        report.converted.len(),
        report.failed.len()
    );
    Ok(report)
}

fn write_error_file(request: &SessionRequest, err: &ConversionError) -> Result<PathBuf, ConversionError> {
    std::fs::create_dir_all(&request.output_dir)?;
    let path = request.output_dir.join(error_file_name(request));
    std::fs::write(&path, error_report(request, err)?)?;
    Ok(path)
}

fn error_report(request: &SessionRequest, err: &ConversionError) -> Result<String, ConversionError> {
    let mut report = String::new();
    let _ = writeln!(report, "Request:");
    report.push_str(&serde_yaml::to_string(request)?);
    let _ = writeln!(report, "\nError: {err}");

    let mut source = err.source();
    while let Some(cause) = source {
        let _ = writeln!(report, "Caused by: {cause}");
        source = cause.source();
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Hemisphere, SessionConfig, SubjectInfo};
    use crate::container::JsonContainerWriter;
    use crate::reader::TimeWindow;
    use std::collections::BTreeMap;

    fn request(root: &Path) -> SessionRequest {
        SessionRequest {
            config: SessionConfig {
                protocol_type: "Varying durations".parse().unwrap(),
                recording_type: "SN pan GABA recordings".parse().unwrap(),
                stimulus_location: "STN".parse().unwrap(),
                channel_name_overrides: BTreeMap::new(),
                subject: SubjectInfo {
                    subject_id: "C4550".to_string(),
                    sex: "F".to_string(),
                    hemisphere: Hemisphere::Right,
                    target_area: "SN".to_string(),
                    recording_site: None,
                    folder_id: None,
                    high_rate_rig: false,
                },
            },
            protocol_dir: root.join("missing"),
            metadata_path: root.join("metadata.yaml"),
            extra_metadata_paths: Vec::new(),
            video_dir: None,
            output_dir: root.join("out"),
            stub_test: false,
            window: TimeWindow::full(),
            include_processed: false,
        }
    }

    #[test]
    fn failed_session_leaves_an_error_file() {
        let dir = tempfile::tempdir().unwrap();
        let requests = vec![request(dir.path())];
        let report = convert_batch(&requests, &JsonContainerWriter::default()).unwrap();

        assert!(report.converted.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(
            report.failed[0].file_name().unwrap(),
            "ERROR_sub-C4550_ses-varying_durations.txt"
        );
        let text = std::fs::read_to_string(&report.failed[0]).unwrap();
        assert!(text.contains("subject_id: C4550"));
        assert!(text.contains("Error: expected exactly one match"));
    }

    #[test]
    fn requests_read_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.yaml");
        let yaml = serde_yaml::to_string(&vec![request(dir.path())]).unwrap();
        std::fs::write(&path, yaml).unwrap();

        let requests = load_requests(&path).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].config.subject.subject_id, "C4550");
        assert!(!requests[0].stub_test);
    }
}
