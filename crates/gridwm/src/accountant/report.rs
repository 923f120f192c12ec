use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::accountant::AccountingResult;
use crate::common::Map;
use crate::JobId;

/// Parsed framework job report, keyed by job id. The wire format is owned by
/// the report collaborator; the core only consumes this structured view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkJobReport {
    pub job: JobId,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
}

/// Descriptor of one output file produced by a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFile {
    pub lfn: String,
    pub dataset: String,
    pub size_bytes: u64,
    pub checksum: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub runs: Vec<RunLumi>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLumi {
    pub run: u32,
    pub lumis: Vec<u32>,
}

/// Supplies the parsed report for a completed job. Injected capability; the
/// core never touches report files itself.
pub trait ReportSource: Send + Sync {
    fn report_for(&self, job: JobId) -> AccountingResult<FrameworkJobReport>;
}

/// Report source backed by raw JSON documents held in memory. Used in tests
/// and small deployments where reports are pushed into the agent directly.
pub struct InMemoryReports {
    reports: Map<JobId, String>,
}

impl InMemoryReports {
    pub fn new(reports: Map<JobId, String>) -> Self {
        Self { reports }
    }
}

impl ReportSource for InMemoryReports {
    fn report_for(&self, job: JobId) -> AccountingResult<FrameworkJobReport> {
        let raw = self
            .reports
            .get(&job)
            .ok_or_else(|| anyhow::anyhow!("No report stored for job {job}"))?;
        let report: FrameworkJobReport = serde_json::from_str(raw)
            .map_err(|error| anyhow::anyhow!("Malformed report for job {job}: {error}"))?;
        if report.job != job {
            return Err(anyhow::anyhow!(
                "Report job id mismatch: expected {job}, report says {}",
                report.job
            ));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameworkJobReport, InMemoryReports, ReportSource};
    use crate::common::Map;
    use crate::JobId;

    #[test]
    fn test_report_roundtrip_through_json() {
        let raw = r#"{
            "job": 7,
            "success": true,
            "timestamp": "2024-03-01T12:00:00Z",
            "output_files": [{
                "lfn": "/store/output/merged.root",
                "dataset": "/PrimaryDS/Era-v1/AOD",
                "size_bytes": 4096,
                "checksum": "adler32:deadbeef",
                "locations": ["siteA"],
                "runs": [{"run": 1, "lumis": [1, 2, 3]}]
            }]
        }"#;
        let report: FrameworkJobReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.job, JobId::new(7));
        assert!(report.success);
        assert_eq!(report.output_files.len(), 1);
        assert_eq!(report.output_files[0].runs[0].lumis, [1, 2, 3]);
    }

    #[test]
    fn test_in_memory_source_rejects_mismatched_id() {
        let mut reports = Map::default();
        reports.insert(
            JobId::new(1),
            r#"{"job": 2, "success": true, "timestamp": "2024-03-01T12:00:00Z"}"#.to_string(),
        );
        let source = InMemoryReports::new(reports);
        assert!(source.report_for(JobId::new(1)).is_err());
        assert!(source.report_for(JobId::new(5)).is_err());
    }
}
