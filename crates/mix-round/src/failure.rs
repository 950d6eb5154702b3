// Round failure records and their on-disk form.
//
// A node that fails a round writes one report to its configured path before
// going to the error state. On restart the node reads the report back and
// keeps it in memory to expose; the file itself is cleared.

use std::fs;
use std::path::Path;

use chrono::Utc;

use mix_types::{NodeId, PhaseType, RoundErrorReport, RoundId};

use crate::error::{Result, RoundError};

/// A round that could not complete on this node.
#[derive(Debug)]
pub struct RoundFailure {
    pub round_id: RoundId,
    pub phase: Option<PhaseType>,
    pub error: RoundError,
}

impl RoundFailure {
    pub fn new(round_id: RoundId, phase: Option<PhaseType>, error: RoundError) -> Self {
        Self {
            round_id,
            phase,
            error,
        }
    }

    pub fn report(&self, node_id: &NodeId) -> RoundErrorReport {
        RoundErrorReport {
            round_id: self.round_id,
            node_id: node_id.clone(),
            phase: self.phase,
            error: self.error.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

pub fn persist_report(path: &Path, report: &RoundErrorReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| RoundError::Serialization(e.to_string()))?;
    fs::write(path, json)?;
    Ok(())
}

/// `None` when no report was left behind.
pub fn read_report(path: &Path) -> Result<Option<RoundErrorReport>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    let report =
        serde_json::from_str(&data).map_err(|e| RoundError::Serialization(e.to_string()))?;
    Ok(Some(report))
}

pub fn clear_report(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_read_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors").join("round-error.json");
        assert!(read_report(&path).unwrap().is_none());

        let failure = RoundFailure::new(
            9,
            Some(PhaseType::RealPermute),
            RoundError::Transmission("peer gone".into()),
        );
        let report = failure.report(&NodeId::from("n1"));
        persist_report(&path, &report).unwrap();

        let back = read_report(&path).unwrap().unwrap();
        assert_eq!(back, report);
        assert!(back.error.contains("peer gone"));

        clear_report(&path).unwrap();
        assert!(read_report(&path).unwrap().is_none());
        clear_report(&path).unwrap();
    }

    #[test]
    fn corrupt_report_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round-error.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(read_report(&path), Err(RoundError::Serialization(_))));
    }
}
