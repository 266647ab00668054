//! On-disk session record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Contents of `session-<pid>.json`. Unknown keys fail to parse, which
/// gets the file quarantined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionRecord {
    pub client_pid: u32,
    pub reference_count: u32,
    pub signals: BTreeSet<String>,
    pub controls: BTreeSet<String>,
    pub watch_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_server: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
}

impl SessionRecord {
    pub fn new(client_pid: u32, signals: &[String], controls: &[String], watch_id: u64) -> Self {
        Self {
            client_pid,
            reference_count: 1,
            signals: signals.iter().cloned().collect(),
            controls: controls.iter().cloned().collect(),
            watch_id,
            batch_server: None,
            profile_name: None,
        }
    }

    /// Structural checks beyond the schema: returns the failures.
    pub fn problems(&self, file_pid: u32) -> Vec<String> {
        let mut problems = Vec::new();
        if self.reference_count == 0 {
            problems.push("has a reference_count of zero".to_string());
        }
        if self.client_pid != file_pid {
            problems.push(format!(
                "names client_pid {} but its file name names {}",
                self.client_pid, file_pid
            ));
        }
        problems
    }
}

/// Inode change time of a file with nanosecond resolution.
pub fn file_ctime(meta: &Metadata) -> SystemTime {
    let secs = Duration::from_secs(meta.ctime().max(0) as u64);
    let nanos = Duration::from_nanos(meta.ctime_nsec().max(0) as u64);
    UNIX_EPOCH + secs + nanos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields_omitted_when_unset() {
        let record = SessionRecord::new(1000, &["TIME".to_string()], &[], 7);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"client_pid":1000,"reference_count":1,"signals":["TIME"],"#,
                r#""controls":[],"watch_id":7}"#
            )
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let json = concat!(
            r#"{"client_pid":1,"reference_count":1,"signals":[],"controls":[],"#,
            r#""watch_id":0,"mode":"rw"}"#
        );
        assert!(serde_json::from_str::<SessionRecord>(json).is_err());
    }

    #[test]
    fn test_missing_key_rejected() {
        let json = r#"{"client_pid":1,"reference_count":1,"signals":[],"watch_id":0}"#;
        assert!(serde_json::from_str::<SessionRecord>(json).is_err());
    }

    #[test]
    fn test_problems() {
        let mut record = SessionRecord::new(5000, &[], &[], 0);
        assert!(record.problems(5000).is_empty());
        record.reference_count = 0;
        assert_eq!(record.problems(5001).len(), 2);
    }
}
