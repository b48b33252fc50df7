use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Append-only writer for daily JSONL files (`{prefix}{YYYYMMDD}.jsonl`).
///
/// Backs the overflow, gap, and scalp ledgers. One serialized record per
/// line; the file rolls over on the UTC calendar day of the record stamp.
#[derive(Debug, Clone)]
pub struct DailyLedger {
    dir: PathBuf,
    prefix: String,
}

impl DailyLedger {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating ledger dir {}", dir.display()))?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
        })
    }

    /// Path of the file covering `stamp`'s UTC day.
    pub fn path_for(&self, stamp: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}{}.jsonl", self.prefix, stamp.format("%Y%m%d")))
    }

    /// Serialize `record` and append it as one line to the day file.
    pub fn append<T: Serialize>(&self, record: &T, stamp: DateTime<Utc>) -> Result<()> {
        let path = self.path_for(stamp);
        let line = serde_json::to_string(record).context("serializing ledger record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening ledger file {}", path.display()))?;
        writeln!(file, "{}", line).with_context(|| format!("appending to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Row {
        symbol: String,
        value: i64,
    }

    #[test]
    fn test_append_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DailyLedger::new(dir.path(), "overflow_").unwrap();
        let stamp = Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap();

        for i in 0..3 {
            let row = Row {
                symbol: format!("00593{}", i),
                value: i,
            };
            ledger.append(&row, stamp).unwrap();
        }

        let path = ledger.path_for(stamp);
        assert!(path.ends_with("overflow_20240315.jsonl"));
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: Row = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.symbol, "005932");
        assert_eq!(parsed.value, 2);
    }

    #[test]
    fn test_day_rollover_uses_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DailyLedger::new(dir.path(), "gap_").unwrap();
        let day1 = Utc.with_ymd_and_hms(2024, 3, 15, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 16, 0, 1, 0).unwrap();

        let row = Row {
            symbol: "000660".to_string(),
            value: 1,
        };
        ledger.append(&row, day1).unwrap();
        ledger.append(&row, day2).unwrap();

        assert!(ledger.path_for(day1).exists());
        assert!(ledger.path_for(day2).exists());
        assert_ne!(ledger.path_for(day1), ledger.path_for(day2));
    }
}
