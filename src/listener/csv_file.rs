//! Listener that logs updates to a CSV file
//!
//! One row per update: `timestamp,fqn,value`, timestamp in RFC 3339.

use super::{Listener, ListenerUpdate};
use crate::error::{Result, ResultExt, WatchError};
use chrono::SecondsFormat;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const CSV_HEADER: &str = "timestamp,fqn,value";

pub struct CsvFileListener {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    rows_written: u64,
}

impl CsvFileListener {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
            rows_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

impl Listener for CsvFileListener {
    fn setup(&mut self) -> Result<()> {
        let file = File::create(&self.path)
            .map_err(WatchError::from)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", CSV_HEADER)?;
        self.writer = Some(writer);
        self.rows_written = 0;
        tracing::info!("Logging values to {}", self.path.display());
        Ok(())
    }

    fn receive(&mut self, updates: &[ListenerUpdate]) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(WatchError::ListenerState("CSV file is not open".into()));
        };
        for update in updates {
            writeln!(
                writer,
                "{},{},{}",
                update.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                escape(&update.fqn.to_string()),
                update.value
            )?;
            self.rows_written += 1;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            tracing::info!(
                "Closed {} after {} rows",
                self.path.display(),
                self.rows_written
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Fqn;
    use crate::types::Value;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut listener = CsvFileListener::new(&path);
        listener.setup().unwrap();
        listener
            .receive(&[ListenerUpdate {
                fqn: Fqn::parse("var:/motor/speed").unwrap(),
                value: Value::Float(1.5),
                timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            }])
            .unwrap();
        listener.teardown().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "2024-01-02T03:04:05.000000Z,var:/motor/speed,1.5");
        assert_eq!(listener.rows_written(), 1);
    }

    #[test]
    fn test_receive_before_setup_fails() {
        let mut listener = CsvFileListener::new("unused.csv");
        let err = listener.receive(&[]).unwrap_err();
        assert!(matches!(err, WatchError::ListenerState(_)));
        assert!(listener.teardown().is_ok());
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
