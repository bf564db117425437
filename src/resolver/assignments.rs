//! The persisted assignment file.
//!
//! A plain CSV file, rewritten in full on every save:
//!
//! ```text
//! metric,host,tcpPort,rate
//! sys.cpu.user,ingest-1,4243,12.5
//! ```
//!
//! No quoting; metric names and hosts must not contain commas. The rate
//! column is written for operators and ignored on load.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{error, info, trace};

const HEADER: &str = "metric,host,tcpPort,rate";

/// One row of the assignment file.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRow {
    pub metric: String,
    pub host: String,
    pub tcp_port: u16,
    pub rate: f64,
}

/// Read assignment rows from `path`.
///
/// Rows with fewer than four fields are dropped. A row whose port does not
/// parse is kept with port 0 so the resolver can rebind it the same way it
/// rebinds rows naming unknown hosts. I/O failures are logged and whatever
/// was accumulated so far is returned; the in-memory state is the source of
/// truth and a missing or truncated file must never stop start-up.
pub fn load(path: &Path) -> Vec<AssignmentRow> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no assignment file, starting with empty assignments");
            return Vec::new();
        }
        Err(error) => {
            error!(%error, path = %path.display(), "failed to open assignment file");
            return Vec::new();
        }
    };

    let mut rows = Vec::new();
    let mut lines = BufReader::new(file).lines();

    // Header row.
    match lines.next() {
        None => return rows,
        Some(Err(error)) => {
            error!(%error, path = %path.display(), "failed to read assignment file header");
            return rows;
        }
        Some(Ok(_)) => {}
    }

    for line in lines {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                error!(%error, path = %path.display(), "assignment file read failed mid-file");
                break;
            }
        };

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 4 {
            continue;
        }

        let row = AssignmentRow {
            metric: fields[0].to_string(),
            host: fields[1].to_string(),
            tcp_port: fields[2].trim().parse().unwrap_or(0),
            rate: fields[3].trim().parse().unwrap_or(0.0),
        };
        trace!(metric = %row.metric, host = %row.host, port = row.tcp_port, "read assignment row");
        rows.push(row);
    }

    rows
}

/// Write the full assignment file: header, then one row per pinned metric.
pub fn save(path: &Path, rows: &[AssignmentRow]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{HEADER}")?;
    for row in rows {
        trace!(metric = %row.metric, host = %row.host, port = row.tcp_port, "saving assignment row");
        writeln!(writer, "{},{},{},{}", row.metric, row.host, row.tcp_port, row.rate)?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as IoWrite;
    use tempfile::NamedTempFile;

    #[test]
    fn test_round_trip() {
        let rows = vec![
            AssignmentRow {
                metric: "sys.cpu.user".to_string(),
                host: "ingest-1".to_string(),
                tcp_port: 4243,
                rate: 12.5,
            },
            AssignmentRow {
                metric: "sys.mem.free".to_string(),
                host: "ingest-2".to_string(),
                tcp_port: 4243,
                rate: 0.0,
            },
        ];

        let file = NamedTempFile::new().unwrap();
        save(file.path(), &rows).unwrap();

        let loaded = load(file.path());
        assert_eq!(loaded, rows);
    }

    #[test]
    fn test_header_written() {
        let file = NamedTempFile::new().unwrap();
        save(file.path(), &[]).unwrap();

        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents, "metric,host,tcpPort,rate\n");
    }

    #[test]
    fn test_short_rows_dropped() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "metric,host,tcpPort,rate").unwrap();
        writeln!(file, "sys.cpu.user,ingest-1,4243,1.0").unwrap();
        writeln!(file, "sys.cpu.sys,ingest-1").unwrap();
        writeln!(file, "").unwrap();
        writeln!(file, "sys.cpu.idle,ingest-2,4243,2.0").unwrap();

        let rows = load(file.path());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].metric, "sys.cpu.user");
        assert_eq!(rows[1].metric, "sys.cpu.idle");
    }

    #[test]
    fn test_unparseable_port_becomes_zero() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "metric,host,tcpPort,rate").unwrap();
        writeln!(file, "sys.cpu.user,ingest-1,not-a-port,1.0").unwrap();

        let rows = load(file.path());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tcp_port, 0);
    }

    #[test]
    fn test_missing_file_yields_empty() {
        let rows = load(Path::new("/nonexistent/metlb/assignments.csv"));
        assert!(rows.is_empty());
    }

    #[test]
    fn test_rate_is_informational_only() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "metric,host,tcpPort,rate").unwrap();
        writeln!(file, "sys.cpu.user,ingest-1,4243,garbage").unwrap();

        let rows = load(file.path());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rate, 0.0);
    }
}
