// Flat-file outputs: CSV tables and generated text artifacts

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Buffered CSV writer with a fixed header
pub struct CsvOutput {
    writer: BufWriter<File>,
    path: PathBuf,
    columns: usize,
}

impl CsvOutput {
    /// Create (truncating) `path` and write the header line
    pub fn create(path: &Path, header: &[String]) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| Error::io(format!("creating {}", path.display()), e))?;
        let mut out = CsvOutput {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            columns: header.len(),
        };
        let line = header.join(",");
        out.write_line(&line)?;
        Ok(out)
    }

    pub fn write_row(&mut self, row: &[f64]) -> Result<()> {
        if row.len() != self.columns {
            return Err(Error::SeriesLengthMismatch {
                name: self.path.display().to_string(),
                expected: self.columns,
                actual: row.len(),
            });
        }
        let line = row
            .iter()
            .map(|v| format!("{}", v))
            .collect::<Vec<_>>()
            .join(",");
        self.write_line(&line)
    }

    /// Flush buffered rows to disk
    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer
            .flush()
            .map_err(|e| Error::io(format!("writing {}", self.path.display()), e))?;
        Ok(self.path)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{}", line)
            .map_err(|e| Error::io(format!("writing {}", self.path.display()), e))
    }
}

/// Write a whole text artifact, creating parent directories
pub fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
    }
    fs::write(path, text).map_err(|e| Error::io(format!("writing {}", path.display()), e))
}
