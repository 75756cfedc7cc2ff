use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::data::{format_row, RawDatapoint};
use crate::error::{ResidualError, ResidualResult};

/// Paired append-only x/y files.
///
/// A successful [`append_rows`](Self::append_rows) adds the same number of
/// rows to both files. A failed one truncates both back to their previous
/// lengths so the files never drift apart.
#[derive(Debug, Clone)]
pub struct PersistedLog {
    x_path: PathBuf,
    y_path: PathBuf,
}

impl PersistedLog {
    /// Attach to the two files, creating neither. Existing files must already
    /// hold equal row counts.
    pub fn open<P, Q>(x_path: P, y_path: Q) -> ResidualResult<Self>
    where
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        let log = Self {
            x_path: x_path.into(),
            y_path: y_path.into(),
        };
        if log.x_path == log.y_path {
            return Err(ResidualError::configuration(
                "y_path",
                log.y_path.display().to_string(),
                "x and y logs must be distinct files",
            ));
        }

        let (x_rows, y_rows) = log.row_counts()?;
        if x_rows != y_rows {
            return Err(ResidualError::configuration(
                "x_path",
                log.x_path.display().to_string(),
                format!("existing log holds {x_rows} x rows but {y_rows} y rows"),
            ));
        }
        Ok(log)
    }

    pub fn x_path(&self) -> &Path {
        &self.x_path
    }

    pub fn y_path(&self) -> &Path {
        &self.y_path
    }

    /// Non-empty lines in each file. Missing files count as empty.
    pub fn row_counts(&self) -> ResidualResult<(usize, usize)> {
        Ok((count_rows(&self.x_path)?, count_rows(&self.y_path)?))
    }

    /// Append `rows` in order to both files and sync them. Returns the number
    /// of rows written.
    pub fn append_rows(&self, rows: &[RawDatapoint]) -> ResidualResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut x_block = String::new();
        let mut y_block = String::new();
        for row in rows {
            format_row(row.x.view(), &mut x_block);
            format_row(row.y.view(), &mut y_block);
        }

        let mut x_file = open_append(&self.x_path)?;
        let mut y_file = open_append(&self.y_path)?;
        let x_len = file_len(&x_file, &self.x_path)?;
        let y_len = file_len(&y_file, &self.y_path)?;

        let written = write_block(&mut x_file, &x_block, &self.x_path)
            .and_then(|_| write_block(&mut y_file, &y_block, &self.y_path));

        if let Err(err) = written {
            tracing::warn!(
                x = %self.x_path.display(),
                y = %self.y_path.display(),
                error = %err,
                "append failed, rolling back both logs"
            );
            rollback(&x_file, x_len, &self.x_path);
            rollback(&y_file, y_len, &self.y_path);
            return Err(err);
        }

        Ok(rows.len())
    }
}

fn open_append(path: &Path) -> ResidualResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| ResidualError::io(format!("creating {}", parent.display()), &err))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| ResidualError::io(format!("opening {}", path.display()), &err))
}

fn file_len(file: &File, path: &Path) -> ResidualResult<u64> {
    file.metadata()
        .map(|meta| meta.len())
        .map_err(|err| ResidualError::io(format!("inspecting {}", path.display()), &err))
}

fn write_block(file: &mut File, block: &str, path: &Path) -> ResidualResult<()> {
    file.write_all(block.as_bytes())
        .and_then(|_| file.sync_data())
        .map_err(|err| ResidualError::io(format!("appending to {}", path.display()), &err))
}

fn rollback(file: &File, len: u64, path: &Path) {
    if let Err(err) = file.set_len(len).and_then(|_| file.sync_data()) {
        tracing::error!(path = %path.display(), error = %err, "rollback truncation failed");
    }
}

fn count_rows(path: &Path) -> ResidualResult<usize> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(ResidualError::io(format!("opening {}", path.display()), &err)),
    };

    let mut rows = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| ResidualError::io(format!("reading {}", path.display()), &err))?;
        if !line.trim().is_empty() {
            rows += 1;
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::load_data;
    use ndarray::array;
    use std::fs;

    fn point(i: f64) -> RawDatapoint {
        RawDatapoint::new(array![i, i + 0.5].view(), array![-i].view())
    }

    #[test]
    fn appends_keep_files_paired_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let log = PersistedLog::open(dir.path().join("x.txt"), dir.path().join("y.txt")).unwrap();
        assert_eq!(log.row_counts().unwrap(), (0, 0));

        assert_eq!(log.append_rows(&[point(1.0), point(2.0)]).unwrap(), 2);
        assert_eq!(log.append_rows(&[point(3.0)]).unwrap(), 1);
        assert_eq!(log.append_rows(&[]).unwrap(), 0);

        let (x, y) = load_data(log.x_path(), log.y_path()).unwrap();
        assert_eq!(x, array![[1.0, 1.5], [2.0, 2.5], [3.0, 3.5]]);
        assert_eq!(y, array![[-1.0], [-2.0], [-3.0]]);
    }

    #[test]
    fn open_rejects_unbalanced_existing_logs() {
        let dir = tempfile::tempdir().unwrap();
        let x_path = dir.path().join("x.txt");
        let y_path = dir.path().join("y.txt");
        fs::write(&x_path, "1\n2\n").unwrap();
        fs::write(&y_path, "1\n").unwrap();

        assert!(PersistedLog::open(&x_path, &y_path)
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn open_rejects_shared_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("both.txt");
        assert!(PersistedLog::open(&path, &path).is_err());
    }

    #[test]
    fn unwritable_target_reports_io_and_leaves_x_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let x_path = dir.path().join("x.txt");
        // A directory cannot be opened for append.
        let y_path = dir.path().join("y_dir");
        fs::create_dir(&y_path).unwrap();

        let log = PersistedLog {
            x_path: x_path.clone(),
            y_path,
        };
        let err = log.append_rows(&[point(1.0)]).unwrap_err();
        assert!(err.is_io());
        assert_eq!(count_rows(&x_path).unwrap(), 0);
    }
}
