//! Framed binary snapshots of predictor state.
//!
//! A predictor conditioned online during one control session can be written
//! out and restored in the next. Every file starts with a small frame that
//! names the component and its payload version:
//!
//! ```text
//! b"RSNP" | kind (u64 length + utf8) | version (u32 le) | payload (bincode)
//! ```
//!
//! The frame is checked before the payload is decoded, so a snapshot of a
//! different component or an older layout is refused with a typed error
//! instead of being misread. Writes go to a sibling `.partial` file that is
//! renamed over the destination once synced.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ResidualError;

const MAGIC: [u8; 4] = *b"RSNP";
/// Upper bound on the encoded `(kind, version)` pair.
const FRAME_LIMIT: u64 = 256;

/// Why a snapshot could not be written or restored.
#[derive(Debug)]
pub enum CheckpointError {
    Io { path: PathBuf, source: io::Error },
    /// The payload did not decode with the snapshot codec.
    Codec(bincode::Error),
    /// The file does not start with a snapshot frame.
    NotACheckpoint { path: PathBuf },
    /// The frame names another component.
    WrongKind { expected: &'static str, found: String },
    VersionMismatch { kind: &'static str, expected: u32, found: u32 },
    /// A flattened array does not match the dimensions stored beside it.
    Malformed { field: &'static str, expected: usize, found: usize },
    /// The decoded state was rejected by the component's own validation.
    Invalid(ResidualError),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Io { path, source } => {
                write!(f, "snapshot {}: {source}", path.display())
            }
            CheckpointError::Codec(err) => write!(f, "snapshot payload does not decode: {err}"),
            CheckpointError::NotACheckpoint { path } => {
                write!(f, "{} is not a residual snapshot", path.display())
            }
            CheckpointError::WrongKind { expected, found } => {
                write!(f, "snapshot holds `{found}` state, wanted `{expected}`")
            }
            CheckpointError::VersionMismatch { kind, expected, found } => write!(
                f,
                "`{kind}` snapshot is layout v{found}, this build reads v{expected}"
            ),
            CheckpointError::Malformed { field, expected, found } => write!(
                f,
                "snapshot field `{field}` holds {found} values, dimensions require {expected}"
            ),
            CheckpointError::Invalid(err) => write!(f, "restored state rejected: {err}"),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::Io { source, .. } => Some(source),
            CheckpointError::Codec(err) => Some(&**err),
            CheckpointError::Invalid(err) => Some(err),
            _ => None,
        }
    }
}

impl From<bincode::Error> for CheckpointError {
    fn from(err: bincode::Error) -> Self {
        CheckpointError::Codec(err)
    }
}

impl From<ResidualError> for CheckpointError {
    fn from(err: ResidualError) -> Self {
        CheckpointError::Invalid(err)
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

/// State that can be captured into a framed snapshot file and rebuilt from it.
///
/// Implementors describe their payload; framing, version checks and the
/// write-then-rename dance are shared.
pub trait Checkpointable: Sized {
    /// Component tag stored in the frame.
    const KIND: &'static str;
    /// Payload layout version. Bump whenever `Snapshot` changes shape.
    const VERSION: u32;

    type Snapshot: Serialize + DeserializeOwned;

    fn snapshot(&self) -> Self::Snapshot;

    /// Rebuild and validate state from a decoded payload.
    fn restore(snapshot: Self::Snapshot) -> Result<Self, CheckpointError>;

    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        write_framed(path.as_ref(), Self::KIND, Self::VERSION, &self.snapshot())
    }

    fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let snapshot = read_framed(path.as_ref(), Self::KIND, Self::VERSION)?;
        Self::restore(snapshot)
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("snapshot"));
    name.push(".partial");
    path.with_file_name(name)
}

fn write_framed<T: Serialize>(
    path: &Path,
    kind: &str,
    version: u32,
    payload: &T,
) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_at(parent))?;
    }

    let staging = partial_path(path);
    let file = File::create(&staging).map_err(io_at(&staging))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&MAGIC).map_err(io_at(&staging))?;
    codec().serialize_into(&mut writer, &(kind, version))?;
    codec().serialize_into(&mut writer, payload)?;
    let file = writer
        .into_inner()
        .map_err(|err| io_at(&staging)(err.into_error()))?;
    file.sync_all().map_err(io_at(&staging))?;

    fs::rename(&staging, path).map_err(io_at(path))?;
    tracing::debug!(path = %path.display(), kind, version, "snapshot written");
    Ok(())
}

fn read_framed<T: DeserializeOwned>(
    path: &Path,
    kind: &'static str,
    version: u32,
) -> Result<T, CheckpointError> {
    let file = File::open(path).map_err(io_at(path))?;
    let mut reader = BufReader::new(file);

    let not_a_checkpoint = || CheckpointError::NotACheckpoint {
        path: path.to_path_buf(),
    };
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(()) if magic == MAGIC => {}
        Ok(()) => return Err(not_a_checkpoint()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Err(not_a_checkpoint()),
        Err(err) => return Err(io_at(path)(err)),
    }

    let (found_kind, found_version): (String, u32) = codec()
        .with_limit(FRAME_LIMIT)
        .deserialize_from(&mut reader)
        .map_err(|_| not_a_checkpoint())?;
    if found_kind != kind {
        return Err(CheckpointError::WrongKind {
            expected: kind,
            found: found_kind,
        });
    }
    if found_version != version {
        return Err(CheckpointError::VersionMismatch {
            kind,
            expected: version,
            found: found_version,
        });
    }

    Ok(codec().deserialize_from(&mut reader)?)
}
