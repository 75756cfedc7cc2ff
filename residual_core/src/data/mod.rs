//! Observation records and their on-disk form.
//!
//! Logged observations live in two parallel plain-text files: row `i` of the
//! x file and row `i` of the y file come from the same control step. Rows are
//! comma-separated floats, newline-terminated, no header, append-only.

pub mod datapoint;
pub mod loader;
pub mod persisted_log;

pub use datapoint::{format_row, RawDatapoint};
pub use loader::{load_data, read_matrix};
pub use persisted_log::PersistedLog;
