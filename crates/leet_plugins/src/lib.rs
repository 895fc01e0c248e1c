//! Built-in plugins and the compile-time registry.

pub mod dirlist;
pub mod file_download;
pub mod process_list;
mod registry;

pub use registry::PluginRegistry;

use chrono::{DateTime, Utc};

/// Timestamp rendering used in result rows.
pub(crate) fn render_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}
