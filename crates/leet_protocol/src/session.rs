//! The session capability set presented to plugins.
//!
//! Backends implement the primitives; the path-walking algorithms (`exists`,
//! recursive `make_dir`, `put_file`) are provided here so every backend
//! behaves the same. All operations block until the remote side answers or
//! fails. Only `SessionError` and `CommandError` may cross this boundary.

use std::io::Read;

use tracing::debug;

use crate::error::{CommandError, SessionFailure};
use crate::types::{DirEntry, OsType, ProcessEntry};

/// A scoped remote-execution channel to one machine. Dropping the session
/// releases the remote channel on every exit path.
pub trait Session: Send {
    fn os_type(&self) -> OsType;

    fn path_separator(&self) -> char {
        self.os_type().path_separator()
    }

    /// Processes currently running on the machine, in backend order.
    fn list_processes(&mut self) -> Result<Vec<ProcessEntry>, SessionFailure>;

    /// Complete content of a remote file, materialised in memory.
    fn get_file(&mut self, remote_path: &str) -> Result<Vec<u8>, SessionFailure>;

    /// Write `data` to `remote_path`. The parent directory must exist; use
    /// `put_file` for the checked variant.
    fn put_file_raw(
        &mut self,
        data: &mut dyn Read,
        remote_path: &str,
    ) -> Result<(), SessionFailure>;

    /// Delete a file, or a directory recursively.
    fn delete_file(&mut self, remote_path: &str) -> Result<(), SessionFailure>;

    /// List a remote directory.
    fn list_dir(&mut self, remote_path: &str) -> Result<Vec<DirEntry>, SessionFailure>;

    /// Create exactly one directory whose parent already exists.
    fn make_dir_single(&mut self, remote_path: &str) -> Result<(), SessionFailure>;

    /// Run a command. Foreground invocations block up to a backend-defined
    /// timeout and return the captured stdout; background invocations return
    /// `None` once the process is launched.
    fn start_process(
        &mut self,
        cmd: &str,
        cwd: Option<&str>,
        background: bool,
    ) -> Result<Option<String>, SessionFailure>;

    /// Whether `remote_path` exists. A trailing separator means "inspect as
    /// directory": a plain file of that name does not count. Root-only paths
    /// cannot be inspected through a directory listing and are rejected.
    fn exists(&mut self, remote_path: &str) -> Result<bool, SessionFailure> {
        let sep = self.path_separator();
        let want_dir = remote_path.ends_with(sep);
        let trimmed = remote_path.trim_end_matches(sep);
        let (parent, name) = trimmed
            .rsplit_once(sep)
            .ok_or_else(|| CommandError::new("cannot inspect the existence of a root path"))?;
        let entries = match self.list_dir(&format!("{parent}{sep}")) {
            Ok(entries) => entries,
            Err(SessionFailure::Command(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(entries
            .iter()
            .any(|entry| entry.name == name && (!want_dir || entry.is_directory())))
    }

    /// Create `remote_path`. When `recursive`, walk the components left to
    /// right and create only the missing suffix; existing prefixes are never
    /// touched or re-created. Root-only paths are refused.
    fn make_dir(&mut self, remote_path: &str, recursive: bool) -> Result<(), SessionFailure> {
        let sep = self.path_separator();
        let trimmed = remote_path.trim_end_matches(sep);
        let parts: Vec<&str> = trimmed.split(sep).collect();
        if parts.len() <= 1 {
            return Err(CommandError::new("refusing to create a root path").into());
        }
        if !recursive {
            return self.make_dir_single(trimmed);
        }

        let sep_str = sep.to_string();
        let mut missing_from = None;
        for idx in 1..parts.len() {
            let prefix = parts[..=idx].join(&sep_str);
            if !self.exists(&format!("{prefix}{sep}"))? {
                missing_from = Some(idx);
                break;
            }
        }
        let Some(start) = missing_from else {
            debug!("no directory needs to be created for {}", trimmed);
            return Ok(());
        };

        for idx in start..parts.len() {
            let path = parts[..=idx].join(&sep_str);
            debug!("creating remote directory {}", path);
            self.make_dir_single(&path)?;
        }
        Ok(())
    }

    /// Write a stream to `remote_path`. With `overwrite`, an existing file is
    /// deleted first; a missing parent directory is created recursively.
    fn put_file(
        &mut self,
        data: &mut dyn Read,
        remote_path: &str,
        overwrite: bool,
    ) -> Result<(), SessionFailure> {
        let sep = self.path_separator();
        let (parent, name) = remote_path
            .rsplit_once(sep)
            .ok_or_else(|| CommandError::new("destination must be an absolute path"))?;
        if name.is_empty() {
            return Err(CommandError::new("destination must name a file").into());
        }

        if overwrite && self.exists(remote_path)? {
            self.delete_file(remote_path)?;
        }

        // Roots always exist; anything deeper may need to be created.
        if parent.contains(sep) && !self.exists(&format!("{parent}{sep}"))? {
            self.make_dir(parent, true)?;
        }

        self.put_file_raw(data, remote_path)
    }
}
