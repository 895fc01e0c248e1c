//! `file_download` - fetch a single remote file to the local disk.
//!
//! Idempotent by construction: a destination that already holds the file at
//! the remote size is reported as `ok` without another transfer.

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};
use leet_protocol::{Machine, Plugin, PluginError, ResultRow, Session, TaskError};
use serde_json::json;

/// 50 MiB transfer cap.
const MAX_SIZE: u64 = 50 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "file_download", disable_help_flag = true)]
struct FileDownloadArgs {
    /// Absolute path of the file to be downloaded on the remote endpoint.
    #[arg(long)]
    source: String,
    /// Local destination. A directory keeps the remote file name; either
    /// way the machine name is prepended to guarantee uniqueness.
    #[arg(long)]
    dest: String,
}

#[derive(Debug, Default)]
pub struct FileDownload {
    args: Option<FileDownloadArgs>,
}

pub fn plugin() -> Box<dyn Plugin> {
    Box::new(FileDownload::default())
}

impl FileDownload {
    fn destination(&self, dest: &str, hostname: &str, remote_name: &str) -> Result<PathBuf, PluginError> {
        let dest = Path::new(dest);
        let (dir, base) = if dest.is_dir() {
            (dest.to_path_buf(), remote_name.to_string())
        } else {
            let name = dest
                .file_name()
                .ok_or_else(|| PluginError::new("destination must name a file or directory"))?;
            let parent = dest.parent().filter(|p| !p.as_os_str().is_empty());
            (
                parent.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
                name.to_string_lossy().into_owned(),
            )
        };

        std::fs::create_dir_all(&dir).map_err(|err| {
            PluginError::new(format!("creating {}: {}", dir.display(), err))
        })?;
        Ok(dir.join(format!("{hostname}_{base}")))
    }
}

impl Plugin for FileDownload {
    fn name(&self) -> &str {
        "file_download"
    }

    fn description(&self) -> &str {
        "Download a single file smaller than 50MB."
    }

    fn help(&self) -> String {
        FileDownloadArgs::command().render_long_help().to_string()
    }

    fn parse_parameters(&mut self, args: &[String]) -> Result<(), PluginError> {
        let argv = std::iter::once("file_download".to_string()).chain(args.iter().cloned());
        self.args = Some(
            FileDownloadArgs::try_parse_from(argv)
                .map_err(|err| PluginError::new(err.to_string()))?,
        );
        Ok(())
    }

    fn run(
        &self,
        session: &mut dyn Session,
        machine: &dyn Machine,
    ) -> Result<Vec<ResultRow>, TaskError> {
        let args = self
            .args
            .as_ref()
            .ok_or_else(|| PluginError::new("parameters were not set"))?;

        let sep = if args.source.contains('\\') { '\\' } else { '/' };
        let (remote_dir, remote_name) = args
            .source
            .rsplit_once(sep)
            .ok_or_else(|| PluginError::new("source must be an absolute path"))?;

        let dest_path = self.destination(&args.dest, machine.hostname(), remote_name)?;

        if !session.exists(&args.source)? {
            return Err(PluginError::new(format!(
                "Could not download {}. File not found.",
                args.source
            ))
            .into());
        }

        let listing_path = if remote_dir.is_empty() {
            sep.to_string()
        } else {
            remote_dir.to_string()
        };
        let size = session
            .list_dir(&listing_path)?
            .into_iter()
            .find(|entry| entry.name == remote_name)
            .map(|entry| entry.size)
            .ok_or_else(|| {
                PluginError::new(format!(
                    "Could not download {}. File not found.",
                    args.source
                ))
            })?;
        if size > MAX_SIZE {
            return Err(PluginError::new("File size is bigger than the allowed.").into());
        }

        // A previous attempt may have finished the transfer already.
        let already_there = std::fs::metadata(&dest_path)
            .map(|meta| meta.is_file() && meta.len() == size)
            .unwrap_or(false);
        if !already_there {
            let content = session.get_file(&args.source)?;
            std::fs::write(&dest_path, &content).map_err(|err| {
                PluginError::new(format!("writing {}: {}", dest_path.display(), err))
            })?;
        }

        let mut row = ResultRow::new();
        row.insert("src".to_string(), json!(args.source));
        row.insert("dst".to_string(), json!(dest_path.display().to_string()));
        row.insert("status".to_string(), json!("ok"));
        Ok(vec![row])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leet_protocol::Backend;
    use leet_test_utils::{NullMachine, SimBackend, SimMachineState};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn machine_and_session(
        state: &Arc<SimMachineState>,
    ) -> (Box<dyn Machine>, Box<dyn Session>) {
        let mut backend = SimBackend::new("B1", 1).with_machine(state.clone());
        backend.start().unwrap();
        let machine = backend
            .search_machines("h1")
            .unwrap()
            .pop()
            .expect("machine");
        let session = machine.connect().unwrap();
        (machine, session)
    }

    fn configured(source: &str, dest: &Path) -> FileDownload {
        let mut plugin = FileDownload::default();
        plugin
            .parse_parameters(&[
                "--source".to_string(),
                source.to_string(),
                "--dest".to_string(),
                dest.display().to_string(),
            ])
            .unwrap();
        plugin
    }

    #[test]
    fn downloads_into_the_destination_directory() {
        let state = SimMachineState::new("h1");
        state.add_file(r"c:\song.txt", b"na na na");
        let (_machine, mut session) = machine_and_session(&state);

        let dest = TempDir::new().unwrap();
        let plugin = configured(r"c:\song.txt", dest.path());

        let rows = plugin.run(session.as_mut(), &NullMachine).expect("download");
        assert_eq!(rows[0]["status"], "ok");

        let local = dest.path().join("null-host_song.txt");
        assert_eq!(std::fs::read(&local).unwrap(), b"na na na");
        assert_eq!(rows[0]["dst"], local.display().to_string());
    }

    #[test]
    fn oversized_files_are_refused() {
        let state = SimMachineState::new("h1");
        let big = vec![0u8; (MAX_SIZE + 1) as usize];
        state.add_file(r"c:\big.bin", &big);
        let (_machine, mut session) = machine_and_session(&state);

        let dest = TempDir::new().unwrap();
        let plugin = configured(r"c:\big.bin", dest.path());

        let err = plugin
            .run(session.as_mut(), &NullMachine)
            .expect_err("must refuse");
        match err {
            TaskError::Plugin(err) => {
                assert_eq!(err.0, "File size is bigger than the allowed.")
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }

    #[test]
    fn missing_source_is_a_plugin_error() {
        let state = SimMachineState::new("h1");
        let (_machine, mut session) = machine_and_session(&state);

        let dest = TempDir::new().unwrap();
        let plugin = configured(r"c:\nope.txt", dest.path());

        assert!(matches!(
            plugin.run(session.as_mut(), &NullMachine),
            Err(TaskError::Plugin(_))
        ));
    }

    #[test]
    fn rerun_detects_the_finished_transfer() {
        let state = SimMachineState::new("h1");
        state.add_file(r"c:\song.txt", b"na na na");
        let (_machine, mut session) = machine_and_session(&state);

        let dest = TempDir::new().unwrap();
        let plugin = configured(r"c:\song.txt", dest.path());

        plugin.run(session.as_mut(), &NullMachine).unwrap();
        let rows = plugin.run(session.as_mut(), &NullMachine).expect("rerun");
        assert_eq!(rows[0]["status"], "ok");
        assert_eq!(
            std::fs::read(dest.path().join("null-host_song.txt")).unwrap(),
            b"na na na"
        );
    }
}
