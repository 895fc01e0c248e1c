//! `dirlist` - directory listing with standard timestamp data.

use clap::{CommandFactory, Parser};
use leet_protocol::{Machine, Plugin, PluginError, ResultRow, Session, TaskError};
use serde_json::json;

use crate::render_ts;

#[derive(Debug, Parser)]
#[command(name = "dirlist", disable_help_flag = true)]
struct DirListArgs {
    /// Path to be listed on the remote endpoint.
    #[arg(long)]
    path: String,
}

#[derive(Debug, Default)]
pub struct DirList {
    args: Option<DirListArgs>,
}

pub fn plugin() -> Box<dyn Plugin> {
    Box::new(DirList::default())
}

impl Plugin for DirList {
    fn name(&self) -> &str {
        "dirlist"
    }

    fn description(&self) -> &str {
        "Returns a directory list from a path with standard timestamp data."
    }

    fn help(&self) -> String {
        DirListArgs::command().render_long_help().to_string()
    }

    fn parse_parameters(&mut self, args: &[String]) -> Result<(), PluginError> {
        let argv = std::iter::once("dirlist".to_string()).chain(args.iter().cloned());
        self.args = Some(
            DirListArgs::try_parse_from(argv).map_err(|err| PluginError::new(err.to_string()))?,
        );
        Ok(())
    }

    fn run(
        &self,
        session: &mut dyn Session,
        _machine: &dyn Machine,
    ) -> Result<Vec<ResultRow>, TaskError> {
        let args = self
            .args
            .as_ref()
            .ok_or_else(|| PluginError::new("parameters were not set"))?;

        let entries = session.list_dir(&args.path)?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let attributes = entry
                    .attributes
                    .iter()
                    .map(|attr| attr.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                let mut row = ResultRow::new();
                row.insert("Access ts".to_string(), json!(render_ts(&entry.accessed)));
                row.insert("Write ts".to_string(), json!(render_ts(&entry.modified)));
                row.insert("Created ts".to_string(), json!(render_ts(&entry.created)));
                row.insert("Filename".to_string(), json!(entry.name));
                row.insert("Attributes".to_string(), json!(attributes));
                row.insert("Size".to_string(), json!(entry.size));
                row
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leet_protocol::Backend;
    use leet_test_utils::{NullMachine, SimBackend, SimMachineState};

    fn session_for(state: &std::sync::Arc<SimMachineState>) -> Box<dyn Session> {
        let mut backend = SimBackend::new("B1", 1).with_machine(state.clone());
        backend.start().unwrap();
        let machine = backend
            .search_machines("h1")
            .unwrap()
            .pop()
            .expect("machine");
        machine.connect().unwrap()
    }

    #[test]
    fn rows_carry_the_listing_columns() {
        let state = SimMachineState::new("h1");
        state
            .add_dir(r"c:\tools")
            .add_file(r"c:\tools\a.txt", b"aaa");
        let mut session = session_for(&state);

        let mut plugin = DirList::default();
        plugin
            .parse_parameters(&["--path".to_string(), r"c:\tools".to_string()])
            .unwrap();

        let rows = plugin
            .run(session.as_mut(), &NullMachine)
            .expect("listing");
        assert_eq!(rows.len(), 1);
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(
            keys,
            vec![
                "Access ts",
                "Write ts",
                "Created ts",
                "Filename",
                "Attributes",
                "Size"
            ]
        );
        assert_eq!(rows[0]["Filename"], "a.txt");
        assert_eq!(rows[0]["Size"], 3);
    }

    #[test]
    fn missing_path_parameter_fails_parsing() {
        let mut plugin = DirList::default();
        assert!(plugin.parse_parameters(&[]).is_err());
        assert!(plugin
            .parse_parameters(&["--nope".to_string(), "x".to_string()])
            .is_err());
    }
}
