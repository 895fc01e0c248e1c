//! `process_list` - passthrough of the remote process listing.

use clap::{CommandFactory, Parser};
use leet_protocol::{Machine, Plugin, PluginError, ResultRow, Session, TaskError};
use serde_json::json;

use crate::render_ts;

#[derive(Debug, Parser)]
#[command(name = "process_list", disable_help_flag = true)]
struct ProcessListArgs {}

#[derive(Debug, Default)]
pub struct ProcessList;

pub fn plugin() -> Box<dyn Plugin> {
    Box::new(ProcessList)
}

impl Plugin for ProcessList {
    fn name(&self) -> &str {
        "process_list"
    }

    fn description(&self) -> &str {
        "Returns a list of processes currently in execution."
    }

    fn help(&self) -> String {
        ProcessListArgs::command().render_long_help().to_string()
    }

    fn parse_parameters(&mut self, args: &[String]) -> Result<(), PluginError> {
        let argv = std::iter::once("process_list".to_string()).chain(args.iter().cloned());
        ProcessListArgs::try_parse_from(argv).map_err(|err| PluginError::new(err.to_string()))?;
        Ok(())
    }

    fn run(
        &self,
        session: &mut dyn Session,
        _machine: &dyn Machine,
    ) -> Result<Vec<ResultRow>, TaskError> {
        let processes = session.list_processes()?;

        Ok(processes
            .into_iter()
            .map(|process| {
                let mut row = ResultRow::new();
                row.insert("Username".to_string(), json!(process.username));
                row.insert("PID".to_string(), json!(process.pid));
                row.insert("PPID".to_string(), json!(process.ppid));
                row.insert("Start ts".to_string(), json!(render_ts(&process.start_time)));
                row.insert("Command line".to_string(), json!(process.command_line));
                row.insert("Path".to_string(), json!(process.path));
                row
            })
            .collect())
    }
}
