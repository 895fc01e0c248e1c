//! The interactive LEET terminal.
//!
//! A small command loop over stdin. Completed jobs arrive on a notification
//! thread that flips the prompt to `! LEET> ` until the results are viewed.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::Result;
use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};
use leet_coordinator::{Leet, LeetHandle};
use leet_protocol::{JobStatus, LeetJob, Plugin, ResultRow};
use serde_json::Value;
use tracing::debug;

pub struct Terminal {
    leet: Leet,
    handle: LeetHandle,
    hostnames: Option<Vec<String>>,
    plugin: Option<Box<dyn Plugin>>,
    finished: Arc<Mutex<Vec<Arc<LeetJob>>>>,
    notified: Arc<AtomicBool>,
    notify_thread: Option<JoinHandle<()>>,
}

impl Terminal {
    pub fn new(mut leet: Leet) -> Self {
        let completed = leet
            .take_completed()
            .expect("the completion stream was already taken");
        let handle = leet.handle();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let notified = Arc::new(AtomicBool::new(false));

        let finished_writer = Arc::clone(&finished);
        let notified_writer = Arc::clone(&notified);
        let notify_thread = thread::Builder::new()
            .name("cli-notify".to_string())
            .spawn(move || {
                while let Ok(job) = completed.recv() {
                    finished_writer
                        .lock()
                        .expect("finished list lock poisoned")
                        .push(job);
                    if !notified_writer.swap(true, Ordering::SeqCst) {
                        println!("\nSomething finished. Use 'results' to get the results.");
                    }
                }
            })
            .expect("failed to spawn the notification thread");

        Self {
            leet,
            handle,
            hostnames: None,
            plugin: None,
            finished,
            notified,
            notify_thread: Some(notify_thread),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        println!("Starting LEET Terminal. Type '?' or 'help' for help.");
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            self.print_prompt()?;
            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            let mut tokens = input.split_whitespace().map(str::to_string);
            let command = tokens.next().unwrap_or_default();
            let rest: Vec<String> = tokens.collect();

            match command.as_str() {
                "machines" => self.cmd_machines(&rest.join(" ")),
                "plugin" => self.cmd_plugin(&rest),
                "add_job" => self.cmd_add_job()?,
                "status" => self.cmd_status(),
                "results" => self.cmd_results(),
                "cancel_all_jobs" => self.handle.cancel_all_jobs(),
                "help" | "?" => self.cmd_help(&rest),
                "exit" | "quit" => break,
                other => println!("*** Unknown command: {other}"),
            }
        }
        self.shutdown();
        Ok(())
    }

    fn print_prompt(&self) -> Result<()> {
        let prompt = if self.notified.load(Ordering::SeqCst) {
            "! LEET> "
        } else {
            "LEET> "
        };
        print!("{prompt}");
        io::stdout().flush()?;
        Ok(())
    }

    fn cmd_machines(&mut self, args: &str) {
        let machines = split_hostnames(args);
        if machines.is_empty() {
            println!("Invalid. See the help.");
            return;
        }
        println!("Set to run in {} machines.", machines.len());
        self.hostnames = Some(machines);
    }

    fn cmd_plugin(&mut self, args: &[String]) {
        match args.first().map(String::as_str) {
            Some("list") => self.print_plugin_list(),
            Some("set") => match args.get(1) {
                Some(name) => self.set_plugin(name, &args[2..]),
                None => println!("Error, invalid command. Usage: plugin set <name> [args]"),
            },
            Some(name) => match self.handle.get_plugin(name) {
                Some(plugin) => println!("{}", plugin.help()),
                None => println!("*** No plugin named {name}"),
            },
            None => println!("Error, invalid command. Usage: plugin list|set <name> [args]"),
        }
    }

    fn print_plugin_list(&self) {
        let names = self.handle.plugin_list();
        println!("{}", "=".repeat(40));
        for name in &names {
            match self.handle.get_plugin(name) {
                Some(plugin) => println!("{name}\t{}", plugin.description()),
                None => println!("{name}"),
            }
        }
        println!("{}", "=".repeat(40));
        println!("Total plugins: {}", names.len());
        println!("For details on each plugin, try 'plugin <plugin_name>'");
    }

    fn set_plugin(&mut self, name: &str, parameters: &[String]) {
        let Some(mut plugin) = self.handle.get_plugin(name) else {
            println!("*** No plugin named {name}");
            return;
        };
        match plugin.parse_parameters(parameters) {
            Ok(()) => {
                debug!("plugin {} configured", name);
                self.plugin = Some(plugin);
            }
            Err(err) => println!("{err}"),
        }
    }

    fn cmd_add_job(&mut self) -> Result<()> {
        let Some(hostnames) = self.hostnames.clone() else {
            println!("Error, no machines defined. Use the command 'machines'");
            return Ok(());
        };
        if self.plugin.is_none() {
            println!("Error, no plugins defined. Use the 'plugin set' command");
            return Ok(());
        }

        println!("***********************************");
        println!("********* Job information *********");
        println!("***********************************");
        if let Some(plugin) = &self.plugin {
            println!("Plugin: {}", plugin.name());
        }
        println!("Amount of machines: {}", hostnames.len());
        println!("Machine list: {}", hostnames.join(","));
        println!("***********************************");
        println!("The job(s) will be sent for processing.");
        print!("Confirm? (y/n) ");
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if answer.trim().eq_ignore_ascii_case("y") {
            let plugin = self.plugin.take().expect("plugin presence checked above");
            self.handle.schedule_jobs(plugin, hostnames);
            self.hostnames = None;
            println!("Job scheduled. Cleaning parameters.");
        } else {
            println!("Job cancelled.");
        }
        Ok(())
    }

    fn cmd_status(&self) {
        let mut rows: Vec<(String, String, String, JobStatus)> = self
            .handle
            .job_status()
            .into_iter()
            .map(|view| (view.id.to_string(), view.hostname, view.plugin, view.status))
            .collect();
        for job in self.finished.lock().expect("finished list lock poisoned").iter() {
            rows.push((
                job.id().to_string(),
                job.machine().hostname().to_string(),
                job.plugin().name().to_string(),
                job.status(),
            ));
        }

        if rows.is_empty() {
            println!("***No jobs pending");
            return;
        }

        let mut table = new_table();
        table.set_header(vec!["id", "hostname", "plugin", "status"]);
        for (id, hostname, plugin, status) in rows {
            table.add_row(vec![id, hostname, plugin, status.to_string()]);
        }
        println!("{table}");
    }

    fn cmd_results(&self) {
        self.notified.store(false, Ordering::SeqCst);

        let finished = self.finished.lock().expect("finished list lock poisoned");
        if finished.is_empty() {
            println!("***No jobs have been completed.");
            return;
        }
        for job in finished.iter() {
            println!();
            println!("{}", "-".repeat(80));
            println!(
                "JobID: {} \t| Hostname: {} \t| Result: {}",
                job.id(),
                job.machine().hostname(),
                job.status()
            );
            println!("--------- Result ----------");
            match job.result() {
                Some(rows) if !rows.is_empty() => println!("{}", render_rows(&rows)),
                _ => println!("(no rows)"),
            }
        }
    }

    fn cmd_help(&self, args: &[String]) {
        if args.first().map(String::as_str) == Some("plugin") {
            match args.get(1) {
                Some(name) => match self.handle.get_plugin(name) {
                    Some(plugin) => println!("{}", plugin.help()),
                    None => println!("***No help for plugin {name}"),
                },
                None => println!("plugin list|set <name> [args]|<name>"),
            }
            return;
        }
        println!("Commands:");
        println!("  machines host1,host2,...   set the target machines");
        println!("  plugin list                list the available plugins");
        println!("  plugin set <name> [args]   choose the plugin to run");
        println!("  plugin <name>              show a plugin's help");
        println!("  add_job                    schedule the configured job");
        println!("  status                     show job status");
        println!("  results                    print completed job results");
        println!("  cancel_all_jobs            cancel every pending job");
        println!("  exit                       close the program");
    }

    fn shutdown(&mut self) {
        self.leet.shutdown();
        if let Some(thread) = self.notify_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Tabulate result rows; the header comes from the first row's keys.
fn render_rows(rows: &[ResultRow]) -> Table {
    let mut table = new_table();
    if let Some(first) = rows.first() {
        table.set_header(first.keys().map(String::as_str).collect::<Vec<_>>());
    }
    for row in rows {
        table.add_row(row.values().map(render_value).collect::<Vec<_>>());
    }
    table
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Hostnames separated by commas, spaces or both.
fn split_hostnames(input: &str) -> Vec<String> {
    input
        .split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hostnames_split_on_commas_and_spaces() {
        assert_eq!(split_hostnames("h1,h2 h3, h4"), vec!["h1", "h2", "h3", "h4"]);
        assert!(split_hostnames("  ").is_empty());
    }

    #[test]
    fn rows_render_with_the_key_order_of_the_first_row() {
        let mut row = ResultRow::new();
        row.insert("Filename".to_string(), json!("a.txt"));
        row.insert("Size".to_string(), json!(3));
        let rendered = render_rows(&[row]).to_string();
        let header_pos = rendered.find("Filename").unwrap();
        assert!(header_pos < rendered.find("Size").unwrap());
        assert!(rendered.contains("a.txt"));
    }

    #[test]
    fn json_values_render_without_quotes() {
        assert_eq!(render_value(&json!("plain")), "plain");
        assert_eq!(render_value(&json!(42)), "42");
    }
}
