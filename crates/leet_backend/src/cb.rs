//! Carbon Black Response backend, using the live-response REST API.
//!
//! Three pieces: `CbBackend` (one server instance), `CbMachine` (a sensor)
//! and `CbSession` (a live-response session). Every cbapi-level failure is
//! converted at this boundary to `SessionError` or `CommandError`; nothing
//! else leaks to a plugin.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use leet_protocol::{
    defaults, Backend, CommandError, DirEntry, FileAttribute, Machine, OsType, ProcessEntry,
    Session, SessionError, SessionFailure,
};
use reqwest::blocking::{multipart, Client, Response};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

/// How long to wait for a requested live-response session to go active.
const SESSION_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a regular session command may take.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Pause between polls of a pending session or command.
const POLL_SLEEP: Duration = Duration::from_millis(500);

/// One `[profile]` of the credentials file.
#[derive(Debug, Clone)]
pub struct CbProfile {
    pub name: String,
    pub url: String,
    pub token: String,
    pub ssl_verify: bool,
    pub max_sessions: usize,
}

#[derive(Debug, Error)]
enum CbError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {code}: {message}")]
    Status { code: u16, message: String },
    #[error("{0}")]
    Command(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    SessionGone(String),
}

impl CbError {
    /// Mapping at the session boundary. Command failures keep the session
    /// alive; transport problems and timeouts are retried through a new
    /// probe cycle; anything unrecognised gives the job up.
    fn into_session_failure(self) -> SessionFailure {
        match self {
            CbError::Command(message) => CommandError::new(message).into(),
            CbError::Status { code: 404, message } => CommandError::new(message).into(),
            CbError::Transport(err) => SessionError::retry(err.to_string()).into(),
            CbError::Timeout(message) => SessionError::retry(message).into(),
            CbError::SessionGone(message) => SessionError::retry(message).into(),
            err @ CbError::Status { .. } => SessionError::fatal(err.to_string()).into(),
        }
    }

    /// Mapping for machine-level operations, where no command is in flight.
    fn into_session_error(self) -> SessionError {
        match self.into_session_failure() {
            SessionFailure::Session(err) => err,
            SessionFailure::Command(err) => SessionError::retry(err.0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SensorDto {
    id: i64,
    computer_name: String,
    status: String,
    #[serde(default)]
    os_type: Option<i32>,
    #[serde(default)]
    last_checkin_time: Option<String>,
}

impl SensorDto {
    fn os(&self) -> OsType {
        match self.os_type {
            Some(1) => OsType::Windows,
            Some(2) => OsType::Mac,
            Some(4) => OsType::Linux,
            _ => OsType::Unknown,
        }
    }

    fn checkin(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_checkin_time.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%z"))
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }
}

#[derive(Debug, Deserialize)]
struct SessionDto {
    id: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct FileUploadDto {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct CbDirEntryDto {
    filename: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    attributes: Vec<String>,
    #[serde(default)]
    create_time: i64,
    #[serde(default)]
    last_access_time: i64,
    #[serde(default)]
    last_write_time: i64,
}

#[derive(Debug, Deserialize)]
struct CbProcessDto {
    pid: u32,
    #[serde(default)]
    parent: u32,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    command_line: Option<String>,
    #[serde(default)]
    create_time: i64,
}

#[derive(Debug, Deserialize)]
struct CommandDto {
    id: i64,
    status: String,
    #[serde(default)]
    result_code: Option<i64>,
    #[serde(default)]
    result_desc: Option<String>,
    #[serde(default)]
    file_id: Option<i64>,
    #[serde(default)]
    files: Option<Vec<CbDirEntryDto>>,
    #[serde(default)]
    processes: Option<Vec<CbProcessDto>>,
    #[serde(default)]
    stdout: Option<String>,
}

struct CbClient {
    http: Client,
    base_url: String,
}

impl CbClient {
    fn new(profile: &CbProfile) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut token =
            HeaderValue::from_str(&profile.token).context("API token is not a valid header")?;
        token.set_sensitive(true);
        headers.insert("X-Auth-Token", token);

        let http = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!profile.ssl_verify)
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build the HTTP client")?;

        Ok(Self {
            http,
            base_url: profile.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn parse<T: DeserializeOwned>(response: Response) -> Result<T, CbError> {
        let status = response.status();
        if !status.is_success() {
            return Err(CbError::Status {
                code: status.as_u16(),
                message: response.text().unwrap_or_default(),
            });
        }
        Ok(response.json()?)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CbError> {
        Self::parse(self.http.get(self.url(path)).send()?)
    }

    fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, CbError> {
        Self::parse(self.http.post(self.url(path)).json(body).send()?)
    }

    fn server_info(&self) -> Result<serde_json::Value, CbError> {
        self.get_json("/api/info")
    }

    fn sensors(&self, hostname: &str) -> Result<Vec<SensorDto>, CbError> {
        Self::parse(
            self.http
                .get(self.url("/api/v1/sensor"))
                .query(&[("hostname", hostname)])
                .send()?,
        )
    }

    fn sensor(&self, id: i64) -> Result<SensorDto, CbError> {
        self.get_json(&format!("/api/v1/sensor/{id}"))
    }

    /// Request a live-response session and poll until it activates.
    fn open_session(&self, sensor_id: i64) -> Result<SessionDto, CbError> {
        let created: SessionDto =
            self.post_json("/api/v1/cblr/session", &json!({ "sensor_id": sensor_id }))?;

        let deadline = Instant::now() + SESSION_ACTIVATION_TIMEOUT;
        loop {
            let current: SessionDto =
                self.get_json(&format!("/api/v1/cblr/session/{}", created.id))?;
            match current.status.as_str() {
                "active" => return Ok(current),
                "pending" => {}
                other => {
                    return Err(CbError::SessionGone(format!(
                        "live-response session entered state {other}"
                    )))
                }
            }
            if Instant::now() >= deadline {
                return Err(CbError::Timeout(
                    "timed out waiting for the live-response session to activate".to_string(),
                ));
            }
            thread::sleep(POLL_SLEEP);
        }
    }

    fn close_session(&self, session_id: i64) {
        let body = json!({ "id": session_id, "session_id": session_id, "status": "close" });
        let result = self
            .http
            .put(self.url(&format!("/api/v1/cblr/session/{session_id}")))
            .json(&body)
            .send();
        if let Err(err) = result {
            debug!("closing live-response session {} failed: {}", session_id, err);
        }
    }

    /// Post a command and poll until it leaves the pending state.
    fn run_command(
        &self,
        session_id: i64,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<CommandDto, CbError> {
        let created: CommandDto =
            self.post_json(&format!("/api/v1/cblr/session/{session_id}/command"), &body)?;

        let deadline = Instant::now() + timeout;
        loop {
            let current: CommandDto = self.get_json(&format!(
                "/api/v1/cblr/session/{session_id}/command/{}",
                created.id
            ))?;
            match current.status.as_str() {
                "complete" => return Ok(current),
                "pending" | "in progress" => {}
                "error" => {
                    let desc = current
                        .result_desc
                        .filter(|d| !d.is_empty())
                        .unwrap_or_else(|| {
                            format!("command failed with code {:?}", current.result_code)
                        });
                    return Err(CbError::Command(desc));
                }
                "canceled" | "cancelled" => {
                    return Err(CbError::Command("command was cancelled".to_string()))
                }
                other => {
                    return Err(CbError::SessionGone(format!(
                        "command entered state {other}"
                    )))
                }
            }
            if Instant::now() >= deadline {
                return Err(CbError::Timeout("command timed out".to_string()));
            }
            thread::sleep(POLL_SLEEP);
        }
    }

    fn file_content(&self, session_id: i64, file_id: i64) -> Result<Vec<u8>, CbError> {
        let response = self
            .http
            .get(self.url(&format!(
                "/api/v1/cblr/session/{session_id}/file/{file_id}/content"
            )))
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(CbError::Status {
                code: status.as_u16(),
                message: response.text().unwrap_or_default(),
            });
        }
        Ok(response.bytes()?.to_vec())
    }

    fn upload_file(&self, session_id: i64, content: Vec<u8>) -> Result<i64, CbError> {
        let part = multipart::Part::bytes(content).file_name("file");
        let form = multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(self.url(&format!("/api/v1/cblr/session/{session_id}/file")))
            .multipart(form)
            .send()?;
        let dto: FileUploadDto = Self::parse(response)?;
        Ok(dto.id)
    }
}

/// A sensor as seen by one Carbon Black server.
pub struct CbMachine {
    client: Arc<CbClient>,
    backend_name: String,
    server_url: String,
    hostname: String,
    sensor: Mutex<SensorDto>,
}

impl Machine for CbMachine {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn backend_name(&self) -> &str {
        &self.backend_name
    }

    fn server_url(&self) -> String {
        self.server_url.clone()
    }

    fn os_type(&self) -> OsType {
        self.sensor().os()
    }

    fn last_checkin(&self) -> Option<DateTime<Utc>> {
        self.sensor().checkin()
    }

    fn can_connect(&self) -> bool {
        self.sensor().status.eq_ignore_ascii_case("online")
    }

    fn refresh(&self) -> Result<(), SessionError> {
        let id = self.sensor().id;
        match self.client.sensor(id) {
            Ok(sensor) => {
                *self.sensor.lock().expect("sensor lock poisoned") = sensor;
                Ok(())
            }
            Err(err) => Err(err.into_session_error()),
        }
    }

    fn connect(&self) -> Result<Box<dyn Session>, SessionError> {
        let id = self.sensor().id;
        let session = self
            .client
            .open_session(id)
            .map_err(CbError::into_session_error)?;
        debug!(
            "live-response session {} open for {}",
            session.id, self.hostname
        );
        Ok(Box::new(CbSession {
            client: Arc::clone(&self.client),
            session_id: session.id,
            os: self.sensor().os(),
        }))
    }
}

impl CbMachine {
    fn sensor(&self) -> SensorDto {
        self.sensor.lock().expect("sensor lock poisoned").clone()
    }
}

/// A live-response session wrapped into the uniform capability set.
pub struct CbSession {
    client: Arc<CbClient>,
    session_id: i64,
    os: OsType,
}

impl CbSession {
    fn command(
        &self,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<CommandDto, SessionFailure> {
        self.client
            .run_command(self.session_id, body, timeout)
            .map_err(CbError::into_session_failure)
    }

    fn parse_attributes(raw: &[String]) -> Vec<FileAttribute> {
        let mut attributes = Vec::new();
        if raw.iter().any(|a| a == "HIDDEN") {
            attributes.push(FileAttribute::Hidden);
        }
        if raw.iter().any(|a| a == "SYSTEM") {
            attributes.push(FileAttribute::System);
        }
        if raw.iter().any(|a| a == "DIRECTORY") {
            attributes.push(FileAttribute::Directory);
        }
        attributes
    }

    fn dir_entries(command: CommandDto) -> Vec<DirEntry> {
        command
            .files
            .unwrap_or_default()
            .into_iter()
            .map(|file| DirEntry {
                name: file.filename,
                size: file.size,
                attributes: Self::parse_attributes(&file.attributes),
                created: epoch(file.create_time),
                accessed: epoch(file.last_access_time),
                modified: epoch(file.last_write_time),
            })
            .collect()
    }
}

impl Session for CbSession {
    fn os_type(&self) -> OsType {
        self.os
    }

    fn list_processes(&mut self) -> Result<Vec<ProcessEntry>, SessionFailure> {
        let command = self.command(
            json!({ "session_id": self.session_id, "name": "process list" }),
            COMMAND_TIMEOUT,
        )?;
        Ok(command
            .processes
            .unwrap_or_default()
            .into_iter()
            .map(|process| ProcessEntry {
                username: process.username.unwrap_or_default(),
                pid: process.pid,
                ppid: process.parent,
                start_time: epoch(process.create_time),
                command_line: process.command_line.unwrap_or_default(),
                path: process.path.unwrap_or_default(),
            })
            .collect())
    }

    fn get_file(&mut self, remote_path: &str) -> Result<Vec<u8>, SessionFailure> {
        let command = self.command(
            json!({ "session_id": self.session_id, "name": "get file", "object": remote_path }),
            COMMAND_TIMEOUT,
        )?;
        let file_id = command
            .file_id
            .ok_or_else(|| CommandError::new("server returned no file id"))?;
        self.client
            .file_content(self.session_id, file_id)
            .map_err(CbError::into_session_failure)
    }

    fn put_file_raw(
        &mut self,
        data: &mut dyn Read,
        remote_path: &str,
    ) -> Result<(), SessionFailure> {
        let mut content = Vec::new();
        data.read_to_end(&mut content)
            .map_err(|err| CommandError::new(format!("reading the source stream: {err}")))?;
        let file_id = self
            .client
            .upload_file(self.session_id, content)
            .map_err(CbError::into_session_failure)?;
        self.command(
            json!({
                "session_id": self.session_id,
                "name": "put file",
                "object": remote_path,
                "file_id": file_id,
            }),
            COMMAND_TIMEOUT,
        )?;
        Ok(())
    }

    fn delete_file(&mut self, remote_path: &str) -> Result<(), SessionFailure> {
        self.command(
            json!({ "session_id": self.session_id, "name": "delete file", "object": remote_path }),
            COMMAND_TIMEOUT,
        )?;
        Ok(())
    }

    fn list_dir(&mut self, remote_path: &str) -> Result<Vec<DirEntry>, SessionFailure> {
        let command = self.command(
            json!({ "session_id": self.session_id, "name": "directory list", "object": remote_path }),
            COMMAND_TIMEOUT,
        )?;
        let entries = Self::dir_entries(command);

        // Listing a directory without a trailing separator returns the
        // directory itself as the single entry; relist its content.
        if entries.len() == 1 && entries[0].is_directory() {
            let relisted = format!("{}{}", remote_path, self.path_separator());
            let command = self.command(
                json!({ "session_id": self.session_id, "name": "directory list", "object": relisted }),
                COMMAND_TIMEOUT,
            )?;
            return Ok(Self::dir_entries(command));
        }
        Ok(entries)
    }

    fn make_dir_single(&mut self, remote_path: &str) -> Result<(), SessionFailure> {
        self.command(
            json!({ "session_id": self.session_id, "name": "create directory", "object": remote_path }),
            COMMAND_TIMEOUT,
        )?;
        Ok(())
    }

    fn start_process(
        &mut self,
        cmd: &str,
        cwd: Option<&str>,
        background: bool,
    ) -> Result<Option<String>, SessionFailure> {
        let mut body = json!({
            "session_id": self.session_id,
            "name": "create process",
            "object": cmd,
            "wait": !background,
        });
        if let Some(cwd) = cwd {
            body["working_directory"] = json!(cwd);
        }

        let timeout = if background {
            COMMAND_TIMEOUT
        } else {
            Duration::from_secs(defaults::FOREGROUND_PROCESS_TIMEOUT_SECS)
        };
        let command = self.command(body, timeout)?;

        if background {
            Ok(None)
        } else {
            Ok(Some(command.stdout.unwrap_or_default()))
        }
    }
}

impl Drop for CbSession {
    fn drop(&mut self) {
        self.client.close_session(self.session_id);
    }
}

/// One Carbon Black server instance, named after its credentials profile.
pub struct CbBackend {
    profile: CbProfile,
    name: String,
    client: Option<Arc<CbClient>>,
}

impl CbBackend {
    pub fn new(profile: CbProfile) -> Self {
        let name = format!("CB-{}", profile.name);
        Self {
            profile,
            name,
            client: None,
        }
    }

    fn client(&self) -> Result<&Arc<CbClient>, SessionError> {
        self.client
            .as_ref()
            .ok_or_else(|| SessionError::fatal("backend is not started"))
    }
}

impl Backend for CbBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_sessions(&self) -> usize {
        self.profile.max_sessions
    }

    fn start(&mut self) -> anyhow::Result<()> {
        let client = CbClient::new(&self.profile)?;
        client
            .server_info()
            .with_context(|| format!("connection check against {} failed", self.profile.url))?;
        info!("connected to profile [{}]", self.profile.name);
        self.client = Some(Arc::new(client));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.client = None;
    }

    fn search_machines(&self, hostname: &str) -> Result<Vec<Box<dyn Machine>>, SessionError> {
        let client = self.client()?;
        let sensors = client
            .sensors(hostname)
            .map_err(CbError::into_session_error)?;

        let mut machines: Vec<Box<dyn Machine>> = Vec::new();
        for sensor in sensors {
            if !sensor.computer_name.eq_ignore_ascii_case(hostname) {
                debug!(
                    "sensor {} ({}) does not match {}; skipping",
                    sensor.id, sensor.computer_name, hostname
                );
                continue;
            }
            machines.push(Box::new(CbMachine {
                client: Arc::clone(client),
                backend_name: self.name.clone(),
                server_url: client.base_url.clone(),
                hostname: sensor.computer_name.clone(),
                sensor: Mutex::new(sensor),
            }));
        }
        Ok(machines)
    }
}

fn epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_os_mapping() {
        let sensor = |os_type| SensorDto {
            id: 1,
            computer_name: "h".to_string(),
            status: "Online".to_string(),
            os_type,
            last_checkin_time: None,
        };
        assert_eq!(sensor(Some(1)).os(), OsType::Windows);
        assert_eq!(sensor(Some(2)).os(), OsType::Mac);
        assert_eq!(sensor(Some(4)).os(), OsType::Linux);
        assert_eq!(sensor(Some(99)).os(), OsType::Unknown);
        assert_eq!(sensor(None).os(), OsType::Unknown);
    }

    #[test]
    fn checkin_accepts_both_server_formats() {
        let sensor = |raw: &str| SensorDto {
            id: 1,
            computer_name: "h".to_string(),
            status: "Online".to_string(),
            os_type: None,
            last_checkin_time: Some(raw.to_string()),
        };
        assert!(sensor("2019-06-01T10:00:00Z").checkin().is_some());
        assert!(sensor("2019-06-01 10:00:00.123456-04:00").checkin().is_some());
        assert!(sensor("yesterday-ish").checkin().is_none());
    }

    #[test]
    fn command_error_stays_in_session() {
        let failure = CbError::Command("no such file".to_string()).into_session_failure();
        assert!(matches!(failure, SessionFailure::Command(_)));

        let failure = CbError::Timeout("slow".to_string()).into_session_failure();
        match failure {
            SessionFailure::Session(err) => assert!(!err.stop),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn unknown_server_errors_stop_the_job() {
        let failure = CbError::Status {
            code: 500,
            message: "boom".to_string(),
        }
        .into_session_failure();
        match failure {
            SessionFailure::Session(err) => assert!(err.stop),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn attribute_parsing_keeps_known_flags() {
        let raw = vec![
            "READONLY".to_string(),
            "HIDDEN".to_string(),
            "SYSTEM".to_string(),
            "DIRECTORY".to_string(),
        ];
        assert_eq!(
            CbSession::parse_attributes(&raw),
            vec![
                FileAttribute::Hidden,
                FileAttribute::System,
                FileAttribute::Directory
            ]
        );
    }
}
