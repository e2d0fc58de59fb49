//! Workload scenario drivers.
//!
//! A trace only sees the syscalls the target actually makes, so each session
//! is paired with a driver that exercises a representative workload:
//! startup, a few requests, shutdown.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use syswarden_common::error::{Result, SyswardenError};

/// Drives a workload against a traced target.
pub trait ScenarioDriver: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Runs the workload. `target_pid` is the traced process.
    ///
    /// # Errors
    ///
    /// Returns `SyswardenError::Scenario` if the workload did not behave as
    /// expected.
    fn drive(&self, target_pid: u32) -> Result<()>;
}

/// Lets the target start up and settle without sending it any work.
#[derive(Debug, Clone)]
pub struct IdleScenario {
    settle: Duration,
}

impl IdleScenario {
    /// Creates a driver that waits `settle` before finishing.
    #[must_use]
    pub const fn new(settle: Duration) -> Self {
        Self { settle }
    }
}

impl ScenarioDriver for IdleScenario {
    fn name(&self) -> &str {
        "idle"
    }

    fn drive(&self, _target_pid: u32) -> Result<()> {
        std::thread::sleep(self.settle);
        Ok(())
    }
}

/// Runs an external command as the workload driver.
///
/// The traced PID is exported to the command as `SYSWARDEN_TARGET_PID`.
#[derive(Debug, Clone)]
pub struct CommandScenario {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandScenario {
    /// Creates a driver running `program args...`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl ScenarioDriver for CommandScenario {
    fn name(&self) -> &str {
        "command"
    }

    fn drive(&self, target_pid: u32) -> Result<()> {
        tracing::debug!(program = %self.program.display(), target_pid, "running driver command");
        let status = std::process::Command::new(&self.program)
            .args(&self.args)
            .env("SYSWARDEN_TARGET_PID", target_pid.to_string())
            .status()
            .map_err(|e| SyswardenError::io(&self.program, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(SyswardenError::Scenario {
                scenario: self.name().into(),
                message: format!("{} exited with {status}", self.program.display()),
            })
        }
    }
}

/// HTTP method of a scripted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`.
    Get,
    /// `POST`.
    Post,
}

/// Request body of a scripted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum HttpBody {
    /// URL-encoded form fields.
    Form(Vec<(String, String)>),
    /// A JSON document.
    Json(serde_json::Value),
}

/// One scripted request; it passes when the response status matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Path relative to the base URL.
    pub path: String,
    /// Optional body.
    #[serde(default)]
    pub body: Option<HttpBody>,
    /// Expected status code.
    #[serde(default = "default_status")]
    pub expect_status: u16,
}

const fn default_status() -> u16 {
    200
}

/// Sends a scripted sequence of HTTP requests to the traced service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpScenario {
    /// Base URL of the service, e.g. `http://127.0.0.1:5000`.
    pub base_url: String,
    /// Requests sent in order once the service answers.
    pub requests: Vec<HttpRequest>,
    /// How long to wait for the service to start answering, in milliseconds.
    #[serde(default = "default_startup_ms")]
    pub startup_timeout_ms: u64,
    /// Per-request timeout, in milliseconds.
    #[serde(default = "default_request_ms")]
    pub request_timeout_ms: u64,
}

const fn default_startup_ms() -> u64 {
    10_000
}

const fn default_request_ms() -> u64 {
    10_000
}

impl HttpScenario {
    /// The default request script for a small web service: load the main
    /// page, submit a form that writes a file, and call a JSON write API.
    #[must_use]
    pub fn web_service(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            requests: vec![
                HttpRequest {
                    method: HttpMethod::Get,
                    path: "/".into(),
                    body: None,
                    expect_status: 200,
                },
                HttpRequest {
                    method: HttpMethod::Post,
                    path: "/write".into(),
                    body: Some(HttpBody::Form(vec![("content".into(), "test_content".into())])),
                    expect_status: 200,
                },
                HttpRequest {
                    method: HttpMethod::Post,
                    path: "/api/write".into(),
                    body: Some(HttpBody::Json(serde_json::json!({ "text": "api_test_content" }))),
                    expect_status: 200,
                },
            ],
            startup_timeout_ms: default_startup_ms(),
            request_timeout_ms: default_request_ms(),
        }
    }

    /// Loads a request script from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| SyswardenError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn failure(&self, message: String) -> SyswardenError {
        SyswardenError::Scenario {
            scenario: self.name().into(),
            message,
        }
    }

    fn wait_until_ready(&self, client: &reqwest::blocking::Client) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.startup_timeout_ms);
        loop {
            if client.get(self.url("/")).send().is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(self.failure(format!(
                    "service at {} did not answer within {} ms",
                    self.base_url, self.startup_timeout_ms
                )));
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn send(&self, client: &reqwest::blocking::Client, req: &HttpRequest) -> Result<()> {
        let url = self.url(&req.path);
        let builder = match req.method {
            HttpMethod::Get => client.get(&url),
            HttpMethod::Post => client.post(&url),
        };
        let builder = match &req.body {
            None => builder,
            Some(HttpBody::Form(fields)) => builder.form(fields),
            Some(HttpBody::Json(value)) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(value)?),
        };
        let response = builder
            .send()
            .map_err(|e| self.failure(format!("{:?} {url}: {e}", req.method)))?;
        let status = response.status().as_u16();
        tracing::debug!(method = ?req.method, %url, status, "scenario request");
        if status == req.expect_status {
            Ok(())
        } else {
            Err(self.failure(format!(
                "{:?} {url} returned {status}, expected {}",
                req.method, req.expect_status
            )))
        }
    }
}

impl ScenarioDriver for HttpScenario {
    fn name(&self) -> &str {
        "http"
    }

    fn drive(&self, _target_pid: u32) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(self.request_timeout_ms))
            .build()
            .map_err(|e| self.failure(format!("cannot build HTTP client: {e}")))?;
        self.wait_until_ready(&client)?;
        for req in &self.requests {
            self.send(&client, req)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_service_script_covers_read_and_write_paths() {
        let s = HttpScenario::web_service("http://127.0.0.1:5000/");
        assert_eq!(s.requests.len(), 3);
        assert_eq!(s.url("/write"), "http://127.0.0.1:5000/write");
    }

    #[test]
    fn script_loads_from_json_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scenario.json");
        std::fs::write(
            &path,
            r#"{
                "base_url": "http://localhost:8080",
                "requests": [
                    { "method": "GET", "path": "/health" },
                    { "method": "POST", "path": "/items",
                      "body": { "kind": "json", "value": { "id": 1 } },
                      "expect_status": 201 }
                ]
            }"#,
        )
        .expect("write");

        let s = HttpScenario::load(&path).expect("load");
        assert_eq!(s.requests[0].expect_status, 200);
        assert_eq!(s.requests[1].expect_status, 201);
        assert_eq!(s.startup_timeout_ms, 10_000);
    }

    #[test]
    fn unreachable_service_fails_after_startup_timeout() {
        let mut s = HttpScenario::web_service("http://127.0.0.1:9");
        s.startup_timeout_ms = 0;
        s.request_timeout_ms = 200;
        let err = s.drive(0).unwrap_err();
        assert!(matches!(err, SyswardenError::Scenario { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn command_scenario_reports_exit_status() {
        assert!(CommandScenario::new("true", Vec::new()).drive(1).is_ok());
        assert!(CommandScenario::new("false", Vec::new()).drive(1).is_err());
    }
}
