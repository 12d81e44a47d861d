use std::path::{Path, PathBuf};
use std::process::Command;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::config::HttpSettings;
use crate::error::AnnotatorError;

/// Outbound JSON GETs made by http and rest-versioned tasks.
pub trait HttpFetcher: Send + Sync {
    fn get_json(&self, url: &str) -> Result<Value, AnnotatorError>;
}

/// Runs external programs for subprocess datasets and returns stdout.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<String, AnnotatorError>;
}

#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self, AnnotatorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&settings.user_agent)
                .map_err(|err| AnnotatorError::Http(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        // The blocking client defaults to a 30s timeout; `None` disables it.
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| AnnotatorError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestFetcher {
    fn get_json(&self, url: &str) -> Result<Value, AnnotatorError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| AnnotatorError::Http(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "annotation request failed".to_string());
            return Err(AnnotatorError::HttpStatus { status, message });
        }
        response
            .json()
            .map_err(|err| AnnotatorError::Json(err.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    cwd: Option<PathBuf>,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
        }
    }

    fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, AnnotatorError> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = self.cwd() {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .map_err(|err| AnnotatorError::Command(format!("{program}: {err}")))?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("{program} exited with {}", output.status)
        } else {
            stderr
        };
        Err(AnnotatorError::Command(message))
    }
}
