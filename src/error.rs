use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixError {
    #[error("{command} failed with code {exit_code}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("download failed with status {status_code}")]
    DownloadFailed { status_code: u16 },
    #[error("Docker CLI not found. Install Docker Desktop and ensure `docker` is on your PATH.")]
    EngineNotFound,
    #[error("Docker daemon unavailable. Start Docker Desktop and retry. Details: {detail}")]
    DaemonUnavailable { detail: String },
    #[error("Docker daemon did not start. Please open Docker Desktop and retry.")]
    DaemonDidNotStart,
    #[error("Homebrew not installed. Install Homebrew or use the Docker Desktop download.")]
    BrewMissing,
    #[error("installer not available")]
    MissingInstaller,
    #[error("Zoom not found after install")]
    VerificationFailed,
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
}

impl FixError {
    /// Stable identifier surfaced in JSON envelopes and event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            FixError::CommandFailed { .. } => "command_failed",
            FixError::DownloadFailed { .. } => "download_failed",
            FixError::EngineNotFound => "engine_not_found",
            FixError::DaemonUnavailable { .. } => "daemon_unavailable",
            FixError::DaemonDidNotStart => "daemon_did_not_start",
            FixError::BrewMissing => "brew_missing",
            FixError::MissingInstaller => "missing_installer",
            FixError::VerificationFailed => "verification_failed",
            FixError::Config(_) => "config_invalid",
            FixError::Io(_) => "io_error",
            FixError::Prompt(_) => "prompt_error",
            FixError::Yaml(_) => "yaml_error",
            FixError::Json(_) => "json_error",
            FixError::Http(_) => "http_error",
            FixError::Process(_) => "process_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_message_carries_command_and_code() {
        let err = FixError::CommandFailed {
            command: "/bin/bash -lc false".to_string(),
            exit_code: 1,
            output: "".to_string(),
        };
        assert_eq!(err.to_string(), "/bin/bash -lc false failed with code 1: ");
        assert_eq!(err.code(), "command_failed");
    }

    #[test]
    fn daemon_unavailable_includes_detail() {
        let err = FixError::DaemonUnavailable {
            detail: "Cannot connect to the Docker daemon".to_string(),
        };
        assert!(err.to_string().contains("Cannot connect to the Docker daemon"));
        assert_eq!(err.code(), "daemon_unavailable");
    }
}
