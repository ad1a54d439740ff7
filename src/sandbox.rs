//! Container sandbox bring-up: engine detection and install, daemon start,
//! build context, image build, container restart and viewer launch.
//!
//! Every entry point runs on its own worker thread, claims the sandbox
//! session on the board first, and reports the outcome as a status string.
//! Failures never reach the repair run.

use crate::board::Board;
use crate::config::{Config, Sandbox};
use crate::elevation::shell_single_quote;
use crate::error::FixError;
use crate::shell::{execute, CommandRunner, RunOptions, ShellResult};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;

pub const DOCKERFILE_TEMPLATE: &str = include_str!("../assets/Dockerfile");
pub const ENTRYPOINT_TEMPLATE: &str = include_str!("../assets/entrypoint.sh");

const DOCKER_INFO: &str = "docker info --format '{{.ServerVersion}}'";

/// Replaces every `{{KEY}}` in `template` with its value.
pub fn substitute_placeholders(template: &str, variables: &HashMap<&str, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }
    result
}

pub fn render_template(template: &str, sandbox: &Sandbox) -> String {
    let variables = HashMap::from([
        ("USER", sandbox.container_user.clone()),
        ("VNC_PORT", sandbox.vnc_port.to_string()),
        ("WEB_PORT", sandbox.web_port.to_string()),
    ]);
    substitute_placeholders(template, &variables)
}

/// Writes the build definition and an executable entrypoint into a fresh
/// `zoomfixer-docker-*` directory. The directory is removed when the
/// returned handle drops.
pub fn materialize_context(sandbox: &Sandbox) -> Result<TempDir, FixError> {
    let dir = tempfile::Builder::new()
        .prefix("zoomfixer-docker-")
        .tempdir()?;
    fs::write(
        dir.path().join("Dockerfile"),
        render_template(DOCKERFILE_TEMPLATE, sandbox),
    )?;
    let entrypoint = dir.path().join("entrypoint.sh");
    fs::write(&entrypoint, render_template(ENTRYPOINT_TEMPLATE, sandbox))?;
    make_executable(&entrypoint)?;
    Ok(dir)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), FixError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), FixError> {
    Ok(())
}

#[derive(Clone)]
pub struct SandboxOrchestrator {
    cfg: Arc<Config>,
    runner: Arc<dyn CommandRunner>,
    board: Board,
    sleeper: fn(Duration),
}

impl SandboxOrchestrator {
    pub fn new(cfg: Arc<Config>, runner: Arc<dyn CommandRunner>, board: Board) -> Self {
        Self {
            cfg,
            runner,
            board,
            sleeper: thread::sleep,
        }
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: fn(Duration)) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn settings(&self) -> &Sandbox {
        &self.cfg.sandbox
    }

    fn running_status(&self) -> String {
        format!(
            "Sandbox running. Open {} (noVNC) or VNC to localhost:{}.",
            self.settings().viewer_url(),
            self.settings().vnc_port
        )
    }

    fn spawn<F>(&self, flow: F) -> JoinHandle<bool>
    where
        F: FnOnce(&SandboxOrchestrator) -> bool + Send + 'static,
    {
        let this = self.clone();
        thread::spawn(move || flow(&this))
    }

    // ---- entry points ----

    pub fn check(&self) -> Option<JoinHandle<bool>> {
        if !self.board.try_begin_sandbox(false, "Checking Docker...", None, None) {
            return None;
        }
        Some(self.spawn(|this| match this.ensure_available() {
            Ok(()) => {
                this.board.set_sandbox(
                    "Docker is available. You can launch the sandbox.",
                    false,
                    None,
                    None,
                );
                true
            }
            Err(err) => {
                this.board.sandbox_log(&format!("[docker] {err}"));
                this.board
                    .set_sandbox(&format!("Docker check failed: {err}"), false, None, None);
                false
            }
        }))
    }

    pub fn launch(&self) -> Option<JoinHandle<bool>> {
        if !self
            .board
            .try_begin_sandbox(false, "Preparing Docker sandbox...", None, None)
        {
            return None;
        }
        Some(self.spawn(|this| {
            let outcome = this.launch_flow().map(|()| this.open_viewer());
            match outcome {
                Ok(()) => {
                    this.board
                        .set_sandbox(&this.running_status(), false, None, None);
                    true
                }
                Err(err) => {
                    this.board.sandbox_log(&format!("[docker] {err}"));
                    this.board
                        .set_sandbox(&format!("Docker sandbox failed: {err}"), false, None, None);
                    false
                }
            }
        }))
    }

    /// One-click flow: installs the engine when missing, starts its daemon,
    /// then launches and opens the viewer.
    pub fn auto(&self) -> Option<JoinHandle<bool>> {
        if !self.board.try_begin_sandbox(
            true,
            "Preparing Docker automatically...",
            Some(true),
            Some(true),
        ) {
            return None;
        }
        Some(self.spawn(|this| {
            let (status, ok) = match this.auto_flow() {
                Ok(()) => (this.running_status(), true),
                Err(err) => {
                    this.board.sandbox_log(&format!("[docker] {err}"));
                    (format!("Auto-setup failed: {err}"), false)
                }
            };
            this.board
                .set_sandbox(&status, false, Some(false), Some(false));
            ok
        }))
    }

    pub fn install(&self) -> Option<JoinHandle<bool>> {
        if !self.board.try_begin_sandbox(
            true,
            "Installing Docker Desktop via Homebrew...",
            Some(true),
            None,
        ) {
            return None;
        }
        Some(self.spawn(|this| {
            let (status, ok) = match this.install_engine() {
                Ok(()) => (
                    "Docker Desktop installed. Launch it, wait for daemon to start, then re-check."
                        .to_string(),
                    true,
                ),
                Err(err) => {
                    this.board.sandbox_log(&format!("[docker-install] {err}"));
                    (format!("Docker install via Homebrew failed: {err}"), false)
                }
            };
            this.board.set_sandbox(&status, false, Some(false), None);
            ok
        }))
    }

    /// Opens the engine's download page. Leaves the in-flight flags alone.
    pub fn open_download_page(&self) {
        self.board
            .set_sandbox_status("Opening Docker Desktop download page...");
        self.open_url(&self.settings().download_page);
    }

    // ---- sub-steps ----

    fn auto_flow(&self) -> Result<(), FixError> {
        if self.runner.locate("docker").is_none() {
            self.board
                .sandbox_log("[docker] Docker not found, attempting Homebrew install...");
            self.install_engine()?;
        }
        self.start_daemon_if_needed()?;
        self.launch_flow()?;
        self.open_viewer();
        Ok(())
    }

    fn launch_flow(&self) -> Result<(), FixError> {
        self.ensure_available()?;
        let context = materialize_context(self.settings())?;
        self.build_image(context.path())?;
        self.run_container()
    }

    fn docker_info(&self) -> Result<ShellResult, FixError> {
        execute(self.runner.as_ref(), DOCKER_INFO, RunOptions::allow_failure(), None)
    }

    fn ensure_available(&self) -> Result<(), FixError> {
        if self.runner.locate("docker").is_none() {
            return Err(FixError::EngineNotFound);
        }
        let info = self.docker_info()?;
        if !info.success() {
            let detail = info.output.trim();
            return Err(FixError::DaemonUnavailable {
                detail: if detail.is_empty() {
                    "docker info failed".to_string()
                } else {
                    detail.to_string()
                },
            });
        }
        self.board.sandbox_log("[docker] Docker daemon is running");
        Ok(())
    }

    fn install_engine(&self) -> Result<(), FixError> {
        if self.runner.locate("brew").is_none() {
            return Err(FixError::BrewMissing);
        }
        let board = &self.board;
        let mut stream = |line: &str| board.sandbox_log(&format!("[docker-install] {line}"));
        execute(
            self.runner.as_ref(),
            &format!(
                "brew install --cask {}",
                shell_single_quote(&self.settings().engine_cask)
            ),
            RunOptions::checked(),
            Some(&mut stream),
        )?;
        self.board
            .sandbox_log("[docker-install] Docker Desktop installed via Homebrew");
        Ok(())
    }

    fn start_daemon_if_needed(&self) -> Result<(), FixError> {
        if self.docker_info()?.success() {
            self.board.sandbox_log("[docker] Docker daemon already running");
            return Ok(());
        }

        self.board.sandbox_log("[docker] Starting Docker Desktop...");
        let open = format!("open -ga {}", shell_single_quote(&self.settings().engine_app));
        let _ = execute(self.runner.as_ref(), &open, RunOptions::allow_failure(), None);

        let attempts = self.settings().daemon_poll_attempts;
        for attempt in 1..=attempts {
            if self.docker_info()?.success() {
                self.board.sandbox_log("[docker] Docker daemon is now running");
                return Ok(());
            }
            self.board.sandbox_log(&format!(
                "[docker] Waiting for Docker daemon ({attempt}/{attempts})..."
            ));
            if attempt < attempts {
                (self.sleeper)(self.settings().poll_interval());
            }
        }
        Err(FixError::DaemonDidNotStart)
    }

    fn build_image(&self, context: &Path) -> Result<(), FixError> {
        let image = &self.settings().image;
        let command = format!(
            "docker build -t {} {}",
            shell_single_quote(image),
            shell_single_quote(&context.to_string_lossy())
        );
        let board = &self.board;
        let mut stream = |line: &str| board.sandbox_log(&format!("[docker] {line}"));
        execute(self.runner.as_ref(), &command, RunOptions::checked(), Some(&mut stream))?;
        self.board
            .sandbox_log(&format!("[docker] Image ready: {image}"));
        Ok(())
    }

    fn run_container(&self) -> Result<(), FixError> {
        let s = self.settings();
        let name = shell_single_quote(&s.container_name);
        let board = &self.board;
        let mut stream = |line: &str| board.sandbox_log(&format!("[docker] {line}"));

        let existing = execute(
            self.runner.as_ref(),
            &format!("docker ps -a --filter name={name} --format '{{{{.Names}}}}'"),
            RunOptions::allow_failure(),
            None,
        )?;
        if existing
            .output
            .lines()
            .any(|line| line.trim() == s.container_name)
        {
            execute(
                self.runner.as_ref(),
                &format!("docker rm -f {name}"),
                RunOptions::checked(),
                Some(&mut stream),
            )?;
        }

        let run = format!(
            "docker run -d --rm --name {name} -p {vnc}:{vnc} -p {web}:{web} -v {volume}:{home} {image}",
            vnc = s.vnc_port,
            web = s.web_port,
            volume = shell_single_quote(&s.volume),
            home = shell_single_quote(&format!("/home/{}", s.container_user)),
            image = shell_single_quote(&s.image),
        );
        let result = execute(self.runner.as_ref(), &run, RunOptions::checked(), Some(&mut stream))?;
        if let Some(id) = result
            .output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
        {
            self.board.sandbox_log(&format!("[docker] Container id: {id}"));
        }
        Ok(())
    }

    fn open_viewer(&self) {
        self.open_url(&self.settings().viewer_url());
    }

    fn open_url(&self, url: &str) {
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        };
        let command = format!("{opener} {}", shell_single_quote(url));
        let _ = execute(self.runner.as_ref(), &command, RunOptions::allow_failure(), None);
    }
}
