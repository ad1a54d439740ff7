mod board;
mod config;
mod discovery;
mod elevation;
mod error;
mod fetch;
mod pipeline;
mod repair;
mod sandbox;
mod shell;

use board::{Board, BoardEvent, RunStatus};
use clap::{Parser, Subcommand};
use config::{expand_path, load_config, read_config, Config, DEFAULT_CONFIG_YAML};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use dirs::home_dir;
use error::FixError;
use fetch::HttpFetcher;
use repair::RepairService;
use sandbox::SandboxOrchestrator;
use serde::Serialize;
use serde_json::json;
use shell::{CommandRunner, ShellExecutor};
use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const RENDER_POLL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "zoomfix", version, about = "Repair a broken Zoom install on macOS")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Kill, clean, remove, download and reinstall Zoom.
    Repair {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Run Zoom inside a Docker container with a browser-viewable desktop.
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Doctor,
    Logs {
        #[command(subcommand)]
        command: LogsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SandboxCommand {
    Check,
    Launch,
    Install,
    Auto,
    DownloadPage,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Edit,
    Show,
}

#[derive(Subcommand, Debug)]
enum LogsCommand {
    Tail {
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

fn main() -> Result<(), FixError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);

    let result = match cli.command {
        Commands::Repair { yes } => handle_repair(&ctx, yes),
        Commands::Sandbox { command } => handle_sandbox(&ctx, command),
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Doctor => handle_doctor(&ctx),
        Commands::Logs { command } => handle_logs(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_code: Some(err.code().to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{}", style(err.to_string()).red());
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("ZOOMFIX_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("ZOOMFIX_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("zoomfix");
    base
}

fn ensure_parent(path: &Path) -> Result<(), FixError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

// ---- repair ----

fn handle_repair(ctx: &Context, yes: bool) -> Result<(), FixError> {
    let cfg = load_config(&ctx.config_path)?;

    if !yes && !ctx.json {
        if !io::stdin().is_terminal() {
            return Err(FixError::Process(
                "repair needs confirmation; re-run with --yes".to_string(),
            ));
        }
        println!("{}", style("Zoom repair").bold().cyan());
        println!(
            "{}",
            style("Quits Zoom, deletes its cache, preferences, logs and installations, then installs the latest release.").dim()
        );
        let proceed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Continue?")
            .default(false)
            .interact()?;
        if !proceed {
            return output(ctx, json!({"started": false}));
        }
    }

    let board = Board::new(cfg.paths.events_path());
    let fetcher = HttpFetcher::new(&cfg.download.user_agent)?;
    let service = RepairService::new(
        Arc::new(cfg),
        Arc::new(ShellExecutor),
        Arc::new(fetcher),
        board.clone(),
    );
    let handle = service
        .start_repair()
        .ok_or_else(|| FixError::Process("a repair run is already in progress".to_string()))?;

    let mut renderer = Renderer::new(ctx.json);
    follow(&board, &handle, &mut renderer);
    service.wait(handle);
    renderer.drain(&board);

    let snapshot = board.run_snapshot();
    let ok = snapshot.status == RunStatus::Success;
    if !ctx.json {
        let summary = style(&snapshot.status_message).bold();
        let summary = match snapshot.status {
            RunStatus::Success => summary.green(),
            RunStatus::Warning => summary.yellow(),
            _ => summary.red(),
        };
        println!("{summary}");
    }
    let message = snapshot.status_message.clone();
    report_outcome(ctx, ok, serde_json::to_value(&snapshot)?, message)
}

// ---- sandbox ----

fn handle_sandbox(ctx: &Context, command: SandboxCommand) -> Result<(), FixError> {
    let cfg = load_config(&ctx.config_path)?;
    let board = Board::new(cfg.paths.events_path());
    let orchestrator =
        SandboxOrchestrator::new(Arc::new(cfg), Arc::new(ShellExecutor), board.clone());

    let handle = match command {
        SandboxCommand::DownloadPage => {
            orchestrator.open_download_page();
            let snapshot = board.sandbox_snapshot();
            return output(ctx, json!({"status": snapshot.status}));
        }
        SandboxCommand::Check => orchestrator.check(),
        SandboxCommand::Launch => orchestrator.launch(),
        SandboxCommand::Install => orchestrator.install(),
        SandboxCommand::Auto => orchestrator.auto(),
    }
    .ok_or_else(|| FixError::Process("a sandbox operation is already in progress".to_string()))?;

    let mut renderer = Renderer::new(ctx.json);
    follow(&board, &handle, &mut renderer);
    let ok = handle.join().unwrap_or(false);
    renderer.drain(&board);

    let snapshot = board.sandbox_snapshot();
    let message = snapshot.status.clone();
    report_outcome(ctx, ok, serde_json::to_value(&snapshot)?, message)
}

/// Renders board events until the worker behind `handle` has finished.
fn follow<T>(board: &Board, handle: &JoinHandle<T>, renderer: &mut Renderer) {
    loop {
        let finished = handle.is_finished();
        for event in board.wait_events(renderer.last_id, RENDER_POLL) {
            renderer.render(&event);
        }
        if finished {
            break;
        }
    }
}

struct Renderer {
    quiet: bool,
    last_id: u64,
    last_percent: Option<u32>,
}

impl Renderer {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            last_id: 0,
            last_percent: None,
        }
    }

    fn drain(&mut self, board: &Board) {
        for event in board.wait_events(self.last_id, Duration::ZERO) {
            self.render(&event);
        }
    }

    fn render(&mut self, event: &BoardEvent) {
        self.last_id = self.last_id.max(event.id);
        if self.quiet {
            return;
        }
        match event.event_type.as_str() {
            "run.log" | "sandbox.log" => {
                if let Some(line) = event.payload["line"].as_str() {
                    println!("{}", styled_line(line));
                }
            }
            "run.progress" => {
                let label = event.payload["label"].as_str().unwrap_or_default();
                let value = event.payload["progress"].as_f64();
                if let Some(line) = self.progress_line(label, value) {
                    println!("{}", style(line).dim());
                }
            }
            "sandbox.status" => {
                if let Some(status) = event.payload["status"].as_str() {
                    println!("{}", style(status).cyan());
                }
            }
            _ => {}
        }
    }

    /// One line per whole percent; an indeterminate phase prints its label once.
    fn progress_line(&mut self, label: &str, value: Option<f64>) -> Option<String> {
        match value {
            Some(fraction) => {
                let percent = (fraction.clamp(0.0, 1.0) * 100.0).floor() as u32;
                if self.last_percent == Some(percent) {
                    return None;
                }
                self.last_percent = Some(percent);
                Some(format!("{label}: {percent}%"))
            }
            None => {
                self.last_percent = None;
                Some(format!("{label}..."))
            }
        }
    }
}

fn styled_line(line: &str) -> String {
    if line.starts_with("[ok]") {
        style(line).green().to_string()
    } else if line.starts_with("[error]") {
        style(line).red().to_string()
    } else if line.starts_with("== ") {
        style(line).bold().to_string()
    } else {
        line.to_string()
    }
}

fn report_outcome(
    ctx: &Context,
    ok: bool,
    result: serde_json::Value,
    message: String,
) -> Result<(), FixError> {
    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(result),
            error: if ok { None } else { Some(message) },
            error_code: None,
        };
        print_json(&payload)?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }
    if ok {
        Ok(())
    } else {
        Err(FixError::Process(message))
    }
}

// ---- config ----

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), FixError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Edit => {
            if !ctx.config_path.exists() {
                ensure_parent(&ctx.config_path)?;
                fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            }
            let editor = env::var("VISUAL").ok().or_else(|| env::var("EDITOR").ok());
            let Some(editor) = editor else {
                return Err(FixError::Process(
                    "EDITOR is not set; please edit the config file manually".to_string(),
                ));
            };
            let status = Command::new(editor)
                .arg(&ctx.config_path)
                .status()
                .map_err(|err| FixError::Process(format!("failed to launch editor: {err}")))?;
            if !status.success() {
                return Err(FixError::Process("editor exited with error".to_string()));
            }
            output(ctx, json!({"path": ctx.config_path}))
        }
        ConfigCommand::Validate => {
            if !ctx.config_path.exists() {
                return Err(FixError::Config(format!(
                    "no config at {}; run `zoomfix config init` first",
                    ctx.config_path.display()
                )));
            }
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            output(
                ctx,
                json!({
                    "path": ctx.config_path,
                    "exists": ctx.config_path.exists(),
                    "config": cfg,
                }),
            )
        }
    }
}

// ---- doctor ----

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    message: String,
    remediation: String,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    message: impl Into<String>,
    remediation: impl Into<String>,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        message: message.into(),
        remediation: remediation.into(),
    }
}

fn collect_doctor_checks(ctx: &Context, runner: &dyn CommandRunner) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    let bash = Path::new(shell::SHELL).exists();
    checks.push(doctor_check(
        "shell",
        bash,
        "error",
        if bash {
            format!("{} found", shell::SHELL)
        } else {
            format!("{} is missing", shell::SHELL)
        },
        "zoomfix runs every step through bash",
    ));

    let osascript = Path::new(elevation::OSASCRIPT).exists();
    checks.push(doctor_check(
        "elevation",
        osascript,
        "warn",
        if osascript {
            "osascript found".to_string()
        } else {
            format!("{} is missing; the privileged install step will fail", elevation::OSASCRIPT)
        },
        "run repair on macOS",
    ));

    let cfg = match load_config(&ctx.config_path) {
        Ok(cfg) => {
            checks.push(doctor_check(
                "config",
                true,
                "error",
                if ctx.config_path.exists() {
                    format!("config valid at {}", ctx.config_path.display())
                } else {
                    "no config file; using built-in defaults".to_string()
                },
                "",
            ));
            cfg
        }
        Err(err) => {
            checks.push(doctor_check(
                "config",
                false,
                "error",
                err.to_string(),
                "fix the file with `zoomfix config edit`",
            ));
            Config::default()
        }
    };

    for (program, remediation) in [
        ("docker", "install Docker Desktop or run `zoomfix sandbox install`"),
        ("brew", "install Homebrew from https://brew.sh"),
    ] {
        let found = runner.locate(program);
        checks.push(doctor_check(
            program,
            found.is_some(),
            "warn",
            match found {
                Some(path) => format!("{program} at {}", path.display()),
                None => format!("{program} not found on PATH"),
            },
            remediation,
        ));
    }

    let installed: Vec<String> = cfg
        .target
        .install_candidates
        .iter()
        .chain(cfg.target.user_install_candidates.iter())
        .map(|candidate| expand_path(candidate))
        .filter(|path| Path::new(path).exists())
        .collect();
    checks.push(doctor_check(
        "zoom",
        !installed.is_empty(),
        "warn",
        if installed.is_empty() {
            "no Zoom installation found".to_string()
        } else {
            format!("Zoom installed at {}", installed.join(", "))
        },
        "run `zoomfix repair` to install the latest release",
    ));

    checks
}

fn handle_doctor(ctx: &Context) -> Result<(), FixError> {
    let checks = collect_doctor_checks(ctx, &ShellExecutor);
    let failed_error = checks
        .iter()
        .find(|check| !check.ok && check.severity == "error")
        .map(|check| check.message.clone());
    let ok = failed_error.is_none();

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error: failed_error,
            error_code: None,
        };
        print_json(&payload)?;
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok {
            style("ok").green()
        } else if check.severity == "error" {
            style("fail").red()
        } else {
            style("warn").yellow()
        };
        println!("[{}] {} ({}) - {}", state, check.id, check.severity, check.message);
        if !check.ok && !check.remediation.is_empty() {
            println!("  remediation: {}", check.remediation);
        }
    }
    match failed_error {
        None => Ok(()),
        Some(message) => Err(FixError::Process(message)),
    }
}

// ---- logs ----

fn handle_logs(ctx: &Context, command: LogsCommand) -> Result<(), FixError> {
    match command {
        LogsCommand::Tail { lines } => logs_tail(ctx, lines),
    }
}

fn logs_tail(ctx: &Context, lines: usize) -> Result<(), FixError> {
    let cfg = load_config(&ctx.config_path)?;
    let target = cfg.paths.events_path().ok_or_else(|| {
        FixError::Config("paths.log_root is empty; event logging is disabled".to_string())
    })?;
    if !target.exists() {
        return Err(FixError::Process(format!(
            "log not found: {}",
            target.display()
        )));
    }
    let content = fs::read_to_string(&target)?;
    let lines_vec: Vec<&str> = content.lines().collect();
    let start = lines_vec.len().saturating_sub(lines);
    if ctx.json {
        let events: Vec<serde_json::Value> = lines_vec[start..]
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        return output(ctx, json!({"path": target, "events": events}));
    }
    for line in &lines_vec[start..] {
        println!("{}", line);
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), FixError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_code: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), FixError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
