use crate::board::{Board, RunStatus};
use crate::config::{expand_path, Config};
use crate::discovery::{discover, partition};
use crate::elevation::shell_single_quote;
use crate::error::FixError;
use crate::fetch::ArtifactFetcher;
use crate::pipeline::{run_steps, Step};
use crate::shell::{execute, CommandRunner, RunOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const DOWNLOAD_LABEL: &str = "Downloading Zoom";

/// Run-scoped state threaded through the repair steps.
pub struct RepairJob {
    cfg: Arc<Config>,
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn ArtifactFetcher>,
    board: Board,
    discovered: Vec<PathBuf>,
    admin_paths: Vec<PathBuf>,
    installer: Option<PathBuf>,
}

pub fn repair_steps() -> Vec<Step<RepairJob>> {
    vec![
        Step::new("Kill Zoom processes", RepairJob::kill_processes),
        Step::new("Clear Zoom cache", RepairJob::clear_cache),
        Step::new("Clear Zoom preferences", RepairJob::clear_preferences),
        Step::new("Remove Zoom logs", RepairJob::remove_logs),
        Step::new("Find duplicate installations", RepairJob::find_installations),
        Step::new("Remove all Zoom installations", RepairJob::remove_installations),
        Step::new("Download latest Zoom", RepairJob::download_latest),
        Step::new("Install & repair with admin tasks", RepairJob::privileged_install),
        Step::new("Verify installation", RepairJob::verify_installation),
    ]
}

impl RepairJob {
    pub fn new(
        cfg: Arc<Config>,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn ArtifactFetcher>,
        board: Board,
    ) -> Self {
        Self {
            cfg,
            runner,
            fetcher,
            board,
            discovered: Vec::new(),
            admin_paths: Vec::new(),
            installer: None,
        }
    }

    fn shell(&self, command: &str) -> Result<(), FixError> {
        execute(self.runner.as_ref(), command, RunOptions::checked(), None).map(|_| ())
    }

    fn kill_processes(&mut self) -> Result<(), FixError> {
        for name in &self.cfg.target.process_names {
            let pattern = shell_single_quote(&self_excluding_pattern(name));
            self.shell(&format!("pkill -9 -f {pattern} || true"))?;
            self.shell(&format!("pkill -9 -x {} || true", shell_single_quote(name)))?;
        }
        Ok(())
    }

    fn clear_cache(&mut self) -> Result<(), FixError> {
        self.remove_dirs(&self.cfg.target.cache_dirs)
    }

    fn clear_preferences(&mut self) -> Result<(), FixError> {
        let target = &self.cfg.target;
        let dir = shell_single_quote(&expand_path(&target.preferences_dir));
        // The glob stays outside the quotes so the shell expands it.
        self.shell(&format!("rm -f {dir}/{}", target.preferences_glob))
    }

    fn remove_logs(&mut self) -> Result<(), FixError> {
        self.remove_dirs(&self.cfg.target.log_dirs)
    }

    fn remove_dirs(&self, dirs: &[String]) -> Result<(), FixError> {
        if dirs.is_empty() {
            return Ok(());
        }
        let targets = dirs.iter().map(|dir| PathBuf::from(expand_path(dir)));
        self.shell(&format!("rm -rf {}", quote_paths(targets)))
    }

    fn find_installations(&mut self) -> Result<(), FixError> {
        let target = &self.cfg.target;
        let roots: Vec<PathBuf> = target
            .search_roots
            .iter()
            .map(|root| PathBuf::from(expand_path(root)))
            .collect();
        self.discovered = discover(&roots, target.search_depth, &target.name_patterns);

        if self.discovered.is_empty() {
            self.board.log("No existing installations detected.");
        } else {
            self.board.log("Found installations:");
            for path in &self.discovered {
                self.board.log(&format!(" - {}", path.display()));
            }
        }
        Ok(())
    }

    fn remove_installations(&mut self) -> Result<(), FixError> {
        if self.discovered.is_empty() {
            let target = &self.cfg.target;
            self.discovered = target
                .install_candidates
                .iter()
                .chain(target.user_install_candidates.iter())
                .map(|candidate| PathBuf::from(expand_path(candidate)))
                .filter(|path| path.exists())
                .collect();
        }

        let split = partition(&self.discovered, &self.cfg.target.admin_root_path());
        self.admin_paths = split.admin;

        if !split.user.is_empty() {
            let command = format!("rm -rf {}", quote_paths(split.user.iter().cloned()));
            execute(self.runner.as_ref(), &command, RunOptions::allow_failure(), None)?;
            for path in &split.user {
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string());
                self.board.log(&format!("Removed {name}"));
            }
        }

        if self.admin_paths.is_empty() {
            self.board.log("No admin-level installations to remove.");
        } else {
            self.board
                .log("Admin-level installations will be removed during privileged step:");
            for path in &self.admin_paths {
                self.board.log(&format!(" - {}", path.display()));
            }
        }
        Ok(())
    }

    fn download_latest(&mut self) -> Result<(), FixError> {
        self.board.set_progress(None, DOWNLOAD_LABEL);
        let board = &self.board;
        let path = self.fetcher.fetch(
            &self.cfg.download.installer_url,
            &mut |fraction| board.set_progress(Some(fraction), DOWNLOAD_LABEL),
            &mut |line: &str| board.log(line),
        )?;
        self.installer = Some(path);
        Ok(())
    }

    fn privileged_install(&mut self) -> Result<(), FixError> {
        let installer = self.installer.as_deref().ok_or(FixError::MissingInstaller)?;
        self.board.set_progress(None, "Applying admin tasks");

        let candidates: Vec<PathBuf> = self
            .cfg
            .target
            .install_candidates
            .iter()
            .map(|candidate| PathBuf::from(expand_path(candidate)))
            .collect();
        let script = privileged_batch(&self.admin_paths, installer, &candidates);
        execute(self.runner.as_ref(), &script, RunOptions::elevated(), None)?;
        self.board
            .log("Admin tasks completed (remove/install/permissions/DNS flush)");
        Ok(())
    }

    fn verify_installation(&mut self) -> Result<(), FixError> {
        for candidate in &self.cfg.target.install_candidates {
            let path = PathBuf::from(expand_path(candidate));
            if path.exists() {
                self.board
                    .log(&format!("Verified install at {}", path.display()));
                self.board.set_status("Completed", RunStatus::Success);
                return Ok(());
            }
        }
        Err(FixError::VerificationFailed)
    }

    /// The run owns the downloaded installer; it is removed once all steps ran.
    fn discard_installer(&mut self) {
        if let Some(path) = self.installer.take() {
            let _ = fs::remove_file(path);
        }
    }
}

/// `pkill -f` matches full command lines, including the wrapper shell that
/// carries the pattern. Bracketing the first character keeps the regex
/// matching `name` while its own text no longer does.
fn self_excluding_pattern(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphanumeric() => format!("[{first}]{}", chars.as_str()),
        _ => name.to_string(),
    }
}

fn quote_paths<I: IntoIterator<Item = PathBuf>>(paths: I) -> String {
    paths
        .into_iter()
        .map(|path| shell_single_quote(&path.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One shell script holding every privileged action, so a single credential
/// prompt covers the whole batch: remove admin installations, flush the DNS
/// cache, restart mDNSResponder, run the installer, then reset ownership and
/// permissions on the known bundle locations.
pub fn privileged_batch(admin_paths: &[PathBuf], installer: &Path, bundles: &[PathBuf]) -> String {
    let mut commands: Vec<String> = Vec::new();
    if !admin_paths.is_empty() {
        commands.push(format!("rm -rf {}", quote_paths(admin_paths.iter().cloned())));
    }
    commands.push("dscacheutil -flushcache || true".to_string());
    commands.push("killall -HUP mDNSResponder || true".to_string());
    commands.push(format!(
        "installer -pkg {} -target /",
        shell_single_quote(&installer.to_string_lossy())
    ));
    if !bundles.is_empty() {
        commands.push(format!(
            "for app in {}; do if [ -d \"$app\" ]; then chown -R root:wheel \"$app\" && chmod -R 755 \"$app\"; fi; done",
            quote_paths(bundles.iter().cloned())
        ));
    }
    let script = format!("set -e; {}", commands.join("; "));
    format!("/bin/bash -c {}", shell_single_quote(&script))
}

/// Owns the collaborators a repair run needs and starts runs on a
/// background thread.
#[derive(Clone)]
pub struct RepairService {
    cfg: Arc<Config>,
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn ArtifactFetcher>,
    board: Board,
}

impl RepairService {
    pub fn new(
        cfg: Arc<Config>,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn ArtifactFetcher>,
        board: Board,
    ) -> Self {
        Self {
            cfg,
            runner,
            fetcher,
            board,
        }
    }

    /// Starts a run, or returns `None` when one is already active.
    pub fn start_repair(&self) -> Option<JoinHandle<()>> {
        if !self.board.try_begin_run() {
            return None;
        }
        let service = self.clone();
        Some(thread::spawn(move || {
            let mut job = RepairJob::new(
                service.cfg.clone(),
                service.runner.clone(),
                service.fetcher.clone(),
                service.board.clone(),
            );
            let steps = repair_steps();
            run_steps(&mut job, &steps, &service.board);
            job.discard_installer();
            service.board.finish_run();
        }))
    }

    /// Waits for a run started by `start_repair`. A worker that died before
    /// finishing leaves the run in the failed state.
    pub fn wait(&self, handle: JoinHandle<()>) {
        let finished = handle.join().is_ok() && self.board.run_snapshot().status.is_terminal();
        if !finished {
            self.board.fail_run("repair worker stopped unexpectedly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::MockRunner;
    use crate::shell::ShellExecutor;
    use std::time::Duration;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct FileFetcher {
        dir: PathBuf,
    }

    impl ArtifactFetcher for FileFetcher {
        fn fetch(
            &self,
            _url: &str,
            on_progress: &mut dyn FnMut(f64),
            on_log: &mut dyn FnMut(&str),
        ) -> Result<PathBuf, FixError> {
            let path = self.dir.join("ZoomInstaller-test.pkg");
            fs::write(&path, b"pkg")?;
            on_progress(0.5);
            on_progress(1.0);
            on_log(&format!("Installer saved to {}", path.display()));
            Ok(path)
        }
    }

    struct FailingFetcher;

    impl ArtifactFetcher for FailingFetcher {
        fn fetch(
            &self,
            _url: &str,
            _on_progress: &mut dyn FnMut(f64),
            _on_log: &mut dyn FnMut(&str),
        ) -> Result<PathBuf, FixError> {
            Err(FixError::DownloadFailed { status_code: 503 })
        }
    }

    struct GatedFetcher {
        gate: Mutex<Receiver<()>>,
    }

    impl ArtifactFetcher for GatedFetcher {
        fn fetch(
            &self,
            _url: &str,
            _on_progress: &mut dyn FnMut(f64),
            _on_log: &mut dyn FnMut(&str),
        ) -> Result<PathBuf, FixError> {
            let _ = self.gate.lock().unwrap().recv();
            Err(FixError::DownloadFailed { status_code: 500 })
        }
    }

    struct Sandboxed {
        _dir: TempDir,
        root: PathBuf,
        cfg: Config,
    }

    /// A config whose every filesystem location lives under a temp dir.
    fn sandboxed_config() -> Sandboxed {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let apps = root.join("Applications");
        let home_apps = root.join("home/Applications");
        fs::create_dir_all(&apps).unwrap();
        fs::create_dir_all(&home_apps).unwrap();
        let text = |p: PathBuf| p.to_string_lossy().to_string();

        let mut cfg = Config::default();
        cfg.paths.log_root = String::new();
        cfg.target.cache_dirs = vec![text(root.join("cache/zoom.us"))];
        cfg.target.log_dirs = vec![text(root.join("logs/zoom.us"))];
        cfg.target.preferences_dir = text(root.join("prefs"));
        cfg.target.search_roots = vec![text(apps.clone()), text(home_apps.clone())];
        cfg.target.admin_root = text(apps.clone());
        cfg.target.install_candidates = vec![text(apps.join("zoom.us.app"))];
        cfg.target.user_install_candidates = vec![text(home_apps.join("zoom.us.app"))];
        Sandboxed {
            _dir: dir,
            root,
            cfg,
        }
    }

    fn file_fetcher(env: &Sandboxed) -> Arc<dyn ArtifactFetcher> {
        Arc::new(FileFetcher {
            dir: env.root.clone(),
        })
    }

    fn run_job(
        cfg: &Config,
        runner: &Arc<MockRunner>,
        fetcher: Arc<dyn ArtifactFetcher>,
        board: &Board,
    ) {
        assert!(board.try_begin_run());
        let mut job = RepairJob::new(Arc::new(cfg.clone()), runner.clone(), fetcher, board.clone());
        let steps = repair_steps();
        run_steps(&mut job, &steps, board);
        assert_eq!(board.run_snapshot().steps.len(), 9);
        job.discard_installer();
        board.finish_run();
    }

    #[test]
    fn missing_install_after_clean_steps_ends_in_warning() {
        let env = sandboxed_config();
        let runner = Arc::new(MockRunner::default());
        let board = Board::new(None);
        run_job(&env.cfg, &runner, file_fetcher(&env), &board);

        let snapshot = board.run_snapshot();
        assert_eq!(snapshot.status, RunStatus::Warning);
        let errors: Vec<&String> = snapshot
            .logs
            .iter()
            .filter(|line| line.starts_with("[error]"))
            .collect();
        assert_eq!(
            errors,
            vec!["[error] Verify installation: Zoom not found after install"]
        );
        assert_eq!(
            snapshot.logs.iter().filter(|l| l.starts_with("[ok]")).count(),
            8
        );
        assert!(snapshot.logs.iter().any(|l| l == "No existing installations detected."));
        assert!(!env.root.join("ZoomInstaller-test.pkg").exists());

        let events = board.wait_events(0, Duration::ZERO);
        let failure = events
            .iter()
            .find(|event| event.severity == "error")
            .expect("failed step event");
        assert_eq!(failure.payload["step"], "Verify installation");
        assert_eq!(failure.payload["error_code"], "verification_failed");
        let verify = snapshot.steps.last().unwrap();
        assert_eq!(verify.error_code.as_deref(), Some("verification_failed"));
    }

    #[test]
    fn discovered_installations_are_split_between_steps() {
        let env = sandboxed_config();
        let admin_app = env.root.join("Applications/Zoom.app");
        let user_app = env.root.join("home/Applications/zoom.us.app");
        fs::create_dir_all(&admin_app).unwrap();
        fs::create_dir_all(&user_app).unwrap();

        let runner = Arc::new(MockRunner::default());
        let board = Board::new(None);
        run_job(&env.cfg, &runner, file_fetcher(&env), &board);

        let commands = runner.commands();
        let user_rm = format!("rm -rf '{}'", user_app.display());
        assert!(commands.iter().any(|c| c == &user_rm), "{commands:?}");

        let elevated = runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.program == "/usr/bin/osascript")
            .count();
        assert_eq!(elevated, 1);
        let batch = commands.iter().find(|c| c.starts_with("do shell script")).unwrap();
        assert!(batch.contains(&admin_app.display().to_string()));
        assert!(!batch.contains(&user_app.display().to_string()));

        let logs = board.run_snapshot().logs;
        assert!(logs.iter().any(|l| l == "Removed zoom.us.app"));
        assert!(logs.iter().any(|l| l == &format!(" - {}", admin_app.display())));
    }

    #[test]
    fn verified_install_finishes_successfully() {
        let env = sandboxed_config();
        fs::create_dir_all(env.root.join("Applications/zoom.us.app")).unwrap();
        let runner = Arc::new(MockRunner::default());
        let board = Board::new(None);
        run_job(&env.cfg, &runner, file_fetcher(&env), &board);

        let snapshot = board.run_snapshot();
        assert_eq!(snapshot.status, RunStatus::Success);
        assert_eq!(snapshot.status_message, "Zoom repaired");
        assert!(snapshot
            .logs
            .iter()
            .any(|l| l.starts_with("Verified install at")));
    }

    #[test]
    fn failed_download_surfaces_missing_installer() {
        let env = sandboxed_config();
        let runner = Arc::new(MockRunner::default());
        let board = Board::new(None);
        run_job(&env.cfg, &runner, Arc::new(FailingFetcher), &board);

        let logs = board.run_snapshot().logs;
        assert!(logs
            .iter()
            .any(|l| l == "[error] Download latest Zoom: download failed with status 503"));
        assert!(logs
            .iter()
            .any(|l| l == "[error] Install & repair with admin tasks: installer not available"));
        assert!(runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .all(|call| call.program != "/usr/bin/osascript"));
    }

    #[test]
    fn failing_command_does_not_stop_the_run() {
        let env = sandboxed_config();
        let runner = Arc::new(MockRunner::default());
        runner.push_output(1, "pkill: denied");
        let board = Board::new(None);
        run_job(&env.cfg, &runner, file_fetcher(&env), &board);

        let logs = board.run_snapshot().logs;
        assert_eq!(logs[0], "== Kill Zoom processes ==");
        assert!(logs[1].starts_with("[error] Kill Zoom processes:"));
        assert!(logs.iter().any(|l| l == "[ok] Clear Zoom cache"));
        assert_eq!(board.run_snapshot().status, RunStatus::Warning);
    }

    #[test]
    fn kill_patterns_do_not_match_their_own_command_line() {
        let env = sandboxed_config();
        let runner = Arc::new(MockRunner::default());
        let board = Board::new(None);
        run_job(&env.cfg, &runner, file_fetcher(&env), &board);
        let commands = runner.commands();
        assert_eq!(commands[0], "pkill -9 -f '[z]oom.us' || true");
        assert_eq!(commands[1], "pkill -9 -x 'zoom.us' || true");
        assert_eq!(self_excluding_pattern("CptHost"), "[C]ptHost");
        assert_eq!(self_excluding_pattern(".hidden"), ".hidden");
        assert_eq!(self_excluding_pattern(""), "");
    }

    #[cfg(unix)]
    #[test]
    fn kill_step_succeeds_through_a_real_shell() {
        let mut cfg = Config::default();
        cfg.target.process_names = vec!["zoomfix-absent-process-name".to_string()];
        let board = Board::new(None);
        let mut job = RepairJob::new(
            Arc::new(cfg),
            Arc::new(ShellExecutor),
            Arc::new(FailingFetcher),
            board,
        );
        job.kill_processes().unwrap();
    }

    #[test]
    fn preferences_glob_is_left_unquoted() {
        let env = sandboxed_config();
        let runner = Arc::new(MockRunner::default());
        let board = Board::new(None);
        run_job(&env.cfg, &runner, file_fetcher(&env), &board);
        let expected = format!("rm -f '{}'/us.zoom.*", env.root.join("prefs").display());
        assert!(runner.commands().iter().any(|c| c == &expected));
    }

    #[test]
    fn batch_orders_privileged_actions() {
        let batch = privileged_batch(
            &[PathBuf::from("/Applications/zoom.us.app")],
            Path::new("/tmp/ZoomInstaller-1.pkg"),
            &[PathBuf::from("/Applications/Zoom Workplace.app")],
        );
        assert!(batch.starts_with("/bin/bash -c 'set -e; rm -rf "));
        let order = [
            "rm -rf",
            "dscacheutil -flushcache",
            "killall -HUP mDNSResponder",
            "installer -pkg",
            "chown -R root:wheel",
        ];
        let positions: Vec<usize> = order.iter().map(|needle| batch.find(needle).unwrap()).collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn batch_without_admin_paths_skips_removal() {
        let batch = privileged_batch(&[], Path::new("/tmp/Zoom.pkg"), &[]);
        assert!(!batch.contains("rm -rf"));
        assert!(batch.contains("installer -pkg"));
    }

    #[test]
    fn second_start_while_running_is_ignored() {
        let env = sandboxed_config();
        let (release, gate) = mpsc::channel();
        let board = Board::new(None);
        let service = RepairService::new(
            Arc::new(env.cfg.clone()),
            Arc::new(MockRunner::default()),
            Arc::new(GatedFetcher {
                gate: Mutex::new(gate),
            }),
            board.clone(),
        );

        let first = service.start_repair().expect("first run starts");
        assert!(service.start_repair().is_none());
        assert!(board.run_snapshot().is_running);

        release.send(()).unwrap();
        service.wait(first);
        let snapshot = board.run_snapshot();
        assert!(!snapshot.is_running);
        assert_eq!(snapshot.status, RunStatus::Warning);
        assert_eq!(
            snapshot.logs.iter().filter(|l| l.as_str() == "== Kill Zoom processes ==").count(),
            1
        );
    }

    #[test]
    fn panicking_worker_marks_run_failed() {
        let board = Board::new(None);
        let service = RepairService::new(
            Arc::new(Config::default()),
            Arc::new(MockRunner::default()),
            Arc::new(FailingFetcher),
            board.clone(),
        );
        assert!(board.try_begin_run());
        let handle = thread::spawn(|| panic!("worker crashed"));
        service.wait(handle);
        let snapshot = board.run_snapshot();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(!snapshot.is_running);
    }
}
