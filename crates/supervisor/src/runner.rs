use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use jobconfig::{DisplayConfig, RunnerConfig};
use tempfile::TempDir;
use thiserror::Error;
use wait_timeout::ChildExt;

use crate::job::RenderJob;

/// Exit code reported when the render process was killed for running too long.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the render process could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// How long pipe readers may keep draining once the process is gone.
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to prepare working area {path}: {source}")]
    WorkArea {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What happened to one render process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    /// Spawn to exit.
    pub elapsed: Duration,
    /// Working area and display setup before the spawn.
    pub cold_start: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Xvfb instance scoped to one run. Dropping the guard kills and reaps it.
#[derive(Debug)]
pub struct VirtualDisplay {
    child: Child,
    name: String,
}

impl VirtualDisplay {
    pub fn start(config: &DisplayConfig) -> io::Result<Self> {
        let name = format!(":{}", config.number);
        let child = Command::new(&config.program)
            .arg(&name)
            .args(["-screen", "0", config.screen.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        // Guard first: every early return below tears Xvfb down.
        let mut display = Self { child, name };
        thread::sleep(config.settle);
        if let Some(status) = display.child.try_wait()? {
            return Err(io::Error::other(format!(
                "{} exited during startup with {status}",
                config.program
            )));
        }

        display.probe();
        Ok(display)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self) {
        let probe = Command::new("xdpyinfo")
            .args(["-display", self.name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match probe {
            Ok(status) if status.success() => {
                tracing::info!(display = %self.name, "virtual display is running");
            }
            Ok(status) => {
                tracing::warn!(display = %self.name, %status, "virtual display may not be running correctly");
            }
            Err(err) => {
                tracing::warn!(display = %self.name, error = %err, "could not probe virtual display");
            }
        }
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        tracing::debug!(display = %self.name, "virtual display stopped");
    }
}

/// Scratch directory one job renders in, holding the materialized script.
/// Dropping it removes the directory and everything the render left there.
#[derive(Debug)]
pub struct WorkArea {
    dir: TempDir,
    path: PathBuf,
    script: PathBuf,
    prepared_at: Instant,
}

impl WorkArea {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn script_path(&self) -> &Path {
        &self.script
    }

    /// Removes the directory, surfacing the error `Drop` would swallow.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Runs the external render process for a job inside its own working area.
#[derive(Debug, Clone)]
pub struct JobRunner {
    runner: RunnerConfig,
    display: DisplayConfig,
}

impl JobRunner {
    pub fn new(runner: RunnerConfig, display: DisplayConfig) -> Self {
        Self { runner, display }
    }

    /// Parent directory of every job's working area.
    pub fn work_dir(&self) -> &Path {
        &self.runner.work_dir
    }

    /// Creates a fresh `<work_dir>/<job_id>-XXXXXX` directory and writes the
    /// job script into it.
    pub fn prepare(&self, job: &RenderJob, job_id: &str) -> Result<WorkArea, RunnerError> {
        let prepared_at = Instant::now();
        let work_dir = &self.runner.work_dir;
        fs::create_dir_all(work_dir).map_err(|source| RunnerError::WorkArea {
            path: work_dir.clone(),
            source,
        })?;
        let prefix = format!("{job_id}-");
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(work_dir)
            .map_err(|source| RunnerError::WorkArea {
                path: work_dir.clone(),
                source,
            })?;
        // The process runs inside the area, so a relative path would resolve twice.
        let path = std::path::absolute(dir.path()).unwrap_or_else(|_| dir.path().to_path_buf());

        let script = path.join(&self.runner.script_name);
        fs::write(&script, job.script()).map_err(|source| RunnerError::WorkArea {
            path: script.clone(),
            source,
        })?;
        tracing::debug!(area = %path.display(), "prepared working area");
        Ok(WorkArea {
            dir,
            path,
            script,
            prepared_at,
        })
    }

    /// Runs the job inside `area` to completion or until its timeout. Process
    /// failures are reported through the outcome.
    pub fn run(&self, job: &RenderJob, area: &WorkArea) -> RunOutcome {
        let display = if self.display.enabled {
            match VirtualDisplay::start(&self.display) {
                Ok(display) => Some(display),
                Err(err) => {
                    tracing::warn!(
                        program = %self.display.program,
                        error = %err,
                        "virtual display unavailable; continuing without it"
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut command = self.build_command(job, area);
        if let Some(display) = &display {
            command.env("DISPLAY", display.name());
        }
        let cold_start = area.prepared_at.elapsed();
        tracing::info!(
            scene = %job.scene(),
            cold_start_ms = cold_start.as_millis() as u64,
            "render environment ready"
        );

        let timeout = job.timeout().unwrap_or(self.runner.timeout);
        let outcome = self.supervise(command, timeout, cold_start);
        drop(display);

        tracing::info!(
            scene = %job.scene(),
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "render process finished"
        );
        outcome
    }

    fn build_command(&self, job: &RenderJob, area: &WorkArea) -> Command {
        let script = area.script_path().to_string_lossy();
        let mut command = Command::new(&self.runner.program);
        command
            .args(
                self.runner
                    .args
                    .iter()
                    .map(|arg| substitute(arg, &script, job.scene())),
            )
            .current_dir(area.path())
            .env("PYTHONPATH", area.path())
            .envs(&self.runner.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // The render and everything it spawns share one process group.
            command.process_group(0);
        }
        command
    }

    fn supervise(&self, mut command: Command, timeout: Duration, cold_start: Duration) -> RunOutcome {
        tracing::debug!(command = ?command, "spawning render process");
        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(program = %self.runner.program, error = %err, "failed to spawn render process");
                return RunOutcome {
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    timed_out: false,
                    elapsed: started.elapsed(),
                    cold_start,
                    stdout: String::new(),
                    stderr: format!("failed to spawn '{}': {err}", self.runner.program),
                };
            }
        };

        let stdout = spawn_pipe_reader("render-stdout", child.stdout.take());
        let stderr = spawn_pipe_reader("render-stderr", child.stderr.take());

        let (status, timed_out) = match child.wait_timeout(timeout) {
            Ok(Some(status)) => {
                if kill_process_group(&child) {
                    tracing::warn!("render left background processes behind; killed them");
                }
                (Some(status), false)
            }
            Ok(None) => {
                tracing::warn!(
                    timeout_s = timeout.as_secs_f64(),
                    "render process exceeded its timeout; killing it"
                );
                (kill_and_reap(&mut child), true)
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to wait on render process");
                (kill_and_reap(&mut child), false)
            }
        };
        let elapsed = started.elapsed();

        let deadline = Instant::now() + OUTPUT_GRACE;
        let stdout = collect_pipe(stdout, "stdout", deadline);
        let stderr = collect_pipe(stderr, "stderr", deadline);

        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            status.map(status_code).unwrap_or(-1)
        };

        RunOutcome {
            exit_code,
            timed_out,
            elapsed,
            cold_start,
            stdout,
            stderr,
        }
    }
}

fn substitute(arg: &str, script: &str, scene: &str) -> String {
    arg.replace("{script}", script).replace("{scene}", scene)
}

fn kill_and_reap(child: &mut Child) -> Option<ExitStatus> {
    if !kill_process_group(child) {
        if let Err(err) = child.kill() {
            tracing::debug!(error = %err, "kill failed; process may have exited already");
        }
    }
    child.wait().ok()
}

/// Sends SIGKILL to the child's process group. Returns whether any process
/// was signalled.
#[cfg(unix)]
fn kill_process_group(child: &Child) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return false;
    };
    // SAFETY: kill(2) only takes integer arguments.
    unsafe { libc::kill(-pgid, libc::SIGKILL) == 0 }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) -> bool {
    false
}

#[cfg(unix)]
fn status_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn status_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

type PipeReceiver = Receiver<io::Result<Vec<u8>>>;

fn spawn_pipe_reader<R>(name: &str, pipe: Option<R>) -> PipeReceiver
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded(1);
    let Some(mut stream) = pipe else {
        let _ = tx.send(Ok(Vec::new()));
        return rx;
    };
    let spawned = thread::Builder::new().name(name.into()).spawn(move || {
        let mut buf = Vec::new();
        let result = stream.read_to_end(&mut buf).map(|_| buf);
        let _ = tx.send(result);
    });
    if let Err(err) = spawned {
        tracing::warn!(reader = name, error = %err, "failed to spawn pipe reader");
    }
    rx
}

fn collect_pipe(rx: PipeReceiver, stream: &str, deadline: Instant) -> String {
    match rx.recv_deadline(deadline) {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(err)) => {
            tracing::warn!(stream, error = %err, "failed to read render output");
            String::new()
        }
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(stream, "render output still held open after exit; giving up on it");
            String::new()
        }
        Err(RecvTimeoutError::Disconnected) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::DeviceTier;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn runner(work_dir: &Path, program: &str, args: &[&str]) -> JobRunner {
        let runner = RunnerConfig {
            work_dir: work_dir.to_path_buf(),
            script_name: "scene.sh".into(),
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            timeout: Duration::from_secs(30),
            env: BTreeMap::from([("RENDER_FLAVOR".to_string(), "test".to_string())]),
        };
        let display = DisplayConfig {
            enabled: false,
            ..DisplayConfig::default()
        };
        JobRunner::new(runner, display)
    }

    fn run(runner: &JobRunner, job: &RenderJob) -> (WorkArea, RunOutcome) {
        let area = runner.prepare(job, "Demo-test").unwrap();
        let outcome = runner.run(job, &area);
        (area, outcome)
    }

    #[test]
    fn runs_script_with_placeholders_and_env() {
        let dir = TempDir::new().unwrap();
        let job = RenderJob::new(
            "echo \"$1 $RENDER_FLAVOR $PYTHONPATH\"; echo oops >&2",
            "Demo",
            DeviceTier::Cpu,
        );
        let (area, outcome) = run(&runner(dir.path(), "sh", &["{script}", "{scene}"]), &job);

        assert!(outcome.succeeded());
        let expected = format!("Demo test {}", area.path().display());
        assert_eq!(outcome.stdout.trim(), expected);
        assert_eq!(outcome.stderr.trim(), "oops");
        assert!(area.script_path().is_file());
    }

    #[test]
    fn each_job_gets_its_own_work_area() {
        let dir = TempDir::new().unwrap();
        let runner = runner(dir.path(), "sh", &["{script}"]);
        let job = RenderJob::new("pwd", "Demo", DeviceTier::Cpu);

        let first = runner.prepare(&job, "Demo-1").unwrap();
        let second = runner.prepare(&job, "Demo-1").unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().starts_with(std::path::absolute(dir.path()).unwrap()));
        assert!(first
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("Demo-1-")));

        let outcome = runner.run(&job, &first);
        assert_eq!(
            fs::canonicalize(outcome.stdout.trim()).unwrap(),
            fs::canonicalize(first.path()).unwrap()
        );

        let path = first.path().to_path_buf();
        first.close().unwrap();
        assert!(!path.exists());
        drop(second);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn non_zero_exit_is_passed_through() {
        let dir = TempDir::new().unwrap();
        let job = RenderJob::new("exit 3", "Demo", DeviceTier::Cpu);
        let (_area, outcome) = run(&runner(dir.path(), "sh", &["{script}"]), &job);
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn timeout_kills_the_process() {
        let dir = TempDir::new().unwrap();
        let job = RenderJob::new("echo started; exec sleep 30", "Demo", DeviceTier::Cpu)
            .with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let (_area, outcome) = run(&runner(dir.path(), "sh", &["{script}"]), &job);

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.stdout.trim(), "started");
    }

    #[test]
    fn timeout_kills_processes_the_render_started() {
        let dir = TempDir::new().unwrap();
        let job = RenderJob::new(
            "echo started; sh -c 'sleep 1; echo late > late.txt'; echo done",
            "Demo",
            DeviceTier::Cpu,
        )
        .with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let (area, outcome) = run(&runner(dir.path(), "sh", &["{script}"]), &job);

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        // Output pipes close as soon as the whole group is gone.
        assert!(started.elapsed() < OUTPUT_GRACE, "took {:?}", started.elapsed());
        assert_eq!(outcome.stdout.trim(), "started");

        thread::sleep(Duration::from_millis(1500));
        assert!(!area.path().join("late.txt").exists());
    }

    #[test]
    fn background_processes_do_not_outlive_the_render() {
        let dir = TempDir::new().unwrap();
        let job = RenderJob::new(
            "(sleep 1; echo late > late.txt) >/dev/null 2>&1 &\necho rendered",
            "Demo",
            DeviceTier::Cpu,
        );
        let (area, outcome) = run(&runner(dir.path(), "sh", &["{script}"]), &job);

        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout.trim(), "rendered");
        thread::sleep(Duration::from_millis(1500));
        assert!(!area.path().join("late.txt").exists());
    }

    #[test]
    fn missing_program_reports_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let job = RenderJob::new("", "Demo", DeviceTier::Cpu);
        let (_area, outcome) = run(
            &runner(dir.path(), "/nonexistent/render-binary", &["{script}"]),
            &job,
        );
        assert_eq!(outcome.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(outcome.stderr.contains("render-binary"));
    }

    #[test]
    fn unusable_work_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();
        let job = RenderJob::new("", "Demo", DeviceTier::Cpu);
        let err = runner(&blocker.join("work"), "sh", &["{script}"])
            .prepare(&job, "Demo-test")
            .unwrap_err();
        assert!(matches!(err, RunnerError::WorkArea { .. }));
    }

    #[test]
    fn display_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner(dir.path(), "sh", &["{script}"]);
        runner.display = DisplayConfig {
            enabled: true,
            program: "/nonexistent/Xvfb".into(),
            settle: Duration::from_millis(10),
            ..DisplayConfig::default()
        };
        let job = RenderJob::new("echo \"display=${DISPLAY:-none}\"", "Demo", DeviceTier::Cpu);
        let (_area, outcome) = run(&runner, &job);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("display="));
    }

    #[test]
    fn display_that_exits_early_is_rejected() {
        let config = DisplayConfig {
            enabled: true,
            program: "false".into(),
            settle: Duration::from_millis(200),
            ..DisplayConfig::default()
        };
        assert!(VirtualDisplay::start(&config).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn display_guard_kills_and_reaps_on_drop() {
        // `yes` ignores its arguments and runs until killed.
        let config = DisplayConfig {
            enabled: true,
            program: "yes".into(),
            settle: Duration::from_millis(50),
            ..DisplayConfig::default()
        };
        let display = VirtualDisplay::start(&config).unwrap();
        let proc_entry = PathBuf::from(format!("/proc/{}", display.child.id()));
        assert!(proc_entry.exists());
        drop(display);
        assert!(!proc_entry.exists());
    }

    #[test]
    fn substitutes_placeholders() {
        assert_eq!(substitute("{script}", "/w/s.py", "Demo"), "/w/s.py");
        assert_eq!(substitute("--scene={scene}", "/w/s.py", "Demo"), "--scene=Demo");
        assert_eq!(substitute("-w", "/w/s.py", "Demo"), "-w");
    }
}
