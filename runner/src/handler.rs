//! Bounded pool of scenario processes polled from a single loop.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::catalog::scenario_program;
use crate::report::{ScenarioResult, Status};
use crate::{RunnerError, RunnerResult};

/// Port seeds a scenario cluster tells apart; the harness reduces every
/// `--portseed` modulo this count, so concurrent jobs need distinct residues.
pub const SEED_SLOTS: usize = 49;

#[derive(Clone, Debug)]
pub struct HandlerSettings {
    /// Upper bound on concurrently running scenarios, between 1 and [`SEED_SLOTS`].
    pub jobs: usize,
    /// Directory holding the scenario executables.
    pub scenario_dir: PathBuf,
    /// Parent of every scenario's `--tmpdir`.
    pub run_dir: PathBuf,
    /// Passed to every scenario ahead of `--portseed` and `--tmpdir`.
    pub flags: Vec<String>,
    pub poll_interval: Duration,
    /// Print a dot per idle poll round and clear the line afterwards.
    pub dots: bool,
}

impl HandlerSettings {
    pub fn new(scenario_dir: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs: 4,
            scenario_dir: scenario_dir.into(),
            run_dir: run_dir.into(),
            flags: Vec::new(),
            poll_interval: Duration::from_millis(500),
            dots: false,
        }
    }
}

/// A scenario that has run to completion (or could not be launched).
#[derive(Debug)]
pub struct Finished {
    pub result: ScenarioResult,
    pub testdir: PathBuf,
    pub stdout: String,
    pub stderr: String,
}

struct Job {
    name: String,
    seed: usize,
    started: Instant,
    child: Child,
    testdir: PathBuf,
    stdout: File,
    stderr: File,
}

impl Job {
    fn collect(mut self, exit_code: Option<i32>) -> Finished {
        let stdout = read_capture(&mut self.stdout);
        let stderr = read_capture(&mut self.stderr);
        let status = Status::classify(exit_code, &stderr);
        Finished {
            result: ScenarioResult {
                name: self.name,
                status,
                duration: self.started.elapsed().as_secs(),
            },
            testdir: self.testdir,
            stdout,
            stderr,
        }
    }
}

fn read_capture(file: &mut File) -> String {
    let mut bytes = Vec::new();
    if let Err(err) = file
        .seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut bytes))
    {
        return format!("<unable to read captured output: {err}>");
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

pub struct TestHandler {
    settings: HandlerSettings,
    queue: VecDeque<String>,
    running: Vec<Job>,
    /// Launch failures waiting to be reported in order.
    rejected: VecDeque<Finished>,
    next_seed: usize,
}

impl TestHandler {
    pub fn new(mut settings: HandlerSettings, scenarios: Vec<String>) -> Self {
        if settings.jobs > SEED_SLOTS {
            warn!(requested = settings.jobs, limit = SEED_SLOTS, "too many jobs for distinct port ranges");
        }
        settings.jobs = settings.jobs.clamp(1, SEED_SLOTS);
        Self {
            settings,
            queue: scenarios.into(),
            running: Vec::new(),
            rejected: VecDeque::new(),
            next_seed: 0,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Names of the scenarios currently running.
    pub fn running(&self) -> Vec<&str> {
        self.running.iter().map(|job| job.name.as_str()).collect()
    }

    /// Starts queued scenarios up to the job limit, then blocks until one of
    /// the running ones exits. Returns `None` once nothing is left.
    pub fn next_finished(&mut self) -> Option<Finished> {
        self.fill();
        if let Some(finished) = self.rejected.pop_front() {
            return Some(finished);
        }
        if self.running.is_empty() {
            return None;
        }
        if self.queue.is_empty() {
            println!("Remaining jobs: [{}]", self.running().join(", "));
        }

        let mut dots = 0usize;
        loop {
            std::thread::sleep(self.settings.poll_interval);
            if let Some(finished) = self.poll_once() {
                if self.settings.dots && dots > 0 {
                    print!("\r{}\r", " ".repeat(dots));
                    let _ = io::stdout().flush();
                }
                return Some(finished);
            }
            if self.settings.dots {
                print!(".");
                let _ = io::stdout().flush();
            }
            dots += 1;
        }
    }

    fn poll_once(&mut self) -> Option<Finished> {
        for position in 0..self.running.len() {
            let exit = match self.running[position].child.try_wait() {
                Ok(Some(status)) => status.code(),
                Ok(None) => continue,
                Err(err) => {
                    warn!(scenario = %self.running[position].name, %err, "unable to poll scenario");
                    let job = &mut self.running[position];
                    let _ = job.child.kill();
                    let _ = job.child.wait();
                    None
                }
            };
            let job = self.running.remove(position);
            return Some(job.collect(exit));
        }
        None
    }

    fn fill(&mut self) {
        while self.running.len() < self.settings.jobs {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            let seed = self.allocate_seed();
            match self.launch(&entry, seed) {
                Ok(job) => self.running.push(job),
                Err(err) => {
                    warn!(scenario = %entry, %err, "scenario did not start");
                    self.rejected.push_back(Finished {
                        testdir: self.testdir(&entry, seed),
                        result: ScenarioResult {
                            name: entry,
                            status: Status::Failed,
                            duration: 0,
                        },
                        stdout: String::new(),
                        stderr: err.to_string(),
                    });
                }
            }
        }
    }

    /// Next seed that is unique within the run and whose port slot no running
    /// job holds. Terminates because fewer than `SEED_SLOTS` jobs run.
    fn allocate_seed(&mut self) -> usize {
        let mut seed = self.next_seed;
        while self
            .running
            .iter()
            .any(|job| job.seed % SEED_SLOTS == seed % SEED_SLOTS)
        {
            seed += 1;
        }
        self.next_seed = seed + 1;
        seed
    }

    fn testdir(&self, entry: &str, seed: usize) -> PathBuf {
        self.settings
            .run_dir
            .join(format!("{}_{seed}", scenario_program(entry)))
    }

    fn launch(&self, entry: &str, seed: usize) -> RunnerResult<Job> {
        let mut words = entry.split_whitespace();
        let program = words.next().unwrap_or(entry);
        let path = self.settings.scenario_dir.join(program);
        let testdir = self.testdir(entry, seed);
        let stdout = tempfile::tempfile()?;
        let stderr = tempfile::tempfile()?;

        let mut command = Command::new(&path);
        command
            .args(words)
            .args(&self.settings.flags)
            .arg(format!("--portseed={seed}"))
            .arg(format!("--tmpdir={}", testdir.display()))
            .stdin(Stdio::null())
            .stdout(stdout.try_clone()?)
            .stderr(stderr.try_clone()?);
        debug!(scenario = entry, seed, testdir = %testdir.display(), "launching scenario");
        let child = command.spawn().map_err(|source| RunnerError::Spawn {
            name: entry.to_string(),
            path,
            source,
        })?;
        Ok(Job {
            name: entry.to_string(),
            seed,
            started: Instant::now(),
            child,
            testdir,
            stdout,
            stderr,
        })
    }

    /// Kills every running scenario and waits for each to exit.
    pub fn kill_and_join(&mut self) {
        for job in &mut self.running {
            if let Err(err) = job.child.kill() {
                debug!(scenario = %job.name, %err, "kill failed");
            }
        }
        for mut job in self.running.drain(..) {
            let _ = job.child.wait();
        }
        self.queue.clear();
    }
}

impl Drop for TestHandler {
    fn drop(&mut self) {
        self.kill_and_join();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::OnceLock;

    use tempfile::TempDir;

    use super::*;

    /// Every script is written before the first spawn; a fork racing an open
    /// write handle would make exec fail with ETXTBSY.
    fn scripts() -> &'static Path {
        static DIR: OnceLock<TempDir> = OnceLock::new();
        DIR.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            for (name, body) in [
                ("args", "echo \"$@\""),
                ("fast", "exit 3"),
                ("slow", "sleep 30"),
            ] {
                let path = dir.path().join(name);
                fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            }
            dir
        })
        .path()
    }

    fn settings(run: &Path, jobs: usize) -> HandlerSettings {
        HandlerSettings {
            jobs,
            poll_interval: Duration::from_millis(20),
            ..HandlerSettings::new(scripts(), run)
        }
    }

    #[test]
    fn seeds_and_tmpdirs_follow_the_queue() {
        let run = tempfile::tempdir().unwrap();
        let mut handler = TestHandler::new(
            settings(run.path(), 1),
            vec!["args".into(), "args --flag".into()],
        );
        let first = handler.next_finished().unwrap();
        assert_eq!(first.result.status, Status::Passed);
        assert_eq!(
            first.stdout.trim(),
            format!("--portseed=0 --tmpdir={}", run.path().join("args_0").display())
        );
        let second = handler.next_finished().unwrap();
        assert_eq!(second.result.name, "args --flag");
        assert!(second.stdout.starts_with("--flag --portseed=1 "));
        assert_eq!(second.testdir, run.path().join("args_1"));
        assert!(handler.next_finished().is_none());
    }

    #[test]
    fn seeds_skip_port_slots_held_by_running_jobs() {
        let run = tempfile::tempdir().unwrap();
        let mut handler = TestHandler::new(settings(run.path(), 2), vec!["slow".into()]);
        handler.fill();
        assert_eq!(handler.running(), vec!["slow"]);

        handler.next_seed = SEED_SLOTS;
        handler.queue.push_back("args".into());
        let finished = handler.next_finished().unwrap();
        assert_eq!(finished.result.name, "args");
        let expected = SEED_SLOTS + 1;
        assert_eq!(
            finished.stdout.trim(),
            format!(
                "--portseed={expected} --tmpdir={}",
                run.path().join(format!("args_{expected}")).display()
            )
        );
        handler.kill_and_join();
    }

    #[test]
    fn job_limit_stays_within_seed_slots() {
        let run = tempfile::tempdir().unwrap();
        let handler = TestHandler::new(settings(run.path(), 500), Vec::new());
        assert_eq!(handler.settings.jobs, SEED_SLOTS);
        let handler = TestHandler::new(settings(run.path(), 0), Vec::new());
        assert_eq!(handler.settings.jobs, 1);
    }

    #[test]
    fn missing_program_is_reported_as_failed() {
        let run = tempfile::tempdir().unwrap();
        let mut handler = TestHandler::new(settings(run.path(), 2), vec!["ghost".into()]);
        let finished = handler.next_finished().unwrap();
        assert_eq!(finished.result.status, Status::Failed);
        assert!(finished.stderr.contains("ghost"));
        assert!(handler.next_finished().is_none());
    }

    #[test]
    fn kill_and_join_reaps_running_jobs() {
        let run = tempfile::tempdir().unwrap();
        let mut handler = TestHandler::new(
            settings(run.path(), 2),
            vec!["slow".into(), "fast".into(), "fast".into()],
        );
        let first = handler.next_finished().unwrap();
        assert_eq!(first.result.name, "fast");
        assert_eq!(first.result.status, Status::Failed);
        assert_eq!(handler.running(), vec!["slow"]);
        assert_eq!(handler.queued(), 1);

        let started = Instant::now();
        handler.kill_and_join();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(handler.running().is_empty());
        assert_eq!(handler.queued(), 0);
        assert!(handler.next_finished().is_none());
    }
}
