use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::error::{Result, TychoError};
use crate::fabric::Fabric;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one executed check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub output: String,
    pub elapsed: Duration,
}

/// Aggregate result of a filter-chain run. Holds only the checks that
/// actually executed; everything after the first failure is skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainReport {
    pub checks: Vec<CheckResult>,
}

impl ChainReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn first_failure(&self) -> Option<&CheckResult> {
        self.checks.iter().find(|c| !c.passed)
    }
}

type CheckFn = Box<dyn Fn(&CancellationToken, &Path) -> (String, bool) + Send + Sync>;

/// A named check over (cancellation token, working directory). Pure from
/// the chain's point of view: output text plus a pass flag.
pub struct Check {
    pub name: String,
    run: CheckFn,
}

impl Check {
    pub fn new(
        name: impl Into<String>,
        run: impl Fn(&CancellationToken, &Path) -> (String, bool) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }
}

impl std::fmt::Debug for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish()
    }
}

/// Ordered, short-circuiting sequence of checks. New checks are appended to
/// the list; there is no subclassing surface.
#[derive(Debug, Default)]
pub struct FilterChain {
    checks: Vec<Check>,
}

impl FilterChain {
    pub fn new(checks: Vec<Check>) -> Self {
        Self { checks }
    }

    pub fn push(&mut self, check: Check) {
        self.checks.push(check);
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run the chain in `workdir`. The first failing check short-circuits
    /// the rest. Cancellation aborts with `TychoError::Cancelled`, which is
    /// an infrastructure error, not a check failure.
    pub fn run(&self, token: &CancellationToken, workdir: &Path) -> Result<ChainReport> {
        let mut report = ChainReport::default();
        for check in &self.checks {
            if token.is_cancelled() {
                return Err(TychoError::Cancelled);
            }
            let started = Instant::now();
            let (output, passed) = (check.run)(token, workdir);
            if token.is_cancelled() {
                return Err(TychoError::Cancelled);
            }
            report.checks.push(CheckResult {
                name: check.name.clone(),
                passed,
                output,
                elapsed: started.elapsed(),
            });
            if !passed {
                break;
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// External-process plumbing
// ---------------------------------------------------------------------------

/// Run an external command under the token, killing it on cancellation.
/// Spawn failure is reported as a failed check with the error in the output.
pub fn run_command(
    token: &CancellationToken,
    workdir: &Path,
    program: &str,
    args: &[&str],
) -> (String, bool) {
    let spawned = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => return (format!("failed to spawn {program}: {e}"), false),
    };

    // Drain pipes on their own threads so a chatty child cannot block on a
    // full pipe while we poll for exit.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = std::thread::spawn(move || read_to_string(stdout));
    let err_reader = std::thread::spawn(move || read_to_string(stderr));

    loop {
        if token.is_cancelled() {
            let _ = child.kill();
            break;
        }
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }

    let status = child.wait();
    let mut text = out_reader.join().unwrap_or_default();
    let err_text = err_reader.join().unwrap_or_default();
    if !err_text.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&err_text);
    }

    let success = status.map(|s| s.success()).unwrap_or(false);
    (text.trim().to_string(), success)
}

fn read_to_string(pipe: Option<impl std::io::Read>) -> String {
    let mut out = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut out);
    }
    out
}

/// True when a failed lint invocation means the tool is absent rather than
/// the code being bad.
fn tool_is_missing(output: &str) -> bool {
    output.contains("no such command") || output.contains("no such subcommand")
}

// ---------------------------------------------------------------------------
// Default checks
// ---------------------------------------------------------------------------

/// Structural check that the project compiles.
pub fn build_check() -> Check {
    Check::new("build", |token, workdir| {
        run_command(token, workdir, "cargo", &["build"])
    })
}

/// Lint pass; silently skipped when the tool is not installed.
pub fn static_analysis_check() -> Check {
    Check::new("static_analysis", |token, workdir| {
        let (output, passed) = run_command(token, workdir, "cargo", &["clippy", "--no-deps"]);
        if !passed && tool_is_missing(&output) {
            return (String::new(), true);
        }
        (output, passed)
    })
}

/// Runs the project's test suite.
pub fn test_check() -> Check {
    Check::new("test", |token, workdir| {
        run_command(token, workdir, "cargo", &["test"])
    })
}

/// Post-hoc ownership audit: every file the task modified must be owned by
/// the task or unowned. Reports every violation, not just the first.
pub fn claims_check(fabric: Arc<Fabric>, task_id: &str, modified: &[String]) -> Check {
    let task_id = task_id.to_string();
    let modified = modified.to_vec();
    Check::new("claims", move |_token, _workdir| {
        let mut violations = Vec::new();
        for path in &modified {
            match fabric.owner(path) {
                Ok(Some(owner)) if owner != task_id => {
                    violations.push(format!("{path} is owned by {owner}, not {task_id}"));
                }
                Ok(_) => {}
                Err(e) => violations.push(format!("{path}: ownership lookup failed: {e}")),
            }
        }
        if violations.is_empty() {
            (format!("{} file(s) verified", modified.len()), true)
        } else {
            (violations.join("\n"), false)
        }
    })
}

/// The default pre-review gate: build, lint, test, and (when a fabric is
/// provided) the claims audit.
pub fn default_chain(
    fabric: Option<Arc<Fabric>>,
    task_id: &str,
    modified: &[String],
) -> FilterChain {
    let mut chain = FilterChain::new(vec![build_check(), static_analysis_check(), test_check()]);
    if let Some(fabric) = fabric {
        chain.push(claims_check(fabric, task_id, modified));
    }
    chain
}
