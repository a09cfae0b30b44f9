//! Ordered setup steps with reverse-order unwinding.
//!
//! A domain is built from a list of [`SetupStep`]s run one after another.
//! Each completed step pushes its undo action; when a later step fails the
//! undo stack is drained in reverse before the failure is returned, so a
//! failed setup leaves nothing behind.
//!
//! # Performance-First Design:
//! - Per-step timing lands in the [`SetupReport`] for bottleneck hunting
//! - Undo actions are plain data, built alongside the step they reverse

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::executor::CommandRunner;

/// One thing a step does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Privileged host command.
    Run(Vec<String>),
    WriteFile { path: PathBuf, contents: String },
    RemoveFile(PathBuf),
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(argv) => write!(f, "{}", argv.join(" ")),
            Self::WriteFile { path, .. } => write!(f, "write {}", path.display()),
            Self::RemoveFile(path) => write!(f, "remove {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub name: String,
    pub apply: StepAction,
    pub undo: Option<StepAction>,
    /// Failure is logged and setup continues.
    pub tolerant: bool,
}

impl SetupStep {
    pub fn run(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            apply: StepAction::Run(argv),
            undo: None,
            tolerant: false,
        }
    }

    pub fn write_file(name: impl Into<String>, path: PathBuf, contents: String) -> Self {
        Self {
            name: name.into(),
            apply: StepAction::WriteFile {
                path: path.clone(),
                contents,
            },
            undo: Some(StepAction::RemoveFile(path)),
            tolerant: false,
        }
    }

    pub fn undo_with(mut self, argv: Vec<String>) -> Self {
        self.undo = Some(StepAction::Run(argv));
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerant = true;
        self
    }
}

/// Outcome of one step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub name: String,
    pub duration: Duration,
    pub success: bool,
    pub message: Option<String>,
}

/// Timing for a completed setup run.
#[derive(Debug, Clone, Default)]
pub struct SetupReport {
    pub results: Vec<StepResult>,
    pub total_duration: Duration,
}

impl SetupReport {
    /// Slowest step, if any ran.
    pub fn slowest(&self) -> Option<&StepResult> {
        self.results.iter().max_by_key(|r| r.duration)
    }

    /// Tolerant steps that failed.
    pub fn tolerated_failures(&self) -> Vec<&StepResult> {
        self.results.iter().filter(|r| !r.success).collect()
    }
}

/// A step failed and the steps before it have been undone.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: String,
    pub reason: String,
    /// Undo actions that themselves failed.
    pub undo_warnings: Vec<String>,
}

/// Run `steps` in order, unwinding completed steps on the first failure.
pub async fn execute(
    runner: &dyn CommandRunner,
    steps: Vec<SetupStep>,
) -> Result<SetupReport, StepFailure> {
    let start = Instant::now();
    let mut report = SetupReport::default();
    let mut undo_stack: Vec<(String, StepAction)> = Vec::new();

    for step in steps {
        let step_start = Instant::now();
        let outcome = perform(runner, &step.apply).await;
        let duration = step_start.elapsed();

        match outcome {
            Ok(()) => {
                debug!(step = %step.name, ms = duration.as_millis() as u64, "Setup step done");
                report.results.push(StepResult {
                    name: step.name.clone(),
                    duration,
                    success: true,
                    message: None,
                });
                if let Some(undo) = step.undo {
                    undo_stack.push((step.name, undo));
                }
            }
            Err(reason) if step.tolerant => {
                warn!(step = %step.name, %reason, "Tolerated setup step failure");
                report.results.push(StepResult {
                    name: step.name,
                    duration,
                    success: false,
                    message: Some(reason),
                });
            }
            Err(reason) => {
                warn!(step = %step.name, %reason, "Setup step failed, unwinding");
                let mut undo_warnings = Vec::new();
                while let Some((name, undo)) = undo_stack.pop() {
                    if let Err(e) = perform(runner, &undo).await {
                        warn!(step = %name, error = %e, "Undo failed");
                        undo_warnings.push(format!("{name}: {e}"));
                    }
                }
                return Err(StepFailure {
                    step: step.name,
                    reason,
                    undo_warnings,
                });
            }
        }
    }

    report.total_duration = start.elapsed();
    Ok(report)
}

/// Run every action regardless of earlier failures; returns the failures.
pub async fn teardown(runner: &dyn CommandRunner, actions: Vec<StepAction>) -> Vec<String> {
    let mut warnings = Vec::new();
    for action in actions {
        if let Err(e) = perform(runner, &action).await {
            debug!(action = %action, error = %e, "Teardown action failed");
            warnings.push(format!("{action}: {e}"));
        }
    }
    warnings
}

async fn perform(runner: &dyn CommandRunner, action: &StepAction) -> Result<(), String> {
    match action {
        StepAction::Run(argv) => {
            let output = runner.run(argv).await.map_err(|e| format!("{e:#}"))?;
            if output.success() {
                Ok(())
            } else {
                Err(output.failure_reason())
            }
        }
        StepAction::WriteFile { path, contents } => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("create {}: {e}", parent.display()))?;
            }
            tokio::fs::write(path, contents)
                .await
                .map_err(|e| format!("write {}: {e}", path.display()))
        }
        StepAction::RemoveFile(path) => match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("remove {}: {e}", path.display())),
        },
    }
}
