//! Collaborators that work on a local checkout.
//!
//! [`FileAnalyzer`] reads the touched resources. [`CommandMutator`] and
//! [`CommandVerifier`] run shell commands with the task described in
//! `STAGEWISE_*` environment variables.

use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::orchestration::collaborators::{Analyzer, ContextBundle, Mutator, Verifier, VerifyResult};
use crate::util::resource_path;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

/// Lines of command output kept in failure details.
const OUTPUT_TAIL_LINES: usize = 20;

/// Reads each touched resource into the context bundle.
#[derive(Debug, Clone)]
pub struct FileAnalyzer {
    root: PathBuf,
}

impl FileAnalyzer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Analyzer for FileAnalyzer {
    async fn context(&self, task: &Task) -> Result<ContextBundle> {
        let mut bundle = ContextBundle::new(task.id.clone());
        bundle.notes = task.description.clone();

        for resource in &task.resource_touches {
            let path = self.root.join(resource_path(resource)?);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => Some(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            bundle.resources.insert(resource.clone(), content);
        }

        tracing::debug!(task = %task.id, resources = bundle.resources.len(), "context gathered");
        Ok(bundle)
    }
}

/// Applies a task by running `sh -c <command>` in `workdir`.
///
/// The context bundle is passed as JSON in `STAGEWISE_CONTEXT`. A non-zero
/// exit status is a mutation error.
#[derive(Debug, Clone)]
pub struct CommandMutator {
    command: String,
    workdir: PathBuf,
}

impl CommandMutator {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Mutator for CommandMutator {
    async fn apply(&self, task: &Task, context: &ContextBundle) -> Result<()> {
        let context_json = serde_json::to_string(context)?;
        let mut command = shell(&self.command, &self.workdir, task);
        command.env("STAGEWISE_CONTEXT", context_json);

        let output = command.output().await?;
        if output.status.success() {
            tracing::debug!(task = %task.id, "mutate command succeeded");
            return Ok(());
        }
        Err(Error::Collaborator(format!(
            "mutate command exited with {}: {}",
            output.status,
            output_tail(&output)
        )))
    }
}

/// Verifies a task by running `sh -c <command>`; exit status 0 passes.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    command: String,
    workdir: PathBuf,
}

impl CommandVerifier {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn run(&self, task: &Task) -> Result<VerifyResult> {
        let output = shell(&self.command, &self.workdir, task).output().await?;
        let details = output_tail(&output);
        if output.status.success() {
            Ok(VerifyResult::passed(details))
        } else {
            tracing::debug!(task = %task.id, status = %output.status, "verify command failed");
            Ok(VerifyResult::failed(details))
        }
    }
}

fn shell(script: &str, workdir: &Path, task: &Task) -> Command {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(script)
        .current_dir(workdir)
        .env("STAGEWISE_TASK_ID", task.id.as_str())
        .env("STAGEWISE_TASK_TITLE", &task.title)
        .env("STAGEWISE_TASK_DESCRIPTION", &task.description)
        .env("STAGEWISE_RESOURCES", task.resource_touches.join("\n"))
        .env("STAGEWISE_ATTEMPT", (task.attempts + 1).to_string())
        .kill_on_drop(true);
    command
}

/// Last lines of stdout followed by stderr.
fn output_tail(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stdout
        .lines()
        .chain(stderr.lines())
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}
