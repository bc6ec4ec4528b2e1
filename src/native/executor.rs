use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use uuid::Uuid;

use crate::{
    config::Toolchains,
    core::{
        domain::{
            Artifact, CompilationLimitType, CompilationLimits, ExecutionLimits, ExecutionResult,
            Language, Submission, Verdict,
        },
        traits::executor::{CompileError, Executor, RunError},
        workspace::Workspace,
    },
    native::{
        languages,
        process::{ProcessSpec, ResourceLimits, run_process},
    },
};

const COMPILER_OUTPUT_LIMIT: usize = 64 * 1024;
const FILE_SIZE_LIMIT: u64 = 16 * 1024 * 1024;
const DEFAULT_OUTPUT_LIMIT: u64 = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct NativeExecutor {
    dir: PathBuf,
    toolchains: Toolchains,
}

impl NativeExecutor {
    pub fn new<T>(dir: T, toolchains: Toolchains) -> Self
    where
        T: AsRef<Path>,
    {
        NativeExecutor {
            dir: dir.as_ref().into(),
            toolchains,
        }
    }
}

/// CPU-time backstop, loose enough that the wall-clock limit normally fires
/// first.
fn cpu_seconds(time_ms: Option<u64>) -> Option<u64> {
    time_ms.map(|ms| ms.saturating_mul(2) / 1000 + 1)
}

#[async_trait::async_trait]
impl Executor for NativeExecutor {
    async fn compile(
        &self,
        submission: &Submission,
        limits: &CompilationLimits,
    ) -> Result<Artifact, CompileError> {
        let source_file = languages::source_file_name(submission.language, &submission.source)
            .ok_or_else(|| CompileError::CompilationFailed {
                msg: "no class declaration found in Java source".to_string(),
            })?;

        let workspace = Workspace::create(&self.dir, "build")
            .await
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?;
        fs::write(workspace.path().join(&source_file), &submission.source)
            .await
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?;

        if let Some(command) = languages::compile_command(
            &self.toolchains,
            submission.language,
            workspace.path(),
            &source_file,
        ) {
            tracing::debug!("Running compiler: {:?}", command);
            let jvm = submission.language == Language::Java;
            let out = run_process(ProcessSpec {
                program: &command.program,
                args: command.args,
                cwd: workspace.path(),
                stdin: b"",
                time_limit: limits.time_ms.map(Duration::from_millis),
                limits: ResourceLimits {
                    address_space_bytes: if jvm { None } else { limits.memory_bytes },
                    cpu_seconds: cpu_seconds(limits.time_ms),
                    file_size_bytes: None,
                },
                stdout_limit: COMPILER_OUTPUT_LIMIT,
                stderr_limit: COMPILER_OUTPUT_LIMIT,
            })
            .await
            .map_err(|e| CompileError::Internal { msg: e.to_string() })?;

            let Some(status) = out.status else {
                return Err(CompileError::CompilationLimitsExceeded(
                    CompilationLimitType::Time,
                ));
            };
            if status.signal() == Some(libc::SIGXCPU) {
                return Err(CompileError::CompilationLimitsExceeded(
                    CompilationLimitType::Time,
                ));
            }
            if !status.success() {
                let mut msg = out.stderr.text();
                if msg.trim().is_empty() {
                    msg = out.stdout.text();
                }
                if msg.trim().is_empty() && status.signal().is_some() {
                    return Err(CompileError::CompilationLimitsExceeded(
                        CompilationLimitType::Ram,
                    ));
                }
                return Err(CompileError::CompilationFailed { msg });
            }
        }

        let (kind, path) =
            languages::artifact_for(submission.language, workspace.path(), &source_file);
        Ok(Artifact {
            id: Uuid::new_v4(),
            language: submission.language,
            kind,
            path,
            workspace: Some(Arc::new(workspace)),
        })
    }

    async fn run(
        &self,
        artifact: &Artifact,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, RunError> {
        let workspace = Workspace::create(&self.dir, "exec")
            .await
            .map_err(|e| RunError::Internal { msg: e.to_string() })?;
        let command = languages::run_command(
            &self.toolchains,
            &artifact.kind,
            &artifact.path,
            limits.memory_bytes,
        );

        let address_space_bytes = if languages::limits_address_space(&artifact.kind) {
            limits.memory_bytes
        } else {
            None
        };
        let out = run_process(ProcessSpec {
            program: &command.program,
            args: command.args,
            cwd: workspace.path(),
            stdin: stdin.as_bytes(),
            time_limit: limits.time_ms.map(Duration::from_millis),
            limits: ResourceLimits {
                address_space_bytes,
                cpu_seconds: cpu_seconds(limits.time_ms),
                file_size_bytes: Some(FILE_SIZE_LIMIT),
            },
            stdout_limit: limits.stdout_size_bytes.unwrap_or(DEFAULT_OUTPUT_LIMIT) as usize,
            stderr_limit: limits.stderr_size_bytes.unwrap_or(DEFAULT_OUTPUT_LIMIT) as usize,
        })
        .await
        .map_err(|e| RunError::Internal { msg: e.to_string() })?;

        let verdict = match out.status {
            None => Verdict::Timeout,
            Some(status) if status.signal() == Some(libc::SIGXCPU) => Verdict::Timeout,
            Some(status) if status.success() => Verdict::Ok,
            Some(_) => Verdict::RuntimeError,
        };

        Ok(ExecutionResult {
            stdout: out.stdout.text(),
            stderr: out.stderr.text(),
            exit_code: out.status.and_then(|s| s.code()),
            execution_time_ms: out.elapsed.as_millis() as u64,
            verdict,
            stdout_truncated: out.stdout.truncated,
            stderr_truncated: out.stderr.truncated,
        })
    }
}
