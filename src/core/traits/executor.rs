use crate::core::domain::{
    Artifact, CompilationLimitType, CompilationLimits, ExecutionLimits, ExecutionResult,
    Submission,
};

/// Low-level seam between the engine and whatever actually launches
/// processes. `compile` prepares a submission once, `run` executes the
/// prepared artifact against one input.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync {
    async fn compile(
        &self,
        submission: &Submission,
        limits: &CompilationLimits,
    ) -> Result<Artifact, CompileError>;

    async fn run(
        &self,
        artifact: &Artifact,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, RunError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("{msg}")]
    CompilationFailed { msg: String },
    #[error("compilation exceeded its {0} limit")]
    CompilationLimitsExceeded(CompilationLimitType),
    #[error("internal error while compiling: {msg}")]
    Internal { msg: String },
}

/// Sandbox infrastructure failure. Misbehaving programs are not errors here,
/// they come back as an `ExecutionResult` with a non-`Ok` verdict.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error("internal error while running: {msg}")]
    Internal { msg: String },
}
