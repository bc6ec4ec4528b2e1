use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::core::{
    domain::{Artifact, ExecutionResult, LanguageLimits, Role, Submission, Verdict},
    traits::executor::{CompileError, Executor, RunError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxState {
    Pending,
    Compiling,
    Compiled,
    CompileError,
}

/// One submission bound to one run. The submission is compiled at most once,
/// however many inputs it is executed against; the artifact is dropped with
/// the sandbox.
#[derive(Debug)]
pub struct Sandbox {
    role: Role,
    submission: Submission,
    limits: LanguageLimits,
    executor: Arc<dyn Executor>,
    artifact: OnceCell<Result<Artifact, CompileError>>,
    state: Mutex<SandboxState>,
}

impl Sandbox {
    pub fn new(
        role: Role,
        submission: Submission,
        limits: LanguageLimits,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Sandbox {
            role,
            submission,
            limits,
            executor,
            artifact: OnceCell::new(),
            state: Mutex::new(SandboxState::Pending),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SandboxState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn change_state(&self, new_state: SandboxState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = new_state;
    }

    pub async fn compile(&self) -> Result<&Artifact, CompileError> {
        let result = self
            .artifact
            .get_or_init(|| async {
                self.change_state(SandboxState::Compiling);
                tracing::debug!(
                    role = ?self.role,
                    language = %self.submission.language,
                    compiler = self.submission.language.requires_compilation(),
                    "Start compiling"
                );
                let result = self
                    .executor
                    .compile(&self.submission, &self.limits.compilation)
                    .await;
                tracing::debug!(role = ?self.role, "Compilation result: {:?}", result.as_ref().map(|a| a.id));
                self.change_state(match result {
                    Ok(_) => SandboxState::Compiled,
                    Err(_) => SandboxState::CompileError,
                });
                result
            })
            .await;
        result.as_ref().map_err(Clone::clone)
    }

    /// Runs the submission against `input`, compiling first if needed. A
    /// failed compilation comes back as a `CompileError` verdict.
    pub async fn execute(&self, input: &str) -> Result<ExecutionResult, RunError> {
        let artifact = match self.compile().await {
            Ok(artifact) => artifact,
            Err(CompileError::Internal { msg }) => return Err(RunError::Internal { msg }),
            Err(e) => return Ok(ExecutionResult::failed(Verdict::CompileError, e.to_string())),
        };
        self.executor
            .run(artifact, input, &self.limits.execution)
            .await
    }
}
