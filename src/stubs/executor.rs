use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use uuid::Uuid;

use crate::core::{
    domain::{
        Artifact, ArtifactKind, CompilationLimits, ExecutionLimits, ExecutionResult, Submission,
    },
    traits::executor::{CompileError, Executor, RunError},
};

type Script = dyn Fn(&Submission, &str) -> (Duration, ExecutionResult) + Send + Sync;

/// Executor that "runs" a submission by calling a script with its source and
/// stdin, then sleeping for the delay the script asked for.
#[derive(Clone)]
pub struct ExecutorStub {
    compile_delay: Duration,
    script: Arc<Script>,
    compiled: Arc<DashMap<Uuid, Submission>>,
}

impl std::fmt::Debug for ExecutorStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorStub")
            .field("compile_delay", &self.compile_delay)
            .field("compiled", &self.compiled.len())
            .finish()
    }
}

impl ExecutorStub {
    pub fn new<F>(compile_delay: Duration, script: F) -> Self
    where
        F: Fn(&Submission, &str) -> (Duration, ExecutionResult) + Send + Sync + 'static,
    {
        Self {
            compile_delay,
            script: Arc::new(script),
            compiled: Arc::new(DashMap::new()),
        }
    }

    pub fn compilations(&self) -> usize {
        self.compiled.len()
    }
}

#[async_trait::async_trait]
impl Executor for ExecutorStub {
    #[tracing::instrument(skip_all)]
    async fn compile(
        &self,
        submission: &Submission,
        _limits: &CompilationLimits,
    ) -> Result<Artifact, CompileError> {
        tokio::time::sleep(self.compile_delay).await;
        let id = Uuid::new_v4();
        self.compiled.insert(id, submission.clone());
        tracing::debug!("Compiled stub artifact {}", id);

        Ok(Artifact {
            id,
            language: submission.language,
            kind: ArtifactKind::Script,
            path: format!("/stub/{}", id).into(),
            workspace: None,
        })
    }

    #[tracing::instrument(skip_all)]
    async fn run(
        &self,
        artifact: &Artifact,
        stdin: &str,
        _limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, RunError> {
        let submission = self
            .compiled
            .get(&artifact.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RunError::Internal {
                msg: format!("unknown artifact {}", artifact.id),
            })?;
        let (delay, result) = (self.script)(&submission, stdin);
        tokio::time::sleep(delay).await;
        tracing::debug!("Execution result: {:?}", result);

        Ok(result)
    }
}
