use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::FuturesUnordered;
use tokio_stream::StreamExt;

use crate::{
    config::Config,
    core::{
        comparator::{Comparator, ToleranceMode},
        domain::{Divergence, ExecutionResult, Role, RunOutcome, Submission, TestCase, Verdict},
        generator::generate,
        sandbox::Sandbox,
        spec::ConstraintSet,
        traits::executor::{CompileError, Executor, RunError},
    },
};

/// Everything one differential run needs besides the shared configuration.
#[derive(Clone, Debug)]
pub struct RunPlan {
    pub reference: Submission,
    pub candidate: Submission,
    pub constraints: ConstraintSet,
    pub trial_budget: u64,
    pub seed: u64,
    pub tolerance: ToleranceMode,
}

/// Run-terminal failures. A mismatch is not one of them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HarnessError {
    #[error("{role} failed to compile: {msg}")]
    CompileFailed { role: Role, msg: String },
    #[error("{role} {verdict} on test {test_number} ({attempts} attempts)")]
    Inconclusive {
        role: Role,
        verdict: Verdict,
        attempts: u32,
        test_number: u64,
        input: String,
        stderr: String,
    },
    #[error("run did not finish within {limit_ms} ms")]
    DeadlineExceeded { limit_ms: u64 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    fn compile(role: Role, error: CompileError) -> Self {
        match error {
            CompileError::Internal { msg } => internal(msg),
            e => HarnessError::CompileFailed {
                role,
                msg: e.to_string(),
            },
        }
    }
}

fn internal(msg: String) -> HarnessError {
    tracing::error!("Sandbox infrastructure failure: {}", msg);
    HarnessError::Internal(msg)
}

#[derive(Debug)]
struct Trial {
    case: TestCase,
    /// 1 for a fresh trial, n for its (n - 1)th re-draw.
    attempt: u32,
    reference: Result<ExecutionResult, RunError>,
    candidate: Result<ExecutionResult, RunError>,
}

enum Judgement {
    Agree { truncated: bool },
    Diverge(Divergence),
    Inconclusive {
        role: Role,
        result: ExecutionResult,
        case: TestCase,
    },
}

#[derive(Clone, Debug)]
pub struct Orchestrator {
    executor: Arc<dyn Executor>,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn Executor>, config: Arc<Config>) -> Self {
        Orchestrator { executor, config }
    }

    /// Runs both submissions against generated inputs until they diverge or
    /// the trial budget is spent. The whole run is bounded by the configured
    /// run timeout; dropping the returned future kills every child process.
    #[tracing::instrument(skip_all, fields(seed = plan.seed, trials = plan.trial_budget))]
    pub async fn run(&self, plan: RunPlan) -> Result<RunOutcome, HarnessError> {
        let started = Utc::now();
        tracing::info!("Run started at {}", started);

        let limit = self.config.run_timeout;
        let result = match tokio::time::timeout(limit, self.run_trials(plan)).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::DeadlineExceeded {
                limit_ms: limit.as_millis() as u64,
            }),
        };

        let finished = Utc::now();
        match &result {
            Ok(RunOutcome::Match { trials, .. }) => {
                tracing::info!("Run matched after {} trials in {}", trials, finished - started)
            }
            Ok(RunOutcome::Mismatch(divergence)) => tracing::info!(
                "Run diverged on test {} in {}",
                divergence.case.index + 1,
                finished - started
            ),
            Err(e) => tracing::info!("Run failed in {}: {}", finished - started, e),
        }
        result
    }

    async fn run_trials(&self, plan: RunPlan) -> Result<RunOutcome, HarnessError> {
        let identical = plan.reference == plan.candidate;
        let budget = if identical { 1 } else { plan.trial_budget.max(1) };

        let reference = Arc::new(Sandbox::new(
            Role::Reference,
            plan.reference.clone(),
            self.config.limits_for(plan.reference.language).clone(),
            self.executor.clone(),
        ));
        let candidate = Arc::new(Sandbox::new(
            Role::Candidate,
            plan.candidate.clone(),
            self.config.limits_for(plan.candidate.language).clone(),
            self.executor.clone(),
        ));

        // Reference first: its failure is never attributed to the candidate.
        let (reference_compiled, candidate_compiled) =
            tokio::join!(reference.compile(), candidate.compile());
        reference_compiled.map_err(|e| HarnessError::compile(reference.role(), e))?;
        candidate_compiled.map_err(|e| HarnessError::compile(candidate.role(), e))?;
        tracing::debug!(
            "Sandboxes ready: reference {:?}, candidate {:?}",
            reference.state(),
            candidate.state()
        );

        let generator = generate(plan.constraints, plan.seed);
        // Identical sources only have to run; their outputs are not compared.
        let comparator = (!identical).then(|| Comparator::new(plan.tolerance));
        let window = self.config.max_parallel_trials.max(1);

        let mut in_flight = FuturesUnordered::new();
        let mut finished: BTreeMap<u64, Trial> = BTreeMap::new();
        let mut next_index = 0u64;
        let mut next_to_judge = 0u64;
        let mut target = budget;
        // Attempt numbers of the re-draws not yet started.
        let mut redraws: VecDeque<u32> = VecDeque::new();
        let mut truncated = 0u64;

        loop {
            // Judge strictly in draw order, whatever order trials finished in.
            while let Some(trial) = finished.remove(&next_to_judge) {
                next_to_judge += 1;
                let attempt = trial.attempt;
                match judge(trial, comparator.as_ref())? {
                    Judgement::Agree { truncated: true } => truncated += 1,
                    Judgement::Agree { truncated: false } => {}
                    Judgement::Diverge(divergence) => {
                        return Ok(RunOutcome::Mismatch(divergence));
                    }
                    Judgement::Inconclusive { role, result, case } => {
                        tracing::warn!(
                            "{} {} on test {} (attempt {} of {})",
                            role,
                            result.verdict,
                            case.index + 1,
                            attempt,
                            self.config.max_retries + 1
                        );
                        if attempt > self.config.max_retries {
                            return Err(HarnessError::Inconclusive {
                                role,
                                verdict: result.verdict,
                                attempts: attempt,
                                test_number: case.index + 1,
                                input: case.input,
                                stderr: result.stderr,
                            });
                        }
                        redraws.push_back(attempt + 1);
                        target += 1;
                    }
                }
            }

            if next_to_judge >= target {
                let message = match (identical, truncated) {
                    (true, _) => "Solutions are identical, 1 test case matched!".to_string(),
                    (false, 0) => format!("All {} test cases matched!", budget),
                    (false, n) => format!(
                        "All {} test cases matched! Output of {} was truncated before comparing.",
                        budget, n
                    ),
                };
                return Ok(RunOutcome::Match {
                    trials: budget,
                    message,
                });
            }

            while next_index < target && in_flight.len() < window {
                let case = generator.case_at(next_index);
                let attempt = redraws.pop_front().unwrap_or(1);
                tracing::debug!("Drawing test {}: {:?}", case.index + 1, case.input);
                let (reference, candidate) = (reference.clone(), candidate.clone());
                in_flight.push(async move {
                    let (reference, candidate) = tokio::join!(
                        reference.execute(&case.input),
                        candidate.execute(&case.input)
                    );
                    Trial {
                        case,
                        attempt,
                        reference,
                        candidate,
                    }
                });
                next_index += 1;
            }

            match in_flight.next().await {
                Some(trial) => {
                    tracing::debug!("Test {} finished", trial.case.index + 1);
                    finished.insert(trial.case.index, trial);
                }
                None => return Err(internal("trial window drained before the budget".to_string())),
            }
        }
    }
}

fn judge(trial: Trial, comparator: Option<&Comparator>) -> Result<Judgement, HarnessError> {
    let Trial {
        case,
        reference,
        candidate,
        ..
    } = trial;
    let reference = reference.map_err(|RunError::Internal { msg }| internal(msg))?;
    let candidate = candidate.map_err(|RunError::Internal { msg }| internal(msg))?;

    for (role, result) in [(Role::Reference, &reference), (Role::Candidate, &candidate)] {
        match result.verdict {
            Verdict::Ok => {}
            Verdict::CompileError => {
                return Err(HarnessError::CompileFailed {
                    role,
                    msg: result.stderr.clone(),
                });
            }
            Verdict::Timeout | Verdict::RuntimeError => {
                return Ok(Judgement::Inconclusive {
                    role,
                    result: result.clone(),
                    case,
                });
            }
        }
    }

    let truncated = reference.stdout_truncated || candidate.stdout_truncated;
    let Some(comparator) = comparator else {
        return Ok(Judgement::Agree { truncated });
    };
    if let Some(difference) = comparator.first_difference(&reference.stdout, &candidate.stdout) {
        tracing::debug!("Test {} diverged at {}", case.index + 1, difference);
        return Ok(Judgement::Diverge(Divergence {
            case,
            reference,
            candidate,
        }));
    }
    Ok(Judgement::Agree { truncated })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::{
        core::{
            domain::{Artifact, ArtifactKind, Language},
            spec::interpret,
            traits::executor::MockExecutor,
        },
        stubs::executor::ExecutorStub,
    };

    const ECHO: &str = "echo";
    const SWAPPER: &str = "swapper";

    fn config() -> Arc<Config> {
        Arc::new(Config {
            max_parallel_trials: 4,
            max_retries: 2,
            run_timeout: Duration::from_secs(10),
            ..Config::default()
        })
    }

    fn plan(reference: &str, candidate: &str, spec: &str, trial_budget: u64) -> RunPlan {
        RunPlan {
            reference: Submission::new(Language::Python, reference),
            candidate: Submission::new(Language::Python, candidate),
            constraints: interpret(spec).unwrap(),
            trial_budget,
            seed: 17,
            tolerance: ToleranceMode::Exact,
        }
    }

    fn swap_first_two(input: &str) -> String {
        let mut chars: Vec<char> = input.trim_end().chars().collect();
        if chars.len() > 5 {
            chars.swap(0, 1);
        }
        let mut out: String = chars.into_iter().collect();
        out.push('\n');
        out
    }

    #[tokio::test]
    async fn test_reports_earliest_failing_trial_not_first_finished() {
        let executor = ExecutorStub::new(Duration::ZERO, |submission, input| {
            if submission.source == ECHO {
                return (Duration::from_millis(5), ExecutionResult::ok(input));
            }
            match input {
                "abc\n" => (Duration::from_millis(300), ExecutionResult::ok("cba\n")),
                "aaa\n" => (Duration::ZERO, ExecutionResult::ok("zzz\n")),
                _ => (Duration::from_millis(5), ExecutionResult::ok(input)),
            }
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let outcome = orchestrator
            .run(plan(ECHO, "buggy", "s: string[1..3] \"abc\"", 10))
            .await
            .unwrap();

        let RunOutcome::Mismatch(divergence) = outcome else {
            panic!("expected a mismatch, got {:?}", outcome);
        };
        assert_eq!(divergence.case.index, 1);
        assert_eq!(divergence.case.input, "abc\n");
        assert_eq!(divergence.reference.stdout, "abc\n");
        assert_eq!(divergence.candidate.stdout, "cba\n");
    }

    #[tokio::test]
    async fn test_swapper_is_caught_on_long_input() {
        let executor = ExecutorStub::new(Duration::ZERO, |submission, input| {
            let output = if submission.source == SWAPPER {
                swap_first_two(input)
            } else {
                input.to_string()
            };
            (Duration::ZERO, ExecutionResult::ok(output))
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let outcome = orchestrator
            .run(plan(ECHO, SWAPPER, "s: string[0..10]", 100))
            .await
            .unwrap();

        let RunOutcome::Mismatch(divergence) = outcome else {
            panic!("expected a mismatch, got {:?}", outcome);
        };
        assert!(divergence.case.input.trim_end().len() > 5);
    }

    #[tokio::test]
    async fn test_all_trials_matching_is_success() {
        let executor = ExecutorStub::new(Duration::ZERO, |submission, input| {
            if submission.source == ECHO {
                (Duration::ZERO, ExecutionResult::ok(input))
            } else {
                (Duration::ZERO, ExecutionResult::ok(format!("{}\n\n", input.trim_end())))
            }
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let outcome = orchestrator
            .run(plan(ECHO, "echo with trailing newline", "n: int 1..1000", 25))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Match {
                trials: 25,
                message: "All 25 test cases matched!".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_identical_submissions_run_a_single_trial() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().times(2).returning(|submission, _| {
            Ok(Artifact {
                id: uuid::Uuid::new_v4(),
                language: submission.language,
                kind: ArtifactKind::Script,
                path: "/tmp/solution.py".into(),
                workspace: None,
            })
        });
        executor
            .expect_run()
            .times(2)
            .returning(|_, stdin, _| Ok(ExecutionResult::ok(stdin.to_string())));
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let outcome = orchestrator
            .run(plan(ECHO, ECHO, "n: int 1..10", 1000))
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Match { trials: 1, .. }));
    }

    #[tokio::test]
    async fn test_identical_nondeterministic_submissions_still_match() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let executor = ExecutorStub::new(Duration::ZERO, move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            (Duration::ZERO, ExecutionResult::ok(format!("{}\n", n)))
        });
        let orchestrator = Orchestrator::new(Arc::new(executor.clone()), config());

        let outcome = orchestrator
            .run(plan("random", "random", "n: int 1..10", 1000))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Match {
                trials: 1,
                message: "Solutions are identical, 1 test case matched!".to_string(),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.compilations(), 2);
    }

    #[tokio::test]
    async fn test_identical_submissions_that_crash_are_not_a_match() {
        let executor = ExecutorStub::new(Duration::ZERO, |_, _| {
            (Duration::ZERO, ExecutionResult::failed(Verdict::RuntimeError, "segfault"))
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let result = orchestrator.run(plan("crash", "crash", "n: int 1..10", 1000)).await;

        assert!(matches!(
            result,
            Err(HarnessError::Inconclusive {
                role: Role::Reference,
                verdict: Verdict::RuntimeError,
                attempts: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_truncated_outputs_are_called_out_in_the_match() {
        let executor = ExecutorStub::new(Duration::ZERO, |_, input| {
            let mut result = ExecutionResult::ok(input);
            result.stdout_truncated = input == "1\n";
            (Duration::ZERO, result)
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let outcome = orchestrator
            .run(plan(ECHO, "echo too", "n: int 1..1000000", 10))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Match {
                trials: 10,
                message: "All 10 test cases matched! Output of 1 was truncated before comparing."
                    .to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_reference_compile_error_is_never_a_mismatch() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().returning(|submission, _| {
            Err(CompileError::CompilationFailed {
                msg: format!("{} does not compile", submission.source),
            })
        });
        executor.expect_run().never();
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let result = orchestrator
            .run(plan("broken reference", "broken candidate", "n: int 1..10", 10))
            .await;

        assert_eq!(
            result,
            Err(HarnessError::CompileFailed {
                role: Role::Reference,
                msg: "broken reference does not compile".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_candidate_compile_error() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().returning(|submission, _| {
            if submission.source == "broken" {
                return Err(CompileError::CompilationFailed {
                    msg: "expected ';'".to_string(),
                });
            }
            Ok(Artifact {
                id: uuid::Uuid::new_v4(),
                language: submission.language,
                kind: ArtifactKind::Script,
                path: "/tmp/solution.py".into(),
                workspace: None,
            })
        });
        executor.expect_run().never();
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let result = orchestrator.run(plan(ECHO, "broken", "n: int 1..10", 10)).await;

        assert_eq!(
            result,
            Err(HarnessError::CompileFailed {
                role: Role::Candidate,
                msg: "expected ';'".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_persistent_timeout_exhausts_retries() {
        let executor = ExecutorStub::new(Duration::ZERO, |submission, input| {
            if submission.source == ECHO {
                (Duration::ZERO, ExecutionResult::ok(input))
            } else {
                (Duration::ZERO, ExecutionResult::failed(Verdict::Timeout, ""))
            }
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let result = orchestrator.run(plan(ECHO, "sleeper", "n: int 1..10", 100)).await;

        assert!(matches!(
            result,
            Err(HarnessError::Inconclusive {
                role: Role::Candidate,
                verdict: Verdict::Timeout,
                attempts: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_retries_are_counted_per_trial() {
        let executor = ExecutorStub::new(Duration::ZERO, |submission, input| {
            // Draws 0 and 1 are the minimal and maximal cases.
            if submission.source != ECHO && (input == "1\n" || input == "1000000\n") {
                (Duration::ZERO, ExecutionResult::failed(Verdict::Timeout, ""))
            } else {
                (Duration::ZERO, ExecutionResult::ok(input))
            }
        });
        let config = Arc::new(Config {
            max_parallel_trials: 4,
            max_retries: 1,
            ..Config::default()
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config);

        let outcome = orchestrator
            .run(plan(ECHO, "slow on extremes", "n: int 1..1000000", 5))
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Match { trials: 5, .. }));
    }

    #[tokio::test]
    async fn test_single_flaky_trial_is_retried_with_fresh_draw() {
        let executor = ExecutorStub::new(Duration::ZERO, |submission, input| {
            // Draw 0 is the minimal case, "1".
            if submission.source != ECHO && input == "1\n" {
                (Duration::ZERO, ExecutionResult::failed(Verdict::RuntimeError, "boom"))
            } else {
                (Duration::ZERO, ExecutionResult::ok(input))
            }
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let outcome = orchestrator
            .run(plan(ECHO, "flaky", "n: int 1..1000000", 5))
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Match { trials: 5, .. }));
    }

    #[tokio::test]
    async fn test_run_deadline() {
        let executor = ExecutorStub::new(Duration::ZERO, |_, input| {
            (Duration::from_secs(30), ExecutionResult::ok(input))
        });
        let config = Arc::new(Config {
            run_timeout: Duration::from_millis(100),
            ..Config::default()
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config);

        let result = orchestrator.run(plan(ECHO, "other", "n: int 1..10", 10)).await;

        assert_eq!(result, Err(HarnessError::DeadlineExceeded { limit_ms: 100 }));
    }

    #[tokio::test]
    async fn test_internal_run_failure_is_fatal() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().returning(|submission, _| {
            Ok(Artifact {
                id: uuid::Uuid::new_v4(),
                language: submission.language,
                kind: ArtifactKind::Script,
                path: "/tmp/solution.py".into(),
                workspace: None,
            })
        });
        executor.expect_run().returning(|_, _, _| {
            Err(RunError::Internal {
                msg: "no space left on device".to_string(),
            })
        });
        let orchestrator = Orchestrator::new(Arc::new(executor), config());

        let result = orchestrator.run(plan(ECHO, "other", "n: int 1..10", 10)).await;

        assert_eq!(
            result,
            Err(HarnessError::Internal("no space left on device".to_string()))
        );
    }
}
