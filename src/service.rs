use std::sync::Arc;

use serde::Deserialize;

use crate::{
    config::Config,
    core::{
        comparator::ToleranceMode,
        domain::{Language, Submission},
        orchestrator::{Orchestrator, RunPlan},
        reporter::{Response, report},
        spec::interpret_or_default,
        traits::executor::Executor,
    },
};

/// One differential-testing request as it arrives on the wire.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub input_spec: String,
    #[serde(default)]
    pub slow_lang: Option<String>,
    #[serde(default)]
    pub fast_lang: Option<String>,
    #[serde(default)]
    pub slow_code: Option<String>,
    #[serde(default)]
    pub fast_code: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub trials: Option<u64>,
    #[serde(default)]
    pub tolerance: Option<ToleranceOverride>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
pub struct ToleranceOverride {
    #[serde(default)]
    pub abs: f64,
    #[serde(default)]
    pub rel: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("Both code inputs are required")]
    MissingCode,
    #[error("Unsupported slow language: {0}")]
    UnsupportedSlowLanguage(String),
    #[error("Unsupported fast language: {0}")]
    UnsupportedFastLanguage(String),
    #[error("Invalid tolerance: values must be finite and non-negative")]
    InvalidTolerance,
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Request exceeds {0} bytes")]
    TooLarge(u64),
}

impl From<RequestError> for Response {
    fn from(e: RequestError) -> Self {
        Response::error(e.to_string())
    }
}

/// Turns wire requests into runs and runs into responses.
#[derive(Clone, Debug)]
pub struct DiffService {
    orchestrator: Orchestrator,
    config: Arc<Config>,
}

impl DiffService {
    pub fn new(executor: Arc<dyn Executor>, config: Arc<Config>) -> Self {
        DiffService {
            orchestrator: Orchestrator::new(executor, config.clone()),
            config,
        }
    }

    pub async fn submit(&self, request: SubmitRequest) -> Response {
        let plan = match self.plan(request) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::debug!("Rejected request: {}", e);
                return e.into();
            }
        };
        report(self.orchestrator.run(plan).await)
    }

    /// Validates a request and resolves every per-run setting. Request
    /// overrides win over `@tolerance` directives, which win over the
    /// configuration.
    pub fn plan(&self, request: SubmitRequest) -> Result<RunPlan, RequestError> {
        let (Some(slow_code), Some(fast_code)) = (request.slow_code, request.fast_code) else {
            return Err(RequestError::MissingCode);
        };
        if slow_code.is_empty() || fast_code.is_empty() {
            return Err(RequestError::MissingCode);
        }

        let slow_lang = request.slow_lang.unwrap_or_default();
        let slow_lang: Language = slow_lang
            .parse()
            .map_err(|_| RequestError::UnsupportedSlowLanguage(slow_lang.clone()))?;
        let fast_lang = request.fast_lang.unwrap_or_default();
        let fast_lang: Language = fast_lang
            .parse()
            .map_err(|_| RequestError::UnsupportedFastLanguage(fast_lang.clone()))?;

        let constraints = interpret_or_default(&request.input_spec);
        let tolerance = match request.tolerance {
            Some(ToleranceOverride { abs, rel }) => {
                if !(abs >= 0.0 && rel >= 0.0 && abs.is_finite() && rel.is_finite()) {
                    return Err(RequestError::InvalidTolerance);
                }
                ToleranceMode::Numeric { abs, rel }
            }
            None => constraints.tolerance.unwrap_or(self.config.tolerance),
        };

        let trial_budget = request
            .trials
            .unwrap_or(self.config.trial_budget)
            .clamp(1, self.config.max_trial_budget);
        let seed = request
            .seed
            .or(self.config.seed)
            .unwrap_or_else(rand::random);

        Ok(RunPlan {
            reference: Submission::new(slow_lang, slow_code),
            candidate: Submission::new(fast_lang, fast_code),
            constraints,
            trial_budget,
            seed,
            tolerance,
        })
    }
}
