use serde::Serialize;

use crate::core::{domain::RunOutcome, orchestrator::HarnessError};

const INTERNAL_ERROR: &str = "Internal error while running the solutions, please try again later";

/// Wire shape of one answer. `match` and `error` never appear together.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Match {
        #[serde(rename = "match")]
        matched: bool,
        message: String,
    },
    Mismatch {
        #[serde(rename = "match")]
        matched: bool,
        test_number: u64,
        seed: u64,
        test_input: String,
        slow_output: String,
        fast_output: String,
        slow_error: String,
        fast_error: String,
        /// Present only when the output hit the capture limit.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        slow_output_truncated: bool,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        fast_output_truncated: bool,
    },
    Error {
        error: String,
    },
}

impl Response {
    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { error: msg.into() }
    }

    /// One JSON object followed by a newline.
    pub fn to_json_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                tracing::error!("Failed to serialize response: {}", e);
                format!("{{\"error\":\"{}\"}}\n", INTERNAL_ERROR)
            }
        }
    }
}

pub fn report(result: Result<RunOutcome, HarnessError>) -> Response {
    match result {
        Ok(RunOutcome::Match { message, .. }) => Response::Match {
            matched: true,
            message,
        },
        Ok(RunOutcome::Mismatch(divergence)) => Response::Mismatch {
            matched: false,
            test_number: divergence.case.index + 1,
            seed: divergence.case.seed,
            test_input: divergence.case.input,
            slow_output: divergence.reference.stdout,
            fast_output: divergence.candidate.stdout,
            slow_error: divergence.reference.stderr,
            fast_error: divergence.candidate.stderr,
            slow_output_truncated: divergence.reference.stdout_truncated,
            fast_output_truncated: divergence.candidate.stdout_truncated,
        },
        Err(HarnessError::Internal(_)) => Response::error(INTERNAL_ERROR),
        Err(e) => {
            let mut msg = e.to_string();
            if let HarnessError::Inconclusive { input, stderr, .. } = &e {
                msg.push_str(&format!("\ninput:\n{}", input));
                if !stderr.is_empty() {
                    msg.push_str(&format!("\nstderr:\n{}", stderr));
                }
            }
            Response::error(msg)
        }
    }
}
