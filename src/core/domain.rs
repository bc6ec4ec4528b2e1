use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use uuid::Uuid;

use crate::core::workspace::Workspace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    Java,
    Cpp,
}

impl Language {
    pub fn id(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }

    /// Interpreted languages skip the compiler and run their source directly.
    pub fn requires_compilation(&self) -> bool {
        !matches!(self, Language::Python)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language `{0}`")]
pub struct UnsupportedLanguage(pub String);

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "cpp" | "c++" | "gnucpp" => Ok(Language::Cpp),
            _ => Err(UnsupportedLanguage(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub language: Language,
    pub source: String,
}

impl Submission {
    pub fn new(language: Language, source: impl Into<String>) -> Self {
        Submission {
            language,
            source: source.into(),
        }
    }
}

/// Which side of the differential run a submission plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Reference,
    Candidate,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reference => f.write_str("reference (slow) solution"),
            Role::Candidate => f.write_str("candidate (fast) solution"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompilationLimits {
    pub time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionLimits {
    pub time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub stdout_size_bytes: Option<u64>,
    pub stderr_size_bytes: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LanguageLimits {
    pub compilation: CompilationLimits,
    pub execution: ExecutionLimits,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompilationLimitType {
    Ram,
    Time,
}

impl fmt::Display for CompilationLimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationLimitType::Ram => f.write_str("memory"),
            CompilationLimitType::Time => f.write_str("time"),
        }
    }
}

/// One generated input. `index` is the draw position, `seed` the per-draw
/// seed that regenerates exactly this input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    pub index: u64,
    pub seed: u64,
    pub input: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Timeout,
    RuntimeError,
    CompileError,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Ok => f.write_str("finished"),
            Verdict::Timeout => f.write_str("timed out"),
            Verdict::RuntimeError => f.write_str("crashed"),
            Verdict::CompileError => f.write_str("failed to compile"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    pub verdict: Verdict,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        ExecutionResult {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            execution_time_ms: 0,
            verdict: Verdict::Ok,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    pub fn failed(verdict: Verdict, stderr: impl Into<String>) -> Self {
        ExecutionResult {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: None,
            execution_time_ms: 0,
            verdict,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Executable,
    JavaClass { class_name: String },
    Script,
}

/// Something runnable produced by `Executor::compile`. The workspace that
/// holds it lives as long as the last clone of the artifact.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub id: Uuid,
    pub language: Language,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub workspace: Option<Arc<Workspace>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Divergence {
    pub case: TestCase,
    pub reference: ExecutionResult,
    pub candidate: ExecutionResult,
}

/// Terminal value of one harness invocation. Errors travel separately as
/// `HarnessError`, so a match always has its message and a mismatch always
/// has the failing input and both outputs.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Match { trials: u64, message: String },
    Mismatch(Divergence),
}
