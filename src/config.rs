use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::core::{
    comparator::ToleranceMode,
    domain::{CompilationLimits, ExecutionLimits, Language, LanguageLimits},
};

const MB: u64 = 1024 * 1024;

/// One trial keeps two processes busy, so half the cores go to trials.
pub fn default_parallel_trials() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cores / 2).max(1)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Toolchains {
    pub python: PathBuf,
    pub javac: PathBuf,
    pub java: PathBuf,
    pub gnucpp: PathBuf,
}

impl Default for Toolchains {
    fn default() -> Self {
        Toolchains {
            python: "python3".into(),
            javac: "javac".into(),
            java: "java".into(),
            gnucpp: "g++".into(),
        }
    }
}

/// Process-wide settings, read once at startup and shared read-only.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub listen_addr: String,
    pub workdir: PathBuf,
    pub toolchains: Toolchains,
    pub python_limits: LanguageLimits,
    pub java_limits: LanguageLimits,
    pub cpp_limits: LanguageLimits,
    pub trial_budget: u64,
    pub max_trial_budget: u64,
    pub max_parallel_trials: usize,
    pub max_retries: u32,
    pub run_timeout: Duration,
    pub tolerance: ToleranceMode,
    pub seed: Option<u64>,
    pub max_request_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

fn default_limits(time_ms: u64, memory_mb: u64, output_bytes: u64) -> LanguageLimits {
    LanguageLimits {
        compilation: CompilationLimits {
            time_ms: Some(30_000),
            memory_bytes: Some(1024 * MB),
        },
        execution: ExecutionLimits {
            time_ms: Some(time_ms),
            memory_bytes: Some(memory_mb * MB),
            stdout_size_bytes: Some(output_bytes),
            stderr_size_bytes: Some(output_bytes / 16),
        },
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "127.0.0.1:5000".to_string(),
            workdir: std::env::temp_dir().join("diffrunner"),
            toolchains: Toolchains::default(),
            python_limits: default_limits(5000, 256, MB),
            java_limits: default_limits(5000, 256, MB),
            cpp_limits: default_limits(5000, 256, MB),
            trial_budget: 100,
            max_trial_budget: 10_000,
            max_parallel_trials: default_parallel_trials(),
            max_retries: 2,
            run_timeout: Duration::from_secs(120),
            tolerance: ToleranceMode::Exact,
            seed: None,
            max_request_bytes: MB,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, starting from the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let mut config = Config::default();

        if let Some(addr) = lookup("DIFFRUNNER_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(dir) = lookup("DIFFRUNNER_WORKDIR") {
            config.workdir = dir.into();
        }
        if let Some(path) = lookup("PYTHON_PATH") {
            config.toolchains.python = path.into();
        }
        if let Some(path) = lookup("JAVAC_PATH") {
            config.toolchains.javac = path.into();
        }
        if let Some(path) = lookup("JAVA_PATH") {
            config.toolchains.java = path.into();
        }
        if let Some(path) = lookup("GNUCPP_PATH") {
            config.toolchains.gnucpp = path.into();
        }

        config.trial_budget = vars.positive("DIFFRUNNER_TRIALS", config.trial_budget)?;
        config.max_trial_budget =
            vars.positive("DIFFRUNNER_MAX_TRIALS", config.max_trial_budget)?;
        config.trial_budget = config.trial_budget.min(config.max_trial_budget);
        config.max_parallel_trials =
            vars.positive("DIFFRUNNER_PARALLEL_TRIALS", config.max_parallel_trials as u64)? as usize;
        config.max_retries = vars.parse("DIFFRUNNER_RETRIES", config.max_retries)?;
        config.run_timeout = Duration::from_millis(vars.positive(
            "DIFFRUNNER_RUN_TIMEOUT_MS",
            config.run_timeout.as_millis() as u64,
        )?);
        config.tolerance = vars.parse("DIFFRUNNER_TOLERANCE", config.tolerance)?;
        config.seed = vars.optional("DIFFRUNNER_SEED")?;
        config.max_request_bytes =
            vars.positive("DIFFRUNNER_MAX_REQUEST_BYTES", config.max_request_bytes)?;

        let time_ms = vars.optional::<u64>("DIFFRUNNER_TIME_LIMIT_MS")?;
        let memory_mb = vars.optional::<u64>("DIFFRUNNER_MEMORY_LIMIT_MB")?;
        let compile_ms = vars.optional::<u64>("DIFFRUNNER_COMPILE_TIME_LIMIT_MS")?;
        let output_bytes = vars.optional::<u64>("DIFFRUNNER_OUTPUT_LIMIT_BYTES")?;
        for (language, key) in [
            (Language::Python, "DIFFRUNNER_PYTHON_TIME_LIMIT_MS"),
            (Language::Java, "DIFFRUNNER_JAVA_TIME_LIMIT_MS"),
            (Language::Cpp, "DIFFRUNNER_CPP_TIME_LIMIT_MS"),
        ] {
            let language_time_ms = vars.optional::<u64>(key)?.or(time_ms);
            let limits = config.limits_for_mut(language);
            if let Some(ms) = language_time_ms {
                limits.execution.time_ms = Some(ms);
            }
            if let Some(mb) = memory_mb {
                limits.execution.memory_bytes = Some(mb * MB);
            }
            if let Some(ms) = compile_ms {
                limits.compilation.time_ms = Some(ms);
            }
            if let Some(bytes) = output_bytes {
                limits.execution.stdout_size_bytes = Some(bytes);
                limits.execution.stderr_size_bytes = Some((bytes / 16).max(1024));
            }
        }

        Ok(config)
    }

    pub fn limits_for(&self, language: Language) -> &LanguageLimits {
        match language {
            Language::Python => &self.python_limits,
            Language::Java => &self.java_limits,
            Language::Cpp => &self.cpp_limits,
        }
    }

    fn limits_for_mut(&mut self, language: Language) -> &mut LanguageLimits {
        match language {
            Language::Python => &mut self.python_limits,
            Language::Java => &mut self.java_limits,
            Language::Cpp => &mut self.cpp_limits,
        }
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = (self.0)(key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    fn positive(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        let value = self.parse(key, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                key: key.to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }
}
