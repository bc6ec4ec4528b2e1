use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::Toolchains;
use crate::core::domain::{ArtifactKind, Language};

/// JVM thread stacks; recursion-heavy solutions need more than the default.
const JAVA_STACK: &str = "-Xss64m";

/// Program and arguments for one child process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandLine {
    fn new(program: &Path) -> Self {
        CommandLine {
            program: program.to_path_buf(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Name of the class a Java source must be saved as: the first public class,
/// otherwise the first class declared at all.
pub fn java_class_name(source: &str) -> Option<String> {
    let mut first_class = None;
    for line in source.lines() {
        let line = line.trim();
        if line.starts_with("//") || line.starts_with('*') || line.starts_with("/*") {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(pos) = tokens.iter().position(|t| *t == "class") else {
            continue;
        };
        let Some(name) = tokens.get(pos + 1).map(|t| identifier_prefix(t)) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        if tokens[..pos].contains(&"public") {
            return Some(name.to_string());
        }
        first_class.get_or_insert_with(|| name.to_string());
    }
    first_class
}

fn identifier_prefix(token: &str) -> &str {
    let end = token
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .unwrap_or(token.len());
    &token[..end]
}

/// File name the source is written to inside its workspace. `None` when a
/// Java source declares no class.
pub fn source_file_name(language: Language, source: &str) -> Option<String> {
    match language {
        Language::Python => Some("solution.py".to_string()),
        Language::Cpp => Some("solution.cpp".to_string()),
        Language::Java => java_class_name(source).map(|class| format!("{}.java", class)),
    }
}

/// Compiler invocation run inside `dir`, or `None` for interpreted languages.
pub fn compile_command(
    toolchains: &Toolchains,
    language: Language,
    dir: &Path,
    source_file: &str,
) -> Option<CommandLine> {
    match language {
        Language::Python => None,
        Language::Cpp => Some(
            CommandLine::new(&toolchains.gnucpp)
                .arg("-std=c++17")
                .arg("-O2")
                .arg("-pipe")
                .arg("-o")
                .arg(dir.join("solution"))
                .arg(dir.join(source_file)),
        ),
        Language::Java => Some(
            CommandLine::new(&toolchains.javac)
                .arg("-encoding")
                .arg("UTF-8")
                .arg("-d")
                .arg(dir)
                .arg(dir.join(source_file)),
        ),
    }
}

/// What `compile` leaves behind for a source saved as `source_file` in `dir`.
pub fn artifact_for(language: Language, dir: &Path, source_file: &str) -> (ArtifactKind, PathBuf) {
    match language {
        Language::Python => (ArtifactKind::Script, dir.join(source_file)),
        Language::Cpp => (ArtifactKind::Executable, dir.join("solution")),
        Language::Java => {
            let class_name = source_file.trim_end_matches(".java").to_string();
            (ArtifactKind::JavaClass { class_name }, dir.to_path_buf())
        }
    }
}

/// Command that runs an artifact. The JVM reserves far more address space
/// than it uses, so its heap is capped with `-Xmx` instead of `RLIMIT_AS`.
pub fn run_command(
    toolchains: &Toolchains,
    kind: &ArtifactKind,
    path: &Path,
    memory_bytes: Option<u64>,
) -> CommandLine {
    match kind {
        ArtifactKind::Executable => CommandLine::new(path),
        ArtifactKind::Script => CommandLine::new(&toolchains.python).arg("-B").arg(path),
        ArtifactKind::JavaClass { class_name } => {
            let mut command = CommandLine::new(&toolchains.java);
            if let Some(bytes) = memory_bytes {
                command = command.arg(format!("-Xmx{}m", (bytes / (1024 * 1024)).max(16)));
            }
            command
                .arg(JAVA_STACK)
                .arg("-XX:+UseSerialGC")
                .arg("-cp")
                .arg(path)
                .arg(class_name.as_str())
        }
    }
}

/// Whether `RLIMIT_AS` can be applied to processes of this kind.
pub fn limits_address_space(kind: &ArtifactKind) -> bool {
    !matches!(kind, ArtifactKind::JavaClass { .. })
}
