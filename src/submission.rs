use std::error::Error;
use std::fmt::{self, Display};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::config::LanguageProfile;

/// One unit of untrusted source code plus metadata, submitted for a single
/// compile-and-run cycle. Immutable once built; the driver only borrows it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmissionBundle {
    /// Key into the language catalogue (closed set of configured languages)
    pub language: String,
    /// Ordered source files; one must be the language's entry point
    pub source_files: Vec<SourceFile>,
    /// Bytes fed to the program's standard input
    #[serde(default)]
    pub stdin: Option<String>,
    /// Per-submission resource ceilings; falls back to the configured defaults
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceFile {
    /// Path relative to the scratch region root
    pub path: String,
    pub content: String,
}

impl SubmissionBundle {
    pub fn new(language: impl Into<String>, source_files: Vec<SourceFile>) -> Self {
        Self {
            language: language.into(),
            source_files,
            stdin: None,
            limits: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Resource ceilings for one submission. All values are deployment-tunable;
/// a zero in any field is rejected as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecutionLimits {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    pub max_output_bytes: u64,
}

/// A malformed bundle, rejected before any sandbox is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    UnknownLanguage(String),
    EmptySources,
    MissingEntryPoint { expected: String },
    UnsafePath(String),
    ZeroLimit(&'static str),
}

impl Display for SubmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionError::UnknownLanguage(name) => {
                write!(f, "Unknown language: {name}")
            }
            SubmissionError::EmptySources => {
                write!(f, "Submission contains no source files")
            }
            SubmissionError::MissingEntryPoint { expected } => {
                write!(f, "Submission is missing the entry point file {expected}")
            }
            SubmissionError::UnsafePath(path) => {
                write!(f, "Source path escapes the scratch region: {path}")
            }
            SubmissionError::ZeroLimit(field) => {
                write!(f, "Limit {field} must be greater than zero")
            }
        }
    }
}

impl Error for SubmissionError {}

/// Checks a bundle against the resolved language profile and the effective
/// limits. Runs before any sandbox exists, so a bad bundle never costs an
/// isolation setup.
pub fn validate_bundle(
    bundle: &SubmissionBundle,
    profile: &LanguageProfile,
    limits: &ExecutionLimits,
) -> Result<(), SubmissionError> {
    if bundle.source_files.is_empty() {
        return Err(SubmissionError::EmptySources);
    }

    for file in &bundle.source_files {
        if !is_safe_relative(&file.path) {
            return Err(SubmissionError::UnsafePath(file.path.clone()));
        }
    }

    if !bundle
        .source_files
        .iter()
        .any(|f| f.path == profile.entry_file)
    {
        return Err(SubmissionError::MissingEntryPoint {
            expected: profile.entry_file.clone(),
        });
    }

    if limits.cpu_time_ms == 0 {
        return Err(SubmissionError::ZeroLimit("cpu_time_ms"));
    }
    if limits.wall_time_ms == 0 {
        return Err(SubmissionError::ZeroLimit("wall_time_ms"));
    }
    if limits.memory_bytes == 0 {
        return Err(SubmissionError::ZeroLimit("memory_bytes"));
    }
    if limits.max_output_bytes == 0 {
        return Err(SubmissionError::ZeroLimit("max_output_bytes"));
    }

    Ok(())
}

/// A path is safe when it stays strictly inside the scratch region: relative,
/// no parent traversal, no root or prefix components.
fn is_safe_relative(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && p.is_relative()
        && p.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageCatalogue;

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            cpu_time_ms: 2000,
            wall_time_ms: 5000,
            memory_bytes: 256 * 1024 * 1024,
            max_output_bytes: 65536,
        }
    }

    fn java_bundle() -> SubmissionBundle {
        SubmissionBundle::new(
            "java",
            vec![SourceFile::new(
                "Solution.java",
                "public class Solution { public static void main(String[] a) {} }",
            )],
        )
    }

    #[test]
    fn test_valid_bundle_passes() {
        let catalogue = LanguageCatalogue::builtin();
        let profile = catalogue.resolve("java").unwrap();
        assert!(validate_bundle(&java_bundle(), profile, &limits()).is_ok());
    }

    #[test]
    fn test_empty_sources_rejected() {
        let catalogue = LanguageCatalogue::builtin();
        let profile = catalogue.resolve("java").unwrap();
        let bundle = SubmissionBundle::new("java", vec![]);
        assert_eq!(
            validate_bundle(&bundle, profile, &limits()),
            Err(SubmissionError::EmptySources)
        );
    }

    #[test]
    fn test_missing_entry_point_rejected() {
        let catalogue = LanguageCatalogue::builtin();
        let profile = catalogue.resolve("java").unwrap();
        let bundle =
            SubmissionBundle::new("java", vec![SourceFile::new("Helper.java", "class Helper {}")]);
        assert_eq!(
            validate_bundle(&bundle, profile, &limits()),
            Err(SubmissionError::MissingEntryPoint {
                expected: "Solution.java".to_string()
            })
        );
    }

    #[test]
    fn test_traversal_paths_rejected() {
        let catalogue = LanguageCatalogue::builtin();
        let profile = catalogue.resolve("java").unwrap();

        for path in ["../Solution.java", "/etc/passwd", "a/../../b.java", ""] {
            let bundle = SubmissionBundle::new(
                "java",
                vec![
                    SourceFile::new("Solution.java", "class Solution {}"),
                    SourceFile::new(path, "x"),
                ],
            );
            assert_eq!(
                validate_bundle(&bundle, profile, &limits()),
                Err(SubmissionError::UnsafePath(path.to_string())),
                "path {path:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_nested_relative_path_allowed() {
        assert!(is_safe_relative("pkg/util/Helper.java"));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let catalogue = LanguageCatalogue::builtin();
        let profile = catalogue.resolve("java").unwrap();
        let mut bad = limits();
        bad.wall_time_ms = 0;
        assert_eq!(
            validate_bundle(&java_bundle(), profile, &bad),
            Err(SubmissionError::ZeroLimit("wall_time_ms"))
        );
    }
}
