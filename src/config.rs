use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::submission::ExecutionLimits;

// Build-step ceilings applied on top of the submission's own limits
const COMPILE_WALL_TIME_MS: u64 = 30_000;
const COMPILE_PROCESSES: u32 = 10;
const COMPILE_OPEN_FILES: u32 = 512;
const COMPILE_MAX_OUTPUT_BYTES: u64 = 65_536;

/// Deployment configuration for the execution core. Loaded from a JSON file;
/// every ceiling here is tunable per deployment rather than baked in.
#[derive(Deserialize, Debug)]
pub struct RunnerConfig {
    /// Limits applied to bundles that do not carry their own
    pub default_limits: ExecutionLimits,
    #[serde(default)]
    pub compile: CompileLimits,
    /// Override for the host directory that scratch regions are created under
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
    /// Extra or replacement language profiles merged over the built-in set
    #[serde(default)]
    pub languages: Vec<LanguageProfile>,
}

impl RunnerConfig {
    /// Load the configuration from the specified file
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }

    pub fn from_reader(reader: impl std::io::Read) -> serde_json::Result<Self> {
        serde_json::from_reader(reader)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_limits: ExecutionLimits {
                cpu_time_ms: 2_000,
                wall_time_ms: 5_000,
                memory_bytes: 256 * 1024 * 1024,
                max_output_bytes: 65_536,
            },
            compile: CompileLimits::default(),
            scratch_root: None,
            languages: Vec::new(),
        }
    }
}

/// Ceilings for the build step. The submission's cpu and memory limits apply
/// to the compiler process as well; these cover what the bundle does not
/// specify for builds.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CompileLimits {
    pub wall_time_ms: u64,
    pub processes: u32,
    pub open_files: u32,
    pub max_output_bytes: u64,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self {
            wall_time_ms: COMPILE_WALL_TIME_MS,
            processes: COMPILE_PROCESSES,
            open_files: COMPILE_OPEN_FILES,
            max_output_bytes: COMPILE_MAX_OUTPUT_BYTES,
        }
    }
}

/// Per-language execution convention: the required entry-point file name, the
/// command templates, and the container image that ships the toolchain.
///
/// Command templates support `%INPUT%` (entry file), `%OUTPUT%` (produced
/// artifact) and `%MAIN%` (entry file stem) placeholders.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LanguageProfile {
    pub name: String,
    pub entry_file: String,
    #[serde(default)]
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    /// Sandbox image carrying this language's toolchain; absent for profiles
    /// that only ever run on the plain process runtime
    #[serde(default)]
    pub image: Option<String>,
}

/// The closed set of languages this deployment accepts.
#[derive(Debug, Clone)]
pub struct LanguageCatalogue {
    profiles: Vec<LanguageProfile>,
}

impl LanguageCatalogue {
    /// The stock profiles, one per supported toolchain image.
    pub fn builtin() -> Self {
        Self {
            profiles: vec![
                profile(
                    "java",
                    "Solution.java",
                    Some(&["javac", "%INPUT%"]),
                    &["java", "%MAIN%"],
                    Some("eclipse-temurin:21-jdk-alpine"),
                ),
                profile(
                    "python",
                    "solution.py",
                    None,
                    &["python3", "%INPUT%"],
                    Some("python:3.11-slim"),
                ),
                profile(
                    "javascript",
                    "solution.js",
                    None,
                    &["node", "%INPUT%"],
                    Some("node:18-alpine"),
                ),
                profile(
                    "cpp",
                    "solution.cpp",
                    Some(&["g++", "-O2", "-o", "%OUTPUT%", "%INPUT%"]),
                    &["./%OUTPUT%"],
                    Some("gcc:11"),
                ),
                profile(
                    "c",
                    "solution.c",
                    Some(&["gcc", "-O2", "-o", "%OUTPUT%", "%INPUT%"]),
                    &["./%OUTPUT%"],
                    Some("gcc:11"),
                ),
            ],
        }
    }

    /// Merges configured profiles over the built-in set. A profile with a
    /// known name replaces the stock one; new names extend the catalogue.
    pub fn extend(&mut self, overrides: &[LanguageProfile]) {
        for over in overrides {
            match self.profiles.iter_mut().find(|p| p.name == over.name) {
                Some(existing) => *existing = over.clone(),
                None => self.profiles.push(over.clone()),
            }
        }
    }

    pub fn resolve(&self, name: &str) -> Option<&LanguageProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(|p| p.name.as_str())
    }
}

fn profile(
    name: &str,
    entry_file: &str,
    compile_command: Option<&[&str]>,
    run_command: &[&str],
    image: Option<&str>,
) -> LanguageProfile {
    let owned = |cmd: &[&str]| cmd.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    LanguageProfile {
        name: name.to_string(),
        entry_file: entry_file.to_string(),
        compile_command: compile_command.map(owned),
        run_command: owned(run_command),
        image: image.map(|s| s.to_string()),
    }
}

/// Applies placeholder substitutions to a command template.
pub fn apply_template(cmd_template: &[String], mapping: &HashMap<&str, &str>) -> Vec<String> {
    cmd_template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let config = RunnerConfig::from_file("data/runner.json").unwrap();
        assert_eq!(config.default_limits.cpu_time_ms, 2000);
        assert_eq!(config.default_limits.wall_time_ms, 5000);
        assert_eq!(config.compile.wall_time_ms, 30000);
        assert_eq!(config.languages[0].name, "java");
        assert_eq!(config.languages[0].entry_file, "Solution.java");
    }

    #[test]
    fn test_builtin_catalogue_covers_java() {
        let catalogue = LanguageCatalogue::builtin();
        let java = catalogue.resolve("java").unwrap();
        assert_eq!(java.entry_file, "Solution.java");
        assert_eq!(
            java.compile_command.as_deref(),
            Some(["javac".to_string(), "%INPUT%".to_string()].as_slice())
        );
        assert!(catalogue.resolve("fortran").is_none());
    }

    #[test]
    fn test_extend_replaces_by_name() {
        let mut catalogue = LanguageCatalogue::builtin();
        let before = catalogue.names().count();
        catalogue.extend(&[profile(
            "java",
            "Main.java",
            Some(&["javac", "%INPUT%"]),
            &["java", "%MAIN%"],
            None,
        )]);
        assert_eq!(catalogue.names().count(), before);
        assert_eq!(catalogue.resolve("java").unwrap().entry_file, "Main.java");
    }

    #[test]
    fn test_apply_template() {
        let mut mapping = HashMap::new();
        mapping.insert("%INPUT%", "Solution.java");
        mapping.insert("%MAIN%", "Solution");
        let rendered = apply_template(
            &["javac".to_string(), "%INPUT%".to_string()],
            &mapping,
        );
        assert_eq!(rendered, vec!["javac", "Solution.java"]);
    }
}
