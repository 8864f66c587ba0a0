//! TOML run files.
//!
//! Relative paths in a run file are resolved against the directory that
//! contains it.

use serde::Deserialize;
use simrun_core::{Backend, ParameterValue, Result, SimrunError, SimulatorSettings};
use simrun_runner::Simulator;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunFile {
    pub model: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Required when `backend = "custom"`.
    pub executable: Option<String>,
    #[serde(default = "current_dir")]
    pub package_path: PathBuf,
    #[serde(default = "current_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub show_progress: bool,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub settings: SimulatorSettings,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
    #[serde(default)]
    pub model_modifiers: Vec<String>,
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
    #[serde(default)]
    pub log_files: Vec<PathBuf>,
    pub env: Option<BTreeMap<String, String>>,
}

fn default_backend() -> String {
    "dymola".to_string()
}

fn current_dir() -> PathBuf {
    PathBuf::from(".")
}

impl RunFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SimrunError::InvalidConfiguration(format!(
                "Failed to read run file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut file = Self::from_toml_str(&content)?;
        file.resolve_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        Ok(file)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SimrunError::ConfigParse(e.to_string()))
    }

    pub fn backend(&self) -> Result<Backend> {
        Backend::from_name(&self.backend, self.executable.clone())
    }

    /// Build the simulator described by this file. Directories are validated
    /// and the output directory is created.
    pub fn into_simulator(self) -> Result<(Simulator, Vec<String>)> {
        let mut builder = Simulator::builder(self.model.clone(), self.backend()?)
            .package_path(&self.package_path)
            .output_dir(&self.output_dir)
            .settings(self.settings)
            .output_files(self.output_files)
            .log_files(self.log_files)
            .show_progress(self.show_progress);
        if let Some(env) = self.env {
            builder = builder.env(env);
        }

        let mut simulator = builder.build()?;
        simulator.add_parameters(self.parameters);
        for modifier in self.model_modifiers {
            simulator.add_model_modifier(modifier);
        }

        Ok((simulator, self.args))
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.package_path.is_relative() {
            self.package_path = base.join(&self.package_path);
        }
        if self.output_dir.is_relative() {
            self.output_dir = base.join(&self.output_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
model = "Buildings.Examples.Tutorial"
backend = "custom"
executable = "/opt/engine/bin/run"
package_path = "lib"
output_dir = "out"
show_progress = true
args = ["run.mos"]
model_modifiers = ["redeclare package MediumA = Buildings.Media.Air"]

[settings]
stop_time = 3600.0
timeout_secs = 120
solver = "radau"

[parameters]
"PID.k" = 1.0
"const1.k" = [2, 3]
"name" = "abc"
"flag" = true

[env]
PATH = "/usr/bin"
"#;

    #[test]
    fn test_parse_full_run_file() {
        let file = RunFile::from_toml_str(FULL).unwrap();
        assert_eq!(file.model, "Buildings.Examples.Tutorial");
        assert_eq!(
            file.backend().unwrap(),
            Backend::Custom {
                executable: "/opt/engine/bin/run".to_string()
            }
        );
        assert!(file.show_progress);
        assert_eq!(file.args, vec!["run.mos".to_string()]);
        assert_eq!(file.settings.stop_time, Some(3600.0));
        assert_eq!(file.settings.timeout_secs, 120.0);
        assert_eq!(file.settings.tolerance, 1e-6);
        assert_eq!(file.settings.solver.as_deref(), Some("radau"));
        assert_eq!(file.parameters.get("PID.k"), Some(&ParameterValue::Real(1.0)));
        assert_eq!(
            file.parameters.get("const1.k"),
            Some(&ParameterValue::Array(vec![
                ParameterValue::Integer(2),
                ParameterValue::Integer(3)
            ]))
        );
        assert_eq!(file.parameters.get("flag"), Some(&ParameterValue::Bool(true)));
        assert_eq!(file.env.unwrap().get("PATH").map(String::as_str), Some("/usr/bin"));
    }

    #[test]
    fn test_defaults() {
        let file = RunFile::from_toml_str(r#"model = "P.M""#).unwrap();
        assert_eq!(file.backend().unwrap(), Backend::Dymola);
        assert_eq!(file.package_path, PathBuf::from("."));
        assert_eq!(file.output_dir, PathBuf::from("."));
        assert_eq!(file.settings, SimulatorSettings::default());
        assert!(file.env.is_none());
        assert!(!file.show_progress);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = RunFile::from_toml_str("model = \"P.M\"\ntimeout = 3\n").unwrap_err();
        assert!(matches!(err, SimrunError::ConfigParse(_)));
    }

    #[test]
    fn test_custom_backend_requires_executable() {
        let file = RunFile::from_toml_str("model = \"P.M\"\nbackend = \"custom\"\n").unwrap();
        assert!(matches!(file.backend(), Err(SimrunError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("lib")).unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, "model = \"P.M\"\npackage_path = \"lib\"\noutput_dir = \"out\"\n").unwrap();

        let file = RunFile::load(&path).unwrap();
        assert_eq!(file.package_path, dir.path().join("lib"));
        assert_eq!(file.output_dir, dir.path().join("out"));

        let (simulator, args) = file.into_simulator().unwrap();
        assert!(args.is_empty());
        assert!(dir.path().join("out").is_dir());
        assert_eq!(simulator.model_name(), "P.M");
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunFile::load(Path::new("/definitely/missing/run.toml")).unwrap_err();
        assert!(matches!(err, SimrunError::InvalidConfiguration(_)));
    }
}
