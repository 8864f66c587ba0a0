use simrun_core::{
    Backend, FileReporter, ParameterValue, Parameters, Reporter, Result, RunOutcome, RunRequest,
    SimulatorSettings,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::files::{delete_files, ensure_output_directory, validate_package_path};
use crate::progress::ConsoleProgress;
use crate::relocate::{copy_result_files, mark_run_start};
use crate::supervisor::Supervisor;
use crate::workdir::{delete_working_directory, WorkingDirectory};

/// Builds a [`Simulator`], validating directories up front.
pub struct SimulatorBuilder {
    model_name: String,
    backend: Backend,
    package_path: Option<PathBuf>,
    output_dir: PathBuf,
    settings: SimulatorSettings,
    output_files: Vec<PathBuf>,
    log_files: Vec<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    show_progress: bool,
    reporter: Option<Arc<dyn Reporter>>,
}

impl SimulatorBuilder {
    pub fn new<S: Into<String>>(model_name: S, backend: Backend) -> Self {
        Self {
            model_name: model_name.into(),
            backend,
            package_path: None,
            output_dir: PathBuf::from("."),
            settings: SimulatorSettings::default(),
            output_files: Vec::new(),
            log_files: Vec::new(),
            env: None,
            show_progress: false,
            reporter: None,
        }
    }

    /// Directory holding the package to simulate; defaults to the current
    /// directory.
    pub fn package_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.package_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn output_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.output_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn settings(mut self, settings: SimulatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Files the engine leaves in the output directory, removed by
    /// [`Simulator::delete_output_files`].
    pub fn output_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.output_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn log_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.log_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Environment for the engine; replaces the inherited one.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Defaults to a [`FileReporter`] writing `simrun.log` in the output
    /// directory.
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn build(self) -> Result<Simulator> {
        let package_path = match self.package_path {
            Some(path) => path,
            None => std::env::current_dir()?,
        };
        validate_package_path(&package_path)?;
        let output_dir = ensure_output_directory(&self.output_dir)?;

        let reporter = match self.reporter {
            Some(reporter) => reporter,
            None => Arc::new(FileReporter::in_directory(&output_dir)?) as Arc<dyn Reporter>,
        };

        Ok(Simulator {
            model_name: self.model_name,
            backend: self.backend,
            package_path,
            output_dir,
            settings: self.settings,
            parameters: Parameters::new(),
            model_modifiers: Vec::new(),
            output_files: self.output_files,
            log_files: self.log_files,
            env: self.env,
            show_progress: self.show_progress,
            reporter,
            simulate_dir: None,
        })
    }
}

/// Drives one model through an external engine: scratch directory, process
/// supervision, result harvesting and cleanup.
pub struct Simulator {
    model_name: String,
    backend: Backend,
    package_path: PathBuf,
    output_dir: PathBuf,
    settings: SimulatorSettings,
    parameters: Parameters,
    model_modifiers: Vec<String>,
    output_files: Vec<PathBuf>,
    log_files: Vec<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    show_progress: bool,
    reporter: Arc<dyn Reporter>,
    simulate_dir: Option<WorkingDirectory>,
}

impl Simulator {
    pub fn builder<S: Into<String>>(model_name: S, backend: Backend) -> SimulatorBuilder {
        SimulatorBuilder::new(model_name, backend)
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn settings(&self) -> &SimulatorSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut SimulatorSettings {
        &mut self.settings
    }

    pub fn add_parameters<I, K, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParameterValue>,
    {
        self.parameters.extend(values);
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// `name=value` declarations in Modelica syntax.
    pub fn parameter_declarations(&self) -> Vec<String> {
        self.parameters.declarations()
    }

    /// Add a modifier such as
    /// `redeclare package MediumA = Buildings.Media.IdealGases.SimpleAir`.
    pub fn add_model_modifier<S: Into<String>>(&mut self, modifier: S) {
        self.model_modifiers.push(modifier.into());
    }

    pub fn model_modifiers(&self) -> &[String] {
        &self.model_modifiers
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_dir
    }

    pub fn set_output_directory<P: AsRef<Path>>(&mut self, dir: P) -> Result<&Path> {
        self.output_dir = ensure_output_directory(dir.as_ref())?;
        Ok(&self.output_dir)
    }

    pub fn package_path(&self) -> &Path {
        &self.package_path
    }

    pub fn set_package_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        validate_package_path(path.as_ref())?;
        self.package_path = path.as_ref().to_path_buf();
        Ok(())
    }

    /// Scratch directory kept from the last run, if it failed.
    pub fn simulate_directory(&self) -> Option<&Path> {
        self.simulate_dir.as_ref().map(WorkingDirectory::path)
    }

    /// Run the engine with `args` in a fresh copy of the package.
    ///
    /// Placeholders in `args` are filled in from the model and settings; see
    /// [`Simulator::placeholders`]. Files the run creates or modifies are
    /// copied to the output directory. The scratch directory is removed after
    /// a successful run and kept after a failed one; see
    /// [`Simulator::delete_simulate_directory`].
    pub async fn run(&mut self, args: &[String]) -> Result<Option<RunOutcome>> {
        self.delete_simulate_directory();

        let working = WorkingDirectory::create(&self.package_path)?;
        let args = self.expand_arguments(args, working.path());

        let mut request = RunRequest::new(self.backend.executable(), working.path())
            .args(args)
            .timeout_secs(self.settings.timeout_secs);
        if let Some(env) = &self.env {
            request = request.env(env.clone());
        }

        let mut supervisor = Supervisor::new(self.reporter.clone());
        if self.show_progress {
            supervisor = supervisor.with_progress(Arc::new(ConsoleProgress));
        }

        info!(
            model = %self.model_name,
            backend = %self.backend,
            working_dir = %working.path().display(),
            "Running simulation"
        );

        let since = match mark_run_start(working.path()).await {
            Ok(since) => since,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Falling back to the system clock for result detection");
                Utc::now()
            }
        };

        let outcome = match supervisor.supervise(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                working.remove(self.reporter.as_ref());
                return Err(e);
            }
        };

        if outcome.is_some() {
            copy_result_files(self.reporter.as_ref(), working.path(), &self.output_dir, since);
        }

        match &outcome {
            Some(o) if o.succeeded() => working.remove(self.reporter.as_ref()),
            _ => {
                warn!(working_dir = %working.path().display(), "Keeping working directory of failed run");
                self.reporter.write_output(&format!(
                    "Working directory of the failed run kept at '{}'.",
                    working.path().display()
                ));
                self.simulate_dir = Some(working);
            }
        }

        Ok(outcome)
    }

    /// Delete the output files of the engine, including `<result_file>_result.mat`.
    pub fn delete_output_files(&self) {
        let mut files: Vec<PathBuf> = self.output_files.iter().map(|f| self.in_output_dir(f)).collect();
        if let Some(result_file) = &self.settings.result_file {
            files.push(self.in_output_dir(Path::new(&format!("{}_result.mat", result_file))));
        }
        delete_files(self.reporter.as_ref(), &files);
    }

    /// Delete the configured log files. The driver's own log,
    /// [`FileReporter::FILE_NAME`], is only removed when it is listed.
    pub fn delete_log_files(&self) {
        let files: Vec<PathBuf> = self.log_files.iter().map(|f| self.in_output_dir(f)).collect();
        delete_files(self.reporter.as_ref(), &files);
    }

    /// Remove the scratch directory kept from a failed run.
    pub fn delete_simulate_directory(&mut self) {
        if let Some(dir) = self.simulate_dir.take() {
            delete_working_directory(self.reporter.as_ref(), Some(dir.root()));
        }
    }

    /// Values substituted for `{name}` placeholders in run arguments.
    ///
    /// | Placeholder | Value |
    /// |---|---|
    /// | `{model}` | model name |
    /// | `{modified_model}` | `Model(modifier, ..., p=v, ...)`, or the bare name |
    /// | `{modifiers}` | model modifiers joined by `, ` |
    /// | `{parameters}` | parameter declarations joined by `, ` |
    /// | `{start_time}`, `{stop_time}`, `{solver}` | setting, or empty when unset |
    /// | `{tolerance}`, `{number_of_intervals}` | setting |
    /// | `{result_file}` | setting, or the last segment of the model name |
    /// | `{output_dir}`, `{working_dir}` | absolute paths |
    pub fn placeholders(&self, working_dir: &Path) -> Vec<(&'static str, String)> {
        let real = |x: f64| ParameterValue::Real(x).to_modelica();
        let parameters = self.parameter_declarations();

        let mut arguments: Vec<String> = self.model_modifiers.clone();
        arguments.extend(parameters.iter().cloned());
        let modified_model = if arguments.is_empty() {
            self.model_name.clone()
        } else {
            format!("{}({})", self.model_name, arguments.join(", "))
        };

        let result_file = self.settings.result_file.clone().unwrap_or_else(|| {
            self.model_name
                .rsplit('.')
                .next()
                .unwrap_or(&self.model_name)
                .to_string()
        });

        vec![
            ("model", self.model_name.clone()),
            ("modified_model", modified_model),
            ("modifiers", self.model_modifiers.join(", ")),
            ("parameters", parameters.join(", ")),
            ("start_time", self.settings.start_time.map(real).unwrap_or_default()),
            ("stop_time", self.settings.stop_time.map(real).unwrap_or_default()),
            ("tolerance", real(self.settings.tolerance)),
            ("number_of_intervals", self.settings.number_of_intervals.to_string()),
            ("solver", self.settings.solver.clone().unwrap_or_default()),
            ("result_file", result_file),
            ("output_dir", absolute_display(&self.output_dir)),
            ("working_dir", absolute_display(working_dir)),
        ]
    }

    fn expand_arguments(&self, args: &[String], working_dir: &Path) -> Vec<String> {
        let values = self.placeholders(working_dir);
        let expanded: Vec<String> = args.iter().map(|arg| expand_placeholders(arg, &values)).collect();

        let mentions = |names: &[&str]| {
            args.iter()
                .any(|arg| names.iter().any(|name| arg.contains(&format!("{{{}}}", name))))
        };
        if (!self.parameters.is_empty() || !self.model_modifiers.is_empty())
            && !mentions(&["parameters", "modifiers", "modified_model"])
        {
            warn!(
                model = %self.model_name,
                "Parameters or model modifiers are set but no argument uses them"
            );
        }

        expanded
    }

    fn in_output_dir(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.output_dir.join(file)
        }
    }
}

/// Replace `{name}` with its value. Unknown names are left as written.
fn expand_placeholders(arg: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let value = tail.find('}').and_then(|close| {
            let name = &tail[1..close];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (value, close))
        });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn absolute_display(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use simrun_core::{MemoryReporter, SimrunError};
    use std::fs;

    fn package() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("package.mo"), "package P end P;").unwrap();
        dir
    }

    fn shell_backend() -> Backend {
        Backend::Custom {
            executable: "sh".to_string(),
        }
    }

    fn args(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_build_rejects_missing_package_path() {
        let out = tempfile::tempdir().unwrap();
        let result = Simulator::builder("P.M", Backend::Dymola)
            .package_path("/definitely/not/a/package")
            .output_dir(out.path())
            .reporter(Arc::new(MemoryReporter::new()))
            .build();
        assert!(matches!(result, Err(SimrunError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_build_creates_output_dir_and_log() {
        let pkg = package();
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("results");

        let sim = Simulator::builder("P.M", Backend::Dymola)
            .package_path(pkg.path())
            .output_dir(&target)
            .build()
            .unwrap();
        sim.reporter.write_output("ready");

        assert!(target.is_dir());
        assert_eq!(
            fs::read_to_string(target.join(FileReporter::FILE_NAME)).unwrap(),
            "ready\n"
        );
    }

    #[test]
    fn test_parameters_and_modifiers() {
        let pkg = package();
        let mut sim = Simulator::builder("P.M", Backend::Dymola)
            .package_path(pkg.path())
            .output_dir(pkg.path())
            .reporter(Arc::new(MemoryReporter::new()))
            .build()
            .unwrap();

        sim.add_parameters([("PID.k", 1.0), ("valve.m_flow_nominal", 0.1)]);
        sim.add_parameters([("PID.t", 10.0)]);
        sim.add_model_modifier("redeclare package MediumA = Buildings.Media.IdealGases.SimpleAir");
        sim.settings_mut().stop_time = Some(3600.0);

        assert_eq!(sim.parameters().len(), 3);
        assert_eq!(
            sim.parameter_declarations(),
            vec!["PID.k=1.0", "valve.m_flow_nominal=0.1", "PID.t=10.0"]
        );
        assert_eq!(sim.model_modifiers().len(), 1);
        assert_eq!(sim.settings().stop_time, Some(3600.0));
    }

    #[test]
    fn test_set_package_path_validates() {
        let pkg = package();
        let mut sim = Simulator::builder("P.M", Backend::Dymola)
            .package_path(pkg.path())
            .output_dir(pkg.path())
            .reporter(Arc::new(MemoryReporter::new()))
            .build()
            .unwrap();

        assert!(sim.set_package_path(pkg.path().join("package.mo")).is_err());
        assert_eq!(sim.package_path(), pkg.path());
    }

    #[test]
    fn test_delete_output_and_log_files() {
        let pkg = package();
        let out = tempfile::tempdir().unwrap();
        for name in ["dsres.mat", "Tutorial_result.mat", "dslog.txt", "keep.txt"] {
            fs::write(out.path().join(name), "x").unwrap();
        }

        let sim = Simulator::builder("P.M", Backend::Dymola)
            .package_path(pkg.path())
            .output_dir(out.path())
            .settings(SimulatorSettings::default().with_result_file("Tutorial"))
            .output_files(["dsres.mat"])
            .log_files(["dslog.txt"])
            .reporter(Arc::new(MemoryReporter::new()))
            .build()
            .unwrap();

        sim.delete_output_files();
        assert!(!out.path().join("dsres.mat").exists());
        assert!(!out.path().join("Tutorial_result.mat").exists());
        assert!(out.path().join("dslog.txt").exists());

        fs::write(out.path().join(FileReporter::FILE_NAME), "log").unwrap();
        sim.delete_log_files();
        assert!(!out.path().join("dslog.txt").exists());
        assert!(out.path().join("keep.txt").exists());
        // Not listed, so kept.
        assert!(out.path().join(FileReporter::FILE_NAME).exists());
    }

    #[test]
    fn test_expand_placeholders() {
        let values = vec![("model", "P.M".to_string()), ("stop_time", "3600.0".to_string())];
        assert_eq!(expand_placeholders("{model}", &values), "P.M");
        assert_eq!(
            expand_placeholders("simulateModel(\"{model}\", stopTime={stop_time})", &values),
            "simulateModel(\"P.M\", stopTime=3600.0)"
        );
        assert_eq!(expand_placeholders("{unknown} {model", &values), "{unknown} {model");
        assert_eq!(expand_placeholders("k={2, 3}", &values), "k={2, 3}");
        assert_eq!(expand_placeholders("plain", &values), "plain");
    }

    #[test]
    fn test_placeholders_from_model_and_settings() {
        let pkg = package();
        let mut sim = Simulator::builder("Buildings.Examples.Tutorial", Backend::Dymola)
            .package_path(pkg.path())
            .output_dir(pkg.path())
            .settings(
                SimulatorSettings::default()
                    .with_stop_time(3600.0)
                    .with_solver("radau"),
            )
            .reporter(Arc::new(MemoryReporter::new()))
            .build()
            .unwrap();
        sim.add_model_modifier("redeclare package MediumA = Air");
        sim.add_parameters([("PID.k", 1.0)]);

        let values: BTreeMap<&str, String> = sim.placeholders(Path::new("/work")).into_iter().collect();
        assert_eq!(values["model"], "Buildings.Examples.Tutorial");
        assert_eq!(
            values["modified_model"],
            "Buildings.Examples.Tutorial(redeclare package MediumA = Air, PID.k=1.0)"
        );
        assert_eq!(values["parameters"], "PID.k=1.0");
        assert_eq!(values["start_time"], "");
        assert_eq!(values["stop_time"], "3600.0");
        assert_eq!(values["tolerance"], "1e-6");
        assert_eq!(values["number_of_intervals"], "500");
        assert_eq!(values["solver"], "radau");
        assert_eq!(values["result_file"], "Tutorial");
        assert_eq!(values["working_dir"], "/work");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_passes_model_and_settings_to_engine() {
        let pkg = package();
        let out = tempfile::tempdir().unwrap();
        let reporter = Arc::new(MemoryReporter::new());
        let mut sim = Simulator::builder("P.M", shell_backend())
            .package_path(pkg.path())
            .output_dir(out.path())
            .settings(SimulatorSettings::default().with_stop_time(3600.0))
            .reporter(reporter.clone())
            .build()
            .unwrap();
        sim.add_parameters([("PID.k", 2.0)]);

        let outcome = sim
            .run(&args("echo '{modified_model} {stop_time} {number_of_intervals}' > seen.txt"))
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(
            fs::read_to_string(out.path().join("seen.txt")).unwrap(),
            "P.M(PID.k=2.0) 3600.0 500\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_copies_new_files_and_cleans_up() {
        let pkg = package();
        let out = tempfile::tempdir().unwrap();
        let reporter = Arc::new(MemoryReporter::new());
        let mut sim = Simulator::builder("P.M", shell_backend())
            .package_path(pkg.path())
            .output_dir(out.path())
            .settings(SimulatorSettings::default().with_timeout_secs(20.0))
            .reporter(reporter.clone())
            .build()
            .unwrap();

        let outcome = sim
            .run(&args("echo data > result.txt; echo finished"))
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(fs::read_to_string(out.path().join("result.txt")).unwrap(), "data\n");
        // The package copy predates the run and is not harvested.
        assert!(!out.path().join("package.mo").exists());
        assert!(sim.simulate_directory().is_none());
        assert!(reporter.errors().is_empty());
        assert!(reporter.outputs()[0].ends_with("finished\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_run_keeps_working_directory() {
        let pkg = package();
        let out = tempfile::tempdir().unwrap();
        let reporter = Arc::new(MemoryReporter::new());
        let mut sim = Simulator::builder("P.M", shell_backend())
            .package_path(pkg.path())
            .output_dir(out.path())
            .reporter(reporter.clone())
            .build()
            .unwrap();

        let outcome = sim.run(&args("echo broken >&2; exit 2")).await.unwrap().unwrap();
        assert_eq!(outcome.exit_code, Some(2));

        let kept = sim.simulate_directory().unwrap().to_path_buf();
        assert!(kept.join("package.mo").is_file());
        assert_eq!(reporter.errors().len(), 1);

        sim.delete_simulate_directory();
        assert!(!kept.exists());
        assert!(sim.simulate_directory().is_none());
    }

    #[tokio::test]
    async fn test_run_with_missing_executable_fails_fast() {
        let pkg = package();
        let reporter = Arc::new(MemoryReporter::new());
        let mut sim = Simulator::builder(
            "P.M",
            Backend::Custom {
                executable: "definitely-not-an-installed-engine".to_string(),
            },
        )
        .package_path(pkg.path())
        .output_dir(pkg.path())
        .reporter(reporter.clone())
        .build()
        .unwrap();

        let err = sim.run(&[]).await.unwrap_err();
        assert!(matches!(err, SimrunError::ExecutableNotFound(_)));
        assert!(err.is_fatal());
        assert!(sim.simulate_directory().is_none());
    }
}
