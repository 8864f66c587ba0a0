use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SimrunError};

/// Simulation engine that a [`crate::RunRequest`] is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Dymola,
    Optimica,
    OpenModelica,
    /// Any other engine, started through an explicit executable.
    Custom { executable: String },
}

impl Backend {
    /// Resolve a backend from its configuration name.
    ///
    /// `executable` is required for `custom` and overrides nothing for the
    /// named engines.
    pub fn from_name(name: &str, executable: Option<String>) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "dymola" => Ok(Backend::Dymola),
            "optimica" => Ok(Backend::Optimica),
            "openmodelica" | "omc" => Ok(Backend::OpenModelica),
            "custom" => executable
                .map(|executable| Backend::Custom { executable })
                .ok_or_else(|| {
                    SimrunError::InvalidConfiguration(
                        "backend 'custom' requires an executable".to_string(),
                    )
                }),
            other => Err(SimrunError::InvalidConfiguration(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }

    /// Executable that starts the engine.
    pub fn executable(&self) -> &str {
        match self {
            Backend::Dymola => "dymola",
            Backend::Optimica => "jm_ipython.sh",
            Backend::OpenModelica => "omc",
            Backend::Custom { executable } => executable,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Dymola => write!(f, "dymola"),
            Backend::Optimica => write!(f, "optimica"),
            Backend::OpenModelica => write!(f, "openmodelica"),
            Backend::Custom { executable } => write!(f, "custom({})", executable),
        }
    }
}

/// Solver and run settings passed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub start_time: Option<f64>,
    pub stop_time: Option<f64>,
    pub tolerance: f64,
    pub solver: Option<String>,
    pub number_of_intervals: u32,
    /// Seconds after which the run is stopped; `-1` never stops it.
    pub timeout_secs: f64,
    pub result_file: Option<String>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            start_time: None,
            stop_time: None,
            tolerance: 1e-6,
            solver: None,
            number_of_intervals: 500,
            timeout_secs: -1.0,
            result_file: None,
        }
    }
}

impl SimulatorSettings {
    pub fn with_start_time(mut self, t0: f64) -> Self {
        self.start_time = Some(t0);
        self
    }

    pub fn with_stop_time(mut self, t1: f64) -> Self {
        self.stop_time = Some(t1);
        self
    }

    pub fn with_tolerance(mut self, eps: f64) -> Self {
        self.tolerance = eps;
        self
    }

    pub fn with_solver<S: Into<String>>(mut self, solver: S) -> Self {
        self.solver = Some(solver.into());
        self
    }

    pub fn with_number_of_intervals(mut self, n: u32) -> Self {
        self.number_of_intervals = n;
        self
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_result_file<S: Into<String>>(mut self, name: S) -> Self {
        self.result_file = Some(name.into());
        self
    }
}

/// Value of a model parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Array(Vec<ParameterValue>),
}

impl ParameterValue {
    /// Render the value as a Modelica literal.
    ///
    /// Strings are quoted with escaped quotes so they survive being embedded
    /// in a quoted script command.
    pub fn to_modelica(&self) -> String {
        match self {
            ParameterValue::Bool(true) => "true".to_string(),
            ParameterValue::Bool(false) => "false".to_string(),
            ParameterValue::Integer(i) => i.to_string(),
            ParameterValue::Real(x) => format!("{:?}", x),
            ParameterValue::Text(s) => format!("\\\"{}\\\"", s),
            ParameterValue::Array(items) => {
                let inner: Vec<String> = items.iter().map(ParameterValue::to_modelica).collect();
                format!("{{{}}}", inner.join(", "))
            }
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Integer(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Real(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::Text(v)
    }
}

impl<T: Into<ParameterValue>> From<Vec<T>> for ParameterValue {
    fn from(v: Vec<T>) -> Self {
        ParameterValue::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Model parameters, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    entries: Vec<(String, ParameterValue)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, replacing the value of an existing key in place.
    pub fn add<K: Into<String>, V: Into<ParameterValue>>(&mut self, key: K, value: V) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn extend<I, K, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParameterValue>,
    {
        for (k, v) in values {
            self.add(k, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `name=value` declarations in Modelica syntax.
    pub fn declarations(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.to_modelica()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_name() {
        assert_eq!(Backend::from_name("Dymola", None).unwrap(), Backend::Dymola);
        assert_eq!(Backend::from_name("omc", None).unwrap(), Backend::OpenModelica);
        assert_eq!(
            Backend::from_name("custom", Some("/opt/engine".to_string())).unwrap(),
            Backend::Custom {
                executable: "/opt/engine".to_string()
            }
        );
        assert!(Backend::from_name("custom", None).is_err());
        assert!(Backend::from_name("simulink", None).is_err());
    }

    #[test]
    fn test_backend_executable() {
        assert_eq!(Backend::Dymola.executable(), "dymola");
        assert_eq!(Backend::Optimica.executable(), "jm_ipython.sh");
        let custom = Backend::Custom {
            executable: "./engine".to_string(),
        };
        assert_eq!(custom.executable(), "./engine");
    }

    #[test]
    fn test_settings_defaults() {
        let settings = SimulatorSettings::default();
        assert_eq!(settings.tolerance, 1e-6);
        assert_eq!(settings.number_of_intervals, 500);
        assert_eq!(settings.timeout_secs, -1.0);
        assert!(settings.start_time.is_none());
        assert!(settings.stop_time.is_none());
    }

    #[test]
    fn test_settings_builder() {
        let settings = SimulatorSettings::default()
            .with_start_time(0.0)
            .with_stop_time(3600.0)
            .with_solver("radau")
            .with_timeout_secs(30.0);
        assert_eq!(settings.stop_time, Some(3600.0));
        assert_eq!(settings.solver.as_deref(), Some("radau"));
        assert_eq!(settings.timeout_secs, 30.0);
    }

    #[test]
    fn test_to_modelica_scalars() {
        assert_eq!(ParameterValue::from(true).to_modelica(), "true");
        assert_eq!(ParameterValue::from(false).to_modelica(), "false");
        assert_eq!(ParameterValue::from(3_i64).to_modelica(), "3");
        assert_eq!(ParameterValue::from(1.0).to_modelica(), "1.0");
        assert_eq!(ParameterValue::from("abc").to_modelica(), "\\\"abc\\\"");
    }

    #[test]
    fn test_to_modelica_arrays() {
        let vector = ParameterValue::from(vec![2_i64, 3]);
        assert_eq!(vector.to_modelica(), "{2, 3}");

        let matrix = ParameterValue::from(vec![vec![1.1, 1.2], vec![2.1, 2.2]]);
        assert_eq!(matrix.to_modelica(), "{{1.1, 1.2}, {2.1, 2.2}}");
    }

    #[test]
    fn test_parameters_keep_insertion_order_and_update_in_place() {
        let mut params = Parameters::new();
        params.add("PID.k", 1.0);
        params.add("valve.m_flow_nominal", 0.1);
        params.add("PID.k", 2.0);

        let keys: Vec<&str> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["PID.k", "valve.m_flow_nominal"]);
        assert_eq!(params.get("PID.k"), Some(&ParameterValue::Real(2.0)));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_parameter_declarations() {
        let mut params = Parameters::new();
        params.extend([("const1.k", ParameterValue::from(vec![2_i64, 3]))]);
        params.add("flag", true);
        assert_eq!(
            params.declarations(),
            vec!["const1.k={2, 3}".to_string(), "flag=true".to_string()]
        );
    }
}
