//! Configuration for inference instances and their filters.
//!
//! Everything has a serde default so partial configuration files are valid. Files are read and
//! written as JSON, YAML or TOML depending on the extension.
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::belief::MotionModel;
use crate::error::FilterError;
use crate::filter::FilterKind;

fn default_seed() -> u64 {
    42
}
fn default_max_update_interval() -> f64 {
    300.0
}
fn default_diagnostics_window() -> usize {
    20
}

/// How much result history an instance keeps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InfoLevel {
    /// Keep only the latest result record.
    #[default]
    SingleResult,
    /// Keep every result record.
    AllResults,
    /// Keep every result record together with the posterior it came from.
    Debug,
}

/// Whether observations for unknown vehicles create instances on the fly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationPolicy {
    #[default]
    Lazy,
    Explicit,
}

/// Prior probabilities of moving between the on-road and off-road regimes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionProbabilities {
    /// Probability that an on-road particle leaves the road at the next fix
    pub on_to_off: f64,
    /// Probability that an off-road particle joins a road at the next fix
    pub off_to_on: f64,
    /// Probability that a freshly initialized particle is off-road
    pub initial_off_road: f64,
}

impl Default for TransitionProbabilities {
    fn default() -> Self {
        TransitionProbabilities {
            on_to_off: 0.05,
            off_to_on: 0.2,
            initial_off_road: 0.1,
        }
    }
}

/// Numeric parameters shared by all filter variants.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParameters {
    pub num_particles: usize,
    /// Floor applied to the reported GPS accuracy (meters, one sigma)
    pub min_observation_std_m: f64,
    /// Variance of the initial velocity components (m²/s²)
    pub initial_velocity_variance: f64,
    pub on_road_accel_variance: f64,
    pub off_road_accel_variance: f64,
    /// Base radius for the candidate edge search (meters)
    pub edge_search_radius_m: f64,
    /// Upper bound for the candidate edge search radius (meters)
    pub max_edge_search_radius_m: f64,
    pub transitions: TransitionProbabilities,
}

impl Default for FilterParameters {
    fn default() -> Self {
        FilterParameters {
            num_particles: 50,
            min_observation_std_m: 5.0,
            initial_velocity_variance: 25.0,
            on_road_accel_variance: 4.0,
            off_road_accel_variance: 9.0,
            edge_search_radius_m: 50.0,
            max_edge_search_radius_m: 250.0,
            transitions: TransitionProbabilities::default(),
        }
    }
}

impl FilterParameters {
    /// Check every parameter; the first offending one is reported.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.num_particles == 0 {
            return Err(invalid("num_particles", "must be at least 1"));
        }
        positive("min_observation_std_m", self.min_observation_std_m)?;
        positive("initial_velocity_variance", self.initial_velocity_variance)?;
        positive("on_road_accel_variance", self.on_road_accel_variance)?;
        positive("off_road_accel_variance", self.off_road_accel_variance)?;
        positive("edge_search_radius_m", self.edge_search_radius_m)?;
        positive("max_edge_search_radius_m", self.max_edge_search_radius_m)?;
        if self.max_edge_search_radius_m < self.edge_search_radius_m {
            return Err(invalid(
                "max_edge_search_radius_m",
                "must not be smaller than edge_search_radius_m",
            ));
        }
        probability("transitions.on_to_off", self.transitions.on_to_off)?;
        probability("transitions.off_to_on", self.transitions.off_to_on)?;
        probability("transitions.initial_off_road", self.transitions.initial_off_road)?;
        Ok(())
    }

    pub fn motion_model(&self) -> MotionModel {
        MotionModel {
            on_road_accel_variance: self.on_road_accel_variance,
            off_road_accel_variance: self.off_road_accel_variance,
        }
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> FilterError {
    FilterError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), FilterError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(name, format!("must be finite and positive, got {value}")))
    }
}

fn probability(name: &'static str, value: f64) -> Result<(), FilterError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(invalid(name, format!("must lie strictly between 0 and 1, got {value}")))
    }
}

/// Top-level configuration of the inference engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default)]
    pub filter: FilterKind,

    #[serde(default)]
    pub info_level: InfoLevel,

    /// Gap (seconds) at or beyond which an instance discards its filter and starts over.
    #[serde(default = "default_max_update_interval")]
    pub max_update_interval_s: f64,

    /// Random number generator seed for deterministic runs.
    ///
    /// Every instance seeds its filter with this value unless registered with its own seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub registration: RegistrationPolicy,

    /// Number of recent updates in the processing-time running average.
    #[serde(default = "default_diagnostics_window")]
    pub diagnostics_window: usize,

    #[serde(default)]
    pub parameters: FilterParameters,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            filter: FilterKind::default(),
            info_level: InfoLevel::default(),
            max_update_interval_s: default_max_update_interval(),
            seed: default_seed(),
            registration: RegistrationPolicy::default(),
            diagnostics_window: default_diagnostics_window(),
            parameters: FilterParameters::default(),
        }
    }
}

impl InferenceConfig {
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}
