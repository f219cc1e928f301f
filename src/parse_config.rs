use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    dataset::SyntheticBatchConfig,
    error::Result,
    options::{ComputeLocation, CtcOptions, ProbabilityScale},
};

#[derive(Serialize, Deserialize, Debug)]
struct EngineYaml {
    loc: ComputeLocation,
    blank_label: usize,
    #[serde(default)]
    num_threads: usize,
    #[serde(default)]
    scale: ProbabilityScale,
    #[serde(default)]
    cross_check: bool,
    #[serde(default)]
    report_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
struct BatchYaml {
    minibatch: usize,
    max_time: usize,
    alphabet_size: usize,
    min_label_len: usize,
    max_label_len: usize,
    logit_std: f32,
    iterations: usize,
    random_seed: u64,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "UPPERCASE")]
struct BenchConfigYaml {
    engine: EngineYaml,
    batch: BatchYaml,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BenchConfig {
    pub loc: ComputeLocation,
    pub blank_label: usize,
    pub num_threads: usize,
    pub scale: ProbabilityScale,
    pub cross_check: bool,
    pub report_path: Option<String>,
    pub minibatch: usize,
    pub max_time: usize,
    pub alphabet_size: usize,
    pub min_label_len: usize,
    pub max_label_len: usize,
    pub logit_std: f32,
    pub iterations: usize,
    pub random_seed: u64,
}

impl BenchConfig {
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = fs::read_to_string(path)?;

        Self::from_yaml_str(&yaml)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let yaml: BenchConfigYaml = serde_yaml::from_str(yaml)?;

        Ok(Self {
            loc: yaml.engine.loc,
            blank_label: yaml.engine.blank_label,
            num_threads: yaml.engine.num_threads,
            scale: yaml.engine.scale,
            cross_check: yaml.engine.cross_check,
            report_path: yaml.engine.report_path,
            minibatch: yaml.batch.minibatch,
            max_time: yaml.batch.max_time,
            alphabet_size: yaml.batch.alphabet_size,
            min_label_len: yaml.batch.min_label_len,
            max_label_len: yaml.batch.max_label_len,
            logit_std: yaml.batch.logit_std,
            iterations: yaml.batch.iterations,
            random_seed: yaml.batch.random_seed,
        })
    }

    /// Options of the engine under test, on the default device.
    pub fn options(&self) -> CtcOptions {
        CtcOptions {
            loc: self.loc,
            blank_label: self.blank_label,
            num_threads: self.num_threads,
            scale: self.scale,
            stream: None,
        }
    }

    pub fn batch_config(&self) -> SyntheticBatchConfig {
        SyntheticBatchConfig {
            minibatch: self.minibatch,
            max_time: self.max_time,
            alphabet_size: self.alphabet_size,
            blank_label: self.blank_label,
            min_label_len: self.min_label_len,
            max_label_len: self.max_label_len,
            logit_std: self.logit_std,
        }
    }
}
