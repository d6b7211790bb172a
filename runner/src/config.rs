use crate::path::{SymmetryPoints, DEFAULT_SYMMETRY_POINTS};
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

/// Schedulers known to `Schedulers::load`
pub const SUPPORTED_SCHEDULERS: [&str; 3] = ["pbs", "slurm", "local"];

// check if a file is executable by the current user
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        Ok(access(path, AccessFlags::X_OK).is_ok())
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Scheduler '{0}' not supported")]
    UnsupportedScheduler(String),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Configuration is invalid, see the log for details")]
    Invalid,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub job: JobConfig,
    // symbol -> coordinate table used to resolve the path
    #[serde(default = "default_symmetry_points")]
    pub symmetry_points: SymmetryPoints,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct PathsConfig {
    // comma separated waypoints, `G` is read as Γ
    pub path: String,
    pub template: Option<PathBuf>,
    // materialized inputs, manifest, segment outputs and the merged table
    pub output: PathBuf,
    // job scripts and scheduler logs
    pub job_directory: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    // Name of the selected scheduler, see Schedulers::load for the selection proccess
    pub name: String,
    // upper bound for a single qsub/qstat/sbatch/squeue invocation
    pub command_timeout_ms: u64,
    // override for qsub/sbatch
    pub submit_command: Option<PathBuf>,
    // override for qstat/squeue
    pub query_command: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct PollingConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
/// Locations inside the XML template, identified by the `cTag` of a `param`
pub struct TemplateConfig {
    pub initial_tag: String,
    pub final_tag: String,
    // `name` of the `group type="obj"` holding the material parameter
    pub title_group: String,
    pub title_tag: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct JobConfig {
    pub executable: PathBuf,
    pub post_process: PathBuf,
    // binary providing `convert`, defaults to the running executable
    pub converter: Option<PathBuf>,
    // scheduler directives, `{name}` and `{job_dir}` are substituted per job
    pub header: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            scheduler: SchedulerConfig::default(),
            polling: PollingConfig::default(),
            template: TemplateConfig::default(),
            job: JobConfig::default(),
            symmetry_points: default_symmetry_points(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            path: "G,X,L".to_owned(),
            template: None,
            output: PathBuf::from("BSNewOutput"),
            job_directory: PathBuf::from("./jobs"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "pbs".to_owned(),
            command_timeout_ms: 30_000,
            submit_command: None,
            query_command: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 48 * 60 * 60,
        }
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            initial_tag: "k0".to_owned(),
            final_tag: "kf".to_owned(),
            title_group: "ShapeName_1".to_owned(),
            title_tag: "mat".to_owned(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("nemo3d"),
            post_process: PathBuf::from("./fmtdat.ex"),
            converter: None,
            header: [
                "#PBS -N {name}",
                "#PBS -o {job_dir}/{name}.out",
                "#PBS -e {job_dir}/{name}.err",
                "#PBS -l ncpus=1",
                "#PBS -l wd",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        }
    }
}

impl SchedulerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }

        Ok(serde_yaml::from_reader(File::open(path)?)?)
    }

    /// Validate everything at once and log each problem, returns true if any error was found
    ///
    /// `submitting` enables the checks that only matter once jobs are handed to a scheduler
    pub fn preflight_checks(&mut self, submitting: bool) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        self.scheduler.name = self.scheduler.name.to_lowercase();

        if !SUPPORTED_SCHEDULERS.contains(&self.scheduler.name.as_str()) {
            error!(
                "scheduler.name ({}) is not supported, please use one of {}",
                self.scheduler.name,
                SUPPORTED_SCHEDULERS.join(", ")
            );
            contains_error = true;
        }

        if self.scheduler.command_timeout_ms == 0 {
            error!("scheduler.command_timeout_ms cannot be 0");
            contains_error = true;
        }

        match self.paths.template {
            None => {
                error!("No template was given, use --template or paths.template");
                contains_error = true;
            }
            Some(ref template) if !template.is_file() => {
                error!(
                    "Failed to find template at {}",
                    template.to_string_lossy()
                );
                contains_error = true;
            }
            Some(_) => {}
        }

        if self.symmetry_points.len() < 2 {
            error!("symmetry_points needs at least 2 entries to form a path");
            contains_error = true;
        }

        for (name, tag) in [
            ("initial_tag", &self.template.initial_tag),
            ("final_tag", &self.template.final_tag),
            ("title_group", &self.template.title_group),
            ("title_tag", &self.template.title_tag),
        ] {
            if tag.trim().is_empty() {
                error!("template.{name} cannot be empty");
                contains_error = true;
            }
        }

        if !submitting {
            return contains_error;
        }

        if self.polling.interval_secs == 0 {
            error!("polling.interval_secs cannot be 0, this would poll the scheduler in a hot loop");
            contains_error = true;
        }

        if self.polling.timeout_secs < self.polling.interval_secs {
            warn!(
                "polling.timeout_secs ({}) is shorter than polling.interval_secs ({}), the jobs are only checked once",
                self.polling.timeout_secs, self.polling.interval_secs
            );
        }

        // the solver and post processor only have to exist on the compute nodes, a missing local
        // file is not fatal for cluster schedulers
        let must_exist = self.scheduler.name == "local";

        for (name, path) in [
            ("job.executable", &self.job.executable),
            ("job.post_process", &self.job.post_process),
        ] {
            if !path.is_file() {
                if must_exist {
                    error!(
                        "Failed to find {name}. Either not a file or not found at {}",
                        path.to_string_lossy()
                    );
                    contains_error = true;
                } else {
                    warn!(
                        "{name} ({}) is not visible from here, assuming it exists on the compute nodes",
                        path.to_string_lossy()
                    );
                }

                continue;
            }

            match check_executable(path) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "{name} target {} is not executable, this might cause problems",
                        path.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if {name} ({}) is an executable: {e}",
                        path.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_symmetry_points() -> SymmetryPoints {
    DEFAULT_SYMMETRY_POINTS.clone()
}
