use clap::{Args, Parser, Subcommand};
use kpath_runner::config::PipelineConfig;
use std::path::PathBuf;

/// Compute a band structure along a path of symmetry points, one scheduler job per segment
#[derive(Debug, Parser)]
#[command(name = "kpath", version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration, flags take precedence over its values
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug messages (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Prepare, submit and wait for all segment jobs, then merge their outputs
    Run {
        #[command(flatten)]
        paths: PathArgs,

        #[command(flatten)]
        polling: PollingArgs,
    },

    /// Write segment inputs, args.json and job scripts without submitting anything
    Prepare {
        #[command(flatten)]
        paths: PathArgs,
    },

    /// Merge the segment outputs of an earlier run described by args.json
    Combine {
        #[command(flatten)]
        paths: PathArgs,
    },

    /// Convert a post-processed `.nd_Ek_ascii` table into the per-segment CSV
    Convert {
        /// Table written by the post-processor
        input: PathBuf,
    },
}

#[derive(Debug, Args)]
pub struct PathArgs {
    /// Comma separated symmetry points, G stands for Γ [default: G,X,L]
    #[arg(short, long)]
    pub path: Option<String>,

    /// XML input template of the solver
    #[arg(short = 'x', long)]
    pub template: Option<PathBuf>,

    /// Directory for segment inputs and outputs [default: BSNewOutput]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory for job scripts and scheduler logs [default: ./jobs]
    #[arg(short, long)]
    pub job_directory: Option<PathBuf>,

    /// Solver executable
    #[arg(short, long)]
    pub executable: Option<PathBuf>,

    /// Post-processing executable
    #[arg(short = 'f', long)]
    pub post_process: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct PollingArgs {
    /// Scheduler to submit to (pbs, slurm or local)
    #[arg(short, long)]
    pub scheduler: Option<String>,

    /// Seconds between two sweeps over the submitted jobs
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Seconds to wait for all jobs before giving up
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl PathArgs {
    pub fn apply(self, config: &mut PipelineConfig) {
        if let Some(path) = self.path {
            config.paths.path = path;
        }
        if let Some(template) = self.template {
            config.paths.template = Some(template);
        }
        if let Some(output) = self.output {
            config.paths.output = output;
        }
        if let Some(job_directory) = self.job_directory {
            config.paths.job_directory = job_directory;
        }
        if let Some(executable) = self.executable {
            config.job.executable = executable;
        }
        if let Some(post_process) = self.post_process {
            config.job.post_process = post_process;
        }
    }
}

impl PollingArgs {
    pub fn apply(self, config: &mut PipelineConfig) {
        if let Some(scheduler) = self.scheduler {
            config.scheduler.name = scheduler;
        }
        if let Some(interval) = self.poll_interval {
            config.polling.interval_secs = interval;
        }
        if let Some(timeout) = self.timeout {
            config.polling.timeout_secs = timeout;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "kpath", "run", "-p", "L,G,X", "-x", "bulk.xml", "-s", "slurm", "--timeout", "600",
        ])
        .unwrap();
        let mut config = PipelineConfig::default();

        let Command::Run { paths, polling } = cli.command else {
            panic!("expected the run subcommand");
        };
        paths.apply(&mut config);
        polling.apply(&mut config);

        assert_eq!(config.paths.path, "L,G,X");
        assert_eq!(config.paths.template, Some(PathBuf::from("bulk.xml")));
        assert_eq!(config.paths.output, PathBuf::from("BSNewOutput"));
        assert_eq!(config.scheduler.name, "slurm");
        assert_eq!(config.polling.timeout_secs, 600);
        assert_eq!(config.polling.interval_secs, 60);
    }
}
