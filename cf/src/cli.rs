//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// cycleflow - cycling-workflow meta-scheduler
#[derive(Parser)]
#[command(
    name = "cf",
    about = "Cycling-workflow meta-scheduler",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Run directories live under ~/cycleflow-run (override with CYLC_RUN_DIR)."
)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Start (or restart) a workflow scheduler in the foreground
    Play {
        /// Workflow id (names the run directory)
        workflow: String,

        /// Workflow definition to install on first play
        #[arg(long, value_name = "FILE")]
        source: Option<PathBuf>,
    },

    /// Stop a running workflow
    Stop {
        workflow: String,

        /// Halt new dispatches; repeat (-n -n) to abandon in-flight work
        #[arg(short = 'n', long = "now", action = clap::ArgAction::Count)]
        now: u8,

        /// Stop cleanly at a wall-clock time (RFC 3339)
        #[arg(long, value_name = "TIME", conflicts_with = "now")]
        at_clock_time: Option<String>,

        /// Hold spawning beyond this point, stop when it completes
        #[arg(long, value_name = "POINT", conflicts_with = "now")]
        at_cycle_point: Option<String>,
    },

    /// Reload the workflow configuration
    Reload { workflow: String },

    /// Hold task instances matching id globs
    Hold {
        workflow: String,
        /// Instance ids or globs, e.g. `a.1` or `a.*`
        ids: Vec<String>,
    },

    /// Release held task instances matching id globs
    Release { workflow: String, ids: Vec<String> },

    /// Force-submit instances regardless of prerequisites
    Trigger { workflow: String, ids: Vec<String> },

    /// Mark outputs of an instance as completed
    Set {
        workflow: String,
        /// Instance id, e.g. `a.1`
        id: String,
        /// Outputs to complete (default: succeeded)
        #[arg(long = "output", value_name = "LABEL")]
        outputs: Vec<String>,
    },

    /// Remove instances from the pool
    Remove { workflow: String, ids: Vec<String> },

    /// Kill the jobs of active instances
    Kill { workflow: String, ids: Vec<String> },

    /// Poll the jobs of active instances now
    Poll { workflow: String, ids: Vec<String> },

    /// Set, cancel, clear, or expire runtime-setting broadcasts
    Broadcast {
        workflow: String,

        /// Setting to broadcast, `key=value` (repeatable)
        #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Cancel a previously broadcast key (repeatable)
        #[arg(long = "cancel", value_name = "KEY")]
        cancel: Vec<String>,

        /// Remove every live broadcast
        #[arg(long)]
        clear: bool,

        /// Expire broadcasts targeting points before this cutoff
        #[arg(long, value_name = "POINT")]
        expire: Option<String>,

        /// Target cycle points (default `*`)
        #[arg(short = 'p', long = "point", value_name = "POINT")]
        points: Vec<String>,

        /// Target namespaces (default `root`)
        #[arg(short = 'N', long = "namespace", value_name = "NAME")]
        namespaces: Vec<String>,
    },

    /// Satisfy a waiting external trigger
    ExtTrigger {
        workflow: String,
        /// Event id declared in `special tasks.external-trigger`
        event: String,
        /// Restrict to one cycle point
        #[arg(long, value_name = "POINT")]
        point: Option<String>,
    },

    /// Show the state of one instance
    Show { workflow: String, id: String },

    /// Dump the live task pool and broadcasts
    Dump { workflow: String },

    /// Print a workflow or job log file
    CatLog {
        workflow: String,

        /// Job selector `point/name/NN`; the scheduler log when omitted
        #[arg(long, value_name = "POINT/NAME/NN")]
        job: Option<String>,

        /// Which job file to print
        #[arg(short = 'f', long, default_value = "job.out", value_name = "FILE")]
        file: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_parses() {
        let cli = Cli::try_parse_from(["cf", "play", "wf", "--source", "flow.yaml"]).unwrap();
        let Command::Play { workflow, source } = cli.command else {
            panic!("wrong command")
        };
        assert_eq!(workflow, "wf");
        assert_eq!(source, Some(PathBuf::from("flow.yaml")));
    }

    #[test]
    fn test_stop_now_now() {
        let cli = Cli::try_parse_from(["cf", "stop", "wf", "-n", "-n"]).unwrap();
        let Command::Stop { now, .. } = cli.command else { panic!("wrong command") };
        assert_eq!(now, 2);
    }

    #[test]
    fn test_stop_at_conflicts_with_now() {
        assert!(Cli::try_parse_from(["cf", "stop", "wf", "-n", "--at-cycle-point", "5"]).is_err());
    }

    #[test]
    fn test_broadcast_settings() {
        let cli = Cli::try_parse_from([
            "cf",
            "broadcast",
            "wf",
            "-s",
            "environment.HELLO=world",
            "-N",
            "t",
        ])
        .unwrap();
        let Command::Broadcast { set, namespaces, .. } = cli.command else {
            panic!("wrong command")
        };
        assert_eq!(set, vec!["environment.HELLO=world"]);
        assert_eq!(namespaces, vec!["t"]);
    }

    #[test]
    fn test_cat_log_defaults() {
        let cli = Cli::try_parse_from(["cf", "cat-log", "wf"]).unwrap();
        let Command::CatLog { job, file, .. } = cli.command else {
            panic!("wrong command")
        };
        assert!(job.is_none());
        assert_eq!(file, "job.out");
    }
}
