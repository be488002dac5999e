//! CLI argument parsing for nanown

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nanown")]
#[command(version)]
#[command(about = "Timing-oracle measurement reduction and classifier training", long_about = None)]
pub struct Cli {
    /// Measurement database (created if missing)
    #[arg(short = 'd', long = "db", value_name = "FILE", global = true, default_value = "nanown.db")]
    pub db: PathBuf,

    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load probe records (newline-delimited JSON) written by the prober
    LoadProbes {
        /// Probe record file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Measure the remote TCP timestamp clock precision and store it
    Precision {
        /// Packet feed captured during the timestamp probes
        #[arg(short = 'f', long = "feed", value_name = "FILE")]
        feed: PathBuf,

        /// Local ports used by the timestamp probes
        #[arg(short = 'p', long = "port", value_name = "PORT", value_delimiter = ',', required = true)]
        ports: Vec<u16>,
    },

    /// Associate a captured packet feed with the stored probes
    Associate {
        /// Packet feed (newline-delimited JSON)
        #[arg(short = 'f', long = "feed", value_name = "FILE")]
        feed: PathBuf,
    },

    /// Select trim parameters, write canonical analyses, record the unusual case
    Analyze,

    /// Train classifiers for the given trial sizes
    Train {
        /// Observations per bootstrap trial
        #[arg(short = 'n', long = "observations", value_delimiter = ',', required = true)]
        observations: Vec<usize>,

        /// Classifiers to train (default: from configuration)
        #[arg(long = "classifier", value_delimiter = ',')]
        classifiers: Vec<String>,

        /// Use small trial counts for a quick pass
        #[arg(long = "quick")]
        quick: bool,
    },

    /// Print the best stored result for a classifier
    Best {
        #[arg(long = "classifier")]
        classifier: String,

        #[arg(short = 'n', long = "observations")]
        observations: usize,

        /// Trial type of the stored result
        #[arg(long = "trial-type", default_value = "train")]
        trial_type: String,
    },

    /// Apply the best trained configuration to the test population
    Evaluate {
        #[arg(long = "classifier")]
        classifier: String,

        #[arg(short = 'n', long = "observations")]
        observations: usize,

        /// Number of test trials
        #[arg(long = "trials", default_value = "500")]
        trials: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_precision_ports() {
        let cli = Cli::parse_from(["nanown", "precision", "-f", "ts.json", "-p", "4001,4002"]);
        match cli.command {
            Command::Precision { feed, ports } => {
                assert_eq!(feed, PathBuf::from("ts.json"));
                assert_eq!(ports, vec![4001, 4002]);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.db, PathBuf::from("nanown.db"));
    }

    #[test]
    fn test_cli_global_db_after_subcommand() {
        let cli = Cli::parse_from(["nanown", "analyze", "--db", "x.db", "--debug"]);
        assert!(matches!(cli.command, Command::Analyze));
        assert_eq!(cli.db, PathBuf::from("x.db"));
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_train_lists() {
        let cli = Cli::parse_from([
            "nanown",
            "train",
            "-n",
            "10,50",
            "--classifier",
            "boxtest,kalman",
            "--quick",
        ]);
        match cli.command {
            Command::Train {
                observations,
                classifiers,
                quick,
            } => {
                assert_eq!(observations, vec![10, 50]);
                assert_eq!(classifiers, vec!["boxtest", "kalman"]);
                assert!(quick);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["nanown"]).is_err());
        assert!(Cli::try_parse_from(["nanown", "train"]).is_err());
    }
}
