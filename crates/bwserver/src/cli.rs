//! Command-line interface of the cluster server binary.
//!
//! Options given here override the matching settings from the
//! configuration file.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Which process the binary runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// The BaseApp manager
    BaseAppMgr,
    /// A BaseApp worker, optionally acting as a backup
    BaseApp { manager: Option<String>, backup: bool },
    /// One-shot status query against a running manager
    Status { manager: String },
}

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the bind address
    pub bind_address: Option<String>,
    /// Optional override for the log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    pub role: Role,
}

impl CliArgs {
    /// Builds the clap command.
    pub fn command() -> Command {
        Command::new("bwserver")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Cluster server processes communicating over Mercury")
            .subcommand_required(true)
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("bwserver.toml")
                    .global(true),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Bind address (e.g., 127.0.0.1:20013)")
                    .global(true),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)")
                    .global(true),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(ArgAction::SetTrue)
                    .global(true),
            )
            .subcommand(Command::new("baseappmgr").about("Run the BaseApp manager"))
            .subcommand(
                Command::new("baseapp")
                    .about("Run a BaseApp that registers with the manager")
                    .arg(
                        Arg::new("manager")
                            .short('m')
                            .long("manager")
                            .value_name("ADDRESS")
                            .help("Manager address; located by interface query when omitted"),
                    )
                    .arg(
                        Arg::new("backup")
                            .long("backup")
                            .help("Register as a backup BaseApp")
                            .action(ArgAction::SetTrue),
                    ),
            )
            .subcommand(
                Command::new("status")
                    .about("Print the health summary of a running manager")
                    .arg(
                        Arg::new("manager")
                            .short('m')
                            .long("manager")
                            .value_name("ADDRESS")
                            .help("Manager address")
                            .required(true),
                    ),
            )
    }

    /// Parses the process arguments.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    /// Parses an explicit argument list, returning clap's error on failure.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&Self::command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        let role = match matches.subcommand() {
            Some(("baseapp", sub)) => Role::BaseApp {
                manager: sub.get_one::<String>("manager").cloned(),
                backup: sub.get_flag("backup"),
            },
            Some(("status", sub)) => Role::Status {
                manager: sub.get_one::<String>("manager").cloned().unwrap_or_default(),
            },
            _ => Role::BaseAppMgr,
        };

        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("bwserver.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_with_overrides() {
        let args = CliArgs::try_parse_from([
            "bwserver",
            "baseappmgr",
            "--bind",
            "0.0.0.0:20013",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(args.role, Role::BaseAppMgr);
        assert_eq!(args.bind_address.as_deref(), Some("0.0.0.0:20013"));
        assert!(args.json_logs);
        assert_eq!(args.config_path, PathBuf::from("bwserver.toml"));
    }

    #[test]
    fn test_base_app_backup() {
        let args = CliArgs::try_parse_from([
            "bwserver",
            "-c",
            "cluster.toml",
            "baseapp",
            "--backup",
            "-m",
            "10.0.0.1:20013",
        ])
        .unwrap();
        assert_eq!(
            args.role,
            Role::BaseApp {
                manager: Some("10.0.0.1:20013".to_string()),
                backup: true
            }
        );
        assert_eq!(args.config_path, PathBuf::from("cluster.toml"));
    }

    #[test]
    fn test_status_requires_manager() {
        assert!(CliArgs::try_parse_from(["bwserver", "status"]).is_err());
        assert!(CliArgs::try_parse_from(["bwserver"]).is_err());
    }
}
