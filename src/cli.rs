// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `devherd`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "devherd",
    version,
    about = "Supervise backend services and run their test suites during development.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the project file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Devherd.toml")]
    pub project: String,

    /// Config profile used to resolve `services/<name>/config/<profile>`.
    ///
    /// Overrides `[config].profile` from the project file.
    #[arg(long, value_name = "NAME")]
    pub profile: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DEVHERD_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List discovered services and available commands.
    List,

    /// Start (or restart) one or more services and stream their output.
    Serve {
        /// Services to start.
        #[arg(required = true, value_name = "SERVICE")]
        services: Vec<String>,

        /// Restart a service whenever a file in its directory changes.
        #[arg(long)]
        watch: bool,
    },

    /// Run the test suite of a service.
    Test {
        /// Service whose tests should run.
        #[arg(value_name = "SERVICE")]
        service: String,

        /// Re-run the suite whenever a file in the service directory changes.
        #[arg(long)]
        watch: bool,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_accepts_multiple_services() {
        let args =
            CliArgs::try_parse_from(["devherd", "--profile", "testing", "serve", "api", "scraper"])
                .unwrap();
        assert_eq!(args.profile.as_deref(), Some("testing"));
        match args.command {
            Some(Command::Serve { services, watch }) => {
                assert_eq!(services, vec!["api", "scraper"]);
                assert!(!watch);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn serve_requires_a_service() {
        assert!(CliArgs::try_parse_from(["devherd", "serve"]).is_err());
    }
}
