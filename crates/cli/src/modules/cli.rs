/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "backup-rotation")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Configuration file (TOML). Environment variables override its values.
    #[arg(short, long, env = "BACKUP_CONFIG", global = true)]
    pub config: Option<PathBuf>,
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dump, encrypt, upload and rotate once
    Run {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run backups on the configured cron schedule until interrupted
    Daemon,

    /// Show which remote backups would be kept or deleted
    Plan {
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply remote retention without taking a new backup
    Prune {
        /// Print the prune report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decrypt an encrypted backup artifact
    Decrypt {
        /// Encrypted input file
        input: PathBuf,
        /// Output file, defaults to the input without its .enc suffix
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_globals() {
        let cli = Cli::try_parse_from([
            "backup-rotation",
            "run",
            "--json",
            "--config",
            "/etc/backup.toml",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Run { json: true }));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/backup.toml")));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_decrypt() {
        let cli = Cli::try_parse_from([
            "backup-rotation",
            "decrypt",
            "db_20240310_120000.sql.gz.enc",
            "-o",
            "restore.sql.gz",
        ])
        .unwrap();

        match cli.command {
            Commands::Decrypt { input, out } => {
                assert_eq!(input, PathBuf::from("db_20240310_120000.sql.gz.enc"));
                assert_eq!(out, Some(PathBuf::from("restore.sql.gz")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["backup-rotation", "restore"]).is_err());
    }
}
