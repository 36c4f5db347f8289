/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::process::ExitCode;

use clap::Parser;
use console::style;
use backup_rotation_cli::modules::{EXIT_SETUP_FAILURE, cli::Cli, logging};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(err) = logging::init(&args.log_level, args.log_format) {
        eprintln!("{} {err:#}", style("error:").red().bold());
        return ExitCode::from(EXIT_SETUP_FAILURE);
    }

    match args.command.exec(args.config.as_deref()).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}
