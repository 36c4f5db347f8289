/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use backup_rotation::{decrypt_file, record::ENCRYPTED_EXTENSION};
use console::style;
use secrecy::SecretString;
use tracing::info;

use super::{cli::Commands, load_config, load_service, output};

impl Commands {
    /// Execute the command and return the process exit status
    pub async fn exec(self, config: Option<&Path>) -> anyhow::Result<u8> {
        match self {
            Commands::Run { json } => {
                let service = load_service(config).await?;
                let report = service.run_once().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    output::print_run_report(&report);
                }
                Ok(u8::try_from(report.exit_code()).unwrap_or(super::EXIT_SETUP_FAILURE))
            }
            Commands::Daemon => {
                let service = load_service(config).await?;
                info!("Running scheduled backups, press Ctrl-C to stop");
                service
                    .run_scheduled(async {
                        if let Err(err) = tokio::signal::ctrl_c().await {
                            tracing::error!(error = %err, "Failed to listen for shutdown signal");
                        }
                    })
                    .await?;
                Ok(0)
            }
            Commands::Plan { json } => {
                let service = load_service(config).await?;
                let plan = service.plan().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&plan)?);
                } else {
                    output::print_plan(&plan, &service.orchestrator().settings().policy);
                }
                Ok(0)
            }
            Commands::Prune { json } => {
                let service = load_service(config).await?;
                let report = service.prune().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    output::print_prune_report(&report);
                }
                Ok(0)
            }
            Commands::Decrypt { input, out } => {
                let out = match out {
                    Some(out) => out,
                    None => default_output(&input)?,
                };
                if out.exists() {
                    bail!("Refusing to overwrite {}", out.display());
                }

                let passphrase = match load_config(config).await?.encryption.passphrase {
                    Some(passphrase) => passphrase,
                    None => SecretString::from(
                        rpassword::prompt_password("Enter encryption passphrase: ")
                            .context("Failed to read passphrase")?,
                    ),
                };

                let bytes = decrypt_file(&input, &out, &passphrase).await?;
                eprintln!(
                    "{} {} ({} bytes)",
                    style("Decrypted to").green(),
                    out.display(),
                    bytes
                );
                Ok(0)
            }
        }
    }
}

/// Strip the encryption suffix from `input`
fn default_output(input: &Path) -> anyhow::Result<PathBuf> {
    let name = input
        .file_name()
        .and_then(|name| name.to_str())
        .context("Input path has no file name")?;
    match name.strip_suffix(&format!(".{ENCRYPTED_EXTENSION}")) {
        Some(stem) if !stem.is_empty() => Ok(input.with_file_name(stem)),
        _ => bail!(
            "{} has no .{ENCRYPTED_EXTENSION} suffix, use --out to name the output",
            input.display()
        ),
    }
}
