/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup Rotation CLI Library
//!
//! Command definitions, logging setup and report rendering for the
//! `backup-rotation` binary.

pub mod modules;

// Re-export commonly used types for easier access
pub use modules::{
    EXIT_SETUP_FAILURE,
    cli::{Cli, Commands, LogFormat},
};
