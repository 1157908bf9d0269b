/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Command-line surface
//!
//! All commands exit 0 on success and non-zero on failure. `run` starts the
//! daemon in the foreground; the service-manager commands delegate to the
//! platform layer.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "havendns", version, about = "Local DNS proxy with DoH upstreams")]
pub struct Options {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "/etc/havendns.conf")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon in the foreground
    Run,
    /// Register the daemon with the host's service manager
    Install,
    /// Deregister the daemon from the host's service manager
    Uninstall,
    /// Start the installed service
    Start,
    /// Stop the installed service
    Stop,
    /// Restart the installed service
    Restart,
    /// Show the installed service status
    Status,
    /// Point the host's system resolver at 127.0.0.1
    Activate,
    /// Restore the host's previous system resolver
    Deactivate,
    /// Read or mutate the on-disk configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Dump the service log
    Log,
    /// Print version
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print every configured key
    List,
    /// Set one or more `key=value` pairs in the config file
    Set {
        /// Assignments in `key=value` form
        #[arg(required = true)]
        assignments: Vec<String>,
    },
}
