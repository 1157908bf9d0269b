/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! havendns — local DNS proxy with DoH upstreams
//!
//! `havendns run` serves DNS on UDP/TCP (and DoT/DoH when configured),
//! forwarding over HTTP/2 to the healthiest upstream endpoint. The other
//! commands manage the installed service, the system resolver and the
//! on-disk configuration.

mod cache;
mod config;
mod core;
mod ctl;
mod discovery;
mod dns;
mod endpoint;
mod netmon;
mod platform;
mod proxy;
mod resolver;
mod rules;
mod server;
mod transport;

use clap::Parser;
use std::sync::Arc;

use crate::config::file::ConfigFile;
use crate::config::Config;
use crate::core::error::Result;
use crate::core::runtime::{Command, ConfigCommand, Options};

fn main() {
    let options = Options::parse();
    if let Err(e) = dispatch(options) {
        eprintln!("havendns: {e}");
        std::process::exit(1);
    }
}

fn dispatch(options: Options) -> Result<()> {
    match options.command {
        Command::Run => run(options),
        Command::Install => platform::service_manager().install(),
        Command::Uninstall => platform::service_manager().uninstall(),
        Command::Start => platform::service_manager().start(),
        Command::Stop => platform::service_manager().stop(),
        Command::Restart => platform::service_manager().restart(),
        Command::Status => {
            println!("{}", platform::service_manager().status()?);
            Ok(())
        }
        Command::Activate => platform::system_dns().activate(),
        Command::Deactivate => platform::system_dns().deactivate(),
        Command::Config(ref command) => config_command(&options, command),
        Command::Log => {
            println!("{}", platform::service_manager().log()?);
            Ok(())
        }
        Command::Version => {
            println!("havendns {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run(options: Options) -> Result<()> {
    let config = Config::load(&options.config)?;
    let level = options.log_level.as_deref().unwrap_or("info");
    let log_file = config.log_file.as_ref().and_then(|p| p.to_str());
    let (_guard, log_handle) = crate::core::init_log(level, log_file);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(proxy::run(options.config, config, Arc::new(log_handle)))
}

fn config_command(options: &Options, command: &ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::List => {
            let file = ConfigFile::load(&options.config)?;
            for (key, value) in file.entries() {
                println!("{key} {value}");
            }
            Ok(())
        }
        ConfigCommand::Set { assignments } => {
            // Validate every assignment before touching the file
            let mut staged: Vec<(String, String)> = Vec::new();
            let mut probe = Config::default();
            for assignment in assignments {
                let (key, value) = assignment.split_once('=').ok_or_else(|| {
                    crate::core::error::ProxyError::config(format!(
                        "expected key=value, got: {assignment}"
                    ))
                })?;
                probe.set(key, value)?;
                staged.push((key.to_string(), value.to_string()));
            }

            let mut file = ConfigFile::load(&options.config)?;
            let mut keys: Vec<&String> = staged.iter().map(|(k, _)| k).collect();
            keys.dedup();
            for key in keys {
                let values: Vec<String> = staged
                    .iter()
                    .filter(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .collect();
                file.set(key, &values);
            }
            file.save(&options.config)
        }
    }
}
