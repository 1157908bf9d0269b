/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Platform integration contracts
//!
//! Service registration and system-resolver activation are host-specific
//! glue the daemon core only consumes through these traits. The stub
//! implementation keeps the CLI surface complete on hosts without an
//! adapter: every command fails with a clear diagnostic instead of
//! guessing at init-system details.

use crate::core::error::{ProxyError, Result};

/// Host service-manager operations (`install`, `start`, ...)
pub trait ServiceManager {
    fn install(&self) -> Result<()>;
    fn uninstall(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn restart(&self) -> Result<()>;
    /// Human-readable service state
    fn status(&self) -> Result<String>;
    /// Stored service log contents
    fn log(&self) -> Result<String>;
}

/// System resolver switching (`activate` points the host at 127.0.0.1)
pub trait SystemDns {
    fn activate(&self) -> Result<()>;
    fn deactivate(&self) -> Result<()>;
}

/// Fallback for hosts without a platform adapter
pub struct Unsupported;

impl Unsupported {
    fn fail<T>(&self, operation: &str) -> Result<T> {
        Err(ProxyError::runtime(format!(
            "{operation}: no service integration for this platform; run the daemon directly with `havendns run`"
        )))
    }
}

impl ServiceManager for Unsupported {
    fn install(&self) -> Result<()> {
        self.fail("install")
    }

    fn uninstall(&self) -> Result<()> {
        self.fail("uninstall")
    }

    fn start(&self) -> Result<()> {
        self.fail("start")
    }

    fn stop(&self) -> Result<()> {
        self.fail("stop")
    }

    fn restart(&self) -> Result<()> {
        self.fail("restart")
    }

    fn status(&self) -> Result<String> {
        self.fail("status")
    }

    fn log(&self) -> Result<String> {
        self.fail("log")
    }
}

impl SystemDns for Unsupported {
    fn activate(&self) -> Result<()> {
        self.fail("activate")
    }

    fn deactivate(&self) -> Result<()> {
        self.fail("deactivate")
    }
}

/// Pick the adapter for the running host
pub fn service_manager() -> Box<dyn ServiceManager> {
    Box::new(Unsupported)
}

pub fn system_dns() -> Box<dyn SystemDns> {
    Box::new(Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_operations_name_themselves() {
        let err = service_manager().install().unwrap_err();
        assert!(err.to_string().contains("install"));
        let err = system_dns().activate().unwrap_err();
        assert!(err.to_string().contains("activate"));
    }
}
