/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Per-client and per-domain routing rules
//!
//! Rule lists are built at config parse/reload time and swapped in as
//! immutable snapshots; lookups on the query path never take a lock.

pub mod forwarders;
pub mod profiles;
