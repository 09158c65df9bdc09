// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/payload-dumper-rust

pub mod bootctl;
pub mod config;
pub mod constants;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod payload;
pub mod performer;
pub mod prefs;
pub mod proto;
pub mod snapshot;
pub mod utils;
pub mod verity;
