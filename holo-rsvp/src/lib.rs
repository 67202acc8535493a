//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod admission;
pub mod collections;
pub mod config;
pub mod debug;
pub mod error;
pub mod events;
pub mod instance;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod lsp;
pub mod task;
pub mod tasks;
pub mod te;
pub mod timers;
pub mod tunnel;
