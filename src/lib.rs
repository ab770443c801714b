// SPDX-License-Identifier: Apache-2.0
pub mod cli;
pub mod config;
pub mod control;
pub mod edgelogd;
pub mod inputs;
pub mod logs;
pub mod metrics;
pub mod util;
