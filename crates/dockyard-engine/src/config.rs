//! Engine settings with environment overrides.
//!
//! Resource budgets and the CFS period are deliberately not configurable;
//! they are fixed constants in [`crate::rebalance`]. Engine endpoint
//! selection is handled by `Docker::connect_with_defaults`, which honors
//! `DOCKER_HOST`.

use std::env;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Shell launched for interactive terminal sessions.
    pub shell: String,
    /// When true, fairness passes only count running containers; stopped
    /// ones keep their last-applied limits and claim no share.
    pub rebalance_running_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            rebalance_running_only: true,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shell: env::var("DOCKYARD_SHELL").unwrap_or(defaults.shell),
            rebalance_running_only: env::var("DOCKYARD_REBALANCE_RUNNING_ONLY")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.rebalance_running_only),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}
