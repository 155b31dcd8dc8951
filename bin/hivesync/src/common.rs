use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use hivesync_core::config::{ClientSettings, FleetConfig, ProbeTable};

/// Where the fleet and its tuning come from. Built-in defaults apply to anything not given.
#[derive(Debug, Parser)]
pub struct FleetOptions {
    /// Path to a JSON node list
    #[clap(long, env = "HIVESYNC_NODES")]
    nodes: Option<PathBuf>,
    /// Path to a JSON table of sub-API canary requests
    #[clap(long, env = "HIVESYNC_PROBES")]
    probes: Option<PathBuf>,
    /// Path to JSON endpoint client settings
    #[clap(long, env = "HIVESYNC_SETTINGS")]
    settings: Option<PathBuf>,
}

impl FleetOptions {
    pub fn load(&self) -> Result<(FleetConfig, ProbeTable, ClientSettings)> {
        let fleet = match &self.nodes {
            Some(path) => FleetConfig::from_path(path)?,
            None => FleetConfig::default(),
        };
        let probes = match &self.probes {
            Some(path) => ProbeTable::from_path(path)?,
            None => ProbeTable::default(),
        };
        let settings = match &self.settings {
            Some(path) => ClientSettings::from_path(path)?,
            None => ClientSettings::default(),
        };

        Ok((fleet, probes, settings))
    }
}
