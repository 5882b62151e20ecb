//! Probes, one per target kind.

pub mod database;
pub mod filesystem;
pub mod forge;

use std::time::Duration;

use crate::core::config::Config;
use crate::core::model::TargetKind;
use crate::core::probe::Probe;

pub fn probe_for(kind: TargetKind, config: &Config) -> Box<dyn Probe> {
    let timeout = Duration::from_secs(config.probe.timeout_secs);
    match kind {
        TargetKind::Filesystem => Box::new(
            filesystem::FilesystemProbe::new(config.filesystem.clone()).with_timeout(timeout),
        ),
        TargetKind::Forge => Box::new(forge::ForgeProbe::new(timeout)),
        TargetKind::Database => Box::new(database::DatabaseProbe::new(
            config.database.clone(),
            timeout,
        )),
    }
}
