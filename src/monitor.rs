//! Epoch block monitor.
//!
//! Watches the acquisition directory for epoch blocks and decides when one is
//! sealed (no longer growing) and safe to hand downstream. A block's
//! observable state is its manifest: the sorted (file name, size) pairs of its
//! directory. A block seals once two consecutive polls, separated by at least
//! the configured quiet window, observe the same manifest. A still-growing
//! block is reported to nobody; "not sealed yet" is a deferred state, not an
//! error.
//!
//! Sealing is sticky: once sealed, a block stays sealed for the lifetime of
//! the monitor and is re-reported each poll (downstream consumption is
//! idempotent, so re-reporting is harmless and makes crash recovery trivial).

use crate::error::PipelineResult;
use crate::layout::ExperimentLayout;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::info;

/// A sealed epoch block, ready for rechunking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    /// Epoch block directory name.
    pub name: String,
    /// Total payload bytes across the block's `.bin` files.
    pub payload_bytes: u64,
}

#[derive(Debug)]
struct Observation {
    manifest: Vec<(String, u64)>,
    observed_at: Instant,
}

/// Detects sealed acquisition epoch blocks by manifest comparison.
#[derive(Debug)]
pub struct EpochBlockMonitor {
    layout: ExperimentLayout,
    quiet_window: Duration,
    observations: BTreeMap<String, Observation>,
    sealed: BTreeMap<String, u64>,
}

impl EpochBlockMonitor {
    /// Monitor over the layout's acquisition directory.
    #[must_use]
    pub fn new(layout: ExperimentLayout, quiet_window: Duration) -> Self {
        Self {
            layout,
            quiet_window,
            observations: BTreeMap::new(),
            sealed: BTreeMap::new(),
        }
    }

    /// Poll once. Returns every currently sealed block in name order.
    pub fn poll(&mut self) -> PipelineResult<Vec<SealedBlock>> {
        let acquisition = self.layout.acquisition_dir();
        if acquisition.is_dir() {
            let mut names: Vec<String> = Vec::new();
            for entry in std::fs::read_dir(&acquisition)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names.sort();

            let now = Instant::now();
            for name in names {
                if self.sealed.contains_key(&name) {
                    continue;
                }
                let manifest = read_manifest(&self.layout, &name)?;
                if manifest.is_empty() {
                    // nothing recorded yet; keep waiting
                    self.observations.remove(&name);
                    continue;
                }
                match self.observations.get(&name) {
                    Some(prev)
                        if prev.manifest == manifest
                            && now.duration_since(prev.observed_at) >= self.quiet_window =>
                    {
                        let payload_bytes = payload_bytes(&manifest);
                        info!(epoch_block = %name, payload_bytes, "epoch block sealed");
                        self.observations.remove(&name);
                        self.sealed.insert(name, payload_bytes);
                    }
                    Some(prev) if prev.manifest == manifest => {
                        // unchanged but the quiet window has not elapsed yet
                    }
                    _ => {
                        self.observations.insert(
                            name,
                            Observation {
                                manifest,
                                observed_at: now,
                            },
                        );
                    }
                }
            }
        }

        Ok(self
            .sealed
            .iter()
            .map(|(name, &payload_bytes)| SealedBlock {
                name: name.clone(),
                payload_bytes,
            })
            .collect())
    }
}

fn read_manifest(layout: &ExperimentLayout, name: &str) -> PipelineResult<Vec<(String, u64)>> {
    let dir = layout.acquisition_block_dir(name);
    let mut manifest = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            manifest.push((
                entry.file_name().to_string_lossy().into_owned(),
                entry.metadata()?.len(),
            ));
        }
    }
    manifest.sort();
    Ok(manifest)
}

fn payload_bytes(manifest: &[(String, u64)]) -> u64 {
    manifest
        .iter()
        .filter(|(name, _)| name.ends_with(".bin"))
        .map(|&(_, size)| size)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, ExperimentLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ExperimentLayout::new(dir.path());
        std::fs::create_dir_all(layout.acquisition_dir()).unwrap();
        (dir, layout)
    }

    fn write_block(layout: &ExperimentLayout, name: &str, bytes: usize) {
        let dir = layout.acquisition_block_dir(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("data000.bin"), vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn unchanged_manifest_seals_after_two_polls() {
        let (_dir, layout) = setup();
        write_block(&layout, "epoch_block_001", 800);

        let mut monitor = EpochBlockMonitor::new(layout, Duration::ZERO);
        assert!(monitor.poll().unwrap().is_empty());

        let sealed = monitor.poll().unwrap();
        assert_eq!(
            sealed,
            vec![SealedBlock {
                name: "epoch_block_001".into(),
                payload_bytes: 800,
            }]
        );
    }

    #[test]
    fn growing_block_is_not_sealed() {
        let (_dir, layout) = setup();
        write_block(&layout, "epoch_block_001", 100);

        let mut monitor = EpochBlockMonitor::new(layout.clone(), Duration::ZERO);
        assert!(monitor.poll().unwrap().is_empty());

        // grows between polls: observation resets
        write_block(&layout, "epoch_block_001", 200);
        assert!(monitor.poll().unwrap().is_empty());

        // stable across the next two polls
        assert_eq!(monitor.poll().unwrap().len(), 1);
    }

    #[test]
    fn quiet_window_defers_sealing() {
        let (_dir, layout) = setup();
        write_block(&layout, "epoch_block_001", 100);

        let mut monitor = EpochBlockMonitor::new(layout, Duration::from_secs(3600));
        assert!(monitor.poll().unwrap().is_empty());
        assert!(monitor.poll().unwrap().is_empty());
    }

    #[test]
    fn sealed_blocks_reported_in_name_order() {
        let (_dir, layout) = setup();
        write_block(&layout, "epoch_block_002", 10);
        write_block(&layout, "epoch_block_001", 10);

        let mut monitor = EpochBlockMonitor::new(layout, Duration::ZERO);
        monitor.poll().unwrap();
        let sealed = monitor.poll().unwrap();
        let names: Vec<_> = sealed.into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["epoch_block_001", "epoch_block_002"]);
    }

    #[test]
    fn empty_block_never_seals() {
        let (_dir, layout) = setup();
        std::fs::create_dir_all(layout.acquisition_block_dir("epoch_block_001")).unwrap();

        let mut monitor = EpochBlockMonitor::new(layout, Duration::ZERO);
        monitor.poll().unwrap();
        assert!(monitor.poll().unwrap().is_empty());
    }
}
