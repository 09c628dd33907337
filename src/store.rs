//! Artifact store: the single source of processing state.
//!
//! Every derived output is an artifact addressed by an [`ArtifactId`]. The
//! store answers the question "what is the status of this artifact?" with
//! an explicit [`ArtifactStatus`] (`Absent`, `Claimed`, `Present`) instead of
//! scattering `path.exists()` checks through business logic. Durable state is
//! the filesystem; the only mutation primitive is stage-to-temp followed by
//! an atomic rename.
//!
//! A [`claim`](ArtifactStore::claim) hands out a staging path next to the
//! final location. At most one claim per key exists in the process at a time;
//! a second claimant gets a benign `ClaimConflict`. Committing renames the
//! staging path into place and records a `.info` provenance sidecar; dropping
//! an uncommitted claim deletes the staging path. A crash mid-production
//! therefore leaves only an orphaned staging path, never a corrupt visible
//! artifact, and a retry simply redoes the work from scratch.

use crate::codec::staging_path;
use crate::error::{PipelineError, PipelineResult};
use crate::layout::{ArtifactKind, ExperimentLayout, SegmentRef};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

/// Address of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    /// A per-segment artifact.
    Segment {
        /// The raw segment the artifact derives from.
        segment: SegmentRef,
        /// Which derived kind.
        kind: ArtifactKind,
    },
    /// The global shift-coefficient calibration artifact.
    ShiftCoeffs,
}

impl ArtifactId {
    /// Shorthand for a per-segment id.
    #[must_use]
    pub fn segment(segment: SegmentRef, kind: ArtifactKind) -> Self {
        ArtifactId::Segment { segment, kind }
    }

    /// True when the artifact is a directory of files.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        match self {
            ArtifactId::Segment { kind, .. } => kind.is_directory(),
            ArtifactId::ShiftCoeffs => false,
        }
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactId::Segment { segment, kind } => write!(f, "{kind}/{segment}"),
            ArtifactId::ShiftCoeffs => f.write_str("shift_coeffs"),
        }
    }
}

/// Processing state of one artifact key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    /// No visible artifact and nobody producing one.
    Absent,
    /// A worker in this process holds the claim and is producing it.
    Claimed,
    /// A complete artifact is visible at the final path.
    Present,
}

/// Provenance sidecar written next to every committed artifact.
#[derive(Debug, Serialize)]
struct ArtifactInfo {
    timestamp: String,
    elapsed_time_sec: f64,
}

/// Existence-and-claim abstraction over the computed output tree.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: ExperimentLayout,
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ArtifactStore {
    /// Store over the given experiment layout.
    #[must_use]
    pub fn new(layout: ExperimentLayout) -> Self {
        Self {
            layout,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Final path of an artifact.
    #[must_use]
    pub fn final_path(&self, id: &ArtifactId) -> PathBuf {
        match id {
            ArtifactId::Segment { segment, kind } => self.layout.artifact_path(segment, *kind),
            ArtifactId::ShiftCoeffs => self.layout.shift_coeffs_path(),
        }
    }

    /// Status of an artifact key.
    #[must_use]
    pub fn status(&self, id: &ArtifactId) -> ArtifactStatus {
        let path = self.final_path(id);
        if self.lock_claims().contains(&path) {
            ArtifactStatus::Claimed
        } else if path.exists() {
            ArtifactStatus::Present
        } else {
            ArtifactStatus::Absent
        }
    }

    /// True when the artifact is visible and complete.
    #[must_use]
    pub fn is_present(&self, id: &ArtifactId) -> bool {
        self.status(id) == ArtifactStatus::Present
    }

    /// Claim exclusive production of an artifact.
    ///
    /// Fails with a benign `ClaimConflict` when the artifact is already
    /// present or another worker holds the claim.
    pub fn claim(&self, id: &ArtifactId) -> PipelineResult<ArtifactClaim> {
        let final_path = self.final_path(id);
        {
            let mut claims = self.lock_claims();
            if claims.contains(&final_path) {
                return Err(PipelineError::ClaimConflict(id.to_string()));
            }
            if final_path.exists() {
                return Err(PipelineError::ClaimConflict(format!("{id} already present")));
            }
            claims.insert(final_path.clone());
        }

        let staging = staging_path(&final_path);
        let prepared = (|| -> PipelineResult<()> {
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if id.is_directory() {
                std::fs::create_dir_all(&staging)?;
            }
            Ok(())
        })();
        if let Err(err) = prepared {
            self.lock_claims().remove(&final_path);
            return Err(err);
        }

        Ok(ArtifactClaim {
            id: id.clone(),
            final_path,
            staging,
            is_dir: id.is_directory(),
            claimed: Arc::clone(&self.claimed),
            started: Instant::now(),
            committed: false,
        })
    }

    /// Delete a visible artifact (and its sidecar) for explicit recompute.
    pub fn invalidate(&self, id: &ArtifactId) -> PipelineResult<()> {
        let path = self.final_path(id);
        remove_artifact_path(&path)?;
        Ok(())
    }

    /// Delete every artifact of one kind, across all epoch blocks. Used when
    /// a calibration change invalidates a whole layer.
    ///
    /// Must only run while no claims for that kind are in flight; the
    /// scheduler guarantees this by updating calibration between dispatch
    /// rounds.
    pub fn invalidate_kind(&self, kind: ArtifactKind) -> PipelineResult<()> {
        let dir = self.layout.computed_dir().join(kind.subdir());
        if dir.exists() {
            debug!(kind = %kind, "invalidating artifact layer");
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn lock_claims(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn remove_artifact_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else if path.exists() {
        std::fs::remove_file(path)?;
    }
    let sidecar = info_path(path);
    if sidecar.exists() {
        std::fs::remove_file(sidecar)?;
    }
    Ok(())
}

fn info_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".info");
    final_path.with_file_name(name)
}

/// Exclusive right to produce one artifact.
///
/// Write the payload into [`staging_path`](ArtifactClaim::staging_path), then
/// [`commit`](ArtifactClaim::commit). Dropping the claim without committing
/// aborts: the staging path is removed and the key returns to `Absent`.
#[derive(Debug)]
pub struct ArtifactClaim {
    id: ArtifactId,
    final_path: PathBuf,
    staging: PathBuf,
    is_dir: bool,
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
    started: Instant,
    committed: bool,
}

impl ArtifactClaim {
    /// Where the producer writes. A file path for file artifacts, an existing
    /// empty directory for directory artifacts.
    #[must_use]
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// The final path this claim will publish to.
    #[must_use]
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Publish the staged payload with an atomic rename and record the
    /// provenance sidecar.
    pub fn commit(mut self) -> PipelineResult<()> {
        let elapsed = self.started.elapsed().as_secs_f64();
        if self.final_path.exists() {
            // Lost a cross-process race; the visible artifact wins.
            debug!(artifact = %self.id, "discarding redundant staged artifact");
            self.remove_staging()?;
        } else {
            std::fs::rename(&self.staging, &self.final_path)?;
            let info = ArtifactInfo {
                timestamp: chrono::Utc::now().to_rfc3339(),
                elapsed_time_sec: elapsed,
            };
            let sidecar = info_path(&self.final_path);
            std::fs::write(&sidecar, serde_json::to_vec_pretty(&info)?)?;
        }
        self.committed = true;
        self.release();
        Ok(())
    }

    fn remove_staging(&self) -> std::io::Result<()> {
        if self.is_dir {
            if self.staging.exists() {
                std::fs::remove_dir_all(&self.staging)?;
            }
        } else if self.staging.exists() {
            std::fs::remove_file(&self.staging)?;
        }
        Ok(())
    }

    fn release(&self) {
        let mut claims = match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        claims.remove(&self.final_path);
    }
}

impl Drop for ArtifactClaim {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = self.remove_staging() {
                debug!(artifact = %self.id, error = %err, "failed to remove staging path");
            }
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ArtifactStore, ArtifactId) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(ExperimentLayout::new(dir.path()));
        let id = ArtifactId::segment(
            SegmentRef::from_index("epoch_block_001", 1),
            ArtifactKind::Stats,
        );
        (dir, store, id)
    }

    #[test]
    fn claim_commit_lifecycle() {
        let (_dir, store, id) = store();
        assert_eq!(store.status(&id), ArtifactStatus::Absent);

        let claim = store.claim(&id).unwrap();
        assert_eq!(store.status(&id), ArtifactStatus::Claimed);

        std::fs::write(claim.staging_path(), b"{}").unwrap();
        claim.commit().unwrap();
        assert_eq!(store.status(&id), ArtifactStatus::Present);

        let final_path = store.final_path(&id);
        assert!(final_path.exists());
        assert!(info_path(&final_path).exists());
    }

    #[test]
    fn second_claim_conflicts() {
        let (_dir, store, id) = store();
        let _held = store.claim(&id).unwrap();
        assert!(matches!(
            store.claim(&id),
            Err(PipelineError::ClaimConflict(_))
        ));
    }

    #[test]
    fn claim_on_present_artifact_conflicts() {
        let (_dir, store, id) = store();
        let claim = store.claim(&id).unwrap();
        std::fs::write(claim.staging_path(), b"{}").unwrap();
        claim.commit().unwrap();
        assert!(matches!(
            store.claim(&id),
            Err(PipelineError::ClaimConflict(_))
        ));
    }

    #[test]
    fn aborted_claim_leaves_nothing_visible() {
        let (_dir, store, id) = store();
        {
            let claim = store.claim(&id).unwrap();
            std::fs::write(claim.staging_path(), b"partial").unwrap();
            // dropped without commit
        }
        assert_eq!(store.status(&id), ArtifactStatus::Absent);
        let parent = store.final_path(&id).parent().unwrap().to_path_buf();
        let leftovers: Vec<_> = std::fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "staging leftovers: {leftovers:?}");

        // the key can be claimed again after the abort
        assert!(store.claim(&id).is_ok());
    }

    #[test]
    fn directory_artifact_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(ExperimentLayout::new(dir.path()));
        let id = ArtifactId::segment(
            SegmentRef::from_index("eb", 1),
            ArtifactKind::ReferenceSorting,
        );

        let claim = store.claim(&id).unwrap();
        assert!(claim.staging_path().is_dir());
        for name in crate::layout::SORTING_FILES {
            std::fs::write(claim.staging_path().join(name), b"[]").unwrap();
        }
        claim.commit().unwrap();

        let final_path = store.final_path(&id);
        assert!(final_path.is_dir());
        assert!(final_path.join("templates").exists());
        assert_eq!(store.status(&id), ArtifactStatus::Present);
    }

    #[test]
    fn invalidate_removes_artifact_and_sidecar() {
        let (_dir, store, id) = store();
        let claim = store.claim(&id).unwrap();
        std::fs::write(claim.staging_path(), b"{}").unwrap();
        claim.commit().unwrap();

        store.invalidate(&id).unwrap();
        assert_eq!(store.status(&id), ArtifactStatus::Absent);
        assert!(!info_path(&store.final_path(&id)).exists());
    }

    #[test]
    fn invalidate_kind_clears_whole_layer() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(ExperimentLayout::new(dir.path()));
        for block in ["a", "b"] {
            let id = ArtifactId::segment(SegmentRef::from_index(block, 1), ArtifactKind::Shifted);
            let claim = store.claim(&id).unwrap();
            std::fs::write(claim.staging_path(), b"x").unwrap();
            claim.commit().unwrap();
        }

        store.invalidate_kind(ArtifactKind::Shifted).unwrap();
        for block in ["a", "b"] {
            let id = ArtifactId::segment(SegmentRef::from_index(block, 1), ArtifactKind::Shifted);
            assert_eq!(store.status(&id), ArtifactStatus::Absent);
        }
    }
}
