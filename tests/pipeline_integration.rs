//! End-to-end pipeline behavior over a real (temporary) experiment tree:
//! sealing and rechunking, dependency gating, one-time calibration,
//! idempotence, and crash recovery.

use mea_pipeline::codec::SegmentCodec;
use mea_pipeline::config::{FilterParams, Settings};
use mea_pipeline::layout::SORTING_FILES;
use mea_pipeline::scheduler::CycleReport;
use mea_pipeline::stages::high_activity::HighActivityIntervals;
use mea_pipeline::stages::stats::ChannelSpikeStats;
use mea_pipeline::{
    ArtifactId, ArtifactKind, CalibrationState, ElectrodeLayout, ExperimentLayout, Scheduler,
    SegmentRef,
};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

const N_CHANNELS: usize = 2;
const FS: f64 = 1000.0;

fn settings() -> Settings {
    Settings {
        n_channels: N_CHANNELS,
        sampling_frequency: FS,
        raw_segment_duration_sec: 1.0,
        filter_params: FilterParams {
            lowcut: 10.0,
            highcut: 300.0,
            order: 2,
        },
        detect_threshold_for_spike_stats: -40.0,
        coarse_sorting_detect_threshold: -80.0,
        // two channels can never exceed this, so no masking in these tests
        high_activity_threshold: 10.0,
        poll_interval_sec: 0.0,
        seal_quiet_sec: 0.0,
        max_concurrent_stage_tasks: 2,
        log_level: "warn".into(),
    }
}

fn electrodes() -> ElectrodeLayout {
    ElectrodeLayout::new(vec![(0.0, 0.0), (10.0, 0.0)])
}

fn scheduler(root: &Path) -> Scheduler {
    let (_tx, rx) = tokio::sync::watch::channel(false);
    Scheduler::new(Arc::new(settings()), Arc::new(electrodes()), root, rx)
}

/// 2.5 s of 2-channel data: strong spikes every 100 frames on channel 0,
/// echoed 2 frames later on channel 1.
fn spiky_acquisition_data() -> Vec<i16> {
    let frames = 2500;
    let mut data = vec![0i16; frames * N_CHANNELS];
    let mut t = 100;
    while t + 2 < frames {
        data[t * N_CHANNELS] = -3000;
        data[(t + 2) * N_CHANNELS + 1] = -3000;
        t += 100;
    }
    data
}

fn write_acquisition_block(layout: &ExperimentLayout, name: &str, samples: &[i16]) {
    let dir = layout.acquisition_block_dir(name);
    std::fs::create_dir_all(&dir).unwrap();
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    std::fs::write(dir.join("data000.bin"), bytes).unwrap();
}

async fn settle(scheduler: &mut Scheduler, max_cycles: usize) -> CycleReport {
    let mut last = scheduler.run_cycle().await.unwrap();
    for _ in 1..max_cycles {
        let report = scheduler.run_cycle().await.unwrap();
        if !report.did_work() && !last.did_work() {
            return report;
        }
        last = report;
    }
    last
}

fn artifact_tree(root: &Path) -> Vec<(String, SystemTime)> {
    fn walk(dir: &Path, base: &Path, out: &mut Vec<(String, SystemTime)>) {
        if !dir.is_dir() {
            return;
        }
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                walk(&path, base, out);
            } else {
                out.push((
                    path.strip_prefix(base).unwrap().to_string_lossy().into_owned(),
                    entry.metadata().unwrap().modified().unwrap(),
                ));
            }
        }
    }
    let mut out = Vec::new();
    walk(&root.join("raw"), root, &mut out);
    walk(&root.join("computed"), root, &mut out);
    out.sort();
    out
}

#[tokio::test]
async fn sealing_rechunking_and_raw_only_stages() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ExperimentLayout::new(dir.path());
    write_acquisition_block(&layout, "epoch_block_001", &spiky_acquisition_data());

    let mut scheduler = scheduler(dir.path());

    // first cycle only observes the manifest; nothing seals yet
    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.sealed_blocks, 0);
    assert_eq!(report.new_segments, 0);

    // second cycle seals, rechunks, and runs every raw-only stage
    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.sealed_blocks, 1);
    assert_eq!(report.new_segments, 3);
    assert_eq!(report.calibration, CalibrationState::NoReference);
    assert_eq!(report.failed, 0);

    // chunking law: 2.5 s at 1 kHz with 1 s segments -> 1000/1000/500 frames
    let codec = SegmentCodec::new(N_CHANNELS, FS);
    let frame_counts: Vec<usize> = (1..=3)
        .map(|i| {
            codec
                .frame_count(&layout.raw_segment_path(&SegmentRef::from_index(
                    "epoch_block_001",
                    i,
                )))
                .unwrap()
        })
        .collect();
    assert_eq!(frame_counts, vec![1000, 1000, 500]);
    assert!(!layout
        .raw_block_dir("epoch_block_001")
        .join("segment_004.bin")
        .exists());

    // raw-only artifacts exist for every segment; gated stages do not
    let store = scheduler.context().store.clone();
    for i in 1..=3 {
        let seg = SegmentRef::from_index("epoch_block_001", i);
        assert!(store.is_present(&ArtifactId::segment(seg.clone(), ArtifactKind::Filt)));
        assert!(store.is_present(&ArtifactId::segment(seg.clone(), ArtifactKind::Stats)));
        assert!(store.is_present(&ArtifactId::segment(seg.clone(), ArtifactKind::HighActivity)));
        assert!(!store.is_present(&ArtifactId::segment(seg.clone(), ArtifactKind::Shifted)));
        assert!(!store.is_present(&ArtifactId::segment(seg, ArtifactKind::ReferenceSorting)));
    }
    assert!(!store.is_present(&ArtifactId::ShiftCoeffs));

    // stats artifact has the published schema and sees the injected spikes
    let stats_path = layout.artifact_path(
        &SegmentRef::from_index("epoch_block_001", 1),
        ArtifactKind::Stats,
    );
    let stats: ChannelSpikeStats =
        serde_json::from_slice(&std::fs::read(stats_path).unwrap()).unwrap();
    assert_eq!(stats.mean_firing_rates.len(), N_CHANNELS);
    assert!(stats.mean_firing_rates[0] > 0.0);

    let ha_path = layout.artifact_path(
        &SegmentRef::from_index("epoch_block_001", 1),
        ArtifactKind::HighActivity,
    );
    let ha: HighActivityIntervals =
        serde_json::from_slice(&std::fs::read(ha_path).unwrap()).unwrap();
    assert!(ha.high_activity_intervals.is_empty());
}

#[tokio::test]
async fn idle_cycles_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ExperimentLayout::new(dir.path());
    write_acquisition_block(&layout, "epoch_block_001", &spiky_acquisition_data());

    let mut scheduler = scheduler(dir.path());
    settle(&mut scheduler, 6).await;

    let before = artifact_tree(dir.path());
    assert!(!before.is_empty());
    for _ in 0..3 {
        let report = scheduler.run_cycle().await.unwrap();
        assert!(!report.did_work());
        assert_eq!(report.dispatched, 0);
    }
    assert_eq!(artifact_tree(dir.path()), before);
}

#[tokio::test]
async fn calibration_gates_and_fires_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ExperimentLayout::new(dir.path());
    write_acquisition_block(&layout, "epoch_block_001", &spiky_acquisition_data());

    // reference designated before any data was processed
    std::fs::write(
        layout.reference_pointer_path(),
        "epoch_block_001/segment_002.bin\n",
    )
    .unwrap();

    let mut scheduler = scheduler(dir.path());
    let report = settle(&mut scheduler, 10).await;
    assert_eq!(report.calibration, CalibrationState::CalibrationReady);
    assert_eq!(report.failed, 0);

    // both calibration artifacts exist (scenario: pointer at segment_002)
    assert!(layout.shift_coeffs_path().exists());
    let ref_sorting = layout.artifact_path(
        &SegmentRef::from_index("epoch_block_001", 2),
        ArtifactKind::ReferenceSorting,
    );
    for name in SORTING_FILES {
        assert!(ref_sorting.join(name).exists(), "missing {name}");
    }

    // the gated layers now cover every segment
    let store = scheduler.context().store.clone();
    for i in 1..=3 {
        let seg = SegmentRef::from_index("epoch_block_001", i);
        assert!(store.is_present(&ArtifactId::segment(seg.clone(), ArtifactKind::Shifted)));
        assert!(store.is_present(&ArtifactId::segment(seg, ArtifactKind::ReferenceSorting)));
    }

    // the reference sorting carries at least one template and labels spikes
    let templates: Vec<Vec<f64>> =
        serde_json::from_slice(&std::fs::read(ref_sorting.join("templates")).unwrap()).unwrap();
    assert!(!templates.is_empty());
    assert_eq!(templates[0].len(), N_CHANNELS);
    let labels: Vec<i64> =
        serde_json::from_slice(&std::fs::read(ref_sorting.join("spike_labels")).unwrap()).unwrap();
    assert!(!labels.is_empty());
    assert!(labels.iter().all(|&l| l >= 1));

    // subsequent idle cycles leave the calibration untouched
    let before = artifact_tree(dir.path());
    for _ in 0..2 {
        let report = scheduler.run_cycle().await.unwrap();
        assert!(!report.did_work());
    }
    assert_eq!(artifact_tree(dir.path()), before);
}

#[tokio::test]
async fn new_epoch_block_is_picked_up_incrementally() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ExperimentLayout::new(dir.path());
    write_acquisition_block(&layout, "epoch_block_001", &spiky_acquisition_data());

    let mut scheduler = scheduler(dir.path());
    settle(&mut scheduler, 6).await;
    let first_tree = artifact_tree(dir.path());

    // a second block arrives while the first is fully processed
    write_acquisition_block(&layout, "epoch_block_002", &vec![0i16; 1000 * N_CHANNELS]);
    let report = settle(&mut scheduler, 6).await;
    assert_eq!(report.failed, 0);

    let seg = SegmentRef::from_index("epoch_block_002", 1);
    let store = scheduler.context().store.clone();
    assert!(store.is_present(&ArtifactId::segment(seg.clone(), ArtifactKind::Filt)));
    assert!(store.is_present(&ArtifactId::segment(seg, ArtifactKind::Stats)));

    // artifacts of the first block were not touched
    let after: Vec<_> = artifact_tree(dir.path())
        .into_iter()
        .filter(|(p, _)| p.contains("epoch_block_001"))
        .collect();
    let before: Vec<_> = first_tree
        .into_iter()
        .filter(|(p, _)| p.contains("epoch_block_001"))
        .collect();
    assert_eq!(after, before);
}

#[tokio::test]
async fn interrupted_production_recovers_on_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ExperimentLayout::new(dir.path());
    write_acquisition_block(&layout, "epoch_block_001", &spiky_acquisition_data());

    let mut scheduler = scheduler(dir.path());
    settle(&mut scheduler, 6).await;

    // simulate a crash mid-write: the artifact is gone, an orphaned staging
    // file is left behind
    let seg = SegmentRef::from_index("epoch_block_001", 1);
    let stats_path = layout.artifact_path(&seg, ArtifactKind::Stats);
    std::fs::remove_file(&stats_path).unwrap();
    std::fs::remove_file(stats_path.with_file_name(format!(
        "{}.info",
        stats_path.file_name().unwrap().to_string_lossy()
    )))
    .unwrap();
    let orphan = stats_path.with_file_name("segment_001.bin.stats.json.tmp-dead");
    std::fs::write(&orphan, b"partial").unwrap();

    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(stats_path.exists());

    // the recovered artifact is complete and valid
    let stats: ChannelSpikeStats =
        serde_json::from_slice(&std::fs::read(&stats_path).unwrap()).unwrap();
    assert_eq!(stats.mean_firing_rates.len(), N_CHANNELS);
}
