mod common;

use approx::assert_abs_diff_eq;
use common::*;
use liver_volumetry::{
    InferenceOutcome, ScanReport,
    affine::{Affine, RAS},
    predict_volume,
    preprocess::Preprocessor,
    run_request,
    volume_loader::VolumeLoader,
};
use ndarray::Array3;

#[test]
fn background_volume_measures_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let data = Array3::from_elem((24, 24, 24), -1000.0);
    let path = write_volume(dir.path(), "empty.nii.gz", data, ras_affine([1.0; 3]));

    let outcome = run_request(&ThresholdModel, &path, &test_config());
    let InferenceOutcome::Success(result) = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(result.liver_volume_cm3, 0.0);
    assert_eq!(result.tumor_volume_cm3, 0.0);
    assert_eq!(result.tumor_percentage, 0.0);

    let mask_path = result.mask_path.expect("mask should have been written");
    let (labels, _) = read_labels(&mask_path);
    assert_eq!(labels.dim(), (24, 24, 24));
    assert!(labels.iter().all(|&label| label == 0));
}

#[test]
fn liver_volume_is_voxel_count_times_voxel_volume() {
    let dir = tempfile::tempdir().unwrap();
    let data = block_volume([24, 24, 24], [4, 6, 8], [14, 14, 14], 100.0);
    let path = write_volume(dir.path(), "liver_b.nii.gz", data, ras_affine([1.0; 3]));

    let result = predict_volume(&ThresholdModel, &path, &test_config()).unwrap();
    assert_eq!(result.liver_volume_cm3, 480.0 * 0.001);
    assert_eq!(result.tumor_volume_cm3, 0.0);
    assert_eq!(result.tumor_percentage, 0.0);
    assert_eq!(result.mask_path, Some(dir.path().join("liver_b_seg.nii.gz")));
}

#[test]
fn tumor_burden_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = block_volume([24, 24, 24], [4, 6, 8], [14, 14, 14], 100.0);
    data.slice_mut(ndarray::s![6..8, 8..10, 10..12]).fill(190.0);
    let path = write_volume(dir.path(), "tumor.nii.gz", data, ras_affine([1.0; 3]));

    let result = predict_volume(&ThresholdModel, &path, &test_config()).unwrap();
    assert_abs_diff_eq!(result.liver_volume_cm3, 0.472, epsilon = 1e-12);
    assert_abs_diff_eq!(result.tumor_volume_cm3, 0.008, epsilon = 1e-12);
    assert_abs_diff_eq!(result.tumor_percentage, 100.0 * 8.0 / 480.0, epsilon = 1e-9);

    let (labels, _) = read_labels(result.mask_path.as_deref().unwrap());
    assert_eq!(labels.iter().filter(|&&label| label == 2).count(), 8);
    assert_eq!(labels[[6, 8, 10]], 2);
    assert_eq!(labels[[4, 6, 8]], 1);
    assert_eq!(labels[[0, 0, 0]], 0);
}

#[test]
fn small_input_is_padded_and_reported_on_its_own_extent() {
    let dir = tempfile::tempdir().unwrap();
    let data = block_volume([6, 5, 4], [1, 1, 1], [5, 4, 3], 100.0);
    let path = write_volume(dir.path(), "small.nii", data.clone(), ras_affine([1.0; 3]));
    let config = test_config();

    let volume = VolumeLoader::load(&path).unwrap();
    let prepared = Preprocessor::new(&config).run(volume).unwrap();
    assert!(prepared.shape().iter().all(|&d| d >= 16));

    let result = predict_volume(&ThresholdModel, &path, &config).unwrap();
    assert_eq!(result.liver_volume_cm3, 24.0 * 0.001);

    let (labels, _) = read_labels(result.mask_path.as_deref().unwrap());
    assert_eq!(labels.dim(), (6, 5, 4));
    for (index, &label) in labels.indexed_iter() {
        assert_eq!(label, u8::from(data[index] > 0.0));
    }
}

#[test]
fn mask_write_failure_keeps_volumes() {
    let dir = tempfile::tempdir().unwrap();
    let data = block_volume([24, 24, 24], [4, 6, 8], [14, 14, 14], 100.0);
    let path = write_volume(dir.path(), "scan.nii.gz", data, ras_affine([1.0; 3]));
    let mut config = test_config();
    // resolves to a directory that does not exist
    config.mask_suffix = "/missing/seg".to_string();

    let outcome = run_request(&ThresholdModel, &path, &config);
    let InferenceOutcome::Success(result) = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(result.liver_volume_cm3, 480.0 * 0.001);
    assert_eq!(result.mask_path, None);
}

#[test]
fn mask_shares_grid_with_normalized_source() {
    let dir = tempfile::tempdir().unwrap();
    let lps = Affine([
        [-1.0, 0.0, 0.0, 40.0],
        [0.0, -1.0, 0.0, 60.0],
        [0.0, 0.0, 1.0, -20.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);
    let data = block_volume([20, 22, 18], [2, 3, 4], [12, 11, 10], 100.0);
    let source = write_volume(dir.path(), "lps.nii.gz", data, lps);

    let result = run_request(&ThresholdModel, &source, &test_config()).result();
    let fixed = dir.path().join("fixed_lps.nii.gz");
    assert_eq!(result.mask_path, Some(dir.path().join("fixed_lps_seg.nii.gz")));

    let normalized = VolumeLoader::load(&fixed).unwrap();
    assert_eq!(normalized.affine.axis_codes().unwrap(), RAS);
    let (labels, mask_affine) = read_labels(result.mask_path.as_deref().unwrap());
    assert_eq!(labels.dim(), normalized.dim());
    assert!(mask_affine.approx_eq(&normalized.affine, 1e-4));
    for (index, &label) in labels.indexed_iter() {
        assert_eq!(label, u8::from(normalized.data[index] > 0.0));
    }
    assert_eq!(result.liver_volume_cm3, 480.0 * 0.001);
}

#[test]
fn report_source_overlays_mask() {
    let dir = tempfile::tempdir().unwrap();
    let lps = Affine([
        [-1.0, 0.0, 0.0, 40.0],
        [0.0, -1.0, 0.0, 60.0],
        [0.0, 0.0, 1.0, -20.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);
    let data = block_volume([20, 22, 18], [2, 3, 4], [12, 11, 10], 100.0);
    let source = write_volume(dir.path(), "overlay.nii.gz", data, lps);

    let outcome = run_request(&ThresholdModel, &source, &test_config());
    let report = ScanReport::from_outcome(&source, &outcome);
    assert_eq!(report.source_path, dir.path().join("fixed_overlay.nii.gz"));
    assert_eq!(report.patient_id, "overlay");

    let shown = VolumeLoader::load(&report.source_path).unwrap();
    let (labels, mask_affine) = read_labels(report.mask_path.as_deref().unwrap());
    assert_eq!(labels.dim(), shown.dim());
    assert!(mask_affine.approx_eq(&shown.affine, 1e-4));
}

#[test]
fn normalization_failure_falls_back_to_original() {
    let dir = tempfile::tempdir().unwrap();
    let data = block_volume([24, 24, 24], [4, 6, 8], [14, 14, 14], 100.0);
    let path = write_volume(dir.path(), "scan.nii.gz", data, ras_affine([1.0; 3]));
    let mut config = test_config();
    // the canonical copy would land in a directory that does not exist
    config.fixed_prefix = "missing/fixed_".to_string();

    let outcome = run_request(&ThresholdModel, &path, &config);
    let InferenceOutcome::Success(result) = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(result.liver_volume_cm3, 480.0 * 0.001);
    assert_eq!(result.processed_path.as_deref(), Some(path.as_path()));
    assert_eq!(result.mask_path, Some(dir.path().join("scan_seg.nii.gz")));
    assert!(!dir.path().join("missing").exists());

    let (labels, mask_affine) = read_labels(result.mask_path.as_deref().unwrap());
    assert_eq!(labels.dim(), (24, 24, 24));
    assert_eq!(labels.iter().filter(|&&label| label == 1).count(), 480);
    assert!(mask_affine.approx_eq(&ras_affine([1.0; 3]), 1e-4));
}

#[test]
fn absurd_spacing_degrades_instead_of_crashing() {
    let dir = tempfile::tempdir().unwrap();
    let data = block_volume([8, 8, 8], [2, 2, 2], [6, 6, 6], 100.0);
    let affine = Affine::from_spacing([1e20, 1.0, 1.0]);
    let path = write_volume(dir.path(), "huge.nii.gz", data, affine);

    match run_request(&ThresholdModel, &path, &test_config()) {
        InferenceOutcome::Degraded { reason, result } => {
            assert!(reason.contains("too large"));
            assert_eq!(result.liver_volume_cm3, 0.0);
            assert_eq!(result.mask_path, None);
        }
        other => panic!("expected degraded outcome, got {other:?}"),
    }
}

#[test]
fn invalid_configuration_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let data = block_volume([8, 8, 8], [2, 2, 2], [6, 6, 6], 100.0);
    let path = write_volume(dir.path(), "zero.nii.gz", data, ras_affine([1.0; 3]));
    let config = liver_volumetry::Config {
        spacing: [0.0, 1.0, 1.0],
        ..test_config()
    };

    let outcome = run_request(&ThresholdModel, &path, &config);
    assert!(matches!(outcome, InferenceOutcome::Degraded { .. }));
    assert!(!dir.path().join("fixed_zero.nii.gz").exists());
}

#[test]
fn resampled_spacing_matches_configuration() {
    let config = liver_volumetry::Config {
        spacing: [1.5, 1.5, 2.0],
        roi_size: [8, 8, 8],
        ..test_config()
    };
    let preprocessor = Preprocessor::new(&config);
    for spacing in [[0.7, 0.7, 5.0], [2.0, 1.0, 0.5], [1.5, 1.5, 2.0], [0.9, 3.0, 1.25]] {
        let volume = liver_volumetry::volume::Volume::new(
            Array3::zeros((20, 20, 20)),
            ras_affine(spacing),
        );
        let resampled = preprocessor.resample(&volume).unwrap();
        let actual = resampled.spacing();
        for axis in 0..3 {
            assert_abs_diff_eq!(actual[axis], config.spacing[axis], epsilon = 1e-9);
        }
    }
}

#[test]
fn repeated_runs_are_identical() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = block_volume([30, 26, 12], [5, 4, 2], [22, 19, 9], 120.0);
    data.slice_mut(ndarray::s![10..14, 9..12, 4..6]).fill(195.0);
    let path = write_volume(dir.path(), "repeat.nii.gz", data, ras_affine([0.8, 0.8, 2.5]));
    let config = liver_volumetry::Config {
        spacing: [1.5, 1.5, 2.0],
        ..test_config()
    };

    let first = predict_volume(&ThresholdModel, &path, &config).unwrap();
    let (first_labels, _) = read_labels(first.mask_path.as_deref().unwrap());
    let second = predict_volume(&ThresholdModel, &path, &config).unwrap();
    let (second_labels, _) = read_labels(second.mask_path.as_deref().unwrap());

    assert_eq!(first, second);
    assert_eq!(first_labels, second_labels);
    assert_eq!(first_labels.dim(), (30, 26, 12));
    assert!(first.liver_volume_cm3 > 0.0);
}

#[test]
fn model_failure_degrades_to_zero_volumes() {
    let dir = tempfile::tempdir().unwrap();
    let data = block_volume([24, 24, 24], [4, 6, 8], [14, 14, 14], 100.0);
    let path = write_volume(dir.path(), "oom.nii.gz", data, ras_affine([1.0; 3]));

    match run_request(&FailingModel, &path, &test_config()) {
        InferenceOutcome::Degraded { reason, result } => {
            assert!(reason.contains("out of device memory"));
            assert_eq!(result.liver_volume_cm3, 0.0);
            assert_eq!(result.tumor_volume_cm3, 0.0);
            assert_eq!(result.mask_path, None);
        }
        other => panic!("expected degraded outcome, got {other:?}"),
    }
}

#[test]
fn unreadable_input_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.nii");
    std::fs::write(&path, b"definitely not an image").unwrap();

    let outcome = run_request(&ThresholdModel, &path, &test_config());
    assert!(matches!(outcome, InferenceOutcome::Fatal(_)));
    assert_eq!(outcome.result(), liver_volumetry::VolumetricResult::zeroed());

    let missing = run_request(&ThresholdModel, &dir.path().join("absent.nii.gz"), &test_config());
    assert!(matches!(missing, InferenceOutcome::Fatal(_)));
}
