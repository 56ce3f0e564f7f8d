//! Full-dataset extraction scenarios: chunked parallel projection of the
//! whole spike train with border-spike zero-fill.

mod common;

use approx::assert_abs_diff_eq;
use common::{merge_spike_trains, SyntheticRecording};
use ndarray::{s, Array3, Axis, Ix3};
use waveform_pca::store::DiskArray;
use waveform_pca::{
    compute_waveform_pca, ChannelSparsity, Error, OutputDtype, PcaMode, PcaParameters, SpikeTrain,
    ExtractionOptions, WaveformPca,
};

const NBEFORE: usize = 5;
const NAFTER: usize = 5;

struct Extracted {
    engine: WaveformPca<common::SyntheticSampler>,
    recording: SyntheticRecording,
    times: Vec<u64>,
    labels: Vec<usize>,
    output: Array3<f64>,
}

/// Run the engine and the full-dataset extractor over a synthetic
/// recording, returning the written output array.
fn extract(
    spikes_per_unit: &[Vec<u64>],
    sparsity: &ChannelSparsity,
    mode: PcaMode,
    chunk_size: u64,
) -> Extracted {
    let recording = SyntheticRecording::new(300, 2, 99);
    // Fit only from interior spikes; the full train may hold border spikes.
    let sampled: Vec<Vec<u64>> = spikes_per_unit
        .iter()
        .map(|times| {
            times
                .iter()
                .copied()
                .filter(|&t| t >= NBEFORE as u64 && t + NAFTER as u64 <= 300)
                .collect()
        })
        .collect();
    let sampler = recording.sampler_for(&sampled, NBEFORE, NAFTER);
    let dir = tempfile::tempdir().unwrap();
    let engine = compute_waveform_pca(
        sampler,
        dir.path(),
        PcaParameters::new(2, mode, true, OutputDtype::Float32).unwrap(),
    )
    .unwrap();

    let (times, labels) = merge_spike_trains(spikes_per_unit);
    let train = SpikeTrain::new(times.clone(), labels.clone()).unwrap();
    let out_path = dir.path().join("pc_features.bin");
    engine
        .run_for_all_spikes(
            &recording,
            std::slice::from_ref(&train),
            sparsity,
            &out_path,
            &ExtractionOptions { chunk_size },
        )
        .unwrap();

    let output = DiskArray::open(
        out_path,
        vec![times.len(), 2, sparsity.max_channels()],
        OutputDtype::Float32,
    )
    .unwrap()
    .read()
    .unwrap()
    .into_dimensionality::<Ix3>()
    .unwrap();
    Extracted {
        engine,
        recording,
        times,
        labels,
        output,
    }
}

#[test]
fn interior_spikes_match_direct_projection() {
    let spikes = vec![vec![50, 120, 250], vec![80, 200]];
    let sparsity = ChannelSparsity::new(vec![vec![0, 1], vec![1]], 2).unwrap();
    let result = extract(&spikes, &sparsity, PcaMode::PerChannelIndependent, 64);

    let models = result.engine.models().unwrap();
    for (row, (&time, &unit)) in result.times.iter().zip(result.labels.iter()).enumerate() {
        let window = result.recording.window(time, NBEFORE, NAFTER);
        for (slot, &channel) in sparsity.channels_for(unit).iter().enumerate() {
            let expected = models
                .transform_channel(channel, window.slice(s![.., channel]).insert_axis(Axis(0)))
                .unwrap();
            for component in 0..2 {
                assert_abs_diff_eq!(
                    result.output[[row, component, slot]],
                    expected[[0, component]],
                    epsilon = 1e-4
                );
            }
        }
    }

    // Unit 1 keeps only one channel; its second slot stays zero.
    for (row, &unit) in result.labels.iter().enumerate() {
        if unit == 1 {
            for component in 0..2 {
                assert_eq!(result.output[[row, component, 1]], 0.0);
            }
        }
    }
}

#[test]
fn border_spikes_leave_zero_rows() {
    // Spike 3 starts before the segment, spike 297 runs past its end.
    let spikes = vec![vec![3, 50, 120, 297], vec![80, 200]];
    let sparsity = ChannelSparsity::new(vec![vec![0, 1], vec![0, 1]], 2).unwrap();
    for chunk_size in [7, 64, 1000] {
        let result = extract(&spikes, &sparsity, PcaMode::PerChannelIndependent, chunk_size);
        for (row, &time) in result.times.iter().enumerate() {
            let is_border = time < NBEFORE as u64 || time + NAFTER as u64 > 300;
            let row_values = result.output.slice(s![row, .., ..]);
            if is_border {
                assert!(
                    row_values.iter().all(|&v| v == 0.0),
                    "border spike at {time} (chunk size {chunk_size}) has non-zero row"
                );
            } else {
                assert!(
                    row_values.iter().any(|&v| v != 0.0),
                    "interior spike at {time} (chunk size {chunk_size}) has all-zero row"
                );
            }
        }
    }
}

#[test]
fn chunk_size_does_not_change_the_output() {
    let spikes = vec![vec![50, 64, 120, 250], vec![80, 128, 200]];
    let sparsity = ChannelSparsity::new(vec![vec![0, 1], vec![1, 0]], 2).unwrap();
    let coarse = extract(&spikes, &sparsity, PcaMode::PerChannelIndependent, 1000);
    let fine = extract(&spikes, &sparsity, PcaMode::PerChannelIndependent, 13);
    assert_eq!(coarse.output, fine.output);
}

#[test]
fn shared_mode_extracts_through_the_single_model() {
    let spikes = vec![vec![50, 120], vec![80, 200]];
    let sparsity = ChannelSparsity::new(vec![vec![0, 1], vec![0]], 2).unwrap();
    let result = extract(&spikes, &sparsity, PcaMode::PerChannelShared, 64);
    assert_eq!(result.engine.models().unwrap().num_models(), 1);
    assert_eq!(result.output.shape(), &[4, 2, 2]);
}

#[test]
fn concatenated_mode_is_rejected() {
    let recording = SyntheticRecording::new(300, 2, 99);
    let sampler = recording.sampler_for(&[vec![50, 120, 250]], NBEFORE, NAFTER);
    let dir = tempfile::tempdir().unwrap();
    let engine = compute_waveform_pca(
        sampler,
        dir.path(),
        PcaParameters::new(2, PcaMode::Concatenated, true, OutputDtype::Float32).unwrap(),
    )
    .unwrap();

    let train = SpikeTrain::new(vec![50, 120, 250], vec![0, 0, 0]).unwrap();
    let sparsity = ChannelSparsity::new(vec![vec![0, 1]], 2).unwrap();
    let result = engine.run_for_all_spikes(
        &recording,
        std::slice::from_ref(&train),
        &sparsity,
        &dir.path().join("pc_features.bin"),
        &ExtractionOptions::default(),
    );
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[test]
fn multi_segment_trains_are_rejected() {
    let recording = SyntheticRecording::new(300, 2, 99);
    let sampler = recording.sampler_for(&[vec![50, 120, 250]], NBEFORE, NAFTER);
    let dir = tempfile::tempdir().unwrap();
    let engine = compute_waveform_pca(
        sampler,
        dir.path(),
        PcaParameters::new(2, PcaMode::PerChannelIndependent, true, OutputDtype::Float32).unwrap(),
    )
    .unwrap();

    let train = SpikeTrain::new(vec![50], vec![0]).unwrap();
    let trains = vec![train.clone(), train];
    let sparsity = ChannelSparsity::new(vec![vec![0, 1]], 2).unwrap();
    let result = engine.run_for_all_spikes(
        &recording,
        &trains,
        &sparsity,
        &dir.path().join("pc_features.bin"),
        &ExtractionOptions::default(),
    );
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[test]
fn empty_spike_train_writes_an_empty_output() {
    let recording = SyntheticRecording::new(300, 2, 99);
    let sampler = recording.sampler_for(&[vec![50, 120, 250]], NBEFORE, NAFTER);
    let dir = tempfile::tempdir().unwrap();
    let engine = compute_waveform_pca(
        sampler,
        dir.path(),
        PcaParameters::new(2, PcaMode::PerChannelIndependent, true, OutputDtype::Float32).unwrap(),
    )
    .unwrap();

    let train = SpikeTrain::new(vec![], vec![]).unwrap();
    let sparsity = ChannelSparsity::new(vec![vec![0, 1]], 2).unwrap();
    let out_path = dir.path().join("pc_features.bin");
    engine
        .run_for_all_spikes(
            &recording,
            std::slice::from_ref(&train),
            &sparsity,
            &out_path,
            &ExtractionOptions::default(),
        )
        .unwrap();

    let output = DiskArray::open(out_path, vec![0, 2, 2], OutputDtype::Float32)
        .unwrap()
        .read()
        .unwrap();
    assert_eq!(output.shape(), &[0, 2, 2]);
}
