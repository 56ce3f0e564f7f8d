//! Shared synthetic fixtures: an in-memory waveform sampler and recording.
#![allow(dead_code)]

use ndarray::{s, Array2, Array3, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use waveform_pca::{Error, RecordingSource, Result, UnitId, WaveformSampler};

/// In-memory sampler holding one pre-built batch per unit.
pub struct SyntheticSampler {
    units: Vec<(UnitId, Array3<f64>)>,
    nbefore: usize,
    nafter: usize,
    num_channels: usize,
}

impl SyntheticSampler {
    pub fn new(
        units: Vec<(UnitId, Array3<f64>)>,
        nbefore: usize,
        nafter: usize,
        num_channels: usize,
    ) -> Self {
        Self {
            units,
            nbefore,
            nafter,
            num_channels,
        }
    }

    /// A sampler with random batches, `spike_counts[i]` waveforms for unit
    /// `i`, windows of `nbefore + nafter` samples.
    pub fn random(
        spike_counts: &[usize],
        nbefore: usize,
        nafter: usize,
        num_channels: usize,
        seed: u64,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let samples = nbefore + nafter;
        let units = spike_counts
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let batch =
                    Array3::from_shape_fn((n, samples, num_channels), |_| rng.gen_range(-1.0..1.0));
                (UnitId(i as u64), batch)
            })
            .collect();
        Self::new(units, nbefore, nafter, num_channels)
    }
}

impl WaveformSampler for SyntheticSampler {
    fn unit_ids(&self) -> Vec<UnitId> {
        self.units.iter().map(|(unit, _)| *unit).collect()
    }

    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn nbefore(&self) -> usize {
        self.nbefore
    }

    fn nafter(&self) -> usize {
        self.nafter
    }

    fn waveforms(&self, unit: UnitId) -> Result<Array3<f64>> {
        self.units
            .iter()
            .find(|(stored, _)| *stored == unit)
            .map(|(_, batch)| batch.clone())
            .ok_or_else(|| Error::Precondition(format!("unknown unit {}", unit.0)))
    }
}

/// In-memory single-segment recording.
pub struct SyntheticRecording {
    traces: Array2<f64>,
}

impl SyntheticRecording {
    /// A recording with smoothly varying deterministic traces.
    pub fn new(num_frames: usize, num_channels: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let traces = Array2::from_shape_fn((num_frames, num_channels), |(t, c)| {
            ((t as f64) * 0.05 + c as f64).sin() + rng.gen_range(-0.1..0.1)
        });
        Self { traces }
    }

    /// The waveform window around one spike time, shape `(samples, channels)`.
    pub fn window(&self, time: u64, nbefore: usize, nafter: usize) -> Array2<f64> {
        let start = time as usize - nbefore;
        let end = time as usize + nafter;
        self.traces.slice(s![start..end, ..]).to_owned()
    }

    /// A sampler whose per-unit batches are cut straight from these traces,
    /// so sampled-waveform projections line up with full-dataset extraction.
    pub fn sampler_for(
        &self,
        spikes_per_unit: &[Vec<u64>],
        nbefore: usize,
        nafter: usize,
    ) -> SyntheticSampler {
        let units = spikes_per_unit
            .iter()
            .enumerate()
            .map(|(i, times)| {
                let windows: Vec<Array2<f64>> = times
                    .iter()
                    .map(|&t| self.window(t, nbefore, nafter))
                    .collect();
                let views: Vec<_> = windows.iter().map(|w| w.view()).collect();
                let batch = ndarray::stack(Axis(0), &views).unwrap();
                (UnitId(i as u64), batch)
            })
            .collect();
        SyntheticSampler::new(units, nbefore, nafter, self.traces.ncols())
    }
}

impl RecordingSource for SyntheticRecording {
    fn num_channels(&self) -> usize {
        self.traces.ncols()
    }

    fn num_frames(&self) -> u64 {
        self.traces.nrows() as u64
    }

    fn traces(&self, start_frame: u64, end_frame: u64) -> Result<Array2<f64>> {
        Ok(self
            .traces
            .slice(s![start_frame as usize..end_frame as usize, ..])
            .to_owned())
    }
}

/// Interleave per-unit spike times into one sorted (times, labels) train.
pub fn merge_spike_trains(spikes_per_unit: &[Vec<u64>]) -> (Vec<u64>, Vec<usize>) {
    let mut merged: Vec<(u64, usize)> = spikes_per_unit
        .iter()
        .enumerate()
        .flat_map(|(unit, times)| times.iter().map(move |&t| (t, unit)))
        .collect();
    merged.sort_unstable();
    merged.into_iter().unzip()
}
