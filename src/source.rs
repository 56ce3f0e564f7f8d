//! Seams to the engine's external collaborators.
//!
//! The sampling, recording, and sorting components live upstream; the engine
//! only consumes their outputs through the traits and value types here.

use crate::error::{Error, Result};
use ndarray::{Array2, Array3};

/// Identifies a sorted unit (a cluster of spikes attributed to one putative
/// signal source). Unit identifiers are assigned upstream and carry no
/// ordering meaning; positional order comes from
/// [`WaveformSampler::unit_ids`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

/// Access to the sampled per-unit waveform batches produced by the upstream
/// waveform-sampling component, which also defines the extraction window
/// geometry (`nbefore`/`nafter`).
///
/// The implementor owns the actual storage; batches are handed out one unit
/// at a time so fitting never holds the full dataset in memory.
pub trait WaveformSampler: Sync {
    /// Unit identifiers in their stored order. Fitting iterates this order
    /// deliberately; it determines the incremental model state exactly.
    fn unit_ids(&self) -> Vec<UnitId>;

    /// Number of recording channels in each sampled waveform.
    fn num_channels(&self) -> usize;

    /// Samples kept before the spike peak.
    fn nbefore(&self) -> usize;

    /// Samples kept after the spike peak.
    fn nafter(&self) -> usize;

    /// Samples per waveform window.
    fn samples_per_waveform(&self) -> usize {
        self.nbefore() + self.nafter()
    }

    /// The sampled waveform batch for one unit, shape
    /// `(num_sampled_spikes, samples_per_waveform, num_channels)`.
    /// A unit with no sampled spikes returns an empty first axis.
    ///
    /// # Errors
    /// Returns a storage-layer error if the unit's batch cannot be read.
    fn waveforms(&self, unit: UnitId) -> Result<Array3<f64>>;
}

/// Access to the raw recording traces.
pub trait RecordingSource: Sync {
    /// Number of recording channels.
    fn num_channels(&self) -> usize;

    /// Total frames in the (single) segment.
    fn num_frames(&self) -> u64;

    /// A contiguous trace block, shape `(end_frame - start_frame,
    /// num_channels)`, for `start_frame..end_frame`.
    ///
    /// # Errors
    /// Returns a storage-layer error if the block cannot be read.
    fn traces(&self, start_frame: u64, end_frame: u64) -> Result<Array2<f64>>;
}

/// The globally time-sorted spike sequence of one recording segment.
///
/// `times` holds frame indices in non-decreasing order; `labels` holds the
/// matching unit ordinals (positions in [`WaveformSampler::unit_ids`]).
#[derive(Clone, Debug)]
pub struct SpikeTrain {
    times: Vec<u64>,
    labels: Vec<usize>,
}

impl SpikeTrain {
    /// Build a spike train from parallel time/label vectors.
    ///
    /// # Errors
    /// Returns [`Error::Precondition`] if the vectors disagree in length or
    /// the times are not sorted.
    pub fn new(times: Vec<u64>, labels: Vec<usize>) -> Result<Self> {
        if times.len() != labels.len() {
            return Err(Error::Precondition(format!(
                "spike times ({}) and labels ({}) disagree in length",
                times.len(),
                labels.len()
            )));
        }
        if times.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::Precondition(
                "spike times must be sorted in non-decreasing order".to_string(),
            ));
        }
        Ok(Self { times, labels })
    }

    /// Number of spikes in the train.
    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// True if the train holds no spikes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Sorted spike frame indices.
    #[must_use]
    pub fn times(&self) -> &[u64] {
        &self.times
    }

    /// Unit ordinal for each spike, parallel to [`SpikeTrain::times`].
    #[must_use]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }
}

/// Externally supplied channel-sparsity selection: for each unit (in ordinal
/// order) the ordered subset of channel indices considered relevant, used by
/// full-dataset extraction to decide which channel's projection occupies
/// which output slot.
#[derive(Clone, Debug)]
pub struct ChannelSparsity {
    by_unit: Vec<Vec<usize>>,
    max_channels: usize,
}

impl ChannelSparsity {
    /// Build a sparsity selection with a bounded per-unit channel count.
    ///
    /// # Errors
    /// Returns [`Error::Precondition`] if any unit's selection exceeds
    /// `max_channels` or `max_channels` is zero.
    pub fn new(by_unit: Vec<Vec<usize>>, max_channels: usize) -> Result<Self> {
        if max_channels == 0 {
            return Err(Error::Precondition(
                "max_channels must be positive".to_string(),
            ));
        }
        if let Some((unit, selection)) = by_unit
            .iter()
            .enumerate()
            .find(|(_, sel)| sel.len() > max_channels)
        {
            return Err(Error::Precondition(format!(
                "unit ordinal {unit} selects {} channels, above the maximum of {max_channels}",
                selection.len()
            )));
        }
        Ok(Self {
            by_unit,
            max_channels,
        })
    }

    /// Number of units covered by the selection.
    #[must_use]
    pub fn num_units(&self) -> usize {
        self.by_unit.len()
    }

    /// Upper bound on channels per unit; the channel-slot axis length of the
    /// full-dataset output.
    #[must_use]
    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    /// Ordered channel indices kept for one unit ordinal.
    #[must_use]
    pub fn channels_for(&self, unit_index: usize) -> &[usize] {
        &self.by_unit[unit_index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spike_train_rejects_unsorted_times() {
        let result = SpikeTrain::new(vec![10, 5, 20], vec![0, 0, 0]);
        assert!(matches!(result, Err(Error::Precondition(_))));
    }

    #[test]
    fn spike_train_rejects_length_mismatch() {
        let result = SpikeTrain::new(vec![10, 20], vec![0]);
        assert!(matches!(result, Err(Error::Precondition(_))));
    }

    #[test]
    fn sparsity_bounds_selection_size() {
        let result = ChannelSparsity::new(vec![vec![0, 1, 2]], 2);
        assert!(matches!(result, Err(Error::Precondition(_))));

        let sparsity = ChannelSparsity::new(vec![vec![0, 1], vec![1]], 2).unwrap();
        assert_eq!(sparsity.channels_for(0), &[0, 1]);
        assert_eq!(sparsity.channels_for(1), &[1]);
        assert_eq!(sparsity.max_channels(), 2);
    }
}
