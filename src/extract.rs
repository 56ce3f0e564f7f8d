//! Full-dataset extraction: re-extract every spike's waveform from the raw
//! recording and project it through the fitted models into one shared
//! output array.
//!
//! The output file has shape `(total_spikes, n_components,
//! max_channels_per_unit)` in float32, the axis order the downstream
//! visualization tooling expects. The recording is processed in independent
//! time chunks; because spikes are globally time-sorted and chunks
//! partition time disjointly, each worker owns a disjoint slice of spike
//! rows and writes without locking.
//!
//! Spikes whose extraction window crosses the segment border are left as
//! all-zero rows rather than reported as errors: upstream bounded sampling
//! legitimately produces such border spikes.

use log::{debug, info};
use ndarray::{s, Axis};
use rayon::prelude::*;
use std::path::Path;

use crate::error::{Error, Result};
use crate::fit::FittedModels;
use crate::params::OutputDtype;
use crate::source::{ChannelSparsity, RecordingSource, SpikeTrain};
use crate::store::{self, DiskArray};

/// Options for the chunked extraction run.
#[derive(Clone, Copy, Debug)]
pub struct ExtractionOptions {
    /// Frames per worker chunk. Callers bound runtime and memory through
    /// this; there is no internal timeout.
    pub chunk_size: u64,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self { chunk_size: 30_000 }
    }
}

/// One worker's assignment: a time chunk and the half-open range of spike
/// indices whose times fall inside it.
#[derive(Clone, Copy, Debug)]
struct ChunkJob {
    spike_start: usize,
    spike_end: usize,
}

/// Immutable context shared by all extraction workers, constructed once
/// before the pool runs and threaded explicitly through the chunk function.
struct WorkerContext<'a, R: RecordingSource> {
    recording: &'a R,
    times: &'a [u64],
    labels: &'a [usize],
    nbefore: u64,
    nafter: u64,
    segment_frames: u64,
    sparsity: &'a ChannelSparsity,
    models: &'a FittedModels,
    n_components: usize,
    max_channels: usize,
}

/// Project every spike of a single-segment spike train into a shared
/// float32 output file at `output_path`.
///
/// # Errors
/// Returns [`Error::Precondition`] if the spike train spans more than one
/// segment, the topology is concatenated, window geometry disagrees with
/// the fitted models, or labels/channels are out of range; propagates
/// trace-read and storage failures from the workers.
#[allow(clippy::too_many_arguments)]
pub fn extract_all_spikes<R: RecordingSource>(
    recording: &R,
    spike_trains: &[SpikeTrain],
    sparsity: &ChannelSparsity,
    models: &FittedModels,
    nbefore: usize,
    nafter: usize,
    output_path: &Path,
    options: &ExtractionOptions,
) -> Result<()> {
    if spike_trains.len() != 1 {
        return Err(Error::Precondition(format!(
            "full-dataset extraction requires a single-segment spike train, got {} segments",
            spike_trains.len()
        )));
    }
    if !models.mode().is_by_channel() {
        return Err(Error::Precondition(
            "full-dataset extraction requires a by-channel mode; concatenated models cannot \
             address per-channel output slots"
                .to_string(),
        ));
    }
    if nbefore + nafter != models.samples_per_waveform() {
        return Err(Error::Precondition(format!(
            "extraction window of {} samples disagrees with the fitted window of {}",
            nbefore + nafter,
            models.samples_per_waveform()
        )));
    }
    if options.chunk_size == 0 {
        return Err(Error::Config("chunk_size must be positive".to_string()));
    }

    let train = &spike_trains[0];
    validate_train(train, sparsity, recording.num_channels())?;

    let total_spikes = train.len();
    let n_components = models.n_components();
    let max_channels = sparsity.max_channels();
    let output = DiskArray::create_zeroed(
        output_path.to_path_buf(),
        vec![total_spikes, n_components, max_channels],
        OutputDtype::Float32,
    )?;
    if total_spikes == 0 {
        return Ok(());
    }

    // Per-chunk spike ranges from binary search over the sorted times. The
    // ranges partition the spike sequence front-to-back, so the output rows
    // can be handed out as disjoint mutable slices.
    let segment_frames = recording.num_frames();
    let times = train.times();
    let mut jobs = Vec::new();
    let mut chunk_start = 0u64;
    while chunk_start < segment_frames {
        let chunk_end = (chunk_start + options.chunk_size).min(segment_frames);
        let spike_start = times.partition_point(|&t| t < chunk_start);
        let spike_end = times.partition_point(|&t| t < chunk_end);
        jobs.push(ChunkJob {
            spike_start,
            spike_end,
        });
        chunk_start = chunk_end;
    }
    debug!(
        "extracting {total_spikes} spikes over {} chunk(s) of {} frames",
        jobs.len(),
        options.chunk_size
    );

    let context = WorkerContext {
        recording,
        times,
        labels: train.labels(),
        nbefore: nbefore as u64,
        nafter: nafter as u64,
        segment_frames,
        sparsity,
        models,
        n_components,
        max_channels,
    };

    let row_len = n_components * max_channels;
    let mut mmap = output.map_mut()?;
    let floats: &mut [f32] = store::cast_bytes_mut(&mut mmap[..])?;

    // Hand each job its disjoint row slice. Consecutive jobs share their
    // boundary index, so the slices tile the mapped buffer front-to-back;
    // spikes at or past the segment end fall after every chunk and keep
    // their zero rows.
    let mut assignments = Vec::with_capacity(jobs.len());
    let mut rest = floats;
    for job in jobs {
        let rows = job.spike_end - job.spike_start;
        let (chunk_rows, tail) = std::mem::take(&mut rest).split_at_mut(rows * row_len);
        rest = tail;
        assignments.push((job, chunk_rows));
    }

    assignments
        .into_par_iter()
        .try_for_each(|(job, rows)| process_chunk(&context, job, rows))?;

    mmap.flush()?;
    info!(
        "wrote full-dataset projections for {total_spikes} spikes to {}",
        output_path.display()
    );
    Ok(())
}

/// Process one time chunk: trim border spikes, read one contiguous trace
/// block, and project each remaining spike's waveform into its rows of the
/// output.
fn process_chunk<R: RecordingSource>(
    context: &WorkerContext<'_, R>,
    job: ChunkJob,
    out: &mut [f32],
) -> Result<()> {
    let mut first = job.spike_start;
    let mut last = job.spike_end;

    // Border spikes keep their zero rows instead of failing the run.
    while first != last && context.times[first] < context.nbefore {
        first += 1;
    }
    while first != last && context.times[last - 1] + context.nafter > context.segment_frames {
        last -= 1;
    }
    if first == last {
        return Ok(());
    }

    let block_start = context.times[first] - context.nbefore;
    let block_end = context.times[last - 1] + context.nafter;
    let traces = context.recording.traces(block_start, block_end)?;
    let block_frames = traces.nrows() as u64;

    let row_len = context.n_components * context.max_channels;
    for spike in first..last {
        let time = context.times[spike];
        let offset = time - block_start;
        // Re-check the window against the block actually fetched; a short
        // read leaves the row zero.
        if offset < context.nbefore || offset + context.nafter > block_frames {
            continue;
        }
        let window_start = (offset - context.nbefore) as usize;
        let window_end = (offset + context.nafter) as usize;

        let unit_index = context.labels[spike];
        let row_base = (spike - job.spike_start) * row_len;
        for (slot, &channel) in context
            .sparsity
            .channels_for(unit_index)
            .iter()
            .enumerate()
        {
            let waveform = traces.slice(s![window_start..window_end, channel]);
            let scores = context
                .models
                .transform_channel(channel, waveform.insert_axis(Axis(0)))?;
            for (component, &score) in scores.row(0).iter().enumerate() {
                out[row_base + component * context.max_channels + slot] = score as f32;
            }
        }
    }
    Ok(())
}

/// Reject spike trains whose labels or channel selections cannot address
/// the recording and sparsity supplied.
fn validate_train(
    train: &SpikeTrain,
    sparsity: &ChannelSparsity,
    num_channels: usize,
) -> Result<()> {
    if let Some(&bad) = train
        .labels()
        .iter()
        .find(|&&label| label >= sparsity.num_units())
    {
        return Err(Error::Precondition(format!(
            "spike label {bad} out of range for {} units in the channel selection",
            sparsity.num_units()
        )));
    }
    for unit in 0..sparsity.num_units() {
        if let Some(&bad) = sparsity
            .channels_for(unit)
            .iter()
            .find(|&&channel| channel >= num_channels)
        {
            return Err(Error::Precondition(format!(
                "channel {bad} in unit {unit}'s selection out of range for {num_channels} \
                 recording channels"
            )));
        }
    }
    Ok(())
}
