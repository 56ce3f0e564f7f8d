//! The projection engine: parameter lifecycle, sampled-waveform runs, and
//! projection retrieval.

use log::info;
use ndarray::{s, Array2, Array3, ArrayD, ArrayView3, Axis, IxDyn};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::extract::{self, ExtractionOptions};
use crate::fit::{fit_models, FittedModels};
use crate::params::{PcaMode, PcaParameters};
use crate::source::{ChannelSparsity, RecordingSource, SpikeTrain, UnitId, WaveformSampler};
use crate::store::{self, DiskArray};

/// How [`WaveformPca::get_all_projections`] labels each output row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelMode {
    /// Label rows with the source unit's identifier.
    UnitId,
    /// Label rows with the source unit's ordinal position in the sampler's
    /// stored order.
    UnitIndex,
}

/// Principal-component projection engine over a waveform sampler.
///
/// Mirrors the lifecycle of the upstream sampling component it sits next
/// to: [`WaveformPca::set_params`] fixes the configuration and clears all
/// derived artifacts, [`WaveformPca::run`] fits models from the sampled
/// waveforms and stores per-unit projection arrays on disk, and the
/// accessors read those artifacts back. Full-dataset extraction re-projects
/// every spike of the recording through the same fitted models.
pub struct WaveformPca<S: WaveformSampler> {
    sampler: S,
    working_dir: PathBuf,
    params: Option<PcaParameters>,
    models: Option<FittedModels>,
    projections: Option<Vec<(UnitId, DiskArray)>>,
}

impl<S: WaveformSampler> WaveformPca<S> {
    /// Create an engine over `sampler`, storing artifacts under the `pca/`
    /// sub-directory of `working_dir`. No filesystem changes happen until
    /// parameters are set.
    pub fn new(sampler: S, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            sampler,
            working_dir: working_dir.into(),
            params: None,
            models: None,
            projections: None,
        }
    }

    /// The waveform sampler this engine reads from.
    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    /// The current parameters, if set.
    #[must_use]
    pub fn params(&self) -> Option<&PcaParameters> {
        self.params.as_ref()
    }

    /// Set the fitting configuration.
    ///
    /// Resets the engine: all stored models and projection arrays are
    /// deleted and in-memory derived state is cleared.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for invalid parameters and propagates
    /// filesystem failures from the reset.
    pub fn set_params(&mut self, params: PcaParameters) -> Result<()> {
        params.validate()?;
        store::reset_engine_dir(&self.working_dir)?;
        self.models = None;
        self.projections = None;
        self.params = Some(params);
        Ok(())
    }

    /// Fit models from the sampled waveforms and store one projection array
    /// per unit.
    ///
    /// Projection arrays are created zero-filled on disk, shape
    /// `(num_sampled_spikes, n_components, num_channels)` (no channel axis
    /// for the concatenated topology), and overwritten in place with the
    /// transformed sampled waveforms. Arrays from a previous run are
    /// replaced.
    ///
    /// # Errors
    /// Returns [`Error::Precondition`] if parameters were never set, and
    /// propagates fitting and storage errors.
    pub fn run(&mut self) -> Result<()> {
        let params = *self.params.as_ref().ok_or_else(|| {
            Error::Precondition("parameters must be set before running".to_string())
        })?;
        let dir = store::engine_dir(&self.working_dir);

        let models = fit_models(&self.sampler, &params)?;
        models.save_to(&dir)?;

        let num_channels = self.sampler.num_channels();
        let unit_ids = self.sampler.unit_ids();
        let mut projections = Vec::with_capacity(unit_ids.len());
        for &unit in &unit_ids {
            let waveforms = self.sampler.waveforms(unit)?;
            let n_spikes = waveforms.len_of(Axis(0));
            let shape = match params.mode {
                PcaMode::Concatenated => vec![n_spikes, params.n_components],
                _ => vec![n_spikes, params.n_components, num_channels],
            };
            let array =
                DiskArray::create_zeroed(store::projection_path(&dir, unit), shape, params.dtype)?;
            if n_spikes > 0 {
                let scores = project_batch(&models, &waveforms.view())?;
                array.write(&scores.view())?;
            }
            projections.push((unit, array));
        }

        info!(
            "stored projections for {} unit(s) under {}",
            projections.len(),
            dir.display()
        );
        self.models = Some(models);
        self.projections = Some(projections);
        Ok(())
    }

    /// The fitted models of the last completed run.
    ///
    /// # Errors
    /// Returns [`Error::NotFitted`] if no run completed for the current
    /// parameters.
    pub fn models(&self) -> Result<&FittedModels> {
        self.models
            .as_ref()
            .ok_or(Error::NotFitted("no completed run for the current parameters"))
    }

    /// The stored projection array for one unit, shape
    /// `(num_sampled_spikes, n_components, num_channels)` (no channel axis
    /// for the concatenated topology).
    ///
    /// # Errors
    /// Returns [`Error::NotFitted`] if no run completed for the current
    /// parameters, [`Error::Precondition`] for an unknown unit, and
    /// propagates storage failures.
    pub fn get_projections(&self, unit: UnitId) -> Result<ArrayD<f64>> {
        let projections = self
            .projections
            .as_ref()
            .ok_or(Error::NotFitted("no completed run for the current parameters"))?;
        let (_, array) = projections
            .iter()
            .find(|(stored, _)| *stored == unit)
            .ok_or_else(|| Error::Precondition(format!("unknown unit {}", unit.0)))?;
        array.read()
    }

    /// Project an externally supplied waveform batch, shape
    /// `(num_waveforms, samples_per_waveform, num_channels)`, through the
    /// fitted models.
    ///
    /// In the by-channel topologies each channel's slice goes through its
    /// respective model into the matching channel slot of the output; in
    /// the concatenated topology the batch is flattened first.
    ///
    /// # Errors
    /// Returns [`Error::NotFitted`] if no run completed, and
    /// [`Error::ShapeMismatch`] if the batch disagrees in sample length or
    /// channel count with the data used at fit time.
    pub fn project_new(&self, waveforms: ArrayView3<'_, f64>) -> Result<ArrayD<f64>> {
        let models = self.models()?;
        if waveforms.len_of(Axis(1)) != models.samples_per_waveform() {
            return Err(Error::ShapeMismatch {
                what: "samples per waveform",
                expected: models.samples_per_waveform(),
                actual: waveforms.len_of(Axis(1)),
            });
        }
        if waveforms.len_of(Axis(2)) != models.num_channels() {
            return Err(Error::ShapeMismatch {
                what: "channel count",
                expected: models.num_channels(),
                actual: waveforms.len_of(Axis(2)),
            });
        }
        project_batch(models, &waveforms)
    }

    /// Concatenate stored per-unit projections into one array plus a
    /// parallel label vector identifying each row's source unit.
    ///
    /// `unit_subset` restricts (and orders) the included units;
    /// `channel_subset` restricts the channel axis and is only valid in the
    /// by-channel topologies. Labels carry unit identifiers or ordinal
    /// indices per `label_mode`.
    ///
    /// # Errors
    /// Returns [`Error::NotFitted`] if no run completed,
    /// [`Error::Config`] for a channel subset in concatenated mode, and
    /// [`Error::Precondition`] for unknown units or out-of-range channels.
    pub fn get_all_projections(
        &self,
        channel_subset: Option<&[usize]>,
        unit_subset: Option<&[UnitId]>,
        label_mode: LabelMode,
    ) -> Result<(Vec<u64>, ArrayD<f64>)> {
        let models = self.models()?;
        let params = self
            .params
            .ok_or(Error::NotFitted("no completed run for the current parameters"))?;

        if channel_subset.is_some() && !params.mode.is_by_channel() {
            return Err(Error::Config(
                "channel subsets require a by-channel mode".to_string(),
            ));
        }
        if let Some(channels) = channel_subset {
            if let Some(&bad) = channels.iter().find(|&&c| c >= models.num_channels()) {
                return Err(Error::Precondition(format!(
                    "channel {bad} out of range for {} channels",
                    models.num_channels()
                )));
            }
        }

        let stored_order = self.sampler.unit_ids();
        let units: Vec<UnitId> = match unit_subset {
            Some(subset) => subset.to_vec(),
            None => stored_order.clone(),
        };

        let num_output_channels = channel_subset
            .map(<[usize]>::len)
            .unwrap_or(models.num_channels());
        let mut labels = Vec::new();
        let mut parts: Vec<ArrayD<f64>> = Vec::with_capacity(units.len());
        for &unit in &units {
            let ordinal = stored_order
                .iter()
                .position(|&stored| stored == unit)
                .ok_or_else(|| Error::Precondition(format!("unknown unit {}", unit.0)))?;
            let mut projection = self.get_projections(unit)?;
            if let Some(channels) = channel_subset {
                projection = projection.select(Axis(2), channels);
            }
            let label = match label_mode {
                LabelMode::UnitId => unit.0,
                LabelMode::UnitIndex => ordinal as u64,
            };
            labels.extend(std::iter::repeat(label).take(projection.len_of(Axis(0))));
            parts.push(projection);
        }

        if parts.is_empty() {
            let shape = match params.mode {
                PcaMode::Concatenated => vec![0, params.n_components],
                _ => vec![0, params.n_components, num_output_channels],
            };
            return Ok((labels, ArrayD::zeros(IxDyn(&shape))));
        }

        let views: Vec<_> = parts.iter().map(|part| part.view()).collect();
        let all = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| Error::Linalg(format!("projection concatenation failed: {e}")))?;
        Ok((labels, all))
    }

    /// Project every spike of the recording through the fitted models into
    /// one shared output array at `output_path`, shape
    /// `(total_spikes, n_components, max_channels_per_unit)`, float32.
    ///
    /// See [`crate::extract`] for the chunked parallel algorithm and its
    /// border-spike zero-fill policy.
    ///
    /// # Errors
    /// Returns [`Error::NotFitted`] if no run completed, and
    /// [`Error::Precondition`] for a multi-segment spike train or a
    /// non-by-channel topology.
    pub fn run_for_all_spikes<R: RecordingSource>(
        &self,
        recording: &R,
        spike_trains: &[SpikeTrain],
        sparsity: &ChannelSparsity,
        output_path: &Path,
        options: &ExtractionOptions,
    ) -> Result<()> {
        extract::extract_all_spikes(
            recording,
            spike_trains,
            sparsity,
            self.models()?,
            self.sampler.nbefore(),
            self.sampler.nafter(),
            output_path,
            options,
        )
    }
}

/// Transform one waveform batch through the fitted models, producing
/// `(spikes, n_components, num_channels)` scores in the by-channel
/// topologies and `(spikes, n_components)` for concatenated.
fn project_batch(models: &FittedModels, waveforms: &ArrayView3<'_, f64>) -> Result<ArrayD<f64>> {
    let n_spikes = waveforms.len_of(Axis(0));
    let n_components = models.n_components();
    match models.mode() {
        PcaMode::Concatenated => {
            let flat: Array2<f64> = waveforms
                .to_owned()
                .into_shape_with_order((n_spikes, models.samples_per_waveform() * models.num_channels()))
                .map_err(|e| Error::Linalg(format!("waveform flatten failed: {e}")))?;
            let scores = models.single_model()?.transform(flat.view())?;
            Ok(scores.into_dyn())
        }
        PcaMode::PerChannelIndependent | PcaMode::PerChannelShared => {
            let num_channels = models.num_channels();
            let mut scores = Array3::<f64>::zeros((n_spikes, n_components, num_channels));
            for channel in 0..num_channels {
                let channel_scores =
                    models.transform_channel(channel, waveforms.slice(s![.., .., channel]))?;
                scores
                    .slice_mut(s![.., .., channel])
                    .assign(&channel_scores);
            }
            Ok(scores.into_dyn())
        }
    }
}

/// Create an engine, set its parameters, and run it in one call.
///
/// # Errors
/// Propagates parameter, fitting, and storage errors.
pub fn compute_waveform_pca<S: WaveformSampler>(
    sampler: S,
    working_dir: impl Into<PathBuf>,
    params: PcaParameters,
) -> Result<WaveformPca<S>> {
    let mut engine = WaveformPca::new(sampler, working_dir);
    engine.set_params(params)?;
    engine.run()?;
    Ok(engine)
}
