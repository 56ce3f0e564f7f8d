//! Fitting the three model topologies from sampled waveform batches.

use log::{debug, info};
use ndarray::{s, ArrayView2, ArrayView3};

use crate::error::{Error, Result};
use crate::params::{PcaMode, PcaParameters};
use crate::pca::IncrementalPca;
use crate::source::WaveformSampler;
use crate::store;
use std::path::Path;

/// Fitted model collection: one model per channel in independent mode,
/// exactly one model otherwise.
#[derive(Debug, Clone)]
enum ModelBank {
    PerChannel(Vec<IncrementalPca>),
    Single(IncrementalPca),
}

/// The fitted models together with the waveform geometry seen at fit time.
///
/// Both variants expose the same per-channel transform capability through
/// [`FittedModels::model_for_channel`], so calling code never branches on
/// the mode to decide arity.
#[derive(Debug, Clone)]
pub struct FittedModels {
    bank: ModelBank,
    mode: PcaMode,
    samples_per_waveform: usize,
    num_channels: usize,
}

impl FittedModels {
    /// Topology the models were fitted with.
    #[must_use]
    pub fn mode(&self) -> PcaMode {
        self.mode
    }

    /// Number of distinct models held (channel count in independent mode,
    /// one otherwise).
    #[must_use]
    pub fn num_models(&self) -> usize {
        match &self.bank {
            ModelBank::PerChannel(models) => models.len(),
            ModelBank::Single(_) => 1,
        }
    }

    /// Samples per waveform window at fit time.
    #[must_use]
    pub fn samples_per_waveform(&self) -> usize {
        self.samples_per_waveform
    }

    /// Channel count at fit time.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Components per model.
    #[must_use]
    pub fn n_components(&self) -> usize {
        match &self.bank {
            ModelBank::PerChannel(models) => models[0].n_components(),
            ModelBank::Single(model) => model.n_components(),
        }
    }

    /// The model addressing one channel: the channel's own model in
    /// independent mode, the shared model otherwise.
    ///
    /// # Errors
    /// Returns [`Error::Precondition`] if `channel` is out of range in
    /// independent mode.
    pub fn model_for_channel(&self, channel: usize) -> Result<&IncrementalPca> {
        match &self.bank {
            ModelBank::PerChannel(models) => models.get(channel).ok_or_else(|| {
                Error::Precondition(format!(
                    "channel {channel} out of range for {} fitted channel models",
                    models.len()
                ))
            }),
            ModelBank::Single(model) => Ok(model),
        }
    }

    /// Transform one channel's waveform slices, shape
    /// `(spikes, samples_per_waveform)`, into component scores.
    ///
    /// # Errors
    /// Propagates channel-range and shape errors from the underlying model.
    pub fn transform_channel(
        &self,
        channel: usize,
        batch: ArrayView2<'_, f64>,
    ) -> Result<ndarray::Array2<f64>> {
        self.model_for_channel(channel)?.transform(batch)
    }

    /// The single shared model of the non-independent topologies.
    ///
    /// # Errors
    /// Returns [`Error::Precondition`] in independent mode.
    pub fn single_model(&self) -> Result<&IncrementalPca> {
        match &self.bank {
            ModelBank::Single(model) => Ok(model),
            ModelBank::PerChannel(_) => Err(Error::Precondition(
                "per-channel-independent fits hold one model per channel, not a single model"
                    .to_string(),
            )),
        }
    }

    /// Persist the fitted models under `dir`: one file per channel in
    /// independent mode, one file otherwise.
    ///
    /// # Errors
    /// Propagates file-creation and serialization failures.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        match &self.bank {
            ModelBank::PerChannel(models) => {
                for (channel, model) in models.iter().enumerate() {
                    model.save_model(store::model_path(dir, self.mode, Some(channel)))?;
                }
            }
            ModelBank::Single(model) => {
                model.save_model(store::model_path(dir, self.mode, None))?;
            }
        }
        debug!(
            "saved {} model file(s) for mode {}",
            self.num_models(),
            self.mode.tag()
        );
        Ok(())
    }

    /// Load previously persisted models from `dir`.
    ///
    /// # Errors
    /// Propagates file and deserialization failures, and rejects model sets
    /// whose geometry is internally inconsistent.
    pub fn load_from(dir: &Path, mode: PcaMode, num_channels: usize) -> Result<Self> {
        let bank = match mode {
            PcaMode::PerChannelIndependent => {
                let mut models = Vec::with_capacity(num_channels);
                for channel in 0..num_channels {
                    models.push(IncrementalPca::load_model(store::model_path(
                        dir,
                        mode,
                        Some(channel),
                    ))?);
                }
                ModelBank::PerChannel(models)
            }
            PcaMode::PerChannelShared | PcaMode::Concatenated => ModelBank::Single(
                IncrementalPca::load_model(store::model_path(dir, mode, None))?,
            ),
        };

        let feature_len = match &bank {
            ModelBank::PerChannel(models) => models
                .first()
                .and_then(IncrementalPca::feature_len)
                .ok_or_else(|| {
                    Error::Serialization("loaded channel model set is empty or unfitted".to_string())
                })?,
            ModelBank::Single(model) => model.feature_len().ok_or_else(|| {
                Error::Serialization("loaded model was never fitted".to_string())
            })?,
        };
        let samples_per_waveform = match mode {
            PcaMode::Concatenated => {
                if num_channels == 0 || feature_len % num_channels != 0 {
                    return Err(Error::Serialization(format!(
                        "loaded concatenated model has feature length {feature_len}, \
                         not divisible by {num_channels} channels"
                    )));
                }
                feature_len / num_channels
            }
            _ => feature_len,
        };

        Ok(Self {
            bank,
            mode,
            samples_per_waveform,
            num_channels,
        })
    }
}

/// Fit models from the sampler's per-unit batches according to `params`.
///
/// Units are consumed one at a time in the sampler's stored order (the
/// order determines the incremental model state exactly), and a unit with
/// zero sampled waveforms is skipped without error.
///
/// # Errors
/// Returns [`Error::InsufficientData`] if no unit contributed any waveform,
/// [`Error::Config`] if `n_components` exceeds the feature dimensionality
/// of the selected topology, and [`Error::ShapeMismatch`] if a unit batch
/// disagrees with the sampler's declared geometry.
pub fn fit_models<S: WaveformSampler>(sampler: &S, params: &PcaParameters) -> Result<FittedModels> {
    params.validate()?;
    let num_channels = sampler.num_channels();
    if num_channels == 0 {
        return Err(Error::Config(
            "the sampler declares zero channels".to_string(),
        ));
    }
    let samples_per_waveform = sampler.samples_per_waveform();
    let feature_len = match params.mode {
        PcaMode::Concatenated => samples_per_waveform * num_channels,
        _ => samples_per_waveform,
    };
    if params.n_components > feature_len {
        return Err(Error::Config(format!(
            "n_components ({}) exceeds the available feature dimensionality ({feature_len}) \
             for mode {}",
            params.n_components,
            params.mode.tag()
        )));
    }

    let unit_ids = sampler.unit_ids();
    let mut bank = match params.mode {
        PcaMode::PerChannelIndependent => ModelBank::PerChannel(
            (0..num_channels)
                .map(|_| IncrementalPca::new(params.n_components, params.whiten))
                .collect(),
        ),
        PcaMode::PerChannelShared | PcaMode::Concatenated => {
            ModelBank::Single(IncrementalPca::new(params.n_components, params.whiten))
        }
    };

    let mut total_spikes = 0usize;
    for &unit in &unit_ids {
        let waveforms = sampler.waveforms(unit)?;
        let n_spikes = waveforms.len_of(ndarray::Axis(0));
        if n_spikes == 0 {
            debug!("unit {} contributed no sampled waveforms, skipped", unit.0);
            continue;
        }
        check_batch_geometry(&waveforms.view(), samples_per_waveform, num_channels)?;
        total_spikes += n_spikes;

        match &mut bank {
            ModelBank::PerChannel(models) => {
                for (channel, model) in models.iter_mut().enumerate() {
                    model.partial_fit(waveforms.slice(s![.., .., channel]))?;
                }
            }
            ModelBank::Single(model) => match params.mode {
                PcaMode::PerChannelShared => {
                    for channel in 0..num_channels {
                        model.partial_fit(waveforms.slice(s![.., .., channel]))?;
                    }
                }
                PcaMode::Concatenated => {
                    let flat = waveforms
                        .into_shape_with_order((n_spikes, samples_per_waveform * num_channels))
                        .map_err(|e| Error::Linalg(format!("waveform flatten failed: {e}")))?;
                    model.partial_fit(flat.view())?;
                }
                PcaMode::PerChannelIndependent => unreachable!(),
            },
        }
    }

    if total_spikes == 0 {
        return Err(Error::InsufficientData);
    }

    match &mut bank {
        ModelBank::PerChannel(models) => {
            for model in models.iter_mut() {
                model.finalize()?;
            }
        }
        ModelBank::Single(model) => model.finalize()?,
    }

    info!(
        "fitted {} {} model(s) from {total_spikes} sampled spikes across {} unit(s)",
        match &bank {
            ModelBank::PerChannel(models) => models.len(),
            ModelBank::Single(_) => 1,
        },
        params.mode.tag(),
        unit_ids.len()
    );

    Ok(FittedModels {
        bank,
        mode: params.mode,
        samples_per_waveform,
        num_channels,
    })
}

fn check_batch_geometry(
    waveforms: &ArrayView3<'_, f64>,
    samples_per_waveform: usize,
    num_channels: usize,
) -> Result<()> {
    if waveforms.len_of(ndarray::Axis(1)) != samples_per_waveform {
        return Err(Error::ShapeMismatch {
            what: "samples per waveform",
            expected: samples_per_waveform,
            actual: waveforms.len_of(ndarray::Axis(1)),
        });
    }
    if waveforms.len_of(ndarray::Axis(2)) != num_channels {
        return Err(Error::ShapeMismatch {
            what: "channel count",
            expected: num_channels,
            actual: waveforms.len_of(ndarray::Axis(2)),
        });
    }
    Ok(())
}
