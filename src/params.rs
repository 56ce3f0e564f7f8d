//! Fitting configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Model topology selected for fitting.
///
/// * `PerChannelIndependent` - one model fitted per channel, each channel
///   seeing only its own waveform slices.
/// * `PerChannelShared` - a single model fitted from every channel's slices,
///   channels treated as additional samples of one shared distribution.
/// * `Concatenated` - all channels' time samples flattened into one feature
///   vector per spike, a single model fitted on the flattened vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PcaMode {
    PerChannelIndependent,
    PerChannelShared,
    Concatenated,
}

impl PcaMode {
    /// Tag used in persisted model file names.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            PcaMode::PerChannelIndependent => "per_channel_independent",
            PcaMode::PerChannelShared => "per_channel_shared",
            PcaMode::Concatenated => "concatenated",
        }
    }

    /// True for the two modes that keep a channel axis in the projections.
    #[must_use]
    pub fn is_by_channel(self) -> bool {
        !matches!(self, PcaMode::Concatenated)
    }
}

/// Numeric type of the persisted projection arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputDtype {
    Float32,
    Float64,
}

impl OutputDtype {
    /// Element size in bytes.
    #[must_use]
    pub fn size_of(self) -> usize {
        match self {
            OutputDtype::Float32 => 4,
            OutputDtype::Float64 => 8,
        }
    }
}

/// Fitting configuration.
///
/// Immutable once handed to the engine; changing parameters on the engine
/// invalidates all stored models and projections.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaParameters {
    /// Number of principal components per model.
    pub n_components: usize,
    /// Model topology.
    pub mode: PcaMode,
    /// Scale each component score by the inverse square root of its
    /// explained variance.
    pub whiten: bool,
    /// Numeric type of the persisted projection arrays.
    pub dtype: OutputDtype,
}

impl Default for PcaParameters {
    fn default() -> Self {
        Self {
            n_components: 5,
            mode: PcaMode::PerChannelIndependent,
            whiten: true,
            dtype: OutputDtype::Float32,
        }
    }
}

impl PcaParameters {
    /// Create a validated parameter set.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `n_components` is zero.
    pub fn new(n_components: usize, mode: PcaMode, whiten: bool, dtype: OutputDtype) -> Result<Self> {
        let params = Self {
            n_components,
            mode,
            whiten,
            dtype,
        };
        params.validate()?;
        Ok(params)
    }

    /// Check the parameter set for internal consistency.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `n_components` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.n_components == 0 {
            return Err(Error::Config(
                "n_components must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parameters_are_valid() {
        let params = PcaParameters::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.n_components, 5);
        assert!(params.whiten);
    }

    #[test]
    fn zero_components_rejected() {
        let result = PcaParameters::new(0, PcaMode::Concatenated, false, OutputDtype::Float32);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn mode_tags_are_distinct() {
        assert_ne!(
            PcaMode::PerChannelIndependent.tag(),
            PcaMode::PerChannelShared.tag()
        );
        assert!(PcaMode::PerChannelShared.is_by_channel());
        assert!(!PcaMode::Concatenated.is_by_channel());
    }
}
