// Principal-component projections of spike waveforms

#![doc = include_str!("../README.md")]

pub mod engine;
pub mod error;
pub mod extract;
pub mod fit;
pub mod params;
pub mod pca;
pub mod source;
pub mod store;

pub use engine::{compute_waveform_pca, LabelMode, WaveformPca};
pub use error::{Error, Result};
pub use extract::{extract_all_spikes, ExtractionOptions};
pub use fit::{fit_models, FittedModels};
pub use params::{OutputDtype, PcaMode, PcaParameters};
pub use pca::IncrementalPca;
pub use source::{ChannelSparsity, RecordingSource, SpikeTrain, UnitId, WaveformSampler};
