//! Incremental principal component analysis of waveform batches.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Error, Result};

/// Variances at or below this floor are treated as degenerate: the matching
/// whitening factor is left at 1.0 and the eigenvalue is clamped to zero.
const VARIANCE_FLOOR: f64 = 1e-12;

/// An incrementally-updatable PCA model.
///
/// The model consumes waveform batches one at a time through
/// [`IncrementalPca::partial_fit`], keeping only pooled sufficient statistics
/// (sample count, running mean, centered scatter matrix) rather than the raw
/// data. [`IncrementalPca::finalize`] turns the pooled statistics into an
/// ordered component basis via an eigendecomposition of the covariance
/// matrix; [`IncrementalPca::transform`] then projects new batches onto that
/// basis, optionally whitening each component score by the inverse square
/// root of its explained variance.
///
/// Models can be saved to and loaded from files.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IncrementalPca {
    /// Requested number of principal components.
    n_components: usize,
    /// Scale transformed scores by `1 / sqrt(explained_variance)`.
    whiten: bool,
    /// Samples consumed so far.
    count: u64,
    /// Running mean of the consumed samples. Empty until the first batch.
    mean: Array1<f64>,
    /// Centered scatter matrix (sum of outer products of deviations from the
    /// running mean). Empty until the first batch.
    scatter: Array2<f64>,
    /// Ordered component basis, shape `(n_features, n_components)`.
    /// `None` until [`IncrementalPca::finalize`] runs.
    components: Option<Array2<f64>>,
    /// Explained variance per component, descending.
    explained_variance: Option<Array1<f64>>,
}

impl IncrementalPca {
    /// Create an empty model for `n_components` components.
    #[must_use]
    pub fn new(n_components: usize, whiten: bool) -> Self {
        Self {
            n_components,
            whiten,
            count: 0,
            mean: Array1::zeros(0),
            scatter: Array2::zeros((0, 0)),
            components: None,
            explained_variance: None,
        }
    }

    /// Requested number of components.
    #[must_use]
    pub fn n_components(&self) -> usize {
        self.n_components
    }

    /// Feature dimensionality seen so far, or `None` before the first batch.
    #[must_use]
    pub fn feature_len(&self) -> Option<usize> {
        (self.count > 0).then(|| self.mean.len())
    }

    /// Samples consumed so far.
    #[must_use]
    pub fn samples_seen(&self) -> u64 {
        self.count
    }

    /// Running mean of the consumed samples, if any batch was consumed.
    #[must_use]
    pub fn mean(&self) -> Option<&Array1<f64>> {
        (self.count > 0).then_some(&self.mean)
    }

    /// Ordered component basis `(n_features, n_components)`, once finalized.
    #[must_use]
    pub fn components(&self) -> Option<&Array2<f64>> {
        self.components.as_ref()
    }

    /// Explained variance per component, descending, once finalized.
    #[must_use]
    pub fn explained_variance(&self) -> Option<&Array1<f64>> {
        self.explained_variance.as_ref()
    }

    /// Update the model with one batch, shape `(batch_samples, n_features)`.
    ///
    /// The running mean and scatter are merged with the batch statistics
    /// using the pooled two-set update, so the model never retains raw
    /// samples. Consuming a batch invalidates a previously finalized basis;
    /// call [`IncrementalPca::finalize`] again before transforming.
    ///
    /// Empty batches are ignored.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `n_components` exceeds the batch's
    /// feature dimensionality, and [`Error::ShapeMismatch`] if the feature
    /// dimensionality disagrees with earlier batches.
    pub fn partial_fit(&mut self, batch: ArrayView2<'_, f64>) -> Result<()> {
        let batch_samples = batch.nrows();
        if batch_samples == 0 {
            return Ok(());
        }
        let n_features = batch.ncols();
        if self.n_components > n_features {
            return Err(Error::Config(format!(
                "n_components ({}) exceeds the feature dimensionality ({n_features})",
                self.n_components
            )));
        }

        if self.count == 0 {
            self.mean = Array1::zeros(n_features);
            self.scatter = Array2::zeros((n_features, n_features));
        } else if n_features != self.mean.len() {
            return Err(Error::ShapeMismatch {
                what: "feature length",
                expected: self.mean.len(),
                actual: n_features,
            });
        }

        let batch_mean = batch
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Linalg("failed to compute batch mean".to_string()))?;
        let mut centered = batch.to_owned();
        centered -= &batch_mean;
        let batch_scatter = centered.t().dot(&centered);

        // Pooled two-set merge of (count, mean, scatter).
        let n_seen = self.count as f64;
        let n_batch = batch_samples as f64;
        let n_total = n_seen + n_batch;
        let delta = &batch_mean - &self.mean;

        self.mean.scaled_add(n_batch / n_total, &delta);
        self.scatter += &batch_scatter;
        let cross_weight = n_seen * n_batch / n_total;
        let delta_col = delta.view().insert_axis(Axis(1));
        self.scatter
            .scaled_add(cross_weight, &delta_col.dot(&delta_col.t()));

        self.count += batch_samples as u64;
        self.components = None;
        self.explained_variance = None;
        Ok(())
    }

    /// Turn the pooled statistics into an ordered component basis.
    ///
    /// The covariance matrix `scatter / (count - 1)` is eigendecomposed,
    /// eigenpairs are sorted by descending eigenvalue, and the leading
    /// `n_components` eigenvectors become the basis columns, each normalized
    /// to unit length. Negative eigenvalues from numerical round-off are
    /// clamped to zero.
    ///
    /// # Errors
    /// Returns [`Error::InsufficientData`] if no batch was consumed and
    /// [`Error::Linalg`] if the eigendecomposition fails.
    pub fn finalize(&mut self) -> Result<()> {
        if self.count == 0 {
            return Err(Error::InsufficientData);
        }
        let n_features = self.mean.len();
        let denominator = (self.count.saturating_sub(1)).max(1) as f64;
        let covariance = self.scatter.mapv(|v| v / denominator);

        let (values, vectors) = covariance
            .eigh(UPLO::Upper)
            .map_err(|e| Error::Linalg(format!("eigendecomposition of covariance failed: {e}")))?;

        let mut eig_pairs: Vec<(f64, Array1<f64>)> = values
            .into_iter()
            .zip(vectors.columns().into_iter().map(|col| col.to_owned()))
            .collect();
        eig_pairs.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        let mut basis = Array2::<f64>::zeros((n_features, self.n_components));
        let mut variances = Array1::<f64>::zeros(self.n_components);
        for i in 0..self.n_components {
            let (value, ref vector) = eig_pairs[i];
            variances[i] = value.max(0.0);
            let norm = vector.dot(vector).sqrt();
            let mut column = basis.column_mut(i);
            if norm > VARIANCE_FLOOR {
                column.assign(&vector.mapv(|v| v / norm));
            }
        }

        self.components = Some(basis);
        self.explained_variance = Some(variances);
        Ok(())
    }

    /// Project a batch onto the fitted basis, shape `(batch_samples,
    /// n_features)` in, `(batch_samples, n_components)` out.
    ///
    /// The batch is centered with the fitted mean and projected onto the
    /// component basis; with whitening, each score column is divided by the
    /// square root of the matching explained variance (degenerate variances
    /// leave the column unscaled).
    ///
    /// # Errors
    /// Returns [`Error::NotFitted`] if the model has no finalized basis and
    /// [`Error::ShapeMismatch`] if the batch's feature dimensionality
    /// disagrees with fit time.
    pub fn transform(&self, batch: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let components = self
            .components
            .as_ref()
            .ok_or(Error::NotFitted("model has no finalized component basis"))?;
        let n_features = self.mean.len();
        if batch.ncols() != n_features {
            return Err(Error::ShapeMismatch {
                what: "feature length",
                expected: n_features,
                actual: batch.ncols(),
            });
        }

        let mut centered = batch.to_owned();
        centered -= &self.mean;
        let mut scores = centered.dot(components);

        if self.whiten {
            let variances = self
                .explained_variance
                .as_ref()
                .ok_or(Error::NotFitted("model has no explained variance"))?;
            for (mut column, &variance) in scores.columns_mut().into_iter().zip(variances.iter()) {
                if variance > VARIANCE_FLOOR {
                    let scale = variance.sqrt();
                    column.mapv_inplace(|v| v / scale);
                }
            }
        }
        Ok(scores)
    }

    /// Map component scores back to feature space, undoing whitening,
    /// projection, and centering. With a full-rank basis this inverts
    /// [`IncrementalPca::transform`]; with a truncated basis it reconstructs
    /// the input up to the variance captured by the kept components.
    ///
    /// # Errors
    /// Returns [`Error::NotFitted`] if the model has no finalized basis and
    /// [`Error::ShapeMismatch`] if the score batch does not have
    /// `n_components` columns.
    pub fn inverse_transform(&self, scores: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let components = self
            .components
            .as_ref()
            .ok_or(Error::NotFitted("model has no finalized component basis"))?;
        if scores.ncols() != self.n_components {
            return Err(Error::ShapeMismatch {
                what: "component count",
                expected: self.n_components,
                actual: scores.ncols(),
            });
        }

        let mut scores = scores.to_owned();
        if self.whiten {
            let variances = self
                .explained_variance
                .as_ref()
                .ok_or(Error::NotFitted("model has no explained variance"))?;
            for (mut column, &variance) in scores.columns_mut().into_iter().zip(variances.iter()) {
                if variance > VARIANCE_FLOOR {
                    let scale = variance.sqrt();
                    column.mapv_inplace(|v| v * scale);
                }
            }
        }

        let mut reconstructed = scores.dot(&components.t());
        reconstructed += &self.mean;
        Ok(reconstructed)
    }

    /// Save the model to a file using bincode.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or serialization fails.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(())
    }

    /// Load a model from a file previously saved with
    /// [`IncrementalPca::save_model`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialization fails,
    /// or the loaded model is internally inconsistent.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let model: IncrementalPca =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| Error::Serialization(e.to_string()))?;

        if let Some(components) = model.components.as_ref() {
            if components.nrows() != model.mean.len() {
                return Err(Error::Serialization(format!(
                    "loaded model is inconsistent: {} basis rows for {} mean features",
                    components.nrows(),
                    model.mean.len()
                )));
            }
            if components.ncols() != model.n_components {
                return Err(Error::Serialization(format!(
                    "loaded model is inconsistent: {} basis columns for n_components {}",
                    components.ncols(),
                    model.n_components
                )));
            }
            let variances = model.explained_variance.as_ref().ok_or_else(|| {
                Error::Serialization(
                    "loaded model has a component basis but no explained variance".to_string(),
                )
            })?;
            if variances.len() != model.n_components {
                return Err(Error::Serialization(format!(
                    "loaded model is inconsistent: {} variances for n_components {}",
                    variances.len(),
                    model.n_components
                )));
            }
            if variances.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(Error::Serialization(
                    "loaded model has non-finite or negative explained variance".to_string(),
                ));
            }
        }
        Ok(model)
    }
}
