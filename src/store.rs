//! Disk layout of the engine's artifacts and memory-mapped array storage.
//!
//! The engine shares its working directory with the upstream waveform
//! sampler and owns only the `pca/` sub-directory inside it: model files,
//! per-unit projection arrays, and nothing else. Arrays are raw
//! native-endian buffers in C order with the fixed axis order
//! spikes/components/channels.

use memmap2::{Mmap, MmapMut};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::params::{OutputDtype, PcaMode};
use crate::source::UnitId;
use ndarray::{ArrayD, ArrayViewD, IxDyn};

/// Name of the engine's dedicated sub-directory inside the shared working
/// directory.
pub const ENGINE_SUBDIR: &str = "pca";

/// The engine's artifact directory under `working_dir`.
#[must_use]
pub fn engine_dir(working_dir: &Path) -> PathBuf {
    working_dir.join(ENGINE_SUBDIR)
}

/// Clear and recreate the engine's artifact directory, deleting all stored
/// models and projections.
///
/// # Errors
/// Propagates filesystem failures.
pub fn reset_engine_dir(working_dir: &Path) -> Result<PathBuf> {
    let dir = engine_dir(working_dir);
    if dir.is_dir() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Path of a persisted model file: one per channel in independent mode,
/// one per mode otherwise.
#[must_use]
pub fn model_path(dir: &Path, mode: PcaMode, channel: Option<usize>) -> PathBuf {
    match channel {
        Some(channel) => dir.join(format!("pca_model_{}_{channel}.bin", mode.tag())),
        None => dir.join(format!("pca_model_{}.bin", mode.tag())),
    }
}

/// Path of one unit's stored projection array.
#[must_use]
pub fn projection_path(dir: &Path, unit: UnitId) -> PathBuf {
    dir.join(format!("pca_{}.bin", unit.0))
}

/// A disk-backed numeric array with a fixed shape and element type.
///
/// Created zero-filled (`File::set_len` guarantees zero bytes) and
/// overwritten in place. The mapped buffer supports concurrent writes to
/// disjoint regions from independent workers.
#[derive(Debug, Clone)]
pub struct DiskArray {
    path: PathBuf,
    shape: Vec<usize>,
    dtype: OutputDtype,
}

impl DiskArray {
    /// Create a zero-filled array file of the given shape.
    ///
    /// # Errors
    /// Propagates file-creation failures.
    pub fn create_zeroed(path: PathBuf, shape: Vec<usize>, dtype: OutputDtype) -> Result<Self> {
        let bytes = shape.iter().product::<usize>() * dtype.size_of();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(bytes as u64)?;
        Ok(Self { path, shape, dtype })
    }

    /// Open an existing array file, verifying its length against the shape.
    ///
    /// # Errors
    /// Returns an error if the file is missing or its length disagrees with
    /// the expected shape.
    pub fn open(path: PathBuf, shape: Vec<usize>, dtype: OutputDtype) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_of();
        let actual = fs::metadata(&path)?.len();
        if actual != expected as u64 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "array file {} holds {actual} bytes, expected {expected} for shape {shape:?}",
                    path.display()
                ),
            )));
        }
        Ok(Self { path, shape, dtype })
    }

    /// The array's shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The array's element count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// True if the array holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map the backing file for writing. Fails on zero-length arrays, which
    /// cannot be mapped; callers skip writes for those.
    ///
    /// # Errors
    /// Propagates mapping failures.
    pub fn map_mut(&self) -> Result<MmapMut> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        // SAFETY: the file is owned by this engine's artifact directory and
        // is not resized while mapped; concurrent writers touch disjoint
        // regions only.
        #[allow(unsafe_code)]
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(mmap)
    }

    /// Overwrite the whole array with `values`, converting to the array's
    /// element type. Iteration is in logical (C) order.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if `values` disagrees in element
    /// count, and propagates mapping failures.
    pub fn write(&self, values: &ArrayViewD<'_, f64>) -> Result<()> {
        if values.len() != self.len() {
            return Err(Error::ShapeMismatch {
                what: "array element count",
                expected: self.len(),
                actual: values.len(),
            });
        }
        if self.is_empty() {
            return Ok(());
        }
        let mut mmap = self.map_mut()?;
        match self.dtype {
            OutputDtype::Float32 => {
                let out: &mut [f32] = cast_bytes_mut(&mut mmap[..])?;
                for (dst, &src) in out.iter_mut().zip(values.iter()) {
                    *dst = src as f32;
                }
            }
            OutputDtype::Float64 => {
                let out: &mut [f64] = cast_bytes_mut(&mut mmap[..])?;
                for (dst, &src) in out.iter_mut().zip(values.iter()) {
                    *dst = src;
                }
            }
        }
        mmap.flush()?;
        Ok(())
    }

    /// Read the whole array into an owned `f64` array of the stored shape.
    ///
    /// # Errors
    /// Propagates file and mapping failures.
    pub fn read(&self) -> Result<ArrayD<f64>> {
        if self.is_empty() {
            return Ok(ArrayD::zeros(IxDyn(&self.shape)));
        }
        let file = File::open(&self.path)?;
        // SAFETY: read-only mapping of a file this engine wrote; writers are
        // done by the time readers map it.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        let values: Vec<f64> = match self.dtype {
            OutputDtype::Float32 => {
                let raw: &[f32] = cast_bytes(&mmap[..])?;
                raw.iter().map(|&v| f64::from(v)).collect()
            }
            OutputDtype::Float64 => cast_bytes::<f64>(&mmap[..])?.to_vec(),
        };
        ArrayD::from_shape_vec(IxDyn(&self.shape), values)
            .map_err(|e| Error::Linalg(format!("stored array has inconsistent shape: {e}")))
    }
}

/// Reinterpret a mapped byte buffer as typed elements.
fn cast_bytes<T: bytemuck::Pod>(bytes: &[u8]) -> Result<&[T]> {
    bytemuck::try_cast_slice(bytes).map_err(|e| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("mapped buffer cannot be viewed as element slice: {e:?}"),
        ))
    })
}

/// Mutable counterpart of [`cast_bytes`].
pub(crate) fn cast_bytes_mut<T: bytemuck::Pod>(bytes: &mut [u8]) -> Result<&mut [T]> {
    bytemuck::try_cast_slice_mut(bytes).map_err(|e| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("mapped buffer cannot be viewed as element slice: {e:?}"),
        ))
    })
}
