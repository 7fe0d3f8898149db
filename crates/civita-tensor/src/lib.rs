#![forbid(unsafe_code)]

//! The tensor capability interface and the concrete value tensor.
//!
//! A [`Tensor`] produces scalar doubles addressed by a physical offset in
//! `[0, size)`, carries a [`Hypercube`] describing its axes, an optional
//! sparse [`Index`], and a logical timestamp consumed by downstream caches.
//! Operator nodes hold their arguments as [`TensorRef`]s, forming a DAG
//! whose leaves are [`TensorVal`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use civita_core::{CoreError, Dimensions, Hypercube, Index};
use civita_runtime::{RuntimeError, Timestamp, check_cancel, now, track_allocation};

/// Error surfaced by any public tensor operation. NaN is data, never an
/// error: absent sparse entries and unmatched coordinates read as NaN.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    Shape { lhs: Vec<usize>, rhs: Vec<usize> },
    UnknownAxis { name: String },
    BadValue { reason: String },
    InconvertibleUnits { from: String, to: String },
    TooLarge { log_num_elements: f64 },
    OutOfMemory { requested: usize, budget: usize },
    Cancelled,
    NotImplemented { operation: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shape { lhs, rhs } => {
                write!(f, "arguments not conformal: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::UnknownAxis { name } => write!(f, "axis '{name}' not found in argument"),
            Self::BadValue { reason } => write!(f, "bad value: {reason}"),
            Self::InconvertibleUnits { from, to } => {
                write!(f, "inconvertible units '{from}' and '{to}'")
            }
            Self::TooLarge { log_num_elements } => write!(
                f,
                "maximum hypercube exceeded: log(numElements)={log_num_elements}"
            ),
            Self::OutOfMemory { requested, budget } => {
                write!(
                    f,
                    "allocation denied: requested={requested} bytes over budget={budget} bytes"
                )
            }
            Self::Cancelled => write!(f, "computation cancelled"),
            Self::NotImplemented { operation } => {
                write!(f, "{operation} variant not implemented")
            }
        }
    }
}

impl std::error::Error for TensorError {}

impl From<CoreError> for TensorError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::BadValue { reason } => Self::BadValue { reason },
            CoreError::InconvertibleUnits { from, to } => Self::InconvertibleUnits { from, to },
        }
    }
}

impl From<RuntimeError> for TensorError {
    fn from(error: RuntimeError) -> Self {
        match error {
            RuntimeError::OutOfMemory { requested, budget } => {
                Self::OutOfMemory { requested, budget }
            }
            RuntimeError::Cancelled => Self::Cancelled,
        }
    }
}

/// Producer of scalar doubles addressed by physical offset. Reads are
/// fallible so cooperative cancellation can surface from any long loop.
pub trait Tensor: Send + Sync {
    /// The axes, types and labels of this tensor.
    fn hypercube(&self) -> &Hypercube;

    /// The sparse index; empty means dense storage.
    fn index(&self) -> &Index;

    /// Return or compute the value at physical offset `i`.
    fn at(&self, i: usize) -> Result<f64, TensorError>;

    /// How fresh the dependent data is; caches compare against this.
    fn timestamp(&self) -> Timestamp;

    fn rank(&self) -> usize {
        self.hypercube().rank()
    }

    fn shape(&self) -> Vec<usize> {
        self.hypercube().dims()
    }

    /// Number of stored elements; less than `num_elements` when sparse.
    fn size(&self) -> usize {
        let s = self.index().len();
        if s > 0 {
            s
        } else {
            self.hypercube().num_elements()
        }
    }

    /// Value at hypercube (lineal) position `h`, NaN when the cell is not
    /// stored.
    fn at_hc(&self, h: usize) -> Result<f64, TensorError> {
        let idx = self.index();
        if idx.is_empty() {
            if h < self.size() {
                return self.at(h);
            }
        } else {
            let offset = idx.lineal_offset(h);
            if offset < idx.len() {
                return self.at(offset);
            }
        }
        Ok(f64::NAN)
    }

    /// Value at a per-axis coordinate vector.
    fn at_coords(&self, coords: &[usize]) -> Result<f64, TensorError> {
        self.at_hc(self.hypercube().lineal_index(coords))
    }

    /// Collect all stored values `[0, size)`.
    fn data(&self) -> Result<Vec<f64>, TensorError> {
        let mut out = Vec::with_capacity(self.size());
        for i in 0..self.size() {
            check_cancel()?;
            out.push(self.at(i)?);
        }
        Ok(out)
    }
}

/// Shared handle to a node in the tensor DAG.
pub type TensorRef = Arc<dyn Tensor>;

/// A tensor variable backed by contiguous storage.
///
/// With an empty index the buffer spans `hypercube().num_elements()`
/// (dense); otherwise it spans `index().len()` (sparse). Shape and index
/// change through `&mut self` before the value is shared into a DAG; the
/// element buffer itself sits behind a lock so values can keep being
/// rewritten through a [`TensorRef`], advancing the timestamp that drives
/// downstream cache invalidation.
#[derive(Debug)]
pub struct TensorVal {
    hypercube: Hypercube,
    index: Index,
    data: RwLock<Vec<f64>>,
    stamp: AtomicU64,
    tracked_bytes: usize,
}

impl Default for TensorVal {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorVal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hypercube: Hypercube::default(),
            index: Index::new(),
            data: RwLock::new(Vec::new()),
            stamp: AtomicU64::new(now().ticks()),
            tracked_bytes: 0,
        }
    }

    /// Rank-0 tensor holding a single value.
    #[must_use]
    pub fn scalar(value: f64) -> Self {
        let tv = Self::new();
        tv.data.write().push(value);
        tv
    }

    pub fn from_hypercube(hypercube: Hypercube) -> Result<Self, TensorError> {
        let mut tv = Self::new();
        tv.set_hypercube(hypercube)?;
        Ok(tv)
    }

    pub fn from_dims(dims: &[usize]) -> Result<Self, TensorError> {
        Self::from_hypercube(Hypercube::from_dims(dims))
    }

    fn touch(&self) {
        self.stamp.store(now().ticks(), Ordering::Release);
    }

    /// Re-register the buffer size with the allocation accountant. Growth
    /// is denied before the buffer changes; shrinkage always succeeds.
    fn account_resize(&mut self, new_len: usize) -> Result<(), TensorError> {
        let new_bytes = new_len.saturating_mul(std::mem::size_of::<f64>());
        if new_bytes >= self.tracked_bytes {
            track_allocation((new_bytes - self.tracked_bytes) as isize)?;
        } else {
            let _ = track_allocation(-((self.tracked_bytes - new_bytes) as isize));
        }
        self.tracked_bytes = new_bytes;
        Ok(())
    }

    /// Reallocate the buffer to the current `size()`, NaN-filled.
    fn alloc_val(&mut self) -> Result<(), TensorError> {
        let len = if self.index.is_empty() {
            self.hypercube.num_elements()
        } else {
            self.index.len()
        };
        self.account_resize(len)?;
        let mut data = self.data.write();
        data.clear();
        data.resize(len, f64::NAN);
        Ok(())
    }

    pub fn set_hypercube(&mut self, hypercube: Hypercube) -> Result<(), TensorError> {
        self.hypercube = hypercube;
        self.alloc_val()?;
        self.touch();
        Ok(())
    }

    pub fn set_dims(&mut self, dims: &[usize]) -> Result<(), TensorError> {
        self.set_hypercube(Hypercube::from_dims(dims))
    }

    pub fn set_index(&mut self, index: Index) -> Result<(), TensorError> {
        debug_assert!(index.is_sorted_unique());
        self.index = index;
        self.alloc_val()?;
        self.touch();
        Ok(())
    }

    /// Write the value at physical offset `i`. The caller keeps `i` below
    /// `size()`.
    pub fn set(&self, i: usize, value: f64) {
        {
            let mut data = self.data.write();
            data[i] = value;
        }
        self.touch();
    }

    /// Write through a per-axis coordinate vector; writes to a cell the
    /// sparse index does not cover go nowhere.
    pub fn set_coords(&self, coords: &[usize], value: f64) {
        let h = self.hypercube.lineal_index(coords);
        if self.index.is_empty() {
            self.set(h, value);
        } else {
            let offset = self.index.lineal_offset(h);
            if offset < self.index.len() {
                self.set(offset, value);
            }
        }
    }

    /// Assign a sparse data set. Becomes sparse storage when the entries
    /// cover less than half the hypercube, dense (NaN elsewhere) otherwise.
    pub fn assign_map(&mut self, entries: &BTreeMap<usize, f64>) -> Result<(), TensorError> {
        let num_elements = self.hypercube.num_elements();
        if 2 * entries.len() < num_elements {
            self.index = Index::from(entries);
            self.account_resize(entries.len())?;
            let mut data = self.data.write();
            data.clear();
            data.extend(entries.values().copied());
        } else {
            self.index.clear();
            self.account_resize(num_elements)?;
            let mut data = self.data.write();
            data.clear();
            data.resize(num_elements, f64::NAN);
            for (&h, &v) in entries {
                if h < num_elements {
                    data[h] = v;
                }
            }
        }
        self.touch();
        Ok(())
    }

    /// Assign a dense data set, trimmed or NaN-padded to
    /// `hypercube().num_elements()`.
    pub fn assign_dense(&mut self, mut values: Vec<f64>) -> Result<(), TensorError> {
        let num_elements = self.hypercube.num_elements();
        self.index.clear();
        self.account_resize(num_elements)?;
        values.resize(num_elements, f64::NAN);
        *self.data.write() = values;
        self.touch();
        Ok(())
    }

    /// Copy shape, index and values from another tensor.
    pub fn assign_from(&mut self, source: &dyn Tensor) -> Result<(), TensorError> {
        self.index = source.index().clone();
        self.hypercube = source.hypercube().clone();
        self.alloc_val()?;
        let size = source.size();
        {
            let mut data = self.data.write();
            for i in 0..size {
                check_cancel()?;
                data[i] = source.at(i)?;
            }
        }
        self.touch();
        Ok(())
    }

    /// Apply a dimension map to any axis it names, re-parsing entries.
    pub fn impose_dimensions(&mut self, dimensions: &Dimensions) -> Result<(), TensorError> {
        for xv in &mut self.hypercube.xvectors {
            if let Some(dim) = dimensions.get(&xv.name) {
                xv.dimension = dim.clone();
                xv.impose_dimension()?;
            }
        }
        self.touch();
        Ok(())
    }
}

impl Tensor for TensorVal {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let data = self.data.read();
        if data.is_empty() {
            return Ok(0.0);
        }
        Ok(data.get(i).copied().unwrap_or(f64::NAN))
    }

    fn timestamp(&self) -> Timestamp {
        Timestamp::from_ticks(self.stamp.load(Ordering::Acquire))
    }
}

impl Drop for TensorVal {
    fn drop(&mut self) {
        if self.tracked_bytes > 0 {
            let _ = track_allocation(-(self.tracked_bytes as isize));
        }
    }
}
