#![forbid(unsafe_code)]

//! The lazy operator family over the tensor DAG.
//!
//! Each operator wraps its argument tensor(s), derives its own hypercube
//! and sparse index at configuration time, and computes elements on demand.
//! Every operator keeps two code paths: a dense one driven by stride
//! arithmetic and a sparse one driven by index remapping built during
//! configuration. Long loops poll the process-wide cancellation flag.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::LN_2;

use parking_lot::Mutex;
use tracing::debug;

use civita_core::{Hypercube, Index, Value, XVector};
use civita_runtime::{Timestamp, check_cancel, now, track_allocation};
use civita_tensor::{Tensor, TensorError, TensorRef};

pub type BinFn = Box<dyn Fn(f64, f64) -> f64 + Send + Sync>;
pub type AccFn = Box<dyn Fn(&mut f64, f64) + Send + Sync>;
pub type IndexedAccFn = Box<dyn Fn(&mut f64, f64, usize) + Send + Sync>;

/// Configuration arguments shared by the operator family: the axis an
/// operation applies along, and a numeric parameter (slice coordinate,
/// scan window, …).
#[derive(Debug, Clone, Default)]
pub struct OpArgs {
    pub dimension: String,
    pub val: f64,
}

impl OpArgs {
    #[must_use]
    pub fn dimension(name: impl Into<String>) -> Self {
        Self {
            dimension: name.into(),
            val: 0.0,
        }
    }

    #[must_use]
    pub fn with_val(mut self, val: f64) -> Self {
        self.val = val;
        self
    }
}

/// Uniform configuration interface over the operator family. Operators
/// implement the arity they support; the rest reports `NotImplemented`.
pub trait TensorOp: Tensor {
    fn set_argument(&mut self, _arg: TensorRef, _args: &OpArgs) -> Result<(), TensorError> {
        Err(TensorError::NotImplemented {
            operation: "set_argument",
        })
    }

    fn set_arguments(
        &mut self,
        _arg1: TensorRef,
        _arg2: TensorRef,
        _args: &OpArgs,
    ) -> Result<(), TensorError> {
        Err(TensorError::NotImplemented {
            operation: "set_arguments",
        })
    }

    fn set_argument_list(
        &mut self,
        args: Vec<TensorRef>,
        op_args: &OpArgs,
    ) -> Result<(), TensorError> {
        match args.into_iter().next() {
            Some(arg) => self.set_argument(arg, op_args),
            None => Ok(()),
        }
    }
}

fn max_timestamp(args: &[TensorRef]) -> Timestamp {
    args.iter()
        .map(|t| t.timestamp())
        .max()
        .unwrap_or(Timestamp::EPOCH)
}

fn arg_timestamp(arg: Option<&TensorRef>) -> Timestamp {
    arg.map_or(Timestamp::EPOCH, |t| t.timestamp())
}

fn shape_error(lhs: &Hypercube, rhs: &Hypercube) -> TensorError {
    TensorError::Shape {
        lhs: lhs.dims(),
        rhs: rhs.dims(),
    }
}

// ---------------------------------------------------------------------------
// BinOp
// ---------------------------------------------------------------------------

/// Element-wise combination of two tensors through a scalar function.
/// A rank-0 argument broadcasts its single value.
pub struct BinOp {
    f: BinFn,
    arg1: Option<TensorRef>,
    arg2: Option<TensorRef>,
    hypercube: Hypercube,
    index: Index,
}

impl BinOp {
    #[must_use]
    pub fn new(f: impl Fn(f64, f64) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            f: Box::new(f),
            arg1: None,
            arg2: None,
            hypercube: Hypercube::default(),
            index: Index::new(),
        }
    }

    fn arg_element(arg: &TensorRef, h: usize) -> Result<f64, TensorError> {
        if arg.rank() == 0 {
            arg.at(0)
        } else {
            arg.at_hc(h)
        }
    }
}

impl Tensor for BinOp {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let (Some(arg1), Some(arg2)) = (&self.arg1, &self.arg2) else {
            return Ok(f64::NAN);
        };
        let h = self.index.get(i);
        Ok((self.f)(
            Self::arg_element(arg1, h)?,
            Self::arg_element(arg2, h)?,
        ))
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg1.as_ref()).max(arg_timestamp(self.arg2.as_ref()))
    }
}

impl TensorOp for BinOp {
    fn set_arguments(
        &mut self,
        arg1: TensorRef,
        arg2: TensorRef,
        _args: &OpArgs,
    ) -> Result<(), TensorError> {
        if arg1.rank() != 0 {
            self.hypercube = arg1.hypercube().clone();
            if arg2.rank() != 0 && arg1.hypercube().dims() != arg2.hypercube().dims() {
                return Err(shape_error(arg1.hypercube(), arg2.hypercube()));
            }
        } else {
            self.hypercube = arg2.hypercube().clone();
        }

        let mut indices: BTreeSet<usize> = arg1.index().iter().collect();
        if !arg2.index().is_empty() {
            let indices2: BTreeSet<usize> = arg2.index().iter().collect();
            if indices.is_empty() {
                indices = indices2;
            } else {
                // intersect, but never down to nothing: an empty index reads
                // as dense and would enumerate the whole hypercube
                let snapshot: Vec<usize> = indices.iter().copied().collect();
                for h in snapshot {
                    check_cancel()?;
                    if !indices2.contains(&h) && indices.len() > 1 {
                        indices.remove(&h);
                    }
                }
            }
        }
        self.index = Index::from(indices);
        self.arg1 = Some(arg1);
        self.arg2 = Some(arg2);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReduceArguments
// ---------------------------------------------------------------------------

/// Fold a set of conformal tensors position-wise with an accumulator
/// function. NaN argument values are skipped.
pub struct ReduceArguments {
    f: AccFn,
    init: f64,
    args: Vec<TensorRef>,
    hypercube: Hypercube,
    index: Index,
}

impl ReduceArguments {
    #[must_use]
    pub fn new(f: impl Fn(&mut f64, f64) + Send + Sync + 'static, init: f64) -> Self {
        Self {
            f: Box::new(f),
            init,
            args: Vec::new(),
            hypercube: Hypercube::default(),
            index: Index::new(),
        }
    }
}

impl Tensor for ReduceArguments {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let mut acc = self.init;
        for arg in &self.args {
            let x = if arg.rank() == 0 {
                arg.at(0)?
            } else {
                arg.at(i)?
            };
            if !x.is_nan() {
                (self.f)(&mut acc, x);
            }
        }
        Ok(acc)
    }

    fn timestamp(&self) -> Timestamp {
        max_timestamp(&self.args)
    }
}

impl TensorOp for ReduceArguments {
    fn set_argument_list(
        &mut self,
        args: Vec<TensorRef>,
        _op_args: &OpArgs,
    ) -> Result<(), TensorError> {
        self.hypercube = Hypercube::default();
        self.index.clear();
        if let Some(first) = args.first() {
            let hc = first.hypercube().clone();
            let mut indices = BTreeSet::new();
            for arg in &args {
                if arg.rank() > 0 && hc.rank() > 0 && *arg.hypercube() != hc {
                    return Err(shape_error(&hc, arg.hypercube()));
                }
                for h in arg.index().iter() {
                    check_cancel()?;
                    indices.insert(h);
                }
            }
            self.hypercube = hc;
            self.index = Index::from(indices);
        }
        self.args = args;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReduceAllOp & ReductionOp
// ---------------------------------------------------------------------------

/// Fold a tensor's entire storage down to a scalar. The accumulator sees
/// each physical offset; NaN values are skipped.
pub struct ReduceAllOp {
    f: IndexedAccFn,
    init: f64,
    arg: Option<TensorRef>,
    hypercube: Hypercube,
    index: Index,
}

impl ReduceAllOp {
    #[must_use]
    pub fn new(f: impl Fn(&mut f64, f64, usize) + Send + Sync + 'static, init: f64) -> Self {
        Self {
            f: Box::new(f),
            init,
            arg: None,
            hypercube: Hypercube::default(),
            index: Index::new(),
        }
    }
}

impl Tensor for ReduceAllOp {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, _i: usize) -> Result<f64, TensorError> {
        let Some(arg) = &self.arg else {
            return Ok(self.init);
        };
        let mut acc = self.init;
        for p in 0..arg.size() {
            check_cancel()?;
            let x = arg.at(p)?;
            if !x.is_nan() {
                (self.f)(&mut acc, x, p);
            }
        }
        Ok(acc)
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg.as_ref())
    }
}

impl TensorOp for ReduceAllOp {
    fn set_argument(&mut self, arg: TensorRef, _args: &OpArgs) -> Result<(), TensorError> {
        self.arg = Some(arg);
        Ok(())
    }
}

/// Fold along one named axis. An unknown axis name degenerates to a
/// reduce-all yielding a scalar.
///
/// Dense arguments are reduced positionally with stride arithmetic; sparse
/// arguments get a per-output-cell list of `(physical offset, axis
/// coordinate)` contributions recorded at configuration time.
pub struct ReductionOp {
    f: IndexedAccFn,
    init: f64,
    arg: Option<TensorRef>,
    axis: Option<usize>,
    hypercube: Hypercube,
    index: Index,
    partials: BTreeMap<usize, Vec<(usize, usize)>>,
}

impl ReductionOp {
    #[must_use]
    pub fn new(f: impl Fn(&mut f64, f64, usize) + Send + Sync + 'static, init: f64) -> Self {
        Self {
            f: Box::new(f),
            init,
            arg: None,
            axis: None,
            hypercube: Hypercube::default(),
            index: Index::new(),
            partials: BTreeMap::new(),
        }
    }
}

impl Tensor for ReductionOp {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let Some(arg) = &self.arg else {
            return Ok(self.init);
        };
        let mut acc = self.init;
        let Some(axis) = self.axis else {
            // no matching axis: reduce the whole storage
            for p in 0..arg.size() {
                check_cancel()?;
                let x = arg.at(p)?;
                if !x.is_nan() {
                    (self.f)(&mut acc, x, p);
                }
            }
            return Ok(acc);
        };

        if self.index.is_empty() {
            let dims = arg.shape();
            let stride: usize = dims[..axis].iter().product();
            let span = dims[axis];
            let start = (i / stride) * stride * span + i % stride;
            for j in 0..span {
                check_cancel()?;
                let x = arg.at_hc(start + j * stride)?;
                if !x.is_nan() {
                    (self.f)(&mut acc, x, j);
                }
            }
        } else if let Some(entries) = self.partials.get(&self.index.get(i)) {
            for &(p, coord) in entries {
                check_cancel()?;
                let x = arg.at(p)?;
                if !x.is_nan() {
                    (self.f)(&mut acc, x, coord);
                }
            }
        }
        Ok(acc)
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg.as_ref())
    }
}

impl TensorOp for ReductionOp {
    fn set_argument(&mut self, arg: TensorRef, args: &OpArgs) -> Result<(), TensorError> {
        self.axis = None;
        self.partials.clear();
        self.index.clear();

        let arg_hc = arg.hypercube().clone();
        self.hypercube = arg_hc.clone();
        match arg_hc
            .xvectors
            .iter()
            .position(|xv| xv.name == args.dimension)
        {
            Some(axis) => {
                self.axis = Some(axis);
                self.hypercube.xvectors.remove(axis);
                if !arg.index().is_empty() {
                    for (p, h) in arg.index().iter().enumerate() {
                        check_cancel()?;
                        let mut split = arg_hc.split_index(h);
                        let coord = split[axis];
                        split.remove(axis);
                        let out = self.hypercube.lineal_index(&split);
                        self.partials.entry(out).or_default().push((p, coord));
                    }
                    self.index = Index::from(&self.partials);
                }
            }
            None => self.hypercube.xvectors.clear(),
        }
        self.arg = Some(arg);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cached operators & Scan
// ---------------------------------------------------------------------------

struct CacheState {
    data: Vec<f64>,
    last_computed: Timestamp,
    tracked_bytes: usize,
}

impl CacheState {
    fn resize_tracked(&mut self, len: usize) -> Result<(), TensorError> {
        let new_bytes = len.saturating_mul(std::mem::size_of::<f64>());
        if new_bytes >= self.tracked_bytes {
            track_allocation((new_bytes - self.tracked_bytes) as isize)?;
        } else {
            let _ = track_allocation(-((self.tracked_bytes - new_bytes) as isize));
        }
        self.tracked_bytes = new_bytes;
        self.data.clear();
        self.data.resize(len, f64::NAN);
        Ok(())
    }
}

/// Memoized dense result buffer behind cached operators. Rematerializes
/// when an upstream timestamp passes the stamp of the last computation;
/// concurrent first-readers serialize on the interior mutex.
pub struct CachedResult {
    state: Mutex<CacheState>,
}

impl Default for CachedResult {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedResult {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                data: Vec::new(),
                last_computed: Timestamp::EPOCH,
                tracked_bytes: 0,
            }),
        }
    }

    /// Read element `i`, recomputing the whole buffer first if any input
    /// changed since the last materialization. A failed compute leaves the
    /// cache stale so the next read retries.
    pub fn read(
        &self,
        upstream: Timestamp,
        len: usize,
        compute: &dyn Fn(&mut [f64]) -> Result<(), TensorError>,
        i: usize,
    ) -> Result<f64, TensorError> {
        let mut state = self.state.lock();
        if state.last_computed < upstream {
            state.resize_tracked(len)?;
            compute(&mut state.data)?;
            state.last_computed = now();
            debug!(len, "cached tensor rematerialized");
        }
        Ok(state.data.get(i).copied().unwrap_or(f64::NAN))
    }
}

impl Drop for CachedResult {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.tracked_bytes > 0 {
            let _ = track_allocation(-(state.tracked_bytes as isize));
        }
    }
}

/// Running accumulation along one named axis, materialized once per
/// upstream change. `OpArgs::val` of one or more narrows the fold to a
/// sliding window of that width; otherwise each output is the fold of the
/// whole fiber prefix. An unknown axis scans the entire hypercube
/// linearly. NaN inputs are skipped.
pub struct Scan {
    f: IndexedAccFn,
    arg: Option<TensorRef>,
    axis: Option<usize>,
    window: f64,
    hypercube: Hypercube,
    index: Index,
    cache: CachedResult,
}

impl Scan {
    #[must_use]
    pub fn new(f: impl Fn(&mut f64, f64, usize) + Send + Sync + 'static) -> Self {
        Self {
            f: Box::new(f),
            arg: None,
            axis: None,
            window: 0.0,
            hypercube: Hypercube::default(),
            index: Index::new(),
            cache: CachedResult::new(),
        }
    }

    fn fold_step(&self, acc: &mut f64, x: f64, position: usize) {
        if x.is_nan() {
            return;
        }
        if acc.is_nan() {
            *acc = x;
        } else {
            (self.f)(acc, x, position);
        }
    }

    fn compute_into(&self, arg: &dyn Tensor, out: &mut [f64]) -> Result<(), TensorError> {
        if out.is_empty() {
            return Ok(());
        }
        match self.axis {
            Some(axis) if axis < arg.rank() => {
                let dims = arg.hypercube().dims();
                let stride: usize = dims[..axis].iter().product();
                let span = dims[axis];
                let windowed = self.window >= 1.0 && (self.window as usize) < span;
                for block in (0..out.len()).step_by(stride * span) {
                    for fiber in 0..stride {
                        if windowed {
                            let width = self.window as usize;
                            for t in 0..span {
                                check_cancel()?;
                                let mut acc = f64::NAN;
                                for u in t.saturating_sub(width - 1)..=t {
                                    let h = block + fiber + u * stride;
                                    self.fold_step(&mut acc, arg.at_hc(h)?, h);
                                }
                                out[block + fiber + t * stride] = acc;
                            }
                        } else {
                            let mut acc = f64::NAN;
                            for t in 0..span {
                                check_cancel()?;
                                let h = block + fiber + t * stride;
                                self.fold_step(&mut acc, arg.at_hc(h)?, h);
                                out[h] = acc;
                            }
                        }
                    }
                }
            }
            _ => {
                let mut acc = f64::NAN;
                for h in 0..out.len() {
                    check_cancel()?;
                    self.fold_step(&mut acc, arg.at_hc(h)?, h);
                    out[h] = acc;
                }
            }
        }
        Ok(())
    }
}

impl Tensor for Scan {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let Some(arg) = &self.arg else {
            return Ok(f64::NAN);
        };
        let len = self.hypercube.num_elements();
        self.cache.read(
            self.timestamp(),
            len,
            &|out| self.compute_into(arg.as_ref(), out),
            i,
        )
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg.as_ref())
    }
}

impl TensorOp for Scan {
    fn set_argument(&mut self, arg: TensorRef, args: &OpArgs) -> Result<(), TensorError> {
        self.window = args.val;
        // fixing the result hypercube here keeps size() from forcing a
        // compute
        self.hypercube = arg.hypercube().clone();
        self.axis = self
            .hypercube
            .xvectors
            .iter()
            .position(|xv| xv.name == args.dimension);
        self.arg = Some(arg);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Slice
// ---------------------------------------------------------------------------

/// Fix one coordinate along a named axis, dropping that axis from the
/// result. An axis name with no match leaves the shape unchanged and
/// reads offset by the slice coordinate.
pub struct Slice {
    arg: Option<TensorRef>,
    slice_index: usize,
    split: usize,
    stride: usize,
    hypercube: Hypercube,
    index: Index,
    arg_index: Vec<usize>,
}

impl Default for Slice {
    fn default() -> Self {
        Self::new()
    }
}

impl Slice {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arg: None,
            slice_index: 0,
            split: 1,
            stride: 1,
            hypercube: Hypercube::default(),
            index: Index::new(),
            arg_index: Vec::new(),
        }
    }
}

impl Tensor for Slice {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let Some(arg) = &self.arg else {
            return Ok(f64::NAN);
        };
        if self.index.is_empty() {
            let q = i / self.split;
            let r = i % self.split;
            arg.at_hc(q * self.stride + self.slice_index * self.split + r)
        } else {
            match self.arg_index.get(i) {
                Some(&p) => arg.at(p),
                None => Ok(f64::NAN),
            }
        }
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg.as_ref())
    }
}

impl TensorOp for Slice {
    fn set_argument(&mut self, arg: TensorRef, args: &OpArgs) -> Result<(), TensorError> {
        self.slice_index = args.val as usize;
        self.index.clear();
        self.arg_index.clear();

        let arg_hc = arg.hypercube();
        let axis = arg_hc
            .xvectors
            .iter()
            .position(|xv| xv.name == args.dimension);

        let mut hc = arg_hc.clone();
        match axis {
            Some(axis) => {
                hc.xvectors.remove(axis);
                self.split = arg_hc.dims()[..axis].iter().product();
                self.stride = self.split * arg_hc.dims()[axis];
            }
            None => {
                self.split = 1;
                self.stride = 1;
            }
        }
        self.hypercube = hc;

        // project the argument's sparse entries onto the reduced hypercube
        if let Some(axis) = axis {
            let mut projected: BTreeMap<usize, usize> = BTreeMap::new();
            for (p, h) in arg.index().iter().enumerate() {
                check_cancel()?;
                let mut split = arg_hc.split_index(h);
                if split[axis] == self.slice_index {
                    split.remove(axis);
                    projected.insert(self.hypercube.lineal_index(&split), p);
                }
            }
            self.index = Index::from(&projected);
            self.arg_index = projected.into_values().collect();
        }
        self.arg = Some(arg);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pivot
// ---------------------------------------------------------------------------

/// Reorder a tensor's axes. Axes not named keep their input order at the
/// tail; an unknown name fails.
pub struct Pivot {
    arg: Option<TensorRef>,
    permutation: Vec<usize>,
    hypercube: Hypercube,
    index: Index,
    permuted_index: Vec<usize>,
}

impl Default for Pivot {
    fn default() -> Self {
        Self::new()
    }
}

impl Pivot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arg: None,
            permutation: Vec::new(),
            hypercube: Hypercube::default(),
            index: Index::new(),
            permuted_index: Vec::new(),
        }
    }

    /// Reorder axes so the named ones come first, in the given order.
    pub fn set_orientation(&mut self, axes: &[String]) -> Result<(), TensorError> {
        let Some(arg) = self.arg.clone() else {
            return Ok(());
        };
        let arg_hc = arg.hypercube();
        let mut by_name: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, xv) in arg_hc.xvectors.iter().enumerate() {
            by_name.insert(xv.name.as_str(), i);
        }

        let mut hc = Hypercube::default();
        let mut named: BTreeSet<&str> = BTreeSet::new();
        let mut inverse: BTreeMap<usize, usize> = BTreeMap::new();
        self.permutation.clear();
        for name in axes {
            let &old = by_name
                .get(name.as_str())
                .ok_or_else(|| TensorError::UnknownAxis { name: name.clone() })?;
            named.insert(name.as_str());
            inverse.insert(old, self.permutation.len());
            self.permutation.push(old);
            hc.xvectors.push(arg_hc.xvectors[old].clone());
        }
        for (i, xv) in arg_hc.xvectors.iter().enumerate() {
            check_cancel()?;
            if !named.contains(xv.name.as_str()) {
                inverse.insert(i, self.permutation.len());
                self.permutation.push(i);
                hc.xvectors.push(xv.clone());
            }
        }
        debug_assert_eq!(hc.rank(), arg.rank());
        self.hypercube = hc;

        // permute the sparse index into the new axis order
        let mut permuted: BTreeMap<usize, usize> = BTreeMap::new();
        for (p, h) in arg.index().iter().enumerate() {
            let split = arg_hc.split_index(h);
            let mut pivoted = split.clone();
            for (old, coord) in split.iter().enumerate() {
                check_cancel()?;
                pivoted[inverse[&old]] = *coord;
            }
            permuted.insert(self.hypercube.lineal_index(&pivoted), p);
        }
        self.index = Index::from(&permuted);
        self.permuted_index = permuted.into_values().collect();
        if !self.permuted_index.is_empty() {
            // dense stride arithmetic is unused on the sparse path
            self.permutation.clear();
        }
        Ok(())
    }

    fn pivot_index(&self, arg: &TensorRef, i: usize) -> usize {
        let split = self.hypercube.split_index(i);
        let mut pivoted = split.clone();
        for (j, coord) in split.iter().enumerate() {
            pivoted[self.permutation[j]] = *coord;
        }
        arg.hypercube().lineal_index(&pivoted)
    }
}

impl Tensor for Pivot {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let Some(arg) = &self.arg else {
            return Ok(f64::NAN);
        };
        if self.index.is_empty() {
            arg.at_hc(self.pivot_index(arg, i))
        } else {
            match self.permuted_index.get(i) {
                Some(&p) => arg.at(p),
                None => Ok(f64::NAN),
            }
        }
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg.as_ref())
    }
}

impl TensorOp for Pivot {
    fn set_argument(&mut self, arg: TensorRef, _args: &OpArgs) -> Result<(), TensorError> {
        let axes = arg.hypercube().dim_labels();
        self.arg = Some(arg);
        self.set_orientation(&axes)
    }
}

// ---------------------------------------------------------------------------
// PermuteAxis
// ---------------------------------------------------------------------------

/// Reorder (and possibly drop) the entries of one named axis according to
/// a permutation of source positions. On rank-1 arguments the name match
/// is skipped and axis 0 is used.
pub struct PermuteAxis {
    arg: Option<TensorRef>,
    axis: usize,
    permutation: Vec<usize>,
    hypercube: Hypercube,
    index: Index,
    permuted_index: Vec<usize>,
}

impl Default for PermuteAxis {
    fn default() -> Self {
        Self::new()
    }
}

impl PermuteAxis {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arg: None,
            axis: 0,
            permutation: Vec::new(),
            hypercube: Hypercube::default(),
            index: Index::new(),
            permuted_index: Vec::new(),
        }
    }

    pub fn set_permutation(&mut self, permutation: Vec<usize>) -> Result<(), TensorError> {
        let Some(arg) = self.arg.clone() else {
            return Ok(());
        };
        self.permutation = permutation;
        let arg_hc = arg.hypercube();
        let source_axis = &arg_hc.xvectors[self.axis];

        let xv = &mut self.hypercube.xvectors[self.axis];
        xv.clear();
        for &p in &self.permutation {
            if p < source_axis.len() {
                check_cancel()?;
                xv.push(source_axis[p].clone());
            }
        }
        let new_len = xv.len();

        let mut reverse: BTreeMap<usize, usize> = BTreeMap::new();
        for (j, &p) in self.permutation.iter().enumerate() {
            check_cancel()?;
            reverse.insert(p, j);
        }

        let mut remapped: BTreeMap<usize, usize> = BTreeMap::new();
        for (k, h) in arg.index().iter().enumerate() {
            check_cancel()?;
            let mut split = arg_hc.split_index(h);
            if let Some(&j) = reverse.get(&split[self.axis]) {
                if j < new_len {
                    split[self.axis] = j;
                    remapped.insert(self.hypercube.lineal_index(&split), k);
                }
            }
        }
        self.index = Index::from(&remapped);
        self.permuted_index = remapped.into_values().collect();
        Ok(())
    }
}

impl Tensor for PermuteAxis {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let Some(arg) = &self.arg else {
            return Ok(f64::NAN);
        };
        if self.index.is_empty() {
            let mut split = self.hypercube.split_index(i);
            if self.axis >= split.len() {
                return Ok(f64::NAN);
            }
            let source = self.permutation[split[self.axis]];
            if source >= arg.hypercube().xvectors[self.axis].len() {
                return Ok(f64::NAN);
            }
            split[self.axis] = source;
            arg.at_hc(arg.hypercube().lineal_index(&split))
        } else {
            match self.permuted_index.get(i) {
                Some(&p) => arg.at(p),
                None => Ok(f64::NAN),
            }
        }
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg.as_ref())
    }
}

impl TensorOp for PermuteAxis {
    fn set_argument(&mut self, arg: TensorRef, args: &OpArgs) -> Result<(), TensorError> {
        self.hypercube = arg.hypercube().clone();
        self.index = arg.index().clone();
        self.permuted_index.clear();
        self.axis = 0;
        // vectors have only one axis to permute, so the name is ignored
        if self.hypercube.rank() != 1 {
            self.axis = self
                .hypercube
                .xvectors
                .iter()
                .position(|xv| xv.name == args.dimension)
                .ok_or_else(|| TensorError::UnknownAxis {
                    name: args.dimension.clone(),
                })?;
        }
        self.permutation = (0..self.hypercube.xvectors[self.axis].len()).collect();
        self.arg = Some(arg);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Spread operators
// ---------------------------------------------------------------------------

fn check_spread_size(spread: &Hypercube, arg_hc: &Hypercube) -> Result<(), TensorError> {
    let log_num_elements = spread.log_num_elements() + arg_hc.log_num_elements();
    if log_num_elements > 64.0 * LN_2 {
        return Err(TensorError::TooLarge { log_num_elements });
    }
    Ok(())
}

/// Replicate the argument over extra axes prepended before its own; the
/// spread axes vary fastest.
pub struct SpreadFirst {
    arg: Option<TensorRef>,
    hypercube: Hypercube,
    index: Index,
    num_spread_elements: usize,
}

impl Default for SpreadFirst {
    fn default() -> Self {
        Self::new()
    }
}

impl SpreadFirst {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arg: None,
            hypercube: Hypercube::default(),
            index: Index::new(),
            num_spread_elements: 1,
        }
    }

    /// Prepend `spread`'s axes. A non-empty `spread_index` restricts the
    /// replication to those spread-axis cells.
    pub fn set_spread_dimensions(
        &mut self,
        spread: &Hypercube,
        spread_index: Option<&Index>,
    ) -> Result<(), TensorError> {
        let Some(arg) = self.arg.clone() else {
            return Ok(());
        };
        check_spread_size(spread, arg.hypercube())?;
        self.hypercube = spread.clone();
        self.hypercube
            .xvectors
            .extend(arg.hypercube().xvectors.iter().cloned());
        self.num_spread_elements = spread.num_elements();
        if spread.rank() > 0 {
            self.index.clear();
        }

        let arg_index = arg.index();
        if arg_index.is_empty() {
            return Ok(());
        }
        if self.num_spread_elements == 1 && spread_index.is_none() {
            self.index = arg_index.clone();
            return Ok(());
        }
        let mut index = BTreeSet::new();
        for i in arg_index.iter() {
            match spread_index {
                Some(restricted) if !restricted.is_empty() => {
                    for j in restricted.iter() {
                        check_cancel()?;
                        index.insert(j + i * self.num_spread_elements);
                    }
                }
                _ => {
                    for j in 0..self.num_spread_elements {
                        check_cancel()?;
                        index.insert(j + i * self.num_spread_elements);
                    }
                }
            }
        }
        self.index = Index::from(index);
        Ok(())
    }
}

impl Tensor for SpreadFirst {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let Some(arg) = &self.arg else {
            return Ok(f64::NAN);
        };
        let h = self.index.get(i);
        arg.at_hc(h / self.num_spread_elements)
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg.as_ref())
    }
}

impl TensorOp for SpreadFirst {
    fn set_argument(&mut self, arg: TensorRef, _args: &OpArgs) -> Result<(), TensorError> {
        self.hypercube = arg.hypercube().clone();
        self.index = arg.index().clone();
        self.num_spread_elements = 1;
        self.arg = Some(arg);
        Ok(())
    }
}

/// Replicate the argument over extra axes appended after its own; the
/// argument's axes vary fastest.
pub struct SpreadLast {
    arg: Option<TensorRef>,
    hypercube: Hypercube,
    index: Index,
    num_spread_elements: usize,
}

impl Default for SpreadLast {
    fn default() -> Self {
        Self::new()
    }
}

impl SpreadLast {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arg: None,
            hypercube: Hypercube::default(),
            index: Index::new(),
            num_spread_elements: 1,
        }
    }

    /// Append `spread`'s axes. A non-empty `spread_index` restricts the
    /// replication to those spread-axis cells.
    pub fn set_spread_dimensions(
        &mut self,
        spread: &Hypercube,
        spread_index: Option<&Index>,
    ) -> Result<(), TensorError> {
        let Some(arg) = self.arg.clone() else {
            return Ok(());
        };
        check_spread_size(spread, arg.hypercube())?;
        self.hypercube = arg.hypercube().clone();
        self.hypercube
            .xvectors
            .extend(spread.xvectors.iter().cloned());
        self.num_spread_elements = arg.hypercube().num_elements();
        if spread.rank() > 0 {
            self.index.clear();
        }

        let arg_index = arg.index();
        if arg_index.is_empty() {
            return Ok(());
        }
        let num_to_spread = spread.num_elements();
        if num_to_spread == 1 && spread_index.is_none() {
            self.index = arg_index.clone();
            return Ok(());
        }
        let mut index = BTreeSet::new();
        match spread_index {
            Some(restricted) if !restricted.is_empty() => {
                for i in restricted.iter() {
                    for j in arg_index.iter() {
                        check_cancel()?;
                        index.insert(j + i * self.num_spread_elements);
                    }
                }
            }
            _ => {
                for i in 0..num_to_spread {
                    for j in arg_index.iter() {
                        check_cancel()?;
                        index.insert(j + i * self.num_spread_elements);
                    }
                }
            }
        }
        self.index = Index::from(index);
        Ok(())
    }
}

impl Tensor for SpreadLast {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let Some(arg) = &self.arg else {
            return Ok(f64::NAN);
        };
        let h = self.index.get(i);
        arg.at_hc(h % self.num_spread_elements)
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg.as_ref())
    }
}

impl TensorOp for SpreadLast {
    fn set_argument(&mut self, arg: TensorRef, _args: &OpArgs) -> Result<(), TensorError> {
        self.hypercube = arg.hypercube().clone();
        self.index = arg.index().clone();
        self.num_spread_elements = arg.hypercube().num_elements();
        self.arg = Some(arg);
        Ok(())
    }
}

/// Spread a tensor onto a target hypercube with the same axes but possibly
/// more coordinate labels per axis. Target coordinates with no pre-image
/// in the argument read as NaN.
pub struct SpreadOverHC {
    arg: Option<TensorRef>,
    hypercube: Hypercube,
    index: Index,
    permutations: Vec<Vec<usize>>,
}

impl SpreadOverHC {
    /// Position in the permutation tables marking a target coordinate with
    /// no source counterpart.
    const NO_SOURCE: usize = usize::MAX;

    #[must_use]
    pub fn new(target: Hypercube) -> Self {
        Self {
            arg: None,
            hypercube: target,
            index: Index::new(),
            permutations: Vec::new(),
        }
    }
}

impl Tensor for SpreadOverHC {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let Some(arg) = &self.arg else {
            return Ok(f64::NAN);
        };
        let h = self.index.get(i);
        let mut split = self.hypercube.split_index(h);
        for (axis, coord) in split.iter_mut().enumerate() {
            check_cancel()?;
            let source = self.permutations[axis][*coord];
            if source >= arg.hypercube().xvectors[axis].len() {
                return Ok(f64::NAN);
            }
            *coord = source;
        }
        arg.at_hc(arg.hypercube().lineal_index(&split))
    }

    fn timestamp(&self) -> Timestamp {
        arg_timestamp(self.arg.as_ref())
    }
}

impl TensorOp for SpreadOverHC {
    fn set_argument(&mut self, arg: TensorRef, _args: &OpArgs) -> Result<(), TensorError> {
        if arg.rank() != self.hypercube.rank() {
            return Err(shape_error(&self.hypercube, arg.hypercube()));
        }
        for (target, source) in self.hypercube.xvectors.iter().zip(&arg.hypercube().xvectors) {
            if target.name != source.name || target.dimension.kind != source.dimension.kind {
                return Err(shape_error(&self.hypercube, arg.hypercube()));
            }
        }

        self.permutations.clear();
        for (target, source) in self.hypercube.xvectors.iter().zip(&arg.hypercube().xvectors) {
            let mut source_positions: BTreeMap<&Value, usize> = BTreeMap::new();
            for (j, v) in source.iter().enumerate() {
                check_cancel()?;
                source_positions.insert(v, j);
            }
            let mut table = Vec::with_capacity(target.len());
            for v in target.iter() {
                check_cancel()?;
                table.push(
                    source_positions
                        .get(v)
                        .copied()
                        .unwrap_or(Self::NO_SOURCE),
                );
            }
            self.permutations.push(table);
        }
        self.arg = Some(arg);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Meld & Merge
// ---------------------------------------------------------------------------

/// Overlay conformal tensors: each cell takes the first finite argument
/// value, NaN when none has one.
pub struct Meld {
    args: Vec<TensorRef>,
    hypercube: Hypercube,
    index: Index,
}

impl Default for Meld {
    fn default() -> Self {
        Self::new()
    }
}

impl Meld {
    #[must_use]
    pub fn new() -> Self {
        Self {
            args: Vec::new(),
            hypercube: Hypercube::default(),
            index: Index::new(),
        }
    }
}

impl Tensor for Meld {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        let h = self.index.get(i);
        for arg in &self.args {
            check_cancel()?;
            let v = arg.at_hc(h)?;
            if v.is_finite() {
                return Ok(v);
            }
        }
        Ok(f64::NAN)
    }

    fn timestamp(&self) -> Timestamp {
        max_timestamp(&self.args)
    }
}

impl TensorOp for Meld {
    fn set_argument_list(
        &mut self,
        args: Vec<TensorRef>,
        _op_args: &OpArgs,
    ) -> Result<(), TensorError> {
        let Some(first) = args.first() else {
            return Ok(());
        };
        self.hypercube = first.hypercube().clone();
        debug_assert!(args.iter().all(|t| *t.hypercube() == self.hypercube));

        self.index.clear();
        if args.iter().all(|t| !t.index().is_empty()) {
            let mut union = BTreeSet::new();
            for arg in &args {
                for h in arg.index().iter() {
                    check_cancel()?;
                    union.insert(h);
                }
            }
            self.index = Index::from(union);
        }
        self.args = args;
        Ok(())
    }
}

/// Stack conformal tensors along a fresh axis whose labels are "0","1",….
pub struct Merge {
    args: Vec<TensorRef>,
    hypercube: Hypercube,
    index: Index,
}

impl Default for Merge {
    fn default() -> Self {
        Self::new()
    }
}

impl Merge {
    #[must_use]
    pub fn new() -> Self {
        Self {
            args: Vec::new(),
            hypercube: Hypercube::default(),
            index: Index::new(),
        }
    }

    fn slice_size(&self) -> usize {
        self.args
            .first()
            .map_or(1, |t| t.hypercube().num_elements())
    }
}

impl Tensor for Merge {
    fn hypercube(&self) -> &Hypercube {
        &self.hypercube
    }

    fn index(&self) -> &Index {
        &self.index
    }

    fn at(&self, i: usize) -> Result<f64, TensorError> {
        if self.args.is_empty() {
            return Ok(f64::NAN);
        }
        let m = self.index.get(i);
        let slice_size = self.slice_size();
        let slot = m / slice_size;
        match self.args.get(slot) {
            Some(arg) => arg.at_hc(m % slice_size),
            None => Ok(f64::NAN),
        }
    }

    fn timestamp(&self) -> Timestamp {
        max_timestamp(&self.args)
    }
}

impl TensorOp for Merge {
    fn set_argument_list(
        &mut self,
        args: Vec<TensorRef>,
        op_args: &OpArgs,
    ) -> Result<(), TensorError> {
        let Some(first) = args.first() else {
            return Ok(());
        };
        debug_assert!(args.iter().all(|t| t.hypercube() == first.hypercube()));

        let mut hc = first.hypercube().clone();
        let mut xv = XVector::new(op_args.dimension.clone());
        for i in 0..args.len() {
            xv.push_label(&i.to_string())?;
        }
        hc.xvectors.push(xv);
        self.hypercube = hc;
        self.index.clear();

        // only index when the merged volume is addressable and the entries
        // stay below half of it
        if self.hypercube.log_num_elements() < f64::from(usize::BITS) * LN_2 {
            let total: usize = args.iter().map(|t| t.size()).sum();
            let slice_size = first.hypercube().num_elements();
            if total < self.hypercube.num_elements() / 2 {
                let mut index = BTreeSet::new();
                for (slot, arg) in args.iter().enumerate() {
                    if arg.index().is_empty() {
                        for h in 0..arg.size() {
                            check_cancel()?;
                            index.insert(slot * slice_size + h);
                        }
                    } else {
                        for h in arg.index().iter() {
                            check_cancel()?;
                            index.insert(slot * slice_size + h);
                        }
                    }
                }
                self.index = Index::from(index);
            }
        }
        self.args = args;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use civita_core::{Dimension, DimensionType, Hypercube, Index, Value, XVector};
    use civita_tensor::{Tensor, TensorError, TensorRef, TensorVal};

    use super::{
        BinOp, Meld, OpArgs, PermuteAxis, Pivot, ReduceAllOp, ReduceArguments, ReductionOp, Scan,
        Slice, SpreadFirst, TensorOp,
    };

    fn iota(dims: &[usize]) -> TensorRef {
        let tv = TensorVal::from_dims(dims).expect("allocate test tensor");
        for i in 0..tv.size() {
            tv.set(i, i as f64);
        }
        Arc::new(tv)
    }

    fn sum_fn() -> impl Fn(&mut f64, f64, usize) + Send + Sync + 'static {
        |acc: &mut f64, x: f64, _: usize| *acc += x
    }

    #[test]
    fn binop_propagates_left_argument() {
        let a = iota(&[4]);
        let b = Arc::new(TensorVal::scalar(100.0)) as TensorRef;
        let mut op = BinOp::new(|x, _| x);
        op.set_arguments(a.clone(), b, &OpArgs::default()).unwrap();
        assert_eq!(op.shape(), vec![4]);
        for i in 0..op.size() {
            assert_eq!(op.at(i).unwrap(), a.at(i).unwrap());
        }
    }

    #[test]
    fn binop_rejects_nonconformal_arguments() {
        let mut op = BinOp::new(|x, y| x + y);
        let err = op
            .set_arguments(iota(&[3]), iota(&[4]), &OpArgs::default())
            .expect_err("dims differ");
        assert!(matches!(err, TensorError::Shape { .. }));
    }

    #[test]
    fn binop_scalar_broadcasts() {
        let mut op = BinOp::new(|x, y| x * y);
        op.set_arguments(
            Arc::new(TensorVal::scalar(2.0)),
            iota(&[3]),
            &OpArgs::default(),
        )
        .unwrap();
        assert_eq!(op.shape(), vec![3]);
        assert_eq!(op.data().unwrap(), vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn binop_intersection_never_collapses_to_dense() {
        let mut a = TensorVal::from_dims(&[10]).unwrap();
        a.set_index(Index::from_sorted(vec![1, 2, 3])).unwrap();
        let mut b = TensorVal::from_dims(&[10]).unwrap();
        b.set_index(Index::from_sorted(vec![5])).unwrap();

        let mut op = BinOp::new(|x, y| x + y);
        op.set_arguments(Arc::new(a), Arc::new(b), &OpArgs::default())
            .unwrap();
        // a true intersection would be empty, which reads as dense; the
        // last survivor is kept instead
        assert_eq!(op.index().positions(), &[3]);
        assert_eq!(op.size(), 1);
        assert!(op.at(0).unwrap().is_nan());
    }

    #[test]
    fn binop_overlapping_sparse_indices_intersect() {
        let mut a = TensorVal::from_dims(&[10]).unwrap();
        a.set_index(Index::from_sorted(vec![1, 4, 7])).unwrap();
        for i in 0..a.size() {
            a.set(i, 10.0 * i as f64);
        }
        let mut b = TensorVal::from_dims(&[10]).unwrap();
        b.set_index(Index::from_sorted(vec![4, 7, 9])).unwrap();
        for i in 0..b.size() {
            b.set(i, 1.0);
        }

        let mut op = BinOp::new(|x, y| x + y);
        op.set_arguments(Arc::new(a), Arc::new(b), &OpArgs::default())
            .unwrap();
        assert_eq!(op.index().positions(), &[4, 7]);
        assert_eq!(op.at(0).unwrap(), 11.0);
        assert_eq!(op.at(1).unwrap(), 21.0);
    }

    #[test]
    fn reduce_arguments_adds_pointwise_with_nan_skip() {
        let x = iota(&[4]);
        let y = TensorVal::from_dims(&[4]).unwrap();
        y.set(0, 1.0);
        y.set(1, f64::NAN);
        y.set(2, 3.0);
        y.set(3, 4.0);

        let mut op = ReduceArguments::new(|acc, v| *acc += v, 0.0);
        op.set_argument_list(vec![x, Arc::new(y)], &OpArgs::default())
            .unwrap();
        assert_eq!(op.data().unwrap(), vec![1.0, 1.0, 5.0, 7.0]);
    }

    #[test]
    fn reduce_arguments_rejects_mismatched_shapes() {
        let mut op = ReduceArguments::new(|acc, v| *acc += v, 0.0);
        let err = op
            .set_argument_list(vec![iota(&[3]), iota(&[2, 2])], &OpArgs::default())
            .expect_err("shapes differ");
        assert!(matches!(err, TensorError::Shape { .. }));
    }

    #[test]
    fn reduce_all_sums_everything() {
        let mut op = ReduceAllOp::new(sum_fn(), 0.0);
        op.set_argument(iota(&[5]), &OpArgs::default()).unwrap();
        assert_eq!(op.rank(), 0);
        assert_eq!(op.at(0).unwrap(), 10.0);
    }

    #[test]
    fn reduction_over_missing_axis_is_reduce_all() {
        let mut op = ReductionOp::new(sum_fn(), 0.0);
        op.set_argument(iota(&[2, 3]), &OpArgs::dimension("no such axis"))
            .unwrap();
        assert_eq!(op.rank(), 0);
        assert_eq!(op.at(0).unwrap(), 15.0);
    }

    #[test]
    fn reduction_dense_sums_along_axis() {
        // 2x3 iota: columns are (0,1), (2,3), (4,5)
        let mut op = ReductionOp::new(sum_fn(), 0.0);
        op.set_argument(iota(&[2, 3]), &OpArgs::dimension("0"))
            .unwrap();
        assert_eq!(op.shape(), vec![3]);
        assert_eq!(op.data().unwrap(), vec![1.0, 5.0, 9.0]);

        let mut op = ReductionOp::new(sum_fn(), 0.0);
        op.set_argument(iota(&[2, 3]), &OpArgs::dimension("1"))
            .unwrap();
        assert_eq!(op.shape(), vec![2]);
        assert_eq!(op.data().unwrap(), vec![6.0, 9.0]);
    }

    #[test]
    fn reduction_sparse_folds_recorded_entries() {
        let mut tv = TensorVal::from_dims(&[5, 5]).unwrap();
        tv.set_index(Index::from_sorted(vec![2, 4, 5, 8, 10, 11, 15, 20]))
            .unwrap();
        for i in 0..tv.size() {
            let h = tv.index().get(i);
            tv.set(i, h as f64);
        }

        let mut op = ReductionOp::new(sum_fn(), 0.0);
        op.set_argument(Arc::new(tv), &OpArgs::dimension("0"))
            .unwrap();
        assert_eq!(op.index().positions(), &[0, 1, 2, 3, 4]);
        assert_eq!(op.data().unwrap(), vec![6.0, 13.0, 21.0, 15.0, 20.0]);
    }

    #[test]
    fn scan_windowed_folds_sliding_windows() {
        let mut op = Scan::new(sum_fn());
        op.set_argument(iota(&[5]), &OpArgs::dimension("0").with_val(2.0))
            .unwrap();
        assert_eq!(op.data().unwrap(), vec![0.0, 1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn scan_skips_nan_inputs() {
        let tv = TensorVal::from_dims(&[4]).unwrap();
        tv.set(0, 1.0);
        tv.set(1, f64::NAN);
        tv.set(2, 2.0);
        tv.set(3, f64::NAN);
        let mut op = Scan::new(sum_fn());
        op.set_argument(Arc::new(tv), &OpArgs::dimension("0"))
            .unwrap();
        assert_eq!(op.data().unwrap(), vec![1.0, 1.0, 3.0, 3.0]);
    }

    #[test]
    fn slice_without_matching_axis_degenerates_to_an_offset_read() {
        let mut op = Slice::new();
        op.set_argument(iota(&[4]), &OpArgs::dimension("nope").with_val(1.0))
            .unwrap();
        // no axis is dropped; reads shift by the slice coordinate
        assert_eq!(op.shape(), vec![4]);
        assert_eq!(op.at(0).unwrap(), 1.0);
        assert_eq!(op.at(2).unwrap(), 3.0);
        assert!(op.at(3).unwrap().is_nan());
    }

    #[test]
    fn slice_sparse_projects_matching_entries() {
        let mut tv = TensorVal::from_dims(&[3, 4]).unwrap();
        // positions (0,1) (2,1) (1,2)
        tv.set_index(Index::from_sorted(vec![3, 5, 7])).unwrap();
        tv.set(0, 30.0);
        tv.set(1, 50.0);
        tv.set(2, 70.0);

        let mut op = Slice::new();
        op.set_argument(Arc::new(tv), &OpArgs::dimension("1").with_val(1.0))
            .unwrap();
        assert_eq!(op.shape(), vec![3]);
        assert_eq!(op.index().positions(), &[0, 2]);
        assert_eq!(op.at(0).unwrap(), 30.0);
        assert_eq!(op.at(1).unwrap(), 50.0);
    }

    #[test]
    fn pivot_unknown_axis_fails() {
        let mut op = Pivot::new();
        op.set_argument(iota(&[2, 2]), &OpArgs::default()).unwrap();
        let err = op
            .set_orientation(&["ghost".to_string()])
            .expect_err("axis missing");
        assert!(matches!(err, TensorError::UnknownAxis { .. }));
    }

    #[test]
    fn permute_axis_on_vector_ignores_name() {
        let mut op = PermuteAxis::new();
        op.set_argument(iota(&[4]), &OpArgs::dimension("whatever"))
            .unwrap();
        op.set_permutation(vec![3, 0]).unwrap();
        assert_eq!(op.shape(), vec![2]);
        assert_eq!(op.data().unwrap(), vec![3.0, 0.0]);
    }

    #[test]
    fn spread_first_too_large_is_rejected() {
        let mut op = SpreadFirst::new();
        op.set_argument(iota(&[4]), &OpArgs::default()).unwrap();
        let wide = XVector::from_values(
            "wide",
            Dimension::new(DimensionType::Num, ""),
            (0..65_536).map(|i| Value::Num(f64::from(i))).collect(),
        );
        let spread = Hypercube::new(vec![
            wide.clone(),
            {
                let mut xv = wide.clone();
                xv.name = "w2".to_string();
                xv
            },
            {
                let mut xv = wide.clone();
                xv.name = "w3".to_string();
                xv
            },
            {
                let mut xv = wide;
                xv.name = "w4".to_string();
                xv
            },
        ]);
        let err = op
            .set_spread_dimensions(&spread, None)
            .expect_err("2^66 cells cannot be addressed");
        assert!(matches!(err, TensorError::TooLarge { .. }));
    }

    #[test]
    fn meld_prefers_first_finite_value() {
        let x = TensorVal::from_dims(&[3]).unwrap();
        x.set(0, f64::NAN);
        x.set(1, 1.0);
        x.set(2, f64::NAN);
        let y = TensorVal::from_dims(&[3]).unwrap();
        y.set(0, 2.0);
        y.set(1, 2.0);
        y.set(2, f64::NAN);

        let mut op = Meld::new();
        op.set_argument_list(vec![Arc::new(x), Arc::new(y)], &OpArgs::default())
            .unwrap();
        assert_eq!(op.at(0).unwrap(), 2.0);
        assert_eq!(op.at(1).unwrap(), 1.0);
        assert!(op.at(2).unwrap().is_nan());
    }

    #[test]
    fn unsupported_configure_variant_reports_not_implemented() {
        let mut op = Meld::new();
        let err = op
            .set_argument(iota(&[2]), &OpArgs::default())
            .expect_err("Meld takes a list");
        assert!(matches!(err, TensorError::NotImplemented { .. }));
    }

    proptest::proptest! {
        #[test]
        fn prop_dense_reduction_matches_manual_sums(
            dims in proptest::collection::vec(1usize..=4, 2..=3),
            axis_seed in 0usize..8,
        ) {
            let axis = axis_seed % dims.len();
            let arg = iota(&dims);
            let mut op = ReductionOp::new(sum_fn(), 0.0);
            op.set_argument(arg.clone(), &OpArgs::dimension(axis.to_string())).unwrap();

            let mut manual = vec![0.0f64; op.size()];
            for h in 0..arg.size() {
                let mut split = arg.hypercube().split_index(h);
                split.remove(axis);
                manual[op.hypercube().lineal_index(&split)] += arg.at(h).unwrap();
            }
            proptest::prop_assert_eq!(op.data().unwrap(), manual);
        }
    }
}
