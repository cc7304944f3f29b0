//! Fold index algebra: train/test partitions as ranges over observation rows,
//! and their conversion into array slices.
//!
//! Partitions come in three shapes. `Full` places no restriction (a full-data
//! fit). A single `[start, end)` range can be sliced as a view without
//! copying. An ordered set of disjoint ranges requires an explicit gather,
//! which copies. All resolution supports a row-offset correction ("rebase")
//! for when the array at hand only covers the tail of the full dataset.

use ndarray::{ArrayView1, ArrayView2, Axis, CowArray, Ix1, Ix2, s};

/// A train or test partition over observation rows.
///
/// Invariant: ranges in `Ranges` are non-empty, sorted and pairwise disjoint.
/// They are produced by fold generators upstream and never overlap within one
/// descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSet {
    /// All rows; a full-data fit.
    Full,
    /// One contiguous `[start, end)` range.
    Range(usize, usize),
    /// An ordered set of disjoint `[start, end)` ranges.
    Ranges(Vec<(usize, usize)>),
}

/// An [`IndexSet`] resolved against a concrete row offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedIndex {
    /// Every row of the target array.
    All,
    /// A contiguous `[start, end)` slice, already rebased.
    Slice(usize, usize),
    /// An explicit, sorted row list, already rebased.
    Gather(Vec<usize>),
}

impl IndexSet {
    /// Rebase this partition by `offset` and collapse it to the cheapest
    /// addressing mode. A range set holding exactly one range degrades to a
    /// plain slice so downstream code can keep returning views.
    pub fn resolve(&self, offset: usize) -> ResolvedIndex {
        match self {
            IndexSet::Full => ResolvedIndex::All,
            IndexSet::Range(start, end) => {
                debug_assert!(offset <= *start && start <= end);
                ResolvedIndex::Slice(start - offset, end - offset)
            }
            IndexSet::Ranges(ranges) if ranges.len() == 1 => {
                let (start, end) = ranges[0];
                debug_assert!(offset <= start && start <= end);
                ResolvedIndex::Slice(start - offset, end - offset)
            }
            IndexSet::Ranges(ranges) => {
                let rows = ranges
                    .iter()
                    .flat_map(|&(start, end)| {
                        debug_assert!(offset <= start && start <= end);
                        (start - offset)..(end - offset)
                    })
                    .collect();
                ResolvedIndex::Gather(rows)
            }
        }
    }

    /// Number of rows selected by this partition, or `None` for `Full`.
    pub fn len(&self) -> Option<usize> {
        match self {
            IndexSet::Full => None,
            IndexSet::Range(start, end) => Some(end - start),
            IndexSet::Ranges(ranges) => Some(ranges.iter().map(|&(s0, e0)| e0 - s0).sum()),
        }
    }
}

/// Slice a feature matrix by a partition. Contiguous partitions come back as
/// views; disjoint range sets are gathered into an owned copy.
pub fn slice_features<'a>(
    x: ArrayView2<'a, f64>,
    index: &IndexSet,
    offset: usize,
) -> CowArray<'a, f64, Ix2> {
    match index.resolve(offset) {
        ResolvedIndex::All => CowArray::from(x),
        ResolvedIndex::Slice(start, end) => CowArray::from(x.slice_move(s![start..end, ..])),
        ResolvedIndex::Gather(rows) => CowArray::from(x.select(Axis(0), &rows)),
    }
}

/// Slice a target vector by a partition; same view-or-gather rules as
/// [`slice_features`].
pub fn slice_targets<'a>(
    y: ArrayView1<'a, f64>,
    index: &IndexSet,
    offset: usize,
) -> CowArray<'a, f64, Ix1> {
    match index.resolve(offset) {
        ResolvedIndex::All => CowArray::from(y),
        ResolvedIndex::Slice(start, end) => CowArray::from(y.slice_move(s![start..end])),
        ResolvedIndex::Gather(rows) => CowArray::from(y.select(Axis(0), &rows)),
    }
}

/// Align targets with a feature matrix that covers only the tail of the full
/// dataset.
///
/// This is legal when `X` is a prediction matrix generated for a subset of the
/// original training set. Indexing is strictly monotonic, so discarding the
/// leading `y.len() - n_rows` observations recovers the matching labels. Only
/// the row counts are checked; monotonic alignment is assumed.
pub fn rebase_targets(y: ArrayView1<'_, f64>, n_rows: usize) -> ArrayView1<'_, f64> {
    let extra = y.len().saturating_sub(n_rows);
    y.slice_move(s![extra..])
}
