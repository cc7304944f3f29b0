use thiserror::Error;

/// The error type trainable units report across the capability boundary.
///
/// Units are opaque to the engine, so their failures arrive as boxed errors
/// and are wrapped into [`EstimationError::Unit`] with the task label attached.
pub type UnitError = Box<dyn std::error::Error + Send + Sync>;

/// A comprehensive error type for every failure the estimation engine can
/// surface. Scorer failures are deliberately absent: they degrade to a
/// missing score and never propagate.
#[derive(Error, Debug)]
pub enum EstimationError {
    /// Predict or transform was requested on a layer that holds no usable
    /// fitted state. The two messages distinguish a layer that was never
    /// fitted from one whose fit produced zero estimators.
    #[error("layer is not fitted: {0}")]
    NotFitted(&'static str),

    /// An artifact was requested from the cache and was not there. This is
    /// the immediate, non-waiting failure; cross-task dependencies go
    /// through the bounded wait instead.
    #[error("artifact '{0}' was not found in the cache")]
    NotFound(String),

    /// The bounded wait on a dependency artifact ran out of patience.
    #[error(
        "artifact '{key}' could not be found after {waited:.1} seconds of waiting. \
         Check that transformers fit quickly enough to be cached before estimators \
         need them; consider reducing the preprocessing cost or extending the wait \
         limit on the layer."
    )]
    ParallelProcessing { key: String, waited: f64 },

    /// A retrieval selector other than 'full' or 'fold' was passed.
    #[error("selector '{0}' is not understood; only 'full' and 'fold' are accepted")]
    InvalidSelector(String),

    /// The layer asks for probability output but an estimator cannot produce
    /// it. Detected when tasks are built, before anything is submitted.
    #[error(
        "estimator '{0}' does not implement predict_proba, but the layer is \
         configured for probability output"
    )]
    MissingProba(String),

    /// A fit, transform or predict call on a trainable unit failed. These are
    /// always fatal: a unit that cannot fit or predict would silently corrupt
    /// the input of the next layer.
    #[error("{label} failed: {source}")]
    Unit {
        label: String,
        #[source]
        source: UnitError,
    },

    /// A prediction block does not fit the region of the shared matrix it was
    /// assigned to.
    #[error(
        "cannot place a {values_rows}x{values_cols} prediction block at column \
         {column} for {target_rows} target row(s) of a {rows}x{cols} matrix"
    )]
    ShapeMismatch {
        values_rows: usize,
        values_cols: usize,
        column: usize,
        target_rows: usize,
        rows: usize,
        cols: usize,
    },

    /// The shared matrix is too small for the layer's column assignments.
    #[error("the prediction matrix has {cols} column(s) but the layer requires {needed}")]
    InsufficientColumns { cols: usize, needed: usize },

    /// The shared matrix covers more rows than the data it is predicted from.
    #[error(
        "the prediction matrix has {matrix_rows} row(s) but the input has only \
         {input_rows}; the matrix cannot cover rows the input does not have"
    )]
    RowMismatch {
        matrix_rows: usize,
        input_rows: usize,
    },

    /// A cache key resolved to an artifact of the wrong role. Keys encode the
    /// role, so this indicates a corrupted store.
    #[error("artifact '{0}' has the wrong role for this task")]
    WrongArtifact(String),
}
