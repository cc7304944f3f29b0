//! # strata
//!
//! A parallel estimation engine for one layer of a stacked ensemble.
//!
//! A layer groups trainable units into *cases* — each case one optional
//! preprocessing pipeline plus one or more estimators — and fits every
//! instance across a set of cross-validation folds plus once on the full
//! dataset. The numeric work lives behind the [`learner`] capability traits;
//! this crate is the orchestration around it:
//!
//! - [`layer`] turns the layer specification into an ordered plan of fit
//!   tasks with resolved data slices, output columns and dependencies.
//! - [`engine`] submits those tasks to a pluggable parallel executor, in one
//!   interleaved batch or two phased ones.
//! - [`cache`] is how concurrently scheduled tasks exchange fitted state:
//!   a keyed artifact store with a bounded-wait retrieval protocol for the
//!   transformer-before-estimator dependency.
//! - [`index`] and [`matrix`] cover the fold-index algebra and the shared
//!   prediction matrix that tasks write disjoint regions of.
//! - [`scores`] reduces per-fold scores to a `(mean, std)` per estimator.

pub mod cache;
pub mod engine;
pub mod error;
pub mod index;
pub mod layer;
pub mod learner;
pub mod matrix;
pub mod scores;

pub use crate::cache::{
    Artifact, ArtifactStore, FittedEstimator, FittedSteps, MemoryStore, PollConfig, SystemClock,
    WaitClock, estimator_key, transformer_key, wait_get,
};
pub use crate::engine::{
    EstimationConfig, EstimationEngine, ExecutionMode, Executor, FitSelector, RayonExecutor,
    SerialExecutor, Task,
};
pub use crate::error::{EstimationError, UnitError};
pub use crate::index::{IndexSet, ResolvedIndex, rebase_targets, slice_features, slice_targets};
pub use crate::layer::{Case, CaseTag, EstimatorEntry, Fold, Layer, Scorer, TaskPlan, TransformerEntry};
pub use crate::learner::{
    Estimator, Prediction, TransformSignature, Transformer, fitted_transform, predict_with,
};
pub use crate::matrix::PredictionMatrix;
pub use crate::scores::{build_scores, composite_key};
