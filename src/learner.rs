//! The capability contract for trainable units.
//!
//! The engine never looks inside a unit; it only needs `fit`, one of
//! `predict`/`predict_proba`, and optionally `transform`. Which of the
//! optional capabilities a unit carries is declared up front — the engine
//! checks capabilities when tasks are built, not per call — and transform
//! steps declare whether they rewrite targets alongside features instead of
//! being probed with trial calls.

use crate::error::UnitError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Which arguments a transform step consumes and produces.
///
/// Declared rather than discovered: a step that resamples or relabels rows
/// must opt into `FeaturesAndTargets` so the training targets stay aligned
/// with its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformSignature {
    /// `transform(X) -> X'`; targets pass through untouched.
    FeaturesOnly,
    /// `transform(X, y) -> (X', y')`; the step rewrites targets too.
    FeaturesAndTargets,
}

/// A preprocessing step: fit on training rows, then applied to any rows.
pub trait Transformer: Send + Sync {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> Result<(), UnitError>;

    /// The declared calling convention for this step during training.
    /// Prediction-time application always uses the features-only form.
    fn signature(&self) -> TransformSignature {
        TransformSignature::FeaturesOnly
    }

    fn transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError>;

    /// The two-argument form; only consulted for steps that declare
    /// [`TransformSignature::FeaturesAndTargets`].
    fn transform_with_targets(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
    ) -> Result<(Array2<f64>, Array1<f64>), UnitError> {
        Ok((self.transform(x)?, y.to_owned()))
    }

    /// A fresh, unfitted copy. Each fold fits its own clone.
    fn boxed_clone(&self) -> Box<dyn Transformer>;
}

/// An estimator: fit on training rows, predicts on held-out or new rows.
pub trait Estimator: Send + Sync {
    fn fit(&mut self, x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> Result<(), UnitError>;

    fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, UnitError>;

    /// Whether this estimator can produce per-class probabilities. Layers
    /// configured for probability output reject estimators that return
    /// `false` before any task runs.
    fn supports_proba(&self) -> bool {
        false
    }

    fn predict_proba(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError> {
        let _ = x;
        Err("predict_proba is not implemented for this estimator".into())
    }

    /// A fresh, unfitted copy. Each fold fits its own clone.
    fn boxed_clone(&self) -> Box<dyn Estimator>;
}

/// A prediction produced by an estimator: one column of values, or one block
/// of per-class probabilities.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Values(Array1<f64>),
    Probabilities(Array2<f64>),
}

impl Prediction {
    /// Number of observation rows in the prediction.
    pub fn nrows(&self) -> usize {
        match self {
            Prediction::Values(v) => v.len(),
            Prediction::Probabilities(p) => p.nrows(),
        }
    }

    /// Number of matrix columns this prediction occupies.
    pub fn width(&self) -> usize {
        match self {
            Prediction::Values(_) => 1,
            Prediction::Probabilities(p) => p.ncols(),
        }
    }
}

/// Predict with the method selected by the layer's probability flag.
pub fn predict_with(
    unit: &dyn Estimator,
    x: ArrayView2<'_, f64>,
    proba: bool,
) -> Result<Prediction, UnitError> {
    if proba {
        Ok(Prediction::Probabilities(unit.predict_proba(x)?))
    } else {
        Ok(Prediction::Values(unit.predict(x)?))
    }
}

/// Apply a fitted transform step during training, dispatching on its declared
/// signature.
pub fn fitted_transform(
    step: &dyn Transformer,
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
) -> Result<(Array2<f64>, Array1<f64>), UnitError> {
    match step.signature() {
        TransformSignature::FeaturesOnly => Ok((step.transform(x)?, y.to_owned())),
        TransformSignature::FeaturesAndTargets => step.transform_with_targets(x, y),
    }
}
