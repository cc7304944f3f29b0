//! The execution engine: submits a layer's fit/predict/transform tasks to a
//! parallel executor and reassembles the cached artifacts into layer state.
//!
//! Two fit modes exist. In `Dual` mode every transformer task runs as one
//! batch and every estimator task as a second, so all preprocessing is
//! cache-visible before any estimator starts. In `Combined` mode one batch
//! interleaves both and the bounded cache wait is the only race guard —
//! note that with a saturated worker pool a polling estimator task can hold
//! a worker while its transformer queues behind it, which the wait timeout
//! turns into an error rather than a hang.

use crate::cache::{
    Artifact, ArtifactStore, FittedEstimator, FittedSteps, PollConfig, SystemClock, WaitClock,
    estimator_key, transformer_key, wait_get,
};
use crate::error::EstimationError;
use crate::index::{rebase_targets, slice_features, slice_targets};
use crate::layer::{CaseTag, EstimatorEntry, Layer, Scorer, TransformerEntry};
use crate::learner::{fitted_transform, predict_with};
use crate::matrix::PredictionMatrix;
use crate::scores::{build_scores, composite_key};
use log::{debug, info};
use ndarray::{ArrayView1, ArrayView2, CowArray};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// How fit batches are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Transformers first, estimators second; no waiting needed.
    #[default]
    Dual,
    /// One interleaved batch; estimators wait on the cache.
    Combined,
}

/// A zero-argument unit of work. Task closures capture their data slices and
/// shared resources; the executor only runs them.
pub type Task<'scope> = Box<dyn FnOnce() -> Result<(), EstimationError> + Send + 'scope>;

/// The external parallel executor: runs a batch to completion and surfaces
/// the first fatal error. No futures or cancellation are exposed inward.
pub trait Executor: Send + Sync {
    fn run<'scope>(&self, tasks: Vec<Task<'scope>>) -> Result<(), EstimationError>;
}

/// Runs batches on the rayon thread pool. Tasks within one batch complete in
/// any order.
#[derive(Default)]
pub struct RayonExecutor;

impl Executor for RayonExecutor {
    fn run<'scope>(&self, tasks: Vec<Task<'scope>>) -> Result<(), EstimationError> {
        tasks.into_par_iter().try_for_each(|task| task())
    }
}

/// Runs tasks one at a time, in submission order. Deterministic; for tests
/// and debugging.
#[derive(Default)]
pub struct SerialExecutor;

impl Executor for SerialExecutor {
    fn run<'scope>(&self, tasks: Vec<Task<'scope>>) -> Result<(), EstimationError> {
        for task in tasks {
            task()?;
        }
        Ok(())
    }
}

/// Which partition of the fitted artifacts a retrieval addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitSelector {
    /// The first `n_pred`/`n_prep` artifacts, fitted on the full data.
    Full,
    /// The remaining artifacts, fitted per fold.
    Fold,
}

impl FitSelector {
    pub fn parse(selector: &str) -> Result<Self, EstimationError> {
        match selector {
            "full" => Ok(FitSelector::Full),
            "fold" => Ok(FitSelector::Fold),
            other => Err(EstimationError::InvalidSelector(other.to_string())),
        }
    }
}

/// The orchestration-relevant layer attributes, snapshotted once before any
/// task runs. Tasks read this immutable copy, never the layer.
#[derive(Debug, Clone)]
pub struct EstimationConfig {
    pub name: String,
    pub verbose: u8,
    pub raise_on_exception: bool,
    pub proba: bool,
    pub mode: ExecutionMode,
    pub poll: PollConfig,
}

impl EstimationConfig {
    pub fn for_layer(layer: &Layer, mode: ExecutionMode) -> Self {
        Self {
            name: layer.name.clone(),
            verbose: layer.verbose,
            raise_on_exception: layer.raise_on_exception,
            proba: layer.proba,
            mode,
            poll: layer.poll,
        }
    }
}

/// Drives one layer through fit, predict and transform passes.
pub struct EstimationEngine {
    config: EstimationConfig,
    clock: Arc<dyn WaitClock>,
}

impl EstimationEngine {
    pub fn new(config: EstimationConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wait clock; timeout tests inject a fake one.
    pub fn with_clock(mut self, clock: Arc<dyn WaitClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fit the layer: run every transformer and estimator task, then load the
    /// cached artifacts into the layer's fitted state.
    pub fn fit(
        &self,
        layer: &mut Layer,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        matrix: &PredictionMatrix,
        store: &dyn ArtifactStore,
        executor: &dyn Executor,
    ) -> Result<(), EstimationError> {
        let started = Instant::now();
        if self.config.verbose > 0 {
            info!("Fitting {}", self.config.name);
        }

        let plan = layer.plan()?;
        if matrix.cols() < plan.total_columns {
            return Err(EstimationError::InsufficientColumns {
                cols: matrix.cols(),
                needed: plan.total_columns,
            });
        }

        // X may be a prediction matrix covering only the tail of the original
        // training set; align the targets before any fold slicing.
        let y = rebase_targets(y, x.nrows());

        // Assembly manifests, captured before the entries move into closures.
        let transformer_tags: Vec<CaseTag> =
            plan.transformers.iter().map(|e| e.tag.clone()).collect();
        let estimator_tags: Vec<(CaseTag, String)> = plan
            .estimators
            .iter()
            .map(|e| (e.tag.clone(), e.name.clone()))
            .collect();

        let scorer = layer.scorer.clone();
        let poll = self.config.poll;
        let raise = self.config.raise_on_exception;
        let proba = self.config.proba;

        let mut transformer_tasks: Vec<Task<'_>> = Vec::with_capacity(plan.transformers.len());
        for entry in plan.transformers {
            transformer_tasks.push(Box::new(move || run_fit_transform(entry, x, y, store)));
        }

        let mut estimator_tasks: Vec<Task<'_>> = Vec::with_capacity(plan.estimators.len());
        for entry in plan.estimators {
            let scorer = scorer.clone();
            let clock = Arc::clone(&self.clock);
            estimator_tasks.push(Box::new(move || {
                run_fit_estimator(
                    entry,
                    x,
                    y,
                    matrix,
                    store,
                    scorer,
                    proba,
                    poll,
                    raise,
                    clock.as_ref(),
                )
            }));
        }

        match self.config.mode {
            ExecutionMode::Dual => {
                if !transformer_tasks.is_empty() {
                    executor.run(transformer_tasks)?;
                }
                executor.run(estimator_tasks)?;
            }
            ExecutionMode::Combined => {
                // Transformers lead the batch so work-stealing tends to start
                // them early; correctness rests on the cache wait alone.
                let mut tasks = transformer_tasks;
                tasks.extend(estimator_tasks);
                executor.run(tasks)?;
            }
        }

        self.assemble(layer, store, &transformer_tags, &estimator_tags, plan.n_pred)?;

        if self.config.verbose > 0 {
            info!(
                "{} done in {:.2}s",
                self.config.name,
                started.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    /// Predict new data with the full-data estimators, writing every
    /// estimator's whole column(s) of `matrix`.
    pub fn predict<'a>(
        &self,
        layer: &'a Layer,
        x: ArrayView2<'a, f64>,
        matrix: &'a PredictionMatrix,
        executor: &dyn Executor,
    ) -> Result<(), EstimationError> {
        let started = Instant::now();
        if self.config.verbose > 0 {
            info!("Predicting {}", self.config.name);
        }
        if matrix.rows() != x.nrows() {
            return Err(EstimationError::RowMismatch {
                matrix_rows: matrix.rows(),
                input_rows: x.nrows(),
            });
        }

        let tasks = self.prediction_tasks(layer, FitSelector::Full, x, matrix)?;
        executor.run(tasks)?;

        if self.config.verbose > 0 {
            info!(
                "{} done in {:.2}s",
                self.config.name,
                started.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    /// Regenerate out-of-fold predictions for training data with the
    /// fold-fitted estimators from the fit pass.
    pub fn transform<'a>(
        &self,
        layer: &'a Layer,
        x: ArrayView2<'a, f64>,
        matrix: &'a PredictionMatrix,
        executor: &dyn Executor,
    ) -> Result<(), EstimationError> {
        let started = Instant::now();
        if self.config.verbose > 0 {
            info!("Transforming {}", self.config.name);
        }

        let tasks = self.prediction_tasks(layer, FitSelector::Fold, x, matrix)?;
        executor.run(tasks)?;

        if self.config.verbose > 0 {
            info!(
                "{} done in {:.2}s",
                self.config.name,
                started.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    /// The fitted artifacts behind `predict`/`transform`, by selector string
    /// (`"full"` or `"fold"`); anything else is a configuration error.
    pub fn retrieve(
        &self,
        layer: &Layer,
        selector: &str,
    ) -> Result<
        (
            Option<HashMap<CaseTag, FittedSteps>>,
            Vec<(CaseTag, FittedEstimator)>,
        ),
        EstimationError,
    > {
        let (prep, ests) = retrieve_parts(layer, FitSelector::parse(selector)?)?;
        Ok((prep, ests.to_vec()))
    }

    /// Build one predict task per fitted estimator in the selected partition.
    fn prediction_tasks<'scope>(
        &self,
        layer: &'scope Layer,
        selector: FitSelector,
        x: ArrayView2<'scope, f64>,
        matrix: &'scope PredictionMatrix,
    ) -> Result<Vec<Task<'scope>>, EstimationError> {
        let (prep, ests) = retrieve_parts(layer, selector)?;
        let proba = self.config.proba;
        let full_rows = x.nrows();

        let mut tasks: Vec<Task<'scope>> = Vec::with_capacity(ests.len());
        for (tag, fitted) in ests {
            let steps: FittedSteps = prep
                .as_ref()
                .and_then(|map| map.get(tag))
                .cloned()
                .unwrap_or_default();
            let unit = Arc::clone(&fitted.unit);
            let label = format!("estimator '{}' in case '{tag}'", fitted.name);
            let (test, column) = fitted.placement.clone();

            tasks.push(Box::new(move || {
                let mut xt = match &test {
                    Some(test) => slice_features(x, test, 0),
                    None => CowArray::from(x),
                };
                for (step_name, step) in &steps {
                    xt = CowArray::from(step.transform(xt.view()).map_err(|source| {
                        EstimationError::Unit {
                            label: format!("transformer '{step_name}' for {label}"),
                            source,
                        }
                    })?);
                }
                // Prediction failures are fatal: every unit that survived
                // into the fitted state must predict, or the next layer
                // would read a half-written column.
                let p = predict_with(unit.as_ref(), xt.view(), proba)
                    .map_err(|source| EstimationError::Unit { label, source })?;
                match &test {
                    Some(test) => matrix.assign(&p, test, column, full_rows),
                    None => matrix.assign_full(&p, column),
                }
            }));
        }
        Ok(tasks)
    }

    /// Load every artifact the fit pass cached back out of the store and
    /// install it as layer state.
    fn assemble(
        &self,
        layer: &mut Layer,
        store: &dyn ArtifactStore,
        transformer_tags: &[CaseTag],
        estimator_tags: &[(CaseTag, String)],
        n_pred: usize,
    ) -> Result<(), EstimationError> {
        layer.preprocessing_fitted = if transformer_tags.is_empty() {
            None
        } else {
            let mut fitted = Vec::with_capacity(transformer_tags.len());
            for tag in transformer_tags {
                let key = transformer_key(tag);
                match store.get(&key)?.as_ref() {
                    Artifact::Transformer(steps) => fitted.push((tag.clone(), steps.clone())),
                    Artifact::Estimator(_) => return Err(EstimationError::WrongArtifact(key)),
                }
            }
            Some(fitted)
        };

        let mut estimators = Vec::with_capacity(estimator_tags.len());
        let mut scores = Vec::with_capacity(estimator_tags.len());
        for (tag, name) in estimator_tags {
            let key = estimator_key(tag, name);
            match store.get(&key)?.as_ref() {
                Artifact::Estimator(fitted) => {
                    scores.push((composite_key(tag, name), fitted.score));
                    estimators.push((tag.clone(), fitted.clone()));
                }
                Artifact::Transformer(_) => return Err(EstimationError::WrongArtifact(key)),
            }
        }
        debug!(
            "{}: assembled {} estimator(s), {} preprocessing pipeline(s)",
            self.config.name,
            estimators.len(),
            transformer_tags.len()
        );
        layer.estimators_fitted = Some(estimators);
        layer.scores_fitted = layer
            .scorer
            .is_some()
            .then(|| build_scores(&scores, n_pred));
        Ok(())
    }
}

fn check_fitted(layer: &Layer) -> Result<&[(CaseTag, FittedEstimator)], EstimationError> {
    match &layer.estimators_fitted {
        None => Err(EstimationError::NotFitted(
            "the layer has not been fitted yet",
        )),
        Some(fitted) if fitted.is_empty() => Err(EstimationError::NotFitted(
            "no estimators were successfully fitted",
        )),
        Some(fitted) => Ok(fitted),
    }
}

fn retrieve_parts(
    layer: &Layer,
    selector: FitSelector,
) -> Result<
    (
        Option<HashMap<CaseTag, FittedSteps>>,
        &[(CaseTag, FittedEstimator)],
    ),
    EstimationError,
> {
    let fitted = check_fitted(layer)?;
    let n_pred = layer.n_pred().min(fitted.len());
    let estimators = match selector {
        FitSelector::Full => &fitted[..n_pred],
        FitSelector::Fold => &fitted[n_pred..],
    };

    let preprocessing = layer.preprocessing_fitted.as_ref().map(|fitted_prep| {
        // The floor keeps a preprocessing-free layer from producing a
        // misaligned slice when n_prep is zero.
        let n_prep = layer.n_prep().max(1).min(fitted_prep.len());
        let slice = match selector {
            FitSelector::Full => &fitted_prep[..n_prep],
            FitSelector::Fold => &fitted_prep[n_prep..],
        };
        slice
            .iter()
            .map(|(tag, steps)| (tag.clone(), steps.clone()))
            .collect()
    });

    Ok((preprocessing, estimators))
}

/// Fit one case/fold's preprocessing pipeline and cache the fitted steps.
fn run_fit_transform(
    mut entry: TransformerEntry,
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    store: &dyn ArtifactStore,
) -> Result<(), EstimationError> {
    let mut xt = slice_features(x, &entry.train, 0);
    let mut yt = slice_targets(y, &entry.train, 0);

    // A single-step pipeline never needs its own output, so the chain (and
    // its copies) only runs for multi-step pipelines.
    let chain = entry.steps.len() > 1;
    let mut fitted: FittedSteps = Vec::with_capacity(entry.steps.len());
    for (step_name, mut step) in entry.steps.drain(..) {
        step.fit(xt.view(), yt.view())
            .map_err(|source| EstimationError::Unit {
                label: format!("transformer '{step_name}' in case '{}'", entry.tag),
                source,
            })?;
        if chain {
            let (next_x, next_y) = fitted_transform(step.as_ref(), xt.view(), yt.view())
                .map_err(|source| EstimationError::Unit {
                    label: format!("transformer '{step_name}' in case '{}'", entry.tag),
                    source,
                })?;
            xt = CowArray::from(next_x);
            yt = CowArray::from(next_y);
        }
        fitted.push((step_name, Arc::from(step)));
    }

    store.put(
        &transformer_key(&entry.tag),
        Arc::new(Artifact::Transformer(fitted)),
    );
    Ok(())
}

/// Fit one estimator instance; predict and score its held-out partition when
/// it has one; cache the fitted artifact.
#[allow(clippy::too_many_arguments)]
fn run_fit_estimator(
    mut entry: EstimatorEntry,
    x: ArrayView2<'_, f64>,
    y: ArrayView1<'_, f64>,
    matrix: &PredictionMatrix,
    store: &dyn ArtifactStore,
    scorer: Option<Scorer>,
    proba: bool,
    poll: PollConfig,
    raise_on_exception: bool,
    clock: &dyn WaitClock,
) -> Result<(), EstimationError> {
    let full_rows = x.nrows();
    let label = format!("estimator '{}' in case '{}'", entry.name, entry.tag);

    let mut xt = slice_features(x, &entry.train, 0);
    let mut yt = slice_targets(y, &entry.train, 0);

    let steps: FittedSteps = if entry.preprocess {
        let key = transformer_key(&entry.tag);
        match wait_get(store, &key, poll, raise_on_exception, clock)?.as_ref() {
            Artifact::Transformer(steps) => steps.clone(),
            Artifact::Estimator(_) => return Err(EstimationError::WrongArtifact(key)),
        }
    } else {
        Vec::new()
    };

    for (step_name, step) in &steps {
        let (next_x, next_y) = fitted_transform(step.as_ref(), xt.view(), yt.view()).map_err(
            |source| EstimationError::Unit {
                label: format!("transformer '{step_name}' for {label}"),
                source,
            },
        )?;
        xt = CowArray::from(next_x);
        yt = CowArray::from(next_y);
    }

    entry
        .unit
        .fit(xt.view(), yt.view())
        .map_err(|source| EstimationError::Unit {
            label: label.clone(),
            source,
        })?;

    let (placement, score) = if let Some(test) = entry.test.take() {
        let mut xtest = slice_features(x, &test, 0);
        let ytest = slice_targets(y, &test, 0);
        for (step_name, step) in &steps {
            xtest = CowArray::from(step.transform(xtest.view()).map_err(|source| {
                EstimationError::Unit {
                    label: format!("transformer '{step_name}' for {label}"),
                    source,
                }
            })?);
        }

        let p = predict_with(entry.unit.as_ref(), xtest.view(), proba).map_err(|source| {
            EstimationError::Unit {
                label: label.clone(),
                source,
            }
        })?;
        matrix.assign(&p, &test, entry.column, full_rows)?;

        // Scoring is the one exception-safe spot: a scorer failure records a
        // missing score and nothing else.
        let score = scorer
            .as_ref()
            .and_then(|scorer| scorer(ytest.view(), &p).ok());
        ((Some(test), entry.column), score)
    } else {
        ((None, entry.column), None)
    };

    let fitted = FittedEstimator {
        name: entry.instance_label(),
        unit: Arc::from(entry.unit),
        placement,
        score,
    };
    store.put(
        &estimator_key(&entry.tag, &entry.name),
        Arc::new(Artifact::Estimator(fitted)),
    );
    Ok(())
}
