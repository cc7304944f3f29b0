//! The layer model: cases, folds, column assignment, and the generation of
//! the fit-task plan the execution engine submits.
//!
//! A layer owns one or more named (or unnamed) cases; each case owns an
//! optional preprocessing pipeline and one or more estimator instances. The
//! task plan lists every `(case, fold)` transformer fit and every
//! `(case, fold, instance)` estimator fit, with full-data entries first so
//! the first `n_pred`/`n_prep` fitted artifacts are always the ones trained
//! on the whole dataset.

use crate::cache::{FittedEstimator, FittedSteps, PollConfig};
use crate::error::{EstimationError, UnitError};
use crate::index::IndexSet;
use crate::learner::{Estimator, Prediction, Transformer};
use ndarray::ArrayView1;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An optional scoring function applied to each fold's held-out predictions.
/// Failures are swallowed and recorded as a missing score.
pub type Scorer =
    Arc<dyn Fn(ArrayView1<'_, f64>, &Prediction) -> Result<f64, UnitError> + Send + Sync>;

/// Identifies which case and which fold an artifact belongs to.
/// `fold == None` marks a full-data fit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaseTag {
    pub case: Option<String>,
    pub fold: Option<usize>,
}

impl CaseTag {
    pub fn new(case: Option<String>, fold: Option<usize>) -> Self {
        Self { case, fold }
    }
}

impl fmt::Display for CaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.case.as_deref().unwrap_or("default"))?;
        if let Some(fold) = self.fold {
            write!(f, "__{fold}")?;
        }
        Ok(())
    }
}

/// A named group of one optional preprocessing pipeline plus one or more
/// estimator instances. Within a case, the pipeline must be fitted before any
/// estimator sees that fold's data.
pub struct Case {
    pub name: Option<String>,
    pub preprocessing: Vec<(String, Box<dyn Transformer>)>,
    pub estimators: Vec<(String, Box<dyn Estimator>)>,
}

impl Case {
    /// The unnamed (default) case.
    pub fn unnamed(estimators: Vec<(String, Box<dyn Estimator>)>) -> Self {
        Self {
            name: None,
            preprocessing: Vec::new(),
            estimators,
        }
    }

    pub fn named(name: impl Into<String>, estimators: Vec<(String, Box<dyn Estimator>)>) -> Self {
        Self {
            name: Some(name.into()),
            preprocessing: Vec::new(),
            estimators,
        }
    }

    pub fn with_preprocessing(
        mut self,
        steps: Vec<(String, Box<dyn Transformer>)>,
    ) -> Self {
        self.preprocessing = steps;
        self
    }
}

/// One cross-validation partition. Fold fits train on `train` and predict
/// out-of-fold on `test`; the full-data fits the engine adds on top of these
/// use the whole dataset and hold nothing out.
#[derive(Debug, Clone)]
pub struct Fold {
    pub train: IndexSet,
    pub test: IndexSet,
}

impl Fold {
    pub fn new(train: IndexSet, test: IndexSet) -> Self {
        Self { train, test }
    }
}

/// One stage of a stacked ensemble, orchestrated as a unit.
///
/// The mutable `*_fitted` slots start empty and are filled by the execution
/// engine at the end of a fit pass; downstream layers read them.
pub struct Layer {
    pub name: String,
    pub cases: Vec<Case>,
    pub folds: Vec<Fold>,
    /// Predict per-class probabilities instead of point predictions.
    pub proba: bool,
    /// Output width per estimator when `proba` is set.
    pub n_classes: usize,
    pub verbose: u8,
    /// Whether the first dependency-wait timeout is already fatal. When
    /// unset, the first timeout warns and extends once; the second is fatal.
    pub raise_on_exception: bool,
    pub scorer: Option<Scorer>,
    /// Poll interval and timeout for cross-task artifact waits.
    pub poll: PollConfig,

    pub estimators_fitted: Option<Vec<(CaseTag, FittedEstimator)>>,
    pub preprocessing_fitted: Option<Vec<(CaseTag, FittedSteps)>>,
    pub scores_fitted: Option<HashMap<String, (f64, f64)>>,
}

impl Layer {
    pub fn new(name: impl Into<String>, cases: Vec<Case>, folds: Vec<Fold>) -> Self {
        Self {
            name: name.into(),
            cases,
            folds,
            proba: false,
            n_classes: 1,
            verbose: 0,
            raise_on_exception: false,
            scorer: None,
            poll: PollConfig::default(),
            estimators_fitted: None,
            preprocessing_fitted: None,
            scores_fitted: None,
        }
    }

    pub fn with_proba(mut self, n_classes: usize) -> Self {
        self.proba = true;
        self.n_classes = n_classes;
        self
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_raise_on_exception(mut self, raise: bool) -> Self {
        self.raise_on_exception = raise;
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Number of full-data-fitted estimator slots: one per instance.
    pub fn n_pred(&self) -> usize {
        self.cases.iter().map(|c| c.estimators.len()).sum()
    }

    /// Number of full-data-fitted preprocessing slots: one per case that
    /// carries a pipeline.
    pub fn n_prep(&self) -> usize {
        self.cases
            .iter()
            .filter(|c| !c.preprocessing.is_empty())
            .count()
    }

    /// Matrix columns each estimator occupies.
    pub fn column_width(&self) -> usize {
        if self.proba { self.n_classes.max(1) } else { 1 }
    }

    /// The stable column assignment: a bijection between `(case, instance)`
    /// pairs and matrix column offsets, in declaration order. Re-running on
    /// the same layer yields the identical mapping.
    pub fn column_assignments(&self) -> HashMap<(Option<String>, String), usize> {
        let width = self.column_width();
        let mut columns = HashMap::new();
        let mut next = 0;
        for case in &self.cases {
            for (name, _) in &case.estimators {
                columns.insert((case.name.clone(), name.clone()), next);
                next += width;
            }
        }
        columns
    }

    /// Total matrix columns the layer writes.
    pub fn total_columns(&self) -> usize {
        self.n_pred() * self.column_width()
    }

    /// Build the fit-task plan: every transformer and estimator fit the layer
    /// requires, full-data entries first, with columns and dependencies
    /// resolved. Capability mismatches (an estimator without `predict_proba`
    /// in a probability layer) are rejected here, before anything runs.
    pub fn plan(&self) -> Result<TaskPlan, EstimationError> {
        if self.proba {
            for case in &self.cases {
                for (name, unit) in &case.estimators {
                    if !unit.supports_proba() {
                        return Err(EstimationError::MissingProba(name.clone()));
                    }
                }
            }
        }

        let columns = self.column_assignments();

        let mut transformers = Vec::new();
        for case in &self.cases {
            if case.preprocessing.is_empty() {
                continue;
            }
            transformers.push(TransformerEntry {
                tag: CaseTag::new(case.name.clone(), None),
                train: IndexSet::Full,
                steps: clone_steps(&case.preprocessing),
            });
        }
        for (fold_id, fold) in self.folds.iter().enumerate() {
            for case in &self.cases {
                if case.preprocessing.is_empty() {
                    continue;
                }
                transformers.push(TransformerEntry {
                    tag: CaseTag::new(case.name.clone(), Some(fold_id)),
                    train: fold.train.clone(),
                    steps: clone_steps(&case.preprocessing),
                });
            }
        }

        let mut estimators = Vec::new();
        for case in &self.cases {
            let preprocess = !case.preprocessing.is_empty();
            for (name, unit) in &case.estimators {
                estimators.push(EstimatorEntry {
                    tag: CaseTag::new(case.name.clone(), None),
                    name: name.clone(),
                    unit: unit.boxed_clone(),
                    train: IndexSet::Full,
                    test: None,
                    column: columns[&(case.name.clone(), name.clone())],
                    preprocess,
                });
            }
        }
        for (fold_id, fold) in self.folds.iter().enumerate() {
            for case in &self.cases {
                let preprocess = !case.preprocessing.is_empty();
                for (name, unit) in &case.estimators {
                    estimators.push(EstimatorEntry {
                        tag: CaseTag::new(case.name.clone(), Some(fold_id)),
                        name: name.clone(),
                        unit: unit.boxed_clone(),
                        train: fold.train.clone(),
                        test: Some(fold.test.clone()),
                        column: columns[&(case.name.clone(), name.clone())],
                        preprocess,
                    });
                }
            }
        }

        Ok(TaskPlan {
            transformers,
            estimators,
            columns,
            n_pred: self.n_pred(),
            n_prep: self.n_prep(),
            total_columns: self.total_columns(),
        })
    }
}

fn clone_steps(steps: &[(String, Box<dyn Transformer>)]) -> Vec<(String, Box<dyn Transformer>)> {
    steps
        .iter()
        .map(|(name, step)| (name.clone(), step.boxed_clone()))
        .collect()
}

/// One transformer fit: the case's pipeline on one fold (or the full data).
pub struct TransformerEntry {
    pub tag: CaseTag,
    pub train: IndexSet,
    pub steps: Vec<(String, Box<dyn Transformer>)>,
}

/// One estimator fit: an instance on one fold (or the full data), with its
/// assigned output column and its dependency on the case's preprocessing.
pub struct EstimatorEntry {
    pub tag: CaseTag,
    /// Base instance name, without the fold tag.
    pub name: String,
    pub unit: Box<dyn Estimator>,
    pub train: IndexSet,
    pub test: Option<IndexSet>,
    pub column: usize,
    pub preprocess: bool,
}

impl EstimatorEntry {
    /// The fold-tagged instance label stored with the fitted artifact.
    pub fn instance_label(&self) -> String {
        match self.tag.fold {
            Some(fold) => format!("{}__{}", self.name, fold),
            None => self.name.clone(),
        }
    }
}

/// The ordered fit-task streams for one layer, plus the column map.
pub struct TaskPlan {
    pub transformers: Vec<TransformerEntry>,
    pub estimators: Vec<EstimatorEntry>,
    pub columns: HashMap<(Option<String>, String), usize>,
    pub n_pred: usize,
    pub n_prep: usize,
    pub total_columns: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnitError;
    use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

    #[derive(Clone)]
    struct Stub;

    impl Estimator for Stub {
        fn fit(&mut self, _x: ArrayView2<'_, f64>, _y: ArrayView1<'_, f64>) -> Result<(), UnitError> {
            Ok(())
        }

        fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, UnitError> {
            Ok(Array1::zeros(x.nrows()))
        }

        fn boxed_clone(&self) -> Box<dyn Estimator> {
            Box::new(self.clone())
        }
    }

    #[derive(Clone)]
    struct StubTransform;

    impl Transformer for StubTransform {
        fn fit(&mut self, _x: ArrayView2<'_, f64>, _y: ArrayView1<'_, f64>) -> Result<(), UnitError> {
            Ok(())
        }

        fn transform(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, UnitError> {
            Ok(x.to_owned())
        }

        fn boxed_clone(&self) -> Box<dyn Transformer> {
            Box::new(self.clone())
        }
    }

    fn two_case_layer() -> Layer {
        let case_a = Case::named(
            "scaled",
            vec![
                ("svc".to_string(), Box::new(Stub) as Box<dyn Estimator>),
                ("ridge".to_string(), Box::new(Stub) as Box<dyn Estimator>),
            ],
        )
        .with_preprocessing(vec![(
            "center".to_string(),
            Box::new(StubTransform) as Box<dyn Transformer>,
        )]);
        let case_b = Case::unnamed(vec![(
            "tree".to_string(),
            Box::new(Stub) as Box<dyn Estimator>,
        )]);
        Layer::new(
            "layer-1",
            vec![case_a, case_b],
            vec![
                Fold::new(IndexSet::Range(5, 10), IndexSet::Range(0, 5)),
                Fold::new(IndexSet::Range(0, 5), IndexSet::Range(5, 10)),
            ],
        )
    }

    #[test]
    fn column_assignment_is_a_stable_bijection() {
        let layer = two_case_layer();
        let first = layer.column_assignments();
        let second = layer.column_assignments();
        assert_eq!(first, second);

        let mut seen: Vec<usize> = first.values().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(first.len(), layer.n_pred());
    }

    #[test]
    fn probability_layers_stride_columns_by_class_count() {
        let layer = two_case_layer();
        let n_pred = layer.n_pred();
        // Rebuild with probability output; stubs do not support it, so only
        // the column arithmetic is checked here.
        let layer = Layer {
            proba: true,
            n_classes: 3,
            ..layer
        };
        let mut cols: Vec<usize> = layer.column_assignments().values().copied().collect();
        cols.sort_unstable();
        assert_eq!(cols, vec![0, 3, 6]);
        assert_eq!(layer.total_columns(), n_pred * 3);
    }

    #[test]
    fn plan_puts_full_data_entries_first() {
        let layer = two_case_layer();
        let plan = layer.plan().unwrap();

        assert_eq!(plan.n_pred, 3);
        assert_eq!(plan.n_prep, 1);
        // 3 full fits + 2 folds * 3 instances.
        assert_eq!(plan.estimators.len(), 9);
        // 1 preprocessing case * (1 full + 2 folds).
        assert_eq!(plan.transformers.len(), 3);

        for entry in &plan.estimators[..plan.n_pred] {
            assert_eq!(entry.tag.fold, None);
            assert!(entry.test.is_none());
            assert_eq!(entry.train, IndexSet::Full);
        }
        for entry in &plan.estimators[plan.n_pred..] {
            assert!(entry.tag.fold.is_some());
            assert!(entry.test.is_some());
        }
        assert_eq!(plan.transformers[0].tag.fold, None);
    }

    #[test]
    fn probability_layers_reject_incapable_estimators_at_plan_time() {
        let layer = Layer {
            proba: true,
            n_classes: 2,
            ..two_case_layer()
        };
        match layer.plan() {
            Err(EstimationError::MissingProba(name)) => assert_eq!(name, "svc"),
            Err(other) => panic!("expected MissingProba, got {other}"),
            Ok(_) => panic!("expected MissingProba, got a plan"),
        }
    }

    #[test]
    fn fold_tagged_labels() {
        let entry = EstimatorEntry {
            tag: CaseTag::new(Some("scaled".to_string()), Some(1)),
            name: "svc".to_string(),
            unit: Box::new(Stub),
            train: IndexSet::Full,
            test: None,
            column: 0,
            preprocess: false,
        };
        assert_eq!(entry.instance_label(), "svc__1");
        assert_eq!(entry.tag.to_string(), "scaled__1");
        assert_eq!(CaseTag::new(None, None).to_string(), "default");
    }
}
