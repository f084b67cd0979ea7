//! Pluggable QC routines and the registry that resolves them by name

use crate::core::flags::FlagSet;
use crate::types::{Dataset, FieldRef, FlagArray};
use ndarray::ArrayViewD;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a routine classifies one field at a time or a whole dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineKind {
    Field,
    Set,
}

impl RoutineKind {
    /// Naming convention: routines ending in `SetQC` operate on the whole dataset
    pub fn from_name(name: &str) -> Self {
        if name.ends_with("SetQC") {
            RoutineKind::Set
        } else {
            RoutineKind::Field
        }
    }
}

/// Candidate flags returned by a per-field routine
#[derive(Debug, Clone)]
pub struct FieldOutcome {
    /// Must have the shape of the data the routine was given
    pub flags: FlagArray,
    /// Parameters used, echoed into the audit log
    pub params_log: Option<String>,
}

impl FieldOutcome {
    pub fn new(flags: FlagArray) -> Self {
        Self { flags, params_log: None }
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params_log = Some(params.into());
        self
    }
}

/// Candidate flags returned by a Set routine
#[derive(Debug, Clone)]
pub struct SetOutcome {
    /// Copy of the input dataset whose flag arrays hold the candidate flags
    pub dataset: Dataset,
    pub params_log: Option<String>,
}

impl SetOutcome {
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset, params_log: None }
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params_log = Some(params.into());
        self
    }
}

/// Routine classifying one dimension or variable at a time.
///
/// Returning `Ok(None)` means the routine does not apply to this field.
pub trait FieldRoutine: Send + Sync {
    fn run(
        &self,
        dataset: &Dataset,
        field: FieldRef,
        data: ArrayViewD<'_, f64>,
        auto: bool,
        flag_set: &FlagSet,
    ) -> anyhow::Result<Option<FieldOutcome>>;
}

impl<F> FieldRoutine for F
where
    F: Fn(&Dataset, FieldRef, ArrayViewD<'_, f64>, bool, &FlagSet) -> anyhow::Result<Option<FieldOutcome>>
        + Send
        + Sync,
{
    fn run(
        &self,
        dataset: &Dataset,
        field: FieldRef,
        data: ArrayViewD<'_, f64>,
        auto: bool,
        flag_set: &FlagSet,
    ) -> anyhow::Result<Option<FieldOutcome>> {
        self(dataset, field, data, auto, flag_set)
    }
}

/// Routine classifying a whole dataset at once (cross-variable checks).
///
/// Returning `Ok(None)` means the routine does not apply to this dataset.
pub trait SetRoutine: Send + Sync {
    fn run(&self, dataset: &Dataset, auto: bool, flag_set: &FlagSet) -> anyhow::Result<Option<SetOutcome>>;
}

impl<F> SetRoutine for F
where
    F: Fn(&Dataset, bool, &FlagSet) -> anyhow::Result<Option<SetOutcome>> + Send + Sync,
{
    fn run(&self, dataset: &Dataset, auto: bool, flag_set: &FlagSet) -> anyhow::Result<Option<SetOutcome>> {
        self(dataset, auto, flag_set)
    }
}

/// A registered routine, tagged with its capability
#[derive(Clone)]
pub enum Routine {
    Field(Arc<dyn FieldRoutine>),
    Set(Arc<dyn SetRoutine>),
}

impl Routine {
    pub fn kind(&self) -> RoutineKind {
        match self {
            Routine::Field(_) => RoutineKind::Field,
            Routine::Set(_) => RoutineKind::Set,
        }
    }
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Routine::{:?}", self.kind())
    }
}

/// Name to implementation lookup, remembering registration order
#[derive(Debug, Clone, Default)]
pub struct RoutineRegistry {
    order: Vec<String>,
    routines: HashMap<String, Routine>,
}

impl RoutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_field<R: FieldRoutine + 'static>(&mut self, name: impl Into<String>, routine: R) {
        self.insert(name.into(), Routine::Field(Arc::new(routine)));
    }

    pub fn register_set<R: SetRoutine + 'static>(&mut self, name: impl Into<String>, routine: R) {
        self.insert(name.into(), Routine::Set(Arc::new(routine)));
    }

    fn insert(&mut self, name: String, routine: Routine) {
        if routine.kind() != RoutineKind::from_name(&name) {
            log::warn!(
                "Routine {} registered as {:?} routine against the SetQC naming convention",
                name,
                routine.kind()
            );
        }
        if self.routines.insert(name.clone(), routine).is_none() {
            self.order.push(name);
        }
    }

    /// Routine names in registration order
    pub fn list_routines(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn get_routine(&self, name: &str) -> Option<&Routine> {
        self.routines.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routines.contains_key(name)
    }
}
