/*!
 * Automatic QC chain executor
 *
 * Runs an ordered chain of QC routines over every dataset of a batch. Within a
 * dataset routines run strictly in chain order because each merge depends on
 * the flags left by the previous routines; datasets are independent and are
 * processed in parallel when the `parallel` feature is enabled.
 *
 * The executor works on copies of the input datasets and only hands them back
 * once the whole batch completed. A routine failure aborts the batch and a
 * cancellation request (polled between routines) discards it. Either one stops
 * the remaining datasets at their next routine boundary.
 */

use crate::core::flags::FlagSet;
use crate::core::merge::FlagMerger;
use crate::core::routine::{FieldRoutine, Routine, RoutineRegistry, SetRoutine};
use crate::types::*;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Lifecycle of a chain run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Result of a chain run that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// Every dataset of the batch went through the full chain
    Completed(Vec<Dataset>),
    /// Cancellation was requested; nothing from the batch is kept
    Cancelled,
}

impl ChainOutcome {
    pub fn into_datasets(self) -> Option<Vec<Dataset>> {
        match self {
            ChainOutcome::Completed(datasets) => Some(datasets),
            ChainOutcome::Cancelled => None,
        }
    }
}

/// Receives progress updates and answers cancellation polls.
///
/// Called between routine invocations only.
pub trait ProgressSink: Send + Sync {
    fn report(&self, _fraction: f64, _message: &str) {}

    fn cancel_requested(&self) -> bool {
        false
    }

    /// Called with `Running` when a run starts and with its final state at the end
    fn state_changed(&self, _state: ExecutorState) {}
}

/// Sink that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Shared cancellation switch
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl ProgressSink for CancelFlag {
    fn cancel_requested(&self) -> bool {
        self.is_cancelled()
    }
}

/// Message emitted to a presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    Started,
    Progress { fraction: f64, message: String },
    Finished(ExecutorState),
}

/// Forwards progress as [`ChainEvent`]s over a channel
#[derive(Debug)]
pub struct ChannelProgress {
    sender: Mutex<Sender<ChainEvent>>,
    cancel: CancelFlag,
}

impl ChannelProgress {
    pub fn new(sender: Sender<ChainEvent>, cancel: CancelFlag) -> Self {
        Self { sender: Mutex::new(sender), cancel }
    }

    fn send(&self, event: ChainEvent) {
        if let Ok(sender) = self.sender.lock() {
            // receiver gone: nobody is listening any more
            let _ = sender.send(event);
        }
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, fraction: f64, message: &str) {
        self.send(ChainEvent::Progress { fraction, message: message.to_string() });
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn state_changed(&self, state: ExecutorState) {
        match state {
            ExecutorState::Running => self.send(ChainEvent::Started),
            ExecutorState::Idle => {}
            terminal => self.send(ChainEvent::Finished(terminal)),
        }
    }
}

enum Interrupt {
    Cancelled,
    /// Another dataset of the batch failed
    Aborted,
    Failed(QcError),
}

impl From<QcError> for Interrupt {
    fn from(err: QcError) -> Self {
        Interrupt::Failed(err)
    }
}

/// Shared state of one batch while its datasets are processed
struct BatchRun<'r, 'c, 'a> {
    routines: &'r [(&'c str, &'a Routine)],
    progress: &'r dyn ProgressSink,
    done: AtomicUsize,
    total: usize,
    failed: AtomicBool,
}

/// Runs QC chains against batches of datasets
pub struct ChainExecutor<'a> {
    registry: &'a RoutineRegistry,
    flag_set: &'a FlagSet,
    auto: bool,
    state: ExecutorState,
}

impl<'a> ChainExecutor<'a> {
    pub fn new(registry: &'a RoutineRegistry, flag_set: &'a FlagSet) -> Self {
        Self {
            registry,
            flag_set,
            auto: true,
            state: ExecutorState::Idle,
        }
    }

    /// Whether routines run unattended (default) or may ask for input
    pub fn with_auto(mut self, auto: bool) -> Self {
        self.auto = auto;
        self
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Run `chain` over a copy of `batch`.
    ///
    /// Fails with [`QcError::Configuration`] for routine names missing from the
    /// registry and with [`QcError::RoutineExecution`] when any routine fails on
    /// any dataset; in both cases no dataset of the batch is returned.
    pub fn run(
        &mut self,
        chain: &[String],
        batch: &[Dataset],
        progress: &dyn ProgressSink,
    ) -> QcResult<ChainOutcome> {
        self.state = ExecutorState::Running;
        progress.state_changed(self.state);
        log::info!(
            "Running QC chain [{}] over {} dataset(s) with QC set {}",
            chain.join(", "),
            batch.len(),
            self.flag_set.id()
        );

        let result = self.run_batch(chain, batch, progress);
        self.state = match &result {
            Ok(ChainOutcome::Completed(_)) => ExecutorState::Completed,
            Ok(ChainOutcome::Cancelled) => ExecutorState::Cancelled,
            Err(_) => ExecutorState::Failed,
        };
        match &result {
            Ok(ChainOutcome::Completed(_)) => log::info!("QC chain completed"),
            Ok(ChainOutcome::Cancelled) => log::info!("QC chain cancelled, batch discarded"),
            Err(e) => log::warn!("QC chain failed, batch discarded: {}", e),
        }
        progress.state_changed(self.state);
        result
    }

    fn run_batch(
        &self,
        chain: &[String],
        batch: &[Dataset],
        progress: &dyn ProgressSink,
    ) -> QcResult<ChainOutcome> {
        let routines = self.resolve_chain(chain)?;

        if routines.is_empty() {
            log::info!("No QC routine configured, resetting flags to raw");
            let datasets = batch.iter().cloned().map(|ds| self.reset_to_raw(ds)).collect();
            progress.report(1.0, "No QC routine configured");
            return Ok(ChainOutcome::Completed(datasets));
        }

        let batch_run = BatchRun {
            routines: &routines,
            progress,
            done: AtomicUsize::new(0),
            total: batch.len() * routines.len(),
            failed: AtomicBool::new(false),
        };
        let run_one = |dataset: &Dataset| {
            let result = self.run_dataset(dataset.clone(), &batch_run);
            if let Err(Interrupt::Failed(_)) = &result {
                batch_run.failed.store(true, Ordering::SeqCst);
            }
            result
        };

        #[cfg(feature = "parallel")]
        let results: Vec<Result<Dataset, Interrupt>> = batch.par_iter().map(run_one).collect();
        #[cfg(not(feature = "parallel"))]
        let results: Vec<Result<Dataset, Interrupt>> = batch.iter().map(run_one).collect();

        // a failure anywhere wins over cancellation, first failing dataset in batch order
        let mut datasets = Vec::with_capacity(results.len());
        let mut cancelled = false;
        for result in results {
            match result {
                Ok(dataset) => datasets.push(dataset),
                Err(Interrupt::Failed(err)) => return Err(err),
                Err(Interrupt::Cancelled) | Err(Interrupt::Aborted) => cancelled = true,
            }
        }
        if cancelled {
            return Ok(ChainOutcome::Cancelled);
        }
        Ok(ChainOutcome::Completed(datasets))
    }

    fn resolve_chain<'c>(&self, chain: &'c [String]) -> QcResult<Vec<(&'c str, &'a Routine)>> {
        chain
            .iter()
            .map(|name| {
                self.registry
                    .get_routine(name)
                    .map(|routine| (name.as_str(), routine))
                    .ok_or_else(|| QcError::Configuration(format!("unknown QC routine {}", name)))
            })
            .collect()
    }

    /// QC is never incremental: raw flags, no ledger, no log
    fn start_from_raw(&self, dataset: &mut Dataset) {
        dataset.fill_flags(self.flag_set.raw());
        dataset.meta.clear_qc();
    }

    /// Degenerate "no QC" path: everything raw, level 0
    fn reset_to_raw(&self, mut dataset: Dataset) -> Dataset {
        self.start_from_raw(&mut dataset);
        dataset.meta.set_level(ProcessingLevel::Raw);
        dataset
    }

    fn run_dataset(&self, mut dataset: Dataset, batch_run: &BatchRun<'_, '_, 'a>) -> Result<Dataset, Interrupt> {
        self.start_from_raw(&mut dataset);

        for &(name, routine) in batch_run.routines {
            if batch_run.failed.load(Ordering::SeqCst) {
                log::debug!("Batch failed, skipping {} on dataset {}", name, dataset.label());
                return Err(Interrupt::Aborted);
            }
            if batch_run.progress.cancel_requested() {
                log::debug!("Cancellation requested before {} on dataset {}", name, dataset.label());
                return Err(Interrupt::Cancelled);
            }
            log::debug!("Running {} on dataset {}", name, dataset.label());
            match routine {
                Routine::Field(r) => self.run_field_routine(&mut dataset, name, r.as_ref())?,
                Routine::Set(r) => self.run_set_routine(&mut dataset, name, r.as_ref())?,
            }
            let finished = batch_run.done.fetch_add(1, Ordering::SeqCst) + 1;
            batch_run.progress.report(
                finished as f64 / batch_run.total as f64,
                &format!("{} done on dataset {}", name, dataset.label()),
            );
        }

        dataset.meta.set_level(ProcessingLevel::QualityControlled);
        dataset.meta.date_modified = Some(Utc::now());
        Ok(dataset)
    }

    fn run_field_routine(
        &self,
        dataset: &mut Dataset,
        name: &str,
        routine: &dyn FieldRoutine,
    ) -> QcResult<()> {
        let merger = FlagMerger::new(self.flag_set);
        for field in dataset.field_refs() {
            let (field_name, outcome) = {
                let target = dataset.field(field).ok_or_else(|| {
                    QcError::InvalidDataset(format!("{} {} disappeared", field.kind, field.index))
                })?;
                let outcome = routine
                    .run(dataset, field, target.data(), self.auto, self.flag_set)
                    .map_err(|e| QcError::RoutineExecution {
                        routine: name.to_string(),
                        dataset: dataset.label(),
                        field: Some(target.name().to_string()),
                        message: format!("{:#}", e),
                    })?;
                (target.name().to_string(), outcome)
            };
            let Some(outcome) = outcome else {
                log::trace!("{} skipped {}", name, field_name);
                continue;
            };
            merger.apply(
                dataset,
                field,
                name,
                outcome.flags.view(),
                outcome.params_log.as_deref(),
            )?;
        }
        Ok(())
    }

    fn run_set_routine(
        &self,
        dataset: &mut Dataset,
        name: &str,
        routine: &dyn SetRoutine,
    ) -> QcResult<()> {
        let outcome = routine
            .run(dataset, self.auto, self.flag_set)
            .map_err(|e| QcError::RoutineExecution {
                routine: name.to_string(),
                dataset: dataset.label(),
                field: None,
                message: format!("{:#}", e),
            })?;
        let Some(outcome) = outcome else {
            log::trace!("{} skipped dataset {}", name, dataset.label());
            return Ok(());
        };

        let candidate = &outcome.dataset;
        if candidate.dimensions.len() != dataset.dimensions.len()
            || candidate.variables.len() != dataset.variables.len()
        {
            return Err(QcError::RoutineExecution {
                routine: name.to_string(),
                dataset: dataset.label(),
                field: None,
                message: "returned dataset does not have the input's dimensions and variables".to_string(),
            });
        }

        // merged field by field against the flags as they stand
        let merger = FlagMerger::new(self.flag_set);
        for field in dataset.field_refs() {
            let candidate_field = candidate.field(field).ok_or_else(|| QcError::RoutineExecution {
                routine: name.to_string(),
                dataset: dataset.label(),
                field: None,
                message: format!("{} {} missing from returned dataset", field.kind, field.index),
            })?;
            merger.apply(
                dataset,
                field,
                name,
                candidate_field.flags(),
                outcome.params_log.as_deref(),
            )?;
        }
        Ok(())
    }
}
