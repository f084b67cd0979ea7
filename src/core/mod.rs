//! Core QC engine modules

pub mod flags;
pub mod routine;
pub mod merge;
pub mod executor;
pub mod chain;
pub mod report;

// Re-export main types
pub use flags::{FlagSet, FlagSetRegistry, FlagDefinition, FlagDescription, FlagRole, LadderCodes, imos_flag_set, argo_flag_set};
pub use routine::{RoutineRegistry, Routine, RoutineKind, FieldRoutine, SetRoutine, FieldOutcome, SetOutcome};
pub use merge::{FlagMerger, MergeSummary, apply_manual_flags};
pub use executor::{
    ChainExecutor, ChainOutcome, ExecutorState, ProgressSink, NoProgress, CancelFlag,
    ChainEvent, ChannelProgress
};
pub use chain::{ChainResolver, ProcessingMode, QcSettings, parse_chain};
pub use report::{QcReport, QcReportEntry, FieldFlagStatistics, flag_statistics};
