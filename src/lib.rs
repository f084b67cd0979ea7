//! moorqc: Automatic QC flag propagation for mooring and profile instrument data
//!
//! This library runs an ordered chain of pluggable quality-control routines over
//! imported instrument datasets and merges their flags into one authoritative flag
//! array per dimension and variable, following the severity ladder of the active
//! QC set. Every merge is recorded in the dataset's audit log and QC results ledger.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    Dataset, DatasetMeta, Dimension, Variable, FieldKind, FieldRef, FlaggedField,
    FlagCode, FlagArray, ProcessingLevel, QcTestResult, QcError, QcResult, Rgba
};

pub use crate::core::{
    FlagSet, FlagSetRegistry, FlagMerger, ChainExecutor, ChainOutcome, ChainResolver,
    ProcessingMode, RoutineRegistry
};
pub use crate::io::{PropertyStore, MemoryPropertyStore, TomlPropertyStore};
