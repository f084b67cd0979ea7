use chrono::{DateTime, Utc};
use ndarray::{Array1, ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Integer flag code as defined by the active QC set
pub type FlagCode = u8;

/// Raw sample values of a dimension or variable
pub type SampleArray = ArrayD<f64>;

/// Flag array congruent with a [`SampleArray`]
pub type FlagArray = ArrayD<FlagCode>;

/// Display colour attached to a flag (8-bit RGBA)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
    }
}

/// Processing level of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingLevel {
    /// Level 0 - raw data, no automatic QC applied
    Raw = 0,
    /// Level 1 - automatic QC chain executed
    QualityControlled = 1,
}

impl ProcessingLevel {
    pub fn file_version(&self) -> &'static str {
        match self {
            ProcessingLevel::Raw => "FV00",
            ProcessingLevel::QualityControlled => "FV01",
        }
    }

    pub fn file_version_description(&self) -> &'static str {
        match self {
            ProcessingLevel::Raw => "Level 0 - Raw Data",
            ProcessingLevel::QualityControlled => "Level 1 - Quality Controlled Data",
        }
    }
}

/// Which kind of field a flag array belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldKind {
    Dimension,
    Variable,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldKind::Dimension => write!(f, "dimension"),
            FieldKind::Variable => write!(f, "variable"),
        }
    }
}

/// Address of a dimension or variable inside a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef {
    pub kind: FieldKind,
    pub index: usize,
}

impl FieldRef {
    pub fn dimension(index: usize) -> Self {
        Self { kind: FieldKind::Dimension, index }
    }

    pub fn variable(index: usize) -> Self {
        Self { kind: FieldKind::Variable, index }
    }
}

/// Shared capability of dimensions and variables: named data with a congruent flag array
pub trait FlaggedField {
    fn name(&self) -> &str;
    fn data(&self) -> ArrayViewD<'_, f64>;
    fn flags(&self) -> ArrayViewD<'_, FlagCode>;
    fn flags_mut(&mut self) -> ArrayViewMutD<'_, FlagCode>;

    /// Overwrite every flag with `code`
    fn fill_flags(&mut self, code: FlagCode) {
        self.flags_mut().fill(code);
    }
}

/// Ordered coordinate axis (TIME, DEPTH, HEIGHT_ABOVE_SENSOR...)
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub name: String,
    pub data: Array1<f64>,
    pub flags: Array1<FlagCode>,
}

impl Dimension {
    /// Create a dimension whose flags all start at `raw_flag`
    pub fn new(name: impl Into<String>, data: Array1<f64>, raw_flag: FlagCode) -> Self {
        let flags = Array1::from_elem(data.len(), raw_flag);
        Self { name: name.into(), data, flags }
    }
}

impl FlaggedField for Dimension {
    fn name(&self) -> &str {
        &self.name
    }

    fn data(&self) -> ArrayViewD<'_, f64> {
        self.data.view().into_dyn()
    }

    fn flags(&self) -> ArrayViewD<'_, FlagCode> {
        self.flags.view().into_dyn()
    }

    fn flags_mut(&mut self) -> ArrayViewMutD<'_, FlagCode> {
        self.flags.view_mut().into_dyn()
    }
}

/// Measured parameter (TEMP, PSAL, UCUR...) over one or more dimensions
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    /// Indices into the owning dataset's dimension list
    pub dimensions: Vec<usize>,
    pub data: SampleArray,
    pub flags: FlagArray,
}

impl Variable {
    /// Create a variable whose flags all start at `raw_flag`
    pub fn new(
        name: impl Into<String>,
        dimensions: Vec<usize>,
        data: SampleArray,
        raw_flag: FlagCode,
    ) -> Self {
        let flags = ArrayD::from_elem(IxDyn(data.shape()), raw_flag);
        Self { name: name.into(), dimensions, data, flags }
    }
}

impl FlaggedField for Variable {
    fn name(&self) -> &str {
        &self.name
    }

    fn data(&self) -> ArrayViewD<'_, f64> {
        self.data.view()
    }

    fn flags(&self) -> ArrayViewD<'_, FlagCode> {
        self.flags.view()
    }

    fn flags_mut(&mut self) -> ArrayViewMutD<'_, FlagCode> {
        self.flags.view_mut()
    }
}

/// Flag applied by a QC test, recorded in the ledger for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedFlag {
    pub code: FlagCode,
    pub description: String,
    pub color: Rgba,
}

/// Outcome of the most recent run of one QC test on one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcTestResult {
    pub failing_sample_count: usize,
    /// Fraction (0-1) of the field's flaggable samples that changed
    pub failing_fraction: f64,
    pub parameters_used: String,
    /// Most severe flag applied, `None` when nothing changed
    pub applied_flag: Option<AppliedFlag>,
}

/// Per-test, per-field QC statistics keyed by (routine name, field name)
pub type QcLedger = BTreeMap<(String, String), QcTestResult>;

/// Dataset-level metadata
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetMeta {
    /// Position of the dataset within its import batch
    pub index: usize,
    /// Human readable identifier (instrument, file name...)
    pub source: String,
    pub level: ProcessingLevel,
    pub file_version: String,
    pub file_version_quality_control: String,
    pub date_modified: Option<DateTime<Utc>>,
    pub qc_results: QcLedger,
    /// QC audit log, append-only within one chain run
    pub log: Vec<String>,
}

impl DatasetMeta {
    pub fn new(index: usize, source: impl Into<String>) -> Self {
        let level = ProcessingLevel::Raw;
        Self {
            index,
            source: source.into(),
            level,
            file_version: level.file_version().to_string(),
            file_version_quality_control: level.file_version_description().to_string(),
            date_modified: None,
            qc_results: QcLedger::new(),
            log: Vec::new(),
        }
    }

    pub fn set_level(&mut self, level: ProcessingLevel) {
        self.level = level;
        self.file_version = level.file_version().to_string();
        self.file_version_quality_control = level.file_version_description().to_string();
    }

    /// Forget the ledger and audit log of a previous QC run
    pub fn clear_qc(&mut self) {
        self.qc_results.clear();
        self.log.clear();
    }
}

/// One imported instrument record
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub dimensions: Vec<Dimension>,
    pub variables: Vec<Variable>,
    pub meta: DatasetMeta,
}

impl Dataset {
    /// Assemble a dataset, checking data/flag congruence and dimension references
    pub fn new(
        meta: DatasetMeta,
        dimensions: Vec<Dimension>,
        variables: Vec<Variable>,
    ) -> QcResult<Self> {
        let dataset = Self { dimensions, variables, meta };
        dataset.validate()?;
        Ok(dataset)
    }

    pub fn validate(&self) -> QcResult<()> {
        for dim in &self.dimensions {
            if dim.data.len() != dim.flags.len() {
                return Err(QcError::InvalidDataset(format!(
                    "dimension {} has {} samples but {} flags",
                    dim.name,
                    dim.data.len(),
                    dim.flags.len()
                )));
            }
        }
        for var in &self.variables {
            if var.data.shape() != var.flags.shape() {
                return Err(QcError::InvalidDataset(format!(
                    "variable {} data shape {:?} differs from flags shape {:?}",
                    var.name,
                    var.data.shape(),
                    var.flags.shape()
                )));
            }
            if let Some(bad) = var.dimensions.iter().find(|&&d| d >= self.dimensions.len()) {
                return Err(QcError::InvalidDataset(format!(
                    "variable {} references missing dimension {}",
                    var.name, bad
                )));
            }
        }
        Ok(())
    }

    /// Every field address in processing order: dimensions first, then variables
    pub fn field_refs(&self) -> Vec<FieldRef> {
        (0..self.dimensions.len())
            .map(FieldRef::dimension)
            .chain((0..self.variables.len()).map(FieldRef::variable))
            .collect()
    }

    pub fn field(&self, field: FieldRef) -> Option<&dyn FlaggedField> {
        match field.kind {
            FieldKind::Dimension => self.dimensions.get(field.index).map(|d| d as &dyn FlaggedField),
            FieldKind::Variable => self.variables.get(field.index).map(|v| v as &dyn FlaggedField),
        }
    }

    pub fn field_mut(&mut self, field: FieldRef) -> Option<&mut dyn FlaggedField> {
        match field.kind {
            FieldKind::Dimension => self
                .dimensions
                .get_mut(field.index)
                .map(|d| d as &mut dyn FlaggedField),
            FieldKind::Variable => self
                .variables
                .get_mut(field.index)
                .map(|v| v as &mut dyn FlaggedField),
        }
    }

    /// Look a field up by name, dimensions taking precedence
    pub fn find_field(&self, name: &str) -> Option<FieldRef> {
        self.field_refs()
            .into_iter()
            .find(|&f| self.field(f).map_or(false, |field| field.name() == name))
    }

    pub fn fill_flags(&mut self, code: FlagCode) {
        for dim in &mut self.dimensions {
            dim.fill_flags(code);
        }
        for var in &mut self.variables {
            var.fill_flags(code);
        }
    }

    /// Label used in diagnostics
    pub fn label(&self) -> String {
        format!("#{} ({})", self.meta.index, self.meta.source)
    }
}

/// Error types for QC processing
#[derive(Debug, thiserror::Error)]
pub enum QcError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown flag code {code} for QC set {qc_set}")]
    UnknownFlag { code: FlagCode, qc_set: String },

    #[error("QC routine {routine} failed on dataset {dataset}{}: {message}",
        .field.as_ref().map(|f| format!(", field {}", f)).unwrap_or_default())]
    RoutineExecution {
        routine: String,
        dataset: String,
        field: Option<String>,
        message: String,
    },

    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl From<quick_xml::DeError> for QcError {
    fn from(err: quick_xml::DeError) -> Self {
        QcError::Xml(err.to_string())
    }
}

/// Result type for QC operations
pub type QcResult<T> = Result<T, QcError>;
