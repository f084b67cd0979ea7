/*!
 * QC flag vocabularies
 *
 * A QC set defines the integer flag codes written to exported products, their
 * severity ordering and their display metadata. Five codes take part in the
 * automatic flagging ladder:
 *
 *   raw < good < probably good < probably bad < bad
 *
 * Any other code in a set (value changed, interpolated, missing...) can only be
 * applied manually.
 */

use crate::types::{FlagCode, QcError, QcResult, Rgba};
use std::collections::{BTreeMap, HashMap};

/// Position of a flag on the automatic flagging ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlagRole {
    Raw,
    Good,
    ProbablyGood,
    ProbablyBad,
    Bad,
}

impl FlagRole {
    pub const LADDER: [FlagRole; 5] = [
        FlagRole::Raw,
        FlagRole::Good,
        FlagRole::ProbablyGood,
        FlagRole::ProbablyBad,
        FlagRole::Bad,
    ];
}

/// One flag of a QC set
#[derive(Debug, Clone, PartialEq)]
pub struct FlagDefinition {
    pub code: FlagCode,
    pub name: String,
    pub severity_rank: u32,
    pub color: Rgba,
}

/// Display metadata for a flag code
#[derive(Debug, Clone, PartialEq)]
pub struct FlagDescription {
    pub name: String,
    pub color: Rgba,
}

/// Codes holding each ladder role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderCodes {
    pub raw: FlagCode,
    pub good: FlagCode,
    pub probably_good: FlagCode,
    pub probably_bad: FlagCode,
    pub bad: FlagCode,
}

impl LadderCodes {
    pub fn code(&self, role: FlagRole) -> FlagCode {
        match role {
            FlagRole::Raw => self.raw,
            FlagRole::Good => self.good,
            FlagRole::ProbablyGood => self.probably_good,
            FlagRole::ProbablyBad => self.probably_bad,
            FlagRole::Bad => self.bad,
        }
    }
}

/// Immutable flag vocabulary of one QC standard
#[derive(Debug, Clone, PartialEq)]
pub struct FlagSet {
    id: String,
    name: String,
    /// Ordered by ascending severity
    flags: Vec<FlagDefinition>,
    ladder: LadderCodes,
    by_code: HashMap<FlagCode, usize>,
}

impl FlagSet {
    /// Build and validate a flag set
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        mut flags: Vec<FlagDefinition>,
        ladder: LadderCodes,
    ) -> QcResult<Self> {
        let id = id.into();
        flags.sort_by_key(|f| f.severity_rank);

        let mut by_code = HashMap::with_capacity(flags.len());
        for (i, flag) in flags.iter().enumerate() {
            if by_code.insert(flag.code, i).is_some() {
                return Err(QcError::Configuration(format!(
                    "QC set {} defines flag code {} twice",
                    id, flag.code
                )));
            }
            if i > 0 && flags[i - 1].severity_rank == flag.severity_rank {
                return Err(QcError::Configuration(format!(
                    "QC set {}: flags {} and {} share severity rank {}",
                    id,
                    flags[i - 1].code,
                    flag.code,
                    flag.severity_rank
                )));
            }
        }

        let mut previous: Option<u32> = None;
        for role in FlagRole::LADDER {
            let code = ladder.code(role);
            let rank = by_code
                .get(&code)
                .map(|&i| flags[i].severity_rank)
                .ok_or_else(|| {
                    QcError::Configuration(format!(
                        "QC set {}: {:?} flag {} is not defined",
                        id, role, code
                    ))
                })?;
            if previous.map_or(false, |p| p >= rank) {
                return Err(QcError::Configuration(format!(
                    "QC set {}: {:?} flag {} must be more severe than the previous ladder flag",
                    id, role, code
                )));
            }
            previous = Some(rank);
        }

        // sorted ascending, so the raw flag has to come first
        if flags.first().map(|f| f.code) != Some(ladder.raw) {
            return Err(QcError::Configuration(format!(
                "QC set {}: raw flag {} must have the lowest severity",
                id, ladder.raw
            )));
        }

        Ok(Self { id, name: name.into(), flags, ladder, by_code })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Definitions in ascending severity
    pub fn flags(&self) -> &[FlagDefinition] {
        &self.flags
    }

    pub fn ladder(&self) -> LadderCodes {
        self.ladder
    }

    pub fn raw(&self) -> FlagCode {
        self.ladder.raw
    }

    pub fn good(&self) -> FlagCode {
        self.ladder.good
    }

    pub fn probably_good(&self) -> FlagCode {
        self.ladder.probably_good
    }

    pub fn probably_bad(&self) -> FlagCode {
        self.ladder.probably_bad
    }

    pub fn bad(&self) -> FlagCode {
        self.ladder.bad
    }

    pub fn contains(&self, code: FlagCode) -> bool {
        self.by_code.contains_key(&code)
    }

    pub fn definition(&self, code: FlagCode) -> QcResult<&FlagDefinition> {
        self.by_code
            .get(&code)
            .map(|&i| &self.flags[i])
            .ok_or_else(|| QcError::UnknownFlag { code, qc_set: self.id.clone() })
    }

    pub fn severity_rank(&self, code: FlagCode) -> QcResult<u32> {
        self.definition(code).map(|f| f.severity_rank)
    }

    pub fn describe(&self, code: FlagCode) -> QcResult<FlagDescription> {
        self.definition(code).map(|f| FlagDescription {
            name: f.name.clone(),
            color: f.color,
        })
    }

    /// Ladder role held by `code`, if any
    pub fn role(&self, code: FlagCode) -> Option<FlagRole> {
        FlagRole::LADDER
            .into_iter()
            .find(|&role| self.ladder.code(role) == code)
    }

    /// Whether a sample flagged `current` may be overwritten by `candidate`
    /// during automatic QC: both must sit on the ladder and the candidate
    /// must be strictly more severe.
    pub fn can_be_flagged(&self, current: FlagCode, candidate: FlagCode) -> bool {
        match (self.role(current), self.role(candidate)) {
            (Some(from), Some(to)) => from < to,
            _ => false,
        }
    }

    /// Whether some ladder flag could still worsen a sample flagged `current`
    pub fn is_flaggable(&self, current: FlagCode) -> bool {
        self.can_be_flagged(current, self.ladder.bad)
    }
}

fn flag(code: FlagCode, name: &str, severity_rank: u32, color: Rgba) -> FlagDefinition {
    FlagDefinition { code, name: name.to_string(), severity_rank, color }
}

const RAW_COLOR: Rgba = Rgba::new(191, 191, 191);
const GOOD_COLOR: Rgba = Rgba::new(0, 255, 0);
const PROBABLY_GOOD_COLOR: Rgba = Rgba::new(0, 128, 255);
const PROBABLY_BAD_COLOR: Rgba = Rgba::new(255, 166, 0);
const BAD_COLOR: Rgba = Rgba::new(255, 0, 0);
const CHANGED_COLOR: Rgba = Rgba::new(255, 0, 255);
const INTERPOLATED_COLOR: Rgba = Rgba::new(0, 255, 255);
const MISSING_COLOR: Rgba = Rgba::new(0, 0, 0);

const STANDARD_LADDER: LadderCodes = LadderCodes {
    raw: 0,
    good: 1,
    probably_good: 2,
    probably_bad: 3,
    bad: 4,
};

/// IMOS flag scheme (QC set "1")
pub fn imos_flag_set() -> FlagSet {
    let flags = vec![
        flag(0, "No QC performed", 0, RAW_COLOR),
        flag(1, "Good data", 1, GOOD_COLOR),
        flag(2, "Probably good data", 2, PROBABLY_GOOD_COLOR),
        flag(3, "Bad data that are potentially correctable", 3, PROBABLY_BAD_COLOR),
        flag(4, "Bad data", 4, BAD_COLOR),
        flag(5, "Value changed", 5, CHANGED_COLOR),
        flag(8, "Interpolated value", 6, INTERPOLATED_COLOR),
        flag(9, "Missing value", 7, MISSING_COLOR),
    ];
    FlagSet::new("1", "IMOS standard flags", flags, STANDARD_LADDER)
        .unwrap_or_else(|e| unreachable!("built-in IMOS flag set is valid: {}", e))
}

/// ARGO flag scheme (QC set "2")
pub fn argo_flag_set() -> FlagSet {
    let flags = vec![
        flag(0, "No QC performed", 0, RAW_COLOR),
        flag(1, "Good data", 1, GOOD_COLOR),
        flag(2, "Probably good data", 2, PROBABLY_GOOD_COLOR),
        flag(3, "Probably bad data", 3, PROBABLY_BAD_COLOR),
        flag(4, "Bad data", 4, BAD_COLOR),
        flag(5, "Value changed", 5, CHANGED_COLOR),
        flag(8, "Interpolated value", 6, INTERPOLATED_COLOR),
        flag(9, "Missing value", 7, MISSING_COLOR),
    ];
    FlagSet::new("2", "ARGO flags", flags, STANDARD_LADDER)
        .unwrap_or_else(|e| unreachable!("built-in ARGO flag set is valid: {}", e))
}

/// Registered QC sets keyed by identifier
#[derive(Debug, Clone, Default)]
pub struct FlagSetRegistry {
    sets: BTreeMap<String, FlagSet>,
}

impl FlagSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the IMOS ("1") and ARGO ("2") sets
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(imos_flag_set());
        registry.register(argo_flag_set());
        registry
    }

    /// Add or replace a QC set
    pub fn register(&mut self, set: FlagSet) {
        log::debug!("Registering QC set {} ({})", set.id(), set.name());
        self.sets.insert(set.id().to_string(), set);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    pub fn resolve(&self, qc_set_id: &str) -> QcResult<&FlagSet> {
        self.sets.get(qc_set_id).ok_or_else(|| {
            QcError::Configuration(format!("no flag vocabulary registered for QC set {}", qc_set_id))
        })
    }
}
