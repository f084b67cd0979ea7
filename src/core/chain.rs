//! QC chain configuration
//!
//! Decides which routines run, in which order: a chain supplied by the caller
//! wins over the chain persisted for the processing mode, and with neither the
//! chain is empty (every sample stays raw).

use crate::io::properties::PropertyStore;
use crate::types::{QcError, QcResult};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const QC_SET_KEY: &str = "toolbox.qc_set";
pub const MODE_KEY: &str = "toolbox.mode";
pub const DEFAULT_QC_SET: &str = "1";

/// Kind of data being processed; each mode keeps its own chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessingMode {
    #[default]
    TimeSeries,
    Profile,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::TimeSeries => "timeSeries",
            ProcessingMode::Profile => "profile",
        }
    }

    /// Property key of the persisted chain for this mode
    pub fn chain_key(&self) -> String {
        format!("autoQCManager.autoQCChain.{}", self.as_str())
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = QcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "timeseries" | "time-series" | "time_series" => Ok(ProcessingMode::TimeSeries),
            "profile" => Ok(ProcessingMode::Profile),
            other => Err(QcError::Configuration(format!("unknown processing mode {}", other))),
        }
    }
}

/// Session settings read from the property store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcSettings {
    pub qc_set: String,
    pub mode: ProcessingMode,
}

impl Default for QcSettings {
    fn default() -> Self {
        Self {
            qc_set: DEFAULT_QC_SET.to_string(),
            mode: ProcessingMode::default(),
        }
    }
}

impl QcSettings {
    /// Read settings, falling back to defaults for absent keys
    pub fn load(store: &dyn PropertyStore) -> QcResult<Self> {
        let mut settings = Self::default();
        if let Some(qc_set) = store.read(QC_SET_KEY)? {
            let qc_set = qc_set.trim();
            if !qc_set.is_empty() {
                settings.qc_set = qc_set.to_string();
            }
        }
        if let Some(mode) = store.read(MODE_KEY)? {
            settings.mode = mode.parse()?;
        }
        Ok(settings)
    }
}

fn routine_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap_or_else(|e| unreachable!("valid pattern: {}", e))
    })
}

/// Parse a whitespace separated list of routine names
pub fn parse_chain(value: &str) -> QcResult<Vec<String>> {
    value
        .split_whitespace()
        .map(|name| {
            if routine_name_pattern().is_match(name) {
                Ok(name.to_string())
            } else {
                Err(QcError::Configuration(format!("invalid QC routine name {:?}", name)))
            }
        })
        .collect()
}

/// Resolves the chain to run for a processing mode
pub struct ChainResolver<'s> {
    store: &'s dyn PropertyStore,
    explicit: Option<Vec<String>>,
}

impl<'s> ChainResolver<'s> {
    pub fn new(store: &'s dyn PropertyStore) -> Self {
        Self { store, explicit: None }
    }

    /// Chain chosen by the caller, taking precedence over the persisted one
    pub fn with_chain(mut self, chain: Vec<String>) -> Self {
        self.explicit = Some(chain);
        self
    }

    /// Ordered routine names to run. Never fails: anything unreadable resolves
    /// to the empty chain.
    pub fn resolve(&self, mode: ProcessingMode) -> Vec<String> {
        if let Some(chain) = &self.explicit {
            log::debug!("Using caller supplied QC chain for {}", mode);
            return chain.clone();
        }

        let key = mode.chain_key();
        match self.store.read(&key) {
            Ok(Some(value)) => match parse_chain(&value) {
                Ok(chain) => {
                    log::debug!("Using persisted QC chain {} = {:?}", key, chain);
                    chain
                }
                Err(e) => {
                    log::warn!("Ignoring persisted QC chain {}: {}", key, e);
                    Vec::new()
                }
            },
            Ok(None) => {
                log::debug!("No QC chain configured for {}", mode);
                Vec::new()
            }
            Err(e) => {
                log::warn!("Could not read QC chain {}: {}", key, e);
                Vec::new()
            }
        }
    }

    /// Remember `chain` as the default for `mode`
    pub fn persist(&self, mode: ProcessingMode, chain: &[String]) -> QcResult<()> {
        if let Some(bad) = chain.iter().find(|name| !routine_name_pattern().is_match(name)) {
            return Err(QcError::Configuration(format!("invalid QC routine name {:?}", bad)));
        }
        self.store.write(&mode.chain_key(), &chain.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::properties::MemoryPropertyStore;

    fn names(chain: &[&str]) -> Vec<String> {
        chain.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_explicit_chain_wins() {
        let store = MemoryPropertyStore::new()
            .with("autoQCManager.autoQCChain.timeSeries", "imosImpossibleDateQC");
        let resolver = ChainResolver::new(&store).with_chain(names(&["imosSpikeQC"]));
        assert_eq!(resolver.resolve(ProcessingMode::TimeSeries), names(&["imosSpikeQC"]));
    }

    #[test]
    fn test_persisted_chain_per_mode() {
        let store = MemoryPropertyStore::new()
            .with(
                "autoQCManager.autoQCChain.timeSeries",
                "imosImpossibleDateQC  imosGlobalRangeQC\timosSalinitySetQC",
            )
            .with("autoQCManager.autoQCChain.profile", "imosVerticalSpikeQC");
        let resolver = ChainResolver::new(&store);

        assert_eq!(
            resolver.resolve(ProcessingMode::TimeSeries),
            names(&["imosImpossibleDateQC", "imosGlobalRangeQC", "imosSalinitySetQC"])
        );
        assert_eq!(resolver.resolve(ProcessingMode::Profile), names(&["imosVerticalSpikeQC"]));
    }

    #[test]
    fn test_missing_or_malformed_chain_is_empty() {
        let store = MemoryPropertyStore::new().with("autoQCManager.autoQCChain.profile", "imosSpikeQC ../evil");
        let resolver = ChainResolver::new(&store);
        assert!(resolver.resolve(ProcessingMode::TimeSeries).is_empty());
        assert!(resolver.resolve(ProcessingMode::Profile).is_empty());
    }

    #[test]
    fn test_persist_then_resolve() {
        let store = MemoryPropertyStore::new();
        let resolver = ChainResolver::new(&store);
        resolver
            .persist(ProcessingMode::Profile, &names(&["imosTiltVelocitySetQC", "imosEchoIntensityQC"]))
            .unwrap();
        assert_eq!(
            store.read("autoQCManager.autoQCChain.profile").unwrap().as_deref(),
            Some("imosTiltVelocitySetQC imosEchoIntensityQC")
        );
        assert_eq!(
            resolver.resolve(ProcessingMode::Profile),
            names(&["imosTiltVelocitySetQC", "imosEchoIntensityQC"])
        );
        assert!(resolver.persist(ProcessingMode::Profile, &names(&["bad name"])).is_err());
    }

    #[test]
    fn test_settings_defaults_and_overrides() {
        let empty = MemoryPropertyStore::new();
        assert_eq!(QcSettings::load(&empty).unwrap(), QcSettings::default());

        let store = MemoryPropertyStore::new().with(QC_SET_KEY, " 2 ").with(MODE_KEY, "profile");
        let settings = QcSettings::load(&store).unwrap();
        assert_eq!(settings.qc_set, "2");
        assert_eq!(settings.mode, ProcessingMode::Profile);

        let broken = MemoryPropertyStore::new().with(MODE_KEY, "trajectory");
        assert!(QcSettings::load(&broken).is_err());
    }
}
