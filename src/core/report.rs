//! Post-run QC summaries for export and plotting consumers

use crate::core::flags::FlagSet;
use crate::types::*;
use std::collections::BTreeMap;

/// Number of samples holding each flag code in one field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFlagStatistics {
    pub field: String,
    pub kind: FieldKind,
    pub total_samples: usize,
    pub counts: BTreeMap<FlagCode, usize>,
}

impl FieldFlagStatistics {
    pub fn count(&self, code: FlagCode) -> usize {
        self.counts.get(&code).copied().unwrap_or(0)
    }

    /// Percentage of the field's samples holding `code`
    pub fn percentage(&self, code: FlagCode) -> f64 {
        if self.total_samples == 0 {
            0.0
        } else {
            self.count(code) as f64 * 100.0 / self.total_samples as f64
        }
    }
}

/// Flag counts for every dimension and variable of a dataset
pub fn flag_statistics(dataset: &Dataset) -> Vec<FieldFlagStatistics> {
    dataset
        .field_refs()
        .into_iter()
        .filter_map(|field_ref| {
            dataset.field(field_ref).map(|field| {
                let flags = field.flags();
                let mut counts = BTreeMap::new();
                for &code in flags.iter() {
                    *counts.entry(code).or_insert(0) += 1;
                }
                FieldFlagStatistics {
                    field: field.name().to_string(),
                    kind: field_ref.kind,
                    total_samples: flags.len(),
                    counts,
                }
            })
        })
        .collect()
}

/// One line of the QC report: the last outcome of a test on a field
#[derive(Debug, Clone, PartialEq)]
pub struct QcReportEntry {
    pub routine: String,
    pub field: String,
    pub result: QcTestResult,
}

/// Pull-style summary of a QC'd dataset
#[derive(Debug, Clone, PartialEq)]
pub struct QcReport {
    pub source: String,
    pub level: ProcessingLevel,
    pub qc_set: String,
    pub entries: Vec<QcReportEntry>,
    pub statistics: Vec<FieldFlagStatistics>,
}

impl QcReport {
    pub fn build(dataset: &Dataset, flag_set: &FlagSet) -> Self {
        let entries = dataset
            .meta
            .qc_results
            .iter()
            .map(|((routine, field), result)| QcReportEntry {
                routine: routine.clone(),
                field: field.clone(),
                result: result.clone(),
            })
            .collect();
        Self {
            source: dataset.meta.source.clone(),
            level: dataset.meta.level,
            qc_set: flag_set.id().to_string(),
            entries,
            statistics: flag_statistics(dataset),
        }
    }

    /// Entries whose test flagged at least one sample
    pub fn failures(&self) -> impl Iterator<Item = &QcReportEntry> {
        self.entries.iter().filter(|e| e.result.failing_sample_count > 0)
    }

    /// Human readable summary, one line per field and flag
    pub fn summary_lines(&self, flag_set: &FlagSet) -> Vec<String> {
        let mut lines = Vec::new();
        for stats in &self.statistics {
            for (&code, &count) in &stats.counts {
                let name = flag_set
                    .describe(code)
                    .map(|d| d.name)
                    .unwrap_or_else(|_| format!("flag {}", code));
                lines.push(format!(
                    "{} {}: {} samples ({:.1}%) {}",
                    stats.kind,
                    stats.field,
                    count,
                    stats.percentage(code),
                    name
                ));
            }
        }
        lines
    }
}
