/*!
 * Flag merge engine
 *
 * Merges the candidate flags proposed by one QC routine into the authoritative
 * flags of a field. A sample only moves up the ladder
 * (raw -> good -> probably good -> probably bad -> bad): a candidate is applied
 * where it is strictly more severe than the current flag, so no routine can
 * soften what an earlier routine decided.
 *
 * Every merge appends to the dataset's audit log and overwrites the
 * (routine, field) entry of the QC results ledger. Inputs are validated before
 * anything is written, so a failed merge leaves the field untouched.
 */

use crate::core::flags::FlagSet;
use crate::types::*;
use ndarray::{ArrayViewD, Zip};
use std::collections::{BTreeMap, BTreeSet};

/// Per-merge statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeSummary {
    /// Positions whose current flag could still be worsened by a ladder flag
    pub flaggable: usize,
    /// Number of positions moved to each flag code
    pub changed: BTreeMap<FlagCode, usize>,
}

impl MergeSummary {
    pub fn total_changed(&self) -> usize {
        self.changed.values().sum()
    }

    /// Share of flaggable positions moved to `code`
    pub fn fraction(&self, code: FlagCode) -> f64 {
        Self::ratio(self.changed.get(&code).copied().unwrap_or(0), self.flaggable)
    }

    /// Share of flaggable positions that changed at all
    pub fn total_fraction(&self) -> f64 {
        Self::ratio(self.total_changed(), self.flaggable)
    }

    fn ratio(count: usize, of: usize) -> f64 {
        if of == 0 {
            0.0
        } else {
            count as f64 / of as f64
        }
    }
}

/// Applies the severity ladder for one QC set
#[derive(Debug, Clone, Copy)]
pub struct FlagMerger<'a> {
    flag_set: &'a FlagSet,
}

impl<'a> FlagMerger<'a> {
    pub fn new(flag_set: &'a FlagSet) -> Self {
        Self { flag_set }
    }

    pub fn flag_set(&self) -> &'a FlagSet {
        self.flag_set
    }

    /// Compute the merged flags without touching `current`.
    ///
    /// Fails when the shapes differ or the candidate holds a code the QC set
    /// does not define.
    pub fn merge(
        &self,
        current: ArrayViewD<'_, FlagCode>,
        candidate: ArrayViewD<'_, FlagCode>,
    ) -> QcResult<(FlagArray, MergeSummary)> {
        if current.shape() != candidate.shape() {
            return Err(QcError::InvalidDataset(format!(
                "candidate flags shape {:?} does not match field shape {:?}",
                candidate.shape(),
                current.shape()
            )));
        }
        let unknown: BTreeSet<FlagCode> = candidate
            .iter()
            .copied()
            .filter(|&code| !self.flag_set.contains(code))
            .collect();
        if let Some(&code) = unknown.iter().next() {
            return Err(QcError::UnknownFlag {
                code,
                qc_set: self.flag_set.id().to_string(),
            });
        }

        let mut merged = current.to_owned();
        let mut summary = MergeSummary::default();
        Zip::from(&mut merged).and(&candidate).for_each(|cur, &cand| {
            if self.flag_set.is_flaggable(*cur) {
                summary.flaggable += 1;
            }
            if self.flag_set.can_be_flagged(*cur, cand) {
                *cur = cand;
                *summary.changed.entry(cand).or_insert(0) += 1;
            }
        });
        Ok((merged, summary))
    }

    /// Merge a routine's candidate flags into one field of `dataset`, then
    /// record the outcome in the audit log and the QC results ledger.
    pub fn apply(
        &self,
        dataset: &mut Dataset,
        field: FieldRef,
        routine: &str,
        candidate: ArrayViewD<'_, FlagCode>,
        params_log: Option<&str>,
    ) -> QcResult<MergeSummary> {
        let label = dataset.label();
        let target = dataset.field_mut(field).ok_or_else(|| QcError::RoutineExecution {
            routine: routine.to_string(),
            dataset: label.clone(),
            field: None,
            message: format!("{} {} does not exist", field.kind, field.index),
        })?;
        let field_name = target.name().to_string();

        let (merged, summary) =
            self.merge(target.flags(), candidate)
                .map_err(|e| QcError::RoutineExecution {
                    routine: routine.to_string(),
                    dataset: label,
                    field: Some(field_name.clone()),
                    message: e.to_string(),
                })?;
        let log_lines = self.log_lines(routine, params_log, &field_name, &summary)?;
        let result = self.ledger_entry(params_log, &summary)?;

        target.flags_mut().assign(&merged);
        dataset.meta.log.extend(log_lines);
        dataset
            .meta
            .qc_results
            .insert((routine.to_string(), field_name), result);
        Ok(summary)
    }

    /// Audit log lines describing one merge
    pub fn log_lines(
        &self,
        routine: &str,
        params_log: Option<&str>,
        field_name: &str,
        summary: &MergeSummary,
    ) -> QcResult<Vec<String>> {
        let caller = match params_log {
            Some(params) if !params.is_empty() => format!("{}({})", routine, params),
            _ => routine.to_string(),
        };
        if summary.total_changed() == 0 {
            return Ok(vec![format!("{} didn't fail on any {} sample", caller, field_name)]);
        }

        let mut lines = Vec::with_capacity(summary.changed.len());
        // ascending severity
        for definition in self.flag_set.flags() {
            if summary.changed.contains_key(&definition.code) {
                lines.push(format!(
                    "{} flagged {:.2}% {} samples with flag {}",
                    caller,
                    summary.fraction(definition.code) * 100.0,
                    field_name,
                    definition.name
                ));
            }
        }
        Ok(lines)
    }

    fn ledger_entry(&self, params_log: Option<&str>, summary: &MergeSummary) -> QcResult<QcTestResult> {
        let mut most_severe: Option<(u32, FlagCode)> = None;
        for &code in summary.changed.keys() {
            let rank = self.flag_set.severity_rank(code)?;
            if most_severe.map_or(true, |(r, _)| rank > r) {
                most_severe = Some((rank, code));
            }
        }
        let applied_flag = match most_severe {
            Some((_, code)) => {
                let description = self.flag_set.describe(code)?;
                Some(AppliedFlag {
                    code,
                    description: description.name,
                    color: description.color,
                })
            }
            None => None,
        };
        Ok(QcTestResult {
            failing_sample_count: summary.total_changed(),
            failing_fraction: summary.total_fraction(),
            parameters_used: params_log.unwrap_or_default().to_string(),
            applied_flag,
        })
    }
}

/// Manually override flags of one field at the given positions.
///
/// Positions are linear indices in logical (row-major) order. Unlike automatic
/// merges any registered flag may be applied, including less severe ones.
pub fn apply_manual_flags(
    dataset: &mut Dataset,
    field: FieldRef,
    positions: &[usize],
    code: FlagCode,
    comment: Option<&str>,
    flag_set: &FlagSet,
) -> QcResult<usize> {
    let description = flag_set.describe(code)?;
    let target = dataset
        .field_mut(field)
        .ok_or_else(|| QcError::InvalidDataset(format!("{} {} does not exist", field.kind, field.index)))?;
    let len = target.flags().len();
    let positions: BTreeSet<usize> = positions.iter().copied().collect();
    if let Some(&out_of_range) = positions.iter().find(|&&p| p >= len) {
        return Err(QcError::InvalidDataset(format!(
            "position {} is outside {} ({} samples)",
            out_of_range,
            target.name(),
            len
        )));
    }

    for (i, flag) in target.flags_mut().iter_mut().enumerate() {
        if positions.contains(&i) {
            *flag = code;
        }
    }

    let mut line = format!(
        "Manually flagged {} {} samples with flag {}",
        positions.len(),
        target.name(),
        description.name
    );
    if let Some(comment) = comment.filter(|c| !c.is_empty()) {
        line.push_str(&format!(": {}", comment));
    }
    log::debug!("{}", line);
    dataset.meta.log.push(line);
    Ok(positions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flags::imos_flag_set;
    use approx::assert_relative_eq;
    use ndarray::{arr1, Array1, ArrayD, IxDyn};

    const RAW: FlagCode = 0;
    const GOOD: FlagCode = 1;
    const PG: FlagCode = 2;
    const PB: FlagCode = 3;
    const BAD: FlagCode = 4;

    fn flags(codes: &[FlagCode]) -> FlagArray {
        arr1(codes).into_dyn()
    }

    fn temp_dataset(current: &[FlagCode]) -> Dataset {
        let n = current.len();
        let time = Dimension::new("TIME", Array1::linspace(0.0, 1.0, n), RAW);
        let mut temp = Variable::new(
            "TEMP",
            vec![0],
            ArrayD::from_elem(IxDyn(&[n]), 12.5),
            RAW,
        );
        temp.flags = flags(current);
        Dataset::new(DatasetMeta::new(0, "SBE37"), vec![time], vec![temp]).unwrap()
    }

    #[test]
    fn test_merge_follows_ladder() {
        let set = imos_flag_set();
        let merger = FlagMerger::new(&set);
        let current = flags(&[RAW, RAW, GOOD, GOOD, PG]);
        let candidate = flags(&[GOOD, PB, BAD, GOOD, BAD]);

        let (merged, summary) = merger.merge(current.view(), candidate.view()).unwrap();

        assert_eq!(merged, flags(&[GOOD, PB, BAD, GOOD, BAD]));
        assert_eq!(summary.flaggable, 5);
        assert_eq!(summary.total_changed(), 4);
        assert_eq!(summary.changed.get(&BAD), Some(&2));
    }

    #[test]
    fn test_merge_never_softens() {
        let set = imos_flag_set();
        let merger = FlagMerger::new(&set);
        let current = flags(&[GOOD, PB, BAD, BAD, PG]);
        let candidate = flags(&[PG, GOOD, GOOD, BAD, RAW]);

        let (merged, summary) = merger.merge(current.view(), candidate.view()).unwrap();

        assert_eq!(merged, flags(&[PG, PB, BAD, BAD, PG]));
        // bad samples cannot be worsened
        assert_eq!(summary.flaggable, 3);
        assert_eq!(summary.total_changed(), 1);
    }

    #[test]
    fn test_probably_bad_only_moves_to_bad() {
        let set = imos_flag_set();
        let merger = FlagMerger::new(&set);
        for candidate in [RAW, GOOD, PG, PB, BAD, 5, 8, 9] {
            let (merged, _) = merger
                .merge(flags(&[PB]).view(), flags(&[candidate]).view())
                .unwrap();
            let expected = if candidate == BAD { BAD } else { PB };
            assert_eq!(merged[[0]], expected, "candidate {}", candidate);
        }
    }

    #[test]
    fn test_all_good_candidate_is_silent() {
        let set = imos_flag_set();
        let merger = FlagMerger::new(&set);
        let current = flags(&[GOOD, GOOD, GOOD]);
        let (merged, summary) = merger
            .merge(current.view(), flags(&[GOOD, GOOD, GOOD]).view())
            .unwrap();
        assert_eq!(merged, current);
        assert_eq!(summary.total_changed(), 0);
    }

    #[test]
    fn test_merge_rejects_shape_mismatch() {
        let set = imos_flag_set();
        let merger = FlagMerger::new(&set);
        let err = merger
            .merge(flags(&[RAW, RAW]).view(), flags(&[BAD]).view())
            .unwrap_err();
        assert!(matches!(err, QcError::InvalidDataset(_)));
    }

    #[test]
    fn test_merge_rejects_unknown_code() {
        let set = imos_flag_set();
        let merger = FlagMerger::new(&set);
        let err = merger
            .merge(flags(&[RAW, RAW]).view(), flags(&[BAD, 7]).view())
            .unwrap_err();
        assert!(matches!(err, QcError::UnknownFlag { code: 7, .. }));
    }

    #[test]
    fn test_apply_logs_and_records_ledger() {
        let set = imos_flag_set();
        let merger = FlagMerger::new(&set);
        let mut dataset = temp_dataset(&[RAW, RAW, GOOD, GOOD, PG]);
        let candidate = flags(&[GOOD, PB, BAD, GOOD, BAD]);

        merger
            .apply(
                &mut dataset,
                FieldRef::variable(0),
                "imosGlobalRangeQC",
                candidate.view(),
                Some("min=-2.5, max=40"),
            )
            .unwrap();

        assert_eq!(dataset.variables[0].flags, flags(&[GOOD, PB, BAD, GOOD, BAD]));
        assert_eq!(
            dataset.meta.log,
            vec![
                "imosGlobalRangeQC(min=-2.5, max=40) flagged 20.00% TEMP samples with flag Good data",
                "imosGlobalRangeQC(min=-2.5, max=40) flagged 20.00% TEMP samples with flag Bad data that are potentially correctable",
                "imosGlobalRangeQC(min=-2.5, max=40) flagged 40.00% TEMP samples with flag Bad data",
            ]
        );

        let entry = &dataset.meta.qc_results[&("imosGlobalRangeQC".to_string(), "TEMP".to_string())];
        assert_eq!(entry.failing_sample_count, 4);
        assert_relative_eq!(entry.failing_fraction, 0.8);
        assert_eq!(entry.parameters_used, "min=-2.5, max=40");
        let applied = entry.applied_flag.as_ref().unwrap();
        assert_eq!(applied.code, BAD);
        assert_eq!(applied.description, "Bad data");
    }

    #[test]
    fn test_apply_without_change_logs_pass() {
        let set = imos_flag_set();
        let merger = FlagMerger::new(&set);
        let mut dataset = temp_dataset(&[GOOD, GOOD]);

        merger
            .apply(&mut dataset, FieldRef::variable(0), "imosSpikeQC", flags(&[GOOD, GOOD]).view(), None)
            .unwrap();

        assert_eq!(dataset.meta.log, vec!["imosSpikeQC didn't fail on any TEMP sample"]);
        let entry = &dataset.meta.qc_results[&("imosSpikeQC".to_string(), "TEMP".to_string())];
        assert_eq!(entry.failing_sample_count, 0);
        assert!(entry.applied_flag.is_none());
    }

    #[test]
    fn test_failed_apply_leaves_field_untouched() {
        let set = imos_flag_set();
        let merger = FlagMerger::new(&set);
        let mut dataset = temp_dataset(&[RAW, RAW, RAW]);
        let before = dataset.clone();

        let err = merger
            .apply(&mut dataset, FieldRef::variable(0), "brokenQC", flags(&[BAD, 6, BAD]).view(), None)
            .unwrap_err();

        match err {
            QcError::RoutineExecution { routine, field, .. } => {
                assert_eq!(routine, "brokenQC");
                assert_eq!(field.as_deref(), Some("TEMP"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(dataset, before);
    }

    #[test]
    fn test_manual_flags_can_soften() {
        let set = imos_flag_set();
        let mut dataset = temp_dataset(&[BAD, BAD, BAD, BAD]);

        let n = apply_manual_flags(
            &mut dataset,
            FieldRef::variable(0),
            &[1, 3, 3],
            GOOD,
            Some("sensor swap confirmed"),
            &set,
        )
        .unwrap();

        assert_eq!(n, 2);
        assert_eq!(dataset.variables[0].flags, flags(&[BAD, GOOD, BAD, GOOD]));
        assert_eq!(
            dataset.meta.log.last().unwrap(),
            "Manually flagged 2 TEMP samples with flag Good data: sensor swap confirmed"
        );
    }

    #[test]
    fn test_manual_flags_reject_out_of_range() {
        let set = imos_flag_set();
        let mut dataset = temp_dataset(&[RAW, RAW]);
        assert!(apply_manual_flags(&mut dataset, FieldRef::variable(0), &[2], BAD, None, &set).is_err());
        assert!(apply_manual_flags(&mut dataset, FieldRef::variable(0), &[0], 6, None, &set).is_err());
        assert_eq!(dataset.variables[0].flags, flags(&[RAW, RAW]));
        assert!(dataset.meta.log.is_empty());
    }
}
