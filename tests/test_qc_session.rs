use moorqc::core::{
    apply_manual_flags, ChainExecutor, ChainResolver, FieldOutcome, FlagSet, FlagSetRegistry, NoProgress,
    ProcessingMode, QcReport, QcSettings, RoutineRegistry,
};
use moorqc::io::{read_flag_set, write_flag_set, PropertyStore, TomlPropertyStore};
use moorqc::types::*;
use ndarray::{arr1, Array1, ArrayViewD};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Flags samples outside [min, max] as bad, everything else good
fn global_range(min: f64, max: f64) -> impl moorqc::core::FieldRoutine {
    move |dataset: &Dataset,
          field: FieldRef,
          data: ArrayViewD<'_, f64>,
          _: bool,
          flag_set: &FlagSet|
          -> anyhow::Result<Option<FieldOutcome>> {
        let applies = dataset.field(field).map_or(false, |f| f.name() == "TEMP");
        if !applies {
            return Ok(None);
        }
        let flags = data.mapv(|v| {
            if v.is_nan() {
                flag_set.raw()
            } else if v < min || v > max {
                flag_set.bad()
            } else {
                flag_set.good()
            }
        });
        Ok(Some(FieldOutcome::new(flags).with_params(format!("min={}, max={}", min, max))))
    }
}

/// Flags samples whose jump from the previous one exceeds `threshold` as probably bad
fn rate_of_change(threshold: f64) -> impl moorqc::core::FieldRoutine {
    move |dataset: &Dataset,
          field: FieldRef,
          data: ArrayViewD<'_, f64>,
          _: bool,
          flag_set: &FlagSet|
          -> anyhow::Result<Option<FieldOutcome>> {
        let applies = dataset.field(field).map_or(false, |f| f.name() == "TEMP");
        if !applies {
            return Ok(None);
        }
        let values: Vec<f64> = data.iter().copied().collect();
        let mut flags = vec![flag_set.good(); values.len()];
        for i in 1..values.len() {
            if values[i].is_nan() {
                flags[i] = flag_set.raw();
            } else if (values[i] - values[i - 1]).abs() > threshold {
                flags[i] = flag_set.probably_bad();
            }
        }
        Ok(Some(FieldOutcome::new(arr1(&flags).into_dyn()).with_params(format!("threshold={}", threshold))))
    }
}

fn deployment() -> Dataset {
    let time = Dimension::new("TIME", Array1::linspace(0.0, 5.0, 6), 0);
    let temp = Variable::new(
        "TEMP",
        vec![0],
        arr1(&[14.2, 14.3, 19.9, 45.0, 14.1, f64::NAN]).into_dyn(),
        0,
    );
    Dataset::new(DatasetMeta::new(0, "NRSMAI-1803 SBE39"), vec![time], vec![temp]).unwrap()
}

#[test]
fn test_full_session_from_property_file() {
    init_logging();
    let dir = TempDir::new().expect("Failed to create temp directory");

    // a custom QC set stored next to the properties
    let mut argo = moorqc::core::argo_flag_set();
    let qcset_path = dir.path().join("argo.xml");
    write_flag_set(&argo, &qcset_path).unwrap();
    argo = read_flag_set(&qcset_path).unwrap();
    let mut flag_sets = FlagSetRegistry::new();
    flag_sets.register(argo);

    let store = TomlPropertyStore::new(dir.path().join("properties.toml"));
    store.write("toolbox.qc_set", "2").unwrap();
    store.write("toolbox.mode", "timeSeries").unwrap();
    let resolver = ChainResolver::new(&store);
    resolver
        .persist(
            ProcessingMode::TimeSeries,
            &["imosGlobalRangeQC".to_string(), "imosRateOfChangeQC".to_string()],
        )
        .unwrap();

    let settings = QcSettings::load(&store).unwrap();
    let flag_set = flag_sets.resolve(&settings.qc_set).unwrap();
    let qc_chain = resolver.resolve(settings.mode);
    assert_eq!(qc_chain, vec!["imosGlobalRangeQC", "imosRateOfChangeQC"]);

    let mut routines = RoutineRegistry::new();
    routines.register_field("imosGlobalRangeQC", global_range(-2.5, 40.0));
    routines.register_field("imosRateOfChangeQC", rate_of_change(5.0));

    let mut executor = ChainExecutor::new(&routines, flag_set);
    let mut out = executor
        .run(&qc_chain, &[deployment()], &NoProgress)
        .unwrap()
        .into_datasets()
        .unwrap();
    let ds = &mut out[0];

    // 45.0 is out of range and stays bad; 19.9 and 14.1 jump by more than 5; NaN stays raw
    assert_eq!(ds.variables[0].flags, arr1(&[1, 1, 3, 4, 3, 0]).into_dyn());
    assert_eq!(
        ds.meta.log,
        vec![
            "imosGlobalRangeQC(min=-2.5, max=40) flagged 66.67% TEMP samples with flag Good data",
            "imosGlobalRangeQC(min=-2.5, max=40) flagged 16.67% TEMP samples with flag Bad data",
            "imosRateOfChangeQC(threshold=5) flagged 40.00% TEMP samples with flag Probably bad data",
        ]
    );

    let report = QcReport::build(ds, flag_set);
    assert_eq!(report.qc_set, "2");
    assert_eq!(report.level, ProcessingLevel::QualityControlled);
    assert_eq!(report.failures().count(), 2);
    let temp_stats = report.statistics.iter().find(|s| s.field == "TEMP").unwrap();
    assert_eq!(temp_stats.count(3), 2);
    assert_eq!(temp_stats.count(0), 1);

    // an operator reviews the spike and restores it
    apply_manual_flags(ds, FieldRef::variable(0), &[2], flag_set.good(), Some("real frontal passage"), flag_set)
        .unwrap();
    assert_eq!(ds.variables[0].flags[[2]], 1);
    assert_eq!(
        ds.meta.log.last().map(String::as_str),
        Some("Manually flagged 1 TEMP samples with flag Good data: real frontal passage")
    );
}

#[test]
fn test_unknown_qc_set_aborts_before_running() {
    init_logging();
    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = TomlPropertyStore::new(dir.path().join("properties.toml"));
    store.write("toolbox.qc_set", "7").unwrap();

    let settings = QcSettings::load(&store).unwrap();
    let err = FlagSetRegistry::builtin().resolve(&settings.qc_set).unwrap_err();
    assert!(matches!(err, QcError::Configuration(_)));
}

#[test]
fn test_no_configured_chain_leaves_data_raw() {
    init_logging();
    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = TomlPropertyStore::new(dir.path().join("missing.toml"));
    let flag_sets = FlagSetRegistry::builtin();
    let settings = QcSettings::load(&store).unwrap();
    let flag_set = flag_sets.resolve(&settings.qc_set).unwrap();

    let qc_chain = ChainResolver::new(&store).resolve(ProcessingMode::Profile);
    assert!(qc_chain.is_empty());

    let routines = RoutineRegistry::new();
    let mut executor = ChainExecutor::new(&routines, flag_set);
    let out = executor
        .run(&qc_chain, &[deployment()], &NoProgress)
        .unwrap()
        .into_datasets()
        .unwrap();
    assert_eq!(out[0].meta.level, ProcessingLevel::Raw);
    assert!(out[0].variables[0].flags.iter().all(|&f| f == flag_set.raw()));
}
