//! End-to-end tabulation checks on synthetic stratified-cluster designs.

use std::io::Write;

use approx::assert_abs_diff_eq;
use svyest::{
    CategoricalVariable, Dataset, EstimationError, FieldSpec, PercentMode, RecodeConfig,
    SurveyDesign, TableSpec, estimate, tabulate_all,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two strata, three clusters each, two rows per cluster, every weight 1.0.
/// Within each stratum the clusters are all-yes, split, and all-no, so the
/// between-cluster variance is strictly positive.
fn even_split_fixture() -> (SurveyDesign, CategoricalVariable) {
    let mut strata = Vec::new();
    let mut clusters = Vec::new();
    let mut codes = Vec::new();
    for (h, stratum) in ["h1", "h2"].iter().enumerate() {
        for c in 0..3 {
            for r in 0..2 {
                strata.push(stratum.to_string());
                clusters.push(format!("c{}{}", h + 1, c + 1));
                // Cluster 0: yes/yes, cluster 1: yes/no, cluster 2: no/no.
                let yes = match c {
                    0 => true,
                    1 => r == 0,
                    _ => false,
                };
                codes.push(Some(u32::from(!yes)));
            }
        }
    }
    let weights = vec![1.0; strata.len()];
    let design = SurveyDesign::new(&strata, &clusters, &weights).unwrap();
    let variable = CategoricalVariable::new(
        "indicator",
        vec!["Yes".to_string(), "No".to_string()],
        codes,
    )
    .unwrap();
    (design, variable)
}

#[test]
fn uniform_design_recovers_even_split() {
    init_logging();
    let (design, variable) = even_split_fixture();
    assert_eq!(design.n_strata(), 2);
    assert_eq!(design.n_clusters(), 6);

    let table = estimate::summarize(&design, &variable).unwrap();
    let n_total: u64 = table.estimates.iter().map(|e| e.n_unweighted).sum();
    assert_eq!(n_total as usize, design.len());
    for cell in &table.estimates {
        assert_abs_diff_eq!(cell.percent, 50.0, epsilon = 1e-9);
        assert!(cell.std_error > 0.0);
        assert!(!cell.precision_flag);
    }
}

#[test]
fn percentages_close_to_one_hundred_after_dropping_missing() {
    let (design, _) = even_split_fixture();
    let codes: Vec<Option<u32>> = (0..design.len())
        .map(|i| match i % 4 {
            0 => Some(0),
            1 => Some(1),
            2 => Some(2),
            _ => None,
        })
        .collect();
    let variable = CategoricalVariable::new(
        "status",
        vec!["Low".to_string(), "Mid".to_string(), "High".to_string()],
        codes,
    )
    .unwrap();
    let table = estimate::summarize(&design, &variable).unwrap();
    let total: f64 = table.estimates.iter().map(|e| e.percent).sum();
    assert_abs_diff_eq!(total, 100.0, epsilon = 1e-9);
    let n_total: u64 = table.estimates.iter().map(|e| e.n_unweighted).sum();
    assert_eq!(n_total as usize, variable.n_observed());
}

#[test]
fn row_percent_closes_across_groups() {
    let (design, variable) = even_split_fixture();
    let group = CategoricalVariable::new(
        "stratum_half",
        vec!["First".to_string(), "Second".to_string()],
        (0..design.len())
            .map(|i| Some(u32::from(i >= design.len() / 2)))
            .collect(),
    )
    .unwrap();
    let table =
        estimate::summarize_by(&design, &variable, &group, PercentMode::Row).unwrap();
    for level in variable.levels() {
        let across_groups: f64 = table
            .estimates
            .iter()
            .filter(|e| &e.level == level)
            .map(|e| e.percent)
            .sum();
        assert_abs_diff_eq!(across_groups, 100.0, epsilon = 1e-9);
    }
}

#[test]
fn summarize_is_idempotent() {
    let (design, variable) = even_split_fixture();
    let first = estimate::summarize(&design, &variable).unwrap();
    let second = estimate::summarize(&design, &variable).unwrap();
    assert_eq!(first.estimates, second.estimates);
}

#[test]
fn degenerate_subgroup_is_an_error_not_a_nan() {
    let (design, variable) = even_split_fixture();
    // A grouping variable observed nowhere.
    let group = CategoricalVariable::new(
        "never",
        vec!["A".to_string(), "B".to_string()],
        vec![None; design.len()],
    )
    .unwrap();
    let err =
        estimate::summarize_by(&design, &variable, &group, PercentMode::Column).unwrap_err();
    assert!(matches!(err, EstimationError::EmptyGroup { .. }));
}

#[test]
fn batch_isolates_per_table_failures() {
    let (design, variable) = even_split_fixture();
    let all_missing = CategoricalVariable::new(
        "unanswered",
        vec!["Yes".to_string(), "No".to_string()],
        vec![None; design.len()],
    )
    .unwrap();
    let specs = [
        TableSpec::Overall {
            variable: &variable,
        },
        TableSpec::Overall {
            variable: &all_missing,
        },
    ];
    let results = tabulate_all(&design, &specs);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
}

/// Full pipeline: delimited file -> recode -> design -> weighted table.
#[test]
fn csv_to_table_pipeline() {
    init_logging();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    // Two strata, two clusters each; smoker coded 1/2 with a refusal (9).
    writeln!(file, "ststr,psu,wt,smoker").unwrap();
    let rows = [
        ("s1", "p1", 1.2, "1"),
        ("s1", "p1", 0.8, "2"),
        ("s1", "p2", 1.0, "1"),
        ("s1", "p2", 1.5, "2"),
        ("s2", "p3", 2.0, "1"),
        ("s2", "p3", 1.0, "9"),
        ("s2", "p4", 0.7, "2"),
        ("s2", "p4", 1.3, "1"),
    ];
    for (ststr, psu, wt, smoker) in rows {
        writeln!(file, "{ststr},{psu},{wt},{smoker}").unwrap();
    }
    file.flush().unwrap();

    let data = Dataset::load_delimited(
        file.path(),
        b',',
        &[
            FieldSpec::text("ststr"),
            FieldSpec::text("psu"),
            FieldSpec::numeric("wt"),
            FieldSpec::numeric("smoker"),
        ],
    )
    .unwrap();

    let config = RecodeConfig::from_toml_str(
        r#"
        [[mappings]]
        variable = "smoker"
        levels = ["Current smoker", "Not a smoker"]
        unmatched = "missing"
        rules = [
            { code = "1", label = "Current smoker" },
            { code = "2", label = "Not a smoker" },
        ]
        "#,
    )
    .unwrap();

    let smoker = config
        .mapping("smoker")
        .unwrap()
        .apply(data.column("smoker").unwrap())
        .unwrap();
    let design = SurveyDesign::from_dataset(&data, "ststr", "psu", "wt").unwrap();
    let table = estimate::summarize(&design, &smoker).unwrap();

    // The refusal became missing: 7 contributing rows.
    let n_total: u64 = table.estimates.iter().map(|e| e.n_unweighted).sum();
    assert_eq!(n_total, 7);

    // Weighted prevalence of current smoking among respondents.
    let respondent_weight = 1.2 + 0.8 + 1.0 + 1.5 + 2.0 + 0.7 + 1.3;
    let smoker_weight = 1.2 + 1.0 + 2.0 + 1.3;
    assert_abs_diff_eq!(
        table.estimates[0].percent,
        100.0 * smoker_weight / respondent_weight,
        epsilon = 1e-9
    );
}
