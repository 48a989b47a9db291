use kontextual::core::association::outcome::*;
use kontextual::core::association::table::*;
use kontextual::core::association::weights::*;
use kontextual::core::data::synthetic_data::*;
use kontextual::core::hierarchy::cell_types::*;
use kontextual::core::spatial::point_pattern::PointPatternParams;
use kontextual::core::spatial::window::{EdgeCorrection, Rect, WindowKind};
use kontextual::CellTable;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const RADII: [f64; 1] = [50.0];

fn window() -> Rect {
    Rect::new(0.0, 1000.0, 0.0, 1000.0).unwrap()
}

fn params() -> PointPatternParams {
    PointPatternParams {
        window: WindowKind::Fixed(window()),
        edge_correction: EdgeCorrection::Isotropic,
        min_cells: 20,
        sigma: None,
    }
}

/// A and B share five tight clusters; C is scattered
fn clustered_image(id: &str, seed: u64) -> SyntheticImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let anchors: Vec<(f64, f64)> = (0..5)
        .map(|_| (rng.random_range(100.0..900.0), rng.random_range(100.0..900.0)))
        .collect();
    let a = planted_points(&anchors, 30, 40.0, &window(), &mut rng);
    let b = planted_points(&anchors, 30, 40.0, &window(), &mut rng);
    let c = uniform_points(100, &window(), &mut rng);
    SyntheticImage::new(id).add("A", &a).add("B", &b).add("C", &c)
}

/// A on the left, B on the right, more than 50 apart; C is scattered
fn separated_image(id: &str, seed: u64) -> SyntheticImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let left = Rect::new(0.0, 400.0, 0.0, 1000.0).unwrap();
    let right = Rect::new(600.0, 1000.0, 0.0, 1000.0).unwrap();
    let a = uniform_points(150, &left, &mut rng);
    let b = uniform_points(150, &right, &mut rng);
    let c = uniform_points(100, &window(), &mut rng);
    SyntheticImage::new(id).add("A", &a).add("B", &b).add("C", &c)
}

fn cohort(with_subjects: bool) -> CellTable {
    let mut images = Vec::new();
    for k in 0..3 {
        let case = clustered_image(&format!("case_{}", k), 100 + k as u64);
        let ctrl = separated_image(&format!("ctrl_{}", k), 200 + k as u64);
        if with_subjects {
            let subject = format!("patient_{}", k);
            images.push(case.with_subject(&subject));
            images.push(ctrl.with_subject(&subject));
        } else {
            images.push(case);
            images.push(ctrl);
        }
    }
    combine_images(images).unwrap()
}

fn groups(table: &AssociationTable) -> Outcome {
    let values = table
        .row_ids
        .iter()
        .map(|id| {
            let group = if id.starts_with("case") { "case" } else { "ctrl" };
            (id.clone(), group.to_string())
        })
        .collect();
    Outcome::Categorical {
        values,
        reference: Some("ctrl".to_string()),
    }
}

#[test]
fn test_colocalisation_separates_groups() {
    let cells = cohort(false);
    let pairs = vec![PairSpec::new("A", "B"), PairSpec::new("A", "C")];
    let batch = build_association_table(&cells, &pairs, &RADII, &params(), &BatchParams::default()).unwrap();

    assert!(batch.failures.is_empty());
    assert_eq!(batch.table.nrows(), 6);
    let col = batch.table.column_index("A__B").unwrap();
    for (row, id) in batch.table.row_ids.iter().enumerate() {
        let value = batch.table.get(row, col).unwrap();
        if id.starts_with("case") {
            assert!(value > 50.0, "{} = {}", id, value);
        } else {
            // no pair closer than 200
            assert!((value + 50.0).abs() < 1e-9, "{} = {}", id, value);
        }
    }

    let weights = fit_weights(&batch.table, &batch.counts, &WeightParams::default()).unwrap();
    let results = fit_outcome_association(
        &batch.table,
        &groups(&batch.table),
        Some(&weights),
        None,
        None,
        &OutcomeParams::default(),
    )
    .unwrap();

    assert_eq!(results.len(), 2);
    let top = &results[0];
    assert_eq!(top.column, "A__B");
    assert_eq!(top.term, "case");
    assert_eq!(top.model, ModelKind::Linear);
    assert_eq!(top.n_obs, 6);
    assert!(top.coefficient.unwrap() > 100.0);
    assert!(top.p_value.unwrap() < 0.05);
    assert!(top.fdr.unwrap() >= top.p_value.unwrap());
}

#[test]
fn test_contextual_columns_from_hierarchy() {
    let cells = cohort(false);
    let mut parents = BTreeMap::new();
    parents.insert("tumour".to_string(), vec!["B".to_string(), "C".to_string()]);
    let hierarchy = CellTypeHierarchy::new(parents, &["A", "B", "C"]).unwrap();
    let combinations = parent_combinations(&["A", "B", "C", "D"], &hierarchy);
    assert_eq!(combinations.failures.len(), 1);
    let combinations = combinations.combinations;
    let pairs = PairSpec::from_combinations(&combinations, &hierarchy).unwrap();
    let batch = build_association_table(&cells, &pairs, &RADII, &params(), &BatchParams::default()).unwrap();

    assert_eq!(batch.table.ncols(), combinations.len());
    let col = batch.table.column_index("A__B__tumour").unwrap();
    let mut case = Vec::new();
    let mut ctrl = Vec::new();
    for (row, id) in batch.table.row_ids.iter().enumerate() {
        let value = batch.table.get(row, col).unwrap();
        if id.starts_with("case") {
            case.push(value);
        } else {
            ctrl.push(value);
        }
    }
    // B is enriched around A relative to the tumour population only in cases
    assert!(case.iter().all(|v| *v > 0.0));
    assert!(ctrl.iter().all(|v| *v < 0.0));
}

#[test]
fn test_repeated_measures_use_mixed_model() {
    let cells = cohort(true);
    let pairs = vec![PairSpec::new("A", "B")];
    let batch = build_association_table(&cells, &pairs, &RADII, &params(), &BatchParams::default()).unwrap();
    let subjects = batch.table.subject_map().unwrap();
    assert_eq!(subjects["case_1"], "patient_1");

    let results = fit_outcome_association(
        &batch.table,
        &groups(&batch.table),
        None,
        Some(&subjects),
        None,
        &OutcomeParams::default(),
    )
    .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].model, ModelKind::Mixed);
    assert!(results[0].coefficient.unwrap() > 100.0);
    assert!(results[0].p_value.is_some());

    // one row per patient after collapsing
    let collapsed = batch.collapse_to_subjects().unwrap();
    assert_eq!(collapsed.table.row_ids, vec!["patient_0", "patient_1", "patient_2"]);
}

#[test]
fn test_table_export() {
    let cells = cohort(false);
    let pairs = vec![PairSpec::new("A", "B")];
    let batch = build_association_table(&cells, &pairs, &RADII, &params(), &BatchParams::default()).unwrap();
    let mut buffer = Vec::new();
    batch.table.write_tsv(&mut buffer).unwrap();
    let text = String::from_utf8(buffer).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("image_id\tA__B"));
    assert_eq!(text.lines().count(), 7);
    assert!(text.lines().any(|l| l.starts_with("ctrl_0\t-50")));
}

#[test]
fn test_dispersed_random_and_localised_images() {
    let big = Rect::new(0.0, 2000.0, 0.0, 2000.0).unwrap();
    let params = PointPatternParams {
        window: WindowKind::Fixed(big),
        ..PointPatternParams::default()
    };
    let mut rng = StdRng::seed_from_u64(42);

    // image 1: A and B in exclusive regions
    let left = Rect::new(0.0, 800.0, 0.0, 2000.0).unwrap();
    let right = Rect::new(1200.0, 2000.0, 0.0, 2000.0).unwrap();
    let a1 = uniform_points(150, &left, &mut rng);
    let b1 = uniform_points(150, &right, &mut rng);
    // image 2: both types interleaved in one small patch
    let patch = Rect::new(980.0, 1020.0, 980.0, 1020.0).unwrap();
    let a2 = uniform_points(150, &patch, &mut rng);
    let b2 = uniform_points(150, &patch, &mut rng);
    // image 3: both types random
    let a3 = uniform_points(150, &big, &mut rng);
    let b3 = uniform_points(150, &big, &mut rng);

    let images = vec![
        SyntheticImage::new("image_1").add("A", &a1).add("B", &b1),
        SyntheticImage::new("image_2").add("A", &a2).add("B", &b2),
        SyntheticImage::new("image_3").add("A", &a3).add("B", &b3),
    ];
    let single: Vec<f64> = images
        .iter()
        .map(|img| {
            let cells = img.clone().into_image();
            kontextual::point_pattern_statistic(&cells, "A", "B", &RADII, &params)
                .unwrap()
                .unwrap()
                .summary()
        })
        .collect();
    assert!(single[1] > single[2]);
    assert!(single[2] > single[0]);

    let cells = combine_images(images).unwrap();
    let batch =
        build_association_table(&cells, &[PairSpec::new("A", "B")], &RADII, &params, &BatchParams::default())
            .unwrap();
    for (row, value) in single.iter().enumerate() {
        assert!((batch.table.get(row, 0).unwrap() - value).abs() < 1e-9);
    }

    let label: BTreeMap<String, String> = [("image_1", "0"), ("image_2", "1"), ("image_3", "0")]
        .iter()
        .map(|(id, g)| (id.to_string(), g.to_string()))
        .collect();
    let outcome = Outcome::Categorical {
        values: label,
        reference: None,
    };
    let results =
        fit_outcome_association(&batch.table, &outcome, None, None, None, &OutcomeParams::default()).unwrap();
    assert_eq!(results[0].column, "A__B");
    assert_eq!(results[0].term, "1");
    assert!(results[0].coefficient.unwrap() > 0.0);
    assert!(results[0].p_value.unwrap() < 0.05);
}
