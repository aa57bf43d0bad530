use kira_refinery::frame::Frame;
use kira_refinery::merge::MergeEngine;

fn frame(sample: &str, features: &[&str], values: &[f64]) -> Frame {
    Frame::single(
        sample,
        features.iter().map(|f| f.to_string()).collect(),
        values.to_vec(),
    )
    .unwrap()
}

fn scenario_a() -> Vec<Frame> {
    vec![
        frame("GSM1", &["g1", "g2", "g3"], &[1.0, 2.0, 3.0]),
        frame("GSM2", &["g1", "g2", "g3"], &[4.0, 5.0, 6.0]),
    ]
}

#[test]
fn identical_indices_join_without_loss() {
    let report = MergeEngine::merge("GSE1", scenario_a());
    let table = report.table.unwrap();
    assert_eq!(table.shape(), (3, 2));
    assert_eq!(table.index(), ["g1", "g2", "g3"]);
    assert_eq!(table.column_by_name("GSM2"), Some(&[4.0, 5.0, 6.0][..]));
    assert!(report.warnings.is_empty());
    assert!(report.unsmashable.is_empty());
}

#[test]
fn partial_overlap_drops_rows_with_warning() {
    let mut frames = scenario_a();
    frames.push(frame("GSM3", &["g1", "g4"], &[7.0, 8.0]));

    let report = MergeEngine::merge("GSE1", frames);
    let table = report.table.unwrap();
    assert_eq!(table.shape(), (1, 3));
    assert_eq!(table.index(), ["g1"]);
    assert_eq!(table.column_by_name("GSM3"), Some(&[7.0][..]));
    assert_eq!(report.warnings, vec!["Dropped rows while smashing GSE1: 3 -> 1"]);
}

#[test]
fn disjoint_frame_is_rolled_back() {
    let mut frames = scenario_a();
    frames.push(frame("GSM3", &["g1", "g4"], &[7.0, 8.0]));
    let before = MergeEngine::merge("GSE1", frames.clone()).table.unwrap();

    frames.push(frame("GSM4", &["g9"], &[9.0]));
    let report = MergeEngine::merge("GSE1", frames);
    assert_eq!(report.table.unwrap(), before);
    assert_eq!(report.unsmashable, vec!["GSM4"]);
}

#[test]
fn merged_rows_never_exceed_smallest_input() {
    let frames = vec![
        frame("A", &["g1", "g2", "g3", "g4"], &[1.0, 2.0, 3.0, 4.0]),
        frame("B", &["g4", "g2", "g1"], &[1.0, 2.0, 3.0]),
        frame("C", &["g2", "g4", "g5", "g1"], &[1.0, 2.0, 3.0, 4.0]),
        frame("D", &["x"], &[0.0]),
    ];
    let report = MergeEngine::merge("ALL", frames);
    let table = report.table.unwrap();
    assert!(table.num_rows() <= 3);
    assert_eq!(table.num_columns(), 3);
    assert_eq!(table.index(), ["g1", "g2", "g4"]);
    assert_eq!(table.column_by_name("B"), Some(&[3.0, 2.0, 1.0][..]));
    assert_eq!(report.unsmashable, vec!["D"]);
}
