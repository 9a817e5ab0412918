//! Integration tests for the record batch handlers
//!
//! These tests drive the handlers through batches built from points:
//! - Grouping partitions and descriptor consistency
//! - Multi-source joins with and without tolerance
//! - Aggregation across grouped batch sets
//! - Per-group threshold state machines

use std::time::Duration;

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::datatypes::{Float64Type, Int64Type};
use chrono::{DateTime, TimeZone, Utc};

use kuba_stream::handlers::{
    AggregateHandler, AggregateOptions, GroupHandler, JoinHandler, JoinOptions, ThresholdOptions,
    ThresholdState, ThresholdStateMachine, ThresholdStateMachineFactory,
};
use kuba_stream::metadata::{extract_group_metadata, time_column_name, GroupDescriptor};
use kuba_stream::{
    FieldValue, PerGroupHandler, Point, PointsConverter, RecordBatchHandler, StatefulHandler,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).unwrap()
}

fn to_batch(points: &[Point]) -> RecordBatch {
    PointsConverter::default()
        .to_record_batch(points)
        .expect("Failed to convert points")
}

fn to_points(batches: &[RecordBatch]) -> Vec<Point> {
    PointsConverter::default()
        .to_points(batches)
        .expect("Failed to convert batches")
}

fn sample(seconds: i64, tag: &str, field: &str, value: FieldValue) -> Point {
    Point::new("m", ts(seconds)).tag("tag", tag).field(field, value)
}

fn host_points(hosts: &[&str]) -> Vec<Point> {
    hosts
        .iter()
        .enumerate()
        .map(|(i, host)| {
            Point::new("cpu", ts(i as i64))
                .tag("host", *host)
                .field("value", FieldValue::Integer(i as i64))
        })
        .collect()
}

// ============================================================================
// Group Handler
// ============================================================================

#[test]
fn test_group_keeps_relative_row_order() {
    let input = host_points(&["b", "a", "b", "c", "a", "b"]);
    let mut handler = GroupHandler::new(vec!["host".to_string()]).unwrap();
    let groups = handler.handle(to_batch(&input)).unwrap();

    let hosts: Vec<Option<Option<String>>> = groups
        .iter()
        .map(|b| {
            let descriptor = extract_group_metadata(b).unwrap().unwrap();
            descriptor.get("host").map(|v| v.map(str::to_string))
        })
        .collect();
    assert_eq!(
        hosts,
        vec![
            Some(Some("b".to_string())),
            Some(Some("a".to_string())),
            Some(Some("c".to_string())),
        ]
    );

    let values: Vec<Vec<i64>> = groups
        .iter()
        .map(|b| {
            b.column_by_name("value")
                .unwrap()
                .as_primitive::<Int64Type>()
                .values()
                .to_vec()
        })
        .collect();
    assert_eq!(values, vec![vec![0, 2, 5], vec![1, 4], vec![3]]);

    for batch in &groups {
        let descriptor = extract_group_metadata(batch).unwrap().unwrap();
        for point in to_points(std::slice::from_ref(batch)) {
            assert_eq!(
                Some(point.tags.get("host").map(String::as_str)),
                descriptor.get("host")
            );
        }
    }
}

#[test]
fn test_group_by_multiple_columns() {
    let points = vec![
        Point::new("cpu", ts(1)).tag("host", "a").tag("dc", "eu").field("v", FieldValue::Integer(1)),
        Point::new("cpu", ts(2)).tag("host", "a").tag("dc", "us").field("v", FieldValue::Integer(2)),
        Point::new("cpu", ts(3)).tag("host", "a").field("v", FieldValue::Integer(3)),
        Point::new("cpu", ts(4)).tag("host", "a").tag("dc", "eu").field("v", FieldValue::Integer(4)),
    ];
    let mut handler = GroupHandler::new(vec!["host".to_string(), "dc".to_string()]).unwrap();
    let groups = handler.handle(to_batch(&points)).unwrap();

    let descriptors: Vec<GroupDescriptor> = groups
        .iter()
        .map(|b| extract_group_metadata(b).unwrap().unwrap())
        .collect();
    assert_eq!(
        descriptors,
        vec![
            GroupDescriptor::new().with("host", Some("a")).with("dc", Some("eu")),
            GroupDescriptor::new().with("host", Some("a")).with("dc", Some("us")),
            GroupDescriptor::new().with("host", Some("a")).with("dc", None),
        ]
    );
    assert_eq!(groups[0].num_rows(), 2);
}

// ============================================================================
// Join Handler
// ============================================================================

#[test]
fn test_join_exact_match() {
    let a = to_batch(&[sample(100, "t", "field_1", FieldValue::Integer(42))]);
    let b = to_batch(&[sample(100, "t", "field_2", FieldValue::Float(3.14))]);

    let mut handler = JoinHandler::new(JoinOptions::new(vec!["tag".to_string()])).unwrap();
    let out = handler.handle_batches(vec![a, b]).unwrap();
    assert_eq!(out.len(), 1);

    let points = to_points(&out);
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].timestamp, ts(100));
    assert_eq!(points[0].tags.get("tag").map(String::as_str), Some("t"));
    assert_eq!(points[0].fields.get("field_1"), Some(&FieldValue::Integer(42)));
    assert_eq!(points[0].fields.get("field_2"), Some(&FieldValue::Float(3.14)));
}

#[test]
fn test_join_no_match_keeps_rows_apart() {
    let a = to_batch(&[
        sample(105, "t", "field_1", FieldValue::Integer(43)),
        sample(110, "o", "field_1", FieldValue::Integer(44)),
    ]);
    let b = to_batch(&[sample(110, "t", "field_2", FieldValue::Float(2.71))]);

    let mut handler = JoinHandler::new(JoinOptions::new(vec!["tag".to_string()])).unwrap();
    let out = handler.handle_batches(vec![a, b]).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].num_rows(), 3);

    let field_1 = out[0].column_by_name("field_1").unwrap();
    let field_2 = out[0].column_by_name("field_2").unwrap();
    for row in 0..3 {
        assert!(
            field_1.is_null(row) != field_2.is_null(row),
            "row {} should carry exactly one source",
            row
        );
    }
}

#[test]
fn test_join_within_tolerance() {
    let a = to_batch(&[sample(100, "t", "field_1", FieldValue::Integer(42))]);
    let b = to_batch(&[sample(103, "t", "field_2", FieldValue::Float(3.14))]);

    let options = JoinOptions::new(vec!["tag".to_string()]).with_tolerance(Duration::from_secs(5));
    let mut handler = JoinHandler::new(options).unwrap();
    let points = to_points(&handler.handle_batches(vec![a, b]).unwrap());

    assert_eq!(points.len(), 1);
    assert_eq!(points[0].timestamp, ts(100));
    assert_eq!(points[0].fields.len(), 2);
}

#[test]
fn test_join_output_is_time_ordered() {
    let a = to_batch(&[
        sample(300, "x", "f", FieldValue::Integer(3)),
        sample(100, "y", "f", FieldValue::Integer(1)),
    ]);
    let b = to_batch(&[sample(200, "x", "g", FieldValue::Integer(2))]);

    let mut handler = JoinHandler::new(JoinOptions::new(vec!["tag".to_string()])).unwrap();
    let points = to_points(&handler.handle_batches(vec![a, b]).unwrap());

    let times: Vec<DateTime<Utc>> = points.iter().map(|p| p.timestamp).collect();
    assert_eq!(times, vec![ts(100), ts(200), ts(300)]);
}

// ============================================================================
// Aggregate Handler
// ============================================================================

#[test]
fn test_group_then_aggregate() {
    let input = host_points(&["a", "b", "a", "c", "b", "a", "d", "c", "a", "b"]);
    let mut group = GroupHandler::new(vec!["host".to_string()]).unwrap();
    let mut aggregate = AggregateHandler::new(AggregateOptions::new(vec![
        "count(value) as n".parse().unwrap(),
        "max(value)".parse().unwrap(),
    ]))
    .unwrap();

    let groups = group.handle(to_batch(&input)).unwrap();
    let rows = aggregate.handle_batches(groups.clone()).unwrap();
    assert_eq!(rows.len(), groups.len());

    let total: i64 = rows
        .iter()
        .map(|b| b.column_by_name("n").unwrap().as_primitive::<Int64Type>().value(0))
        .sum();
    assert_eq!(total, 10);

    for (row, group) in rows.iter().zip(&groups) {
        assert_eq!(row.num_rows(), 1);
        assert_eq!(
            extract_group_metadata(row).unwrap(),
            extract_group_metadata(group).unwrap()
        );
        assert!(row.column_by_name("host").is_some());
        assert_eq!(time_column_name(row).unwrap(), "time");
    }
}

#[test]
fn test_aggregate_last_reproduces_single_row() {
    let point = Point::new("cpu", ts(5))
        .tag("host", "a")
        .field("value", FieldValue::Float(0.25));
    let mut group = GroupHandler::new(vec!["host".to_string()]).unwrap();
    let options =
        AggregateOptions::new(vec!["last(value)".parse().unwrap()]).with_keep_measurement(true);
    let mut aggregate = AggregateHandler::new(options).unwrap();

    let grouped = group.handle(to_batch(&[point.clone()])).unwrap();
    let out = aggregate.handle_batches(grouped).unwrap();

    let points = to_points(&out);
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].timestamp, point.timestamp);
    assert_eq!(points[0].fields, point.fields);
    assert_eq!(points[0].tags, point.tags);
}

// ============================================================================
// Threshold State Machine
// ============================================================================

fn threshold_options() -> ThresholdOptions {
    ThresholdOptions::new("value", "threshold", 10.0)
        .with_increase(2.0, Duration::from_secs(5))
        .with_decrease(0.3, 0.5, Duration::from_secs(5))
}

fn thresholds(batches: &[RecordBatch]) -> Vec<f64> {
    batches
        .iter()
        .flat_map(|b| {
            b.column_by_name("threshold")
                .unwrap()
                .as_primitive::<Float64Type>()
                .values()
                .to_vec()
        })
        .collect()
}

#[test]
fn test_threshold_state_per_group() {
    let points: Vec<Point> = [(100, "a", 15.0), (100, "b", 5.0), (106, "a", 15.0), (106, "b", 5.0)]
        .iter()
        .map(|&(t, host, v)| {
            Point::new("cpu", ts(t))
                .tag("host", host)
                .field("value", FieldValue::Float(v))
        })
        .collect();

    let factory = ThresholdStateMachineFactory::new(threshold_options()).unwrap();
    let mut machines = PerGroupHandler::new(Box::new(factory));
    let mut group = GroupHandler::new(vec!["host".to_string()]).unwrap();

    let mut emitted = Vec::new();
    for point in &points {
        let grouped = group.handle(to_batch(std::slice::from_ref(point))).unwrap();
        emitted.extend(thresholds(&machines.handle_batches(grouped).unwrap()));
    }

    assert_eq!(emitted, vec![10.0, 10.0, 20.0, 10.0]);
    assert_eq!(machines.instance_count(), 2);
}

#[test]
fn test_threshold_replay_is_deterministic() {
    let points: Vec<Point> = (0..50)
        .map(|i| {
            let value = if (i / 7) % 2 == 0 { 25.0 } else { 1.0 };
            Point::new("cpu", ts(i * 2)).field("value", FieldValue::Float(value))
        })
        .collect();
    let batch = to_batch(&points);

    let mut first = ThresholdStateMachine::new(threshold_options()).unwrap();
    let mut second = ThresholdStateMachine::new(threshold_options()).unwrap();
    let a = thresholds(&first.handle(batch.clone()).unwrap());
    let b = thresholds(&second.handle(batch).unwrap());
    assert_eq!(a, b);
    assert_eq!(first.state(), second.state());
}

#[test]
fn test_threshold_snapshot_resumes_through_trait_object() {
    let mut machine: Box<dyn StatefulHandler> =
        Box::new(ThresholdStateMachine::new(threshold_options()).unwrap());
    let batch = |t: i64, v: f64| {
        to_batch(&[Point::new("cpu", ts(t)).field("value", FieldValue::Float(v))])
    };

    machine.handle(batch(100, 2.0)).unwrap();
    let snapshot = machine.snapshot().unwrap();

    let mut restored = ThresholdStateMachine::new(threshold_options()).unwrap();
    restored.restore(&snapshot).unwrap();
    assert_eq!(restored.state(), ThresholdState::Decrease);

    let resumed = thresholds(&restored.handle(batch(105, 2.0)).unwrap());
    let original = thresholds(&machine.handle(batch(105, 2.0)).unwrap());
    assert_eq!(resumed, vec![5.0]);
    assert_eq!(resumed, original);
}
