// tests/pipeline_tests.rs
mod common;

use common::{keyword_config, keyword_lines, pipeline_over};
use linewright::{
    clustering, ActionOnDuplicateKey, Cluster, CollectingSink, CompletionStatus,
    DeferTransformation, FnSource, GlobalCache, InputFormat, IntakeLine, OutputFormat,
    PipelineConfig, RejectedRecordAction, Router, StreamPipeline, Transformer,
};
use parking_lot::Mutex;
use regex::Regex;
use rstest::rstest;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_keyword_stream_clusters_on_marker() {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let seen = sizes.clone();

    let (pipeline, sink) = pipeline_over(keyword_config(), &keyword_lines());
    let pipeline = pipeline
        .with_cluster_marker(clustering::field_matches("RECTYPE", Regex::new("^XYZ$").unwrap()))
        .with_transformer(Transformer::cluster(move |cluster, _| {
            seen.lock().push((cluster.clstr_no(), cluster.count()));
            Ok(Some(cluster))
        }));

    let result = pipeline.execute().await;

    assert_eq!(result.completion_status, CompletionStatus::IntakeDepleted);
    assert_eq!(result.rows_read, 12);
    assert_eq!(result.clusters_read, 2);
    assert_eq!(result.rows_written, 12);
    assert_eq!(result.clusters_written, 2);
    assert_eq!(*sizes.lock(), vec![(1, 5), (2, 7)]);

    let lines = sink.lines(1);
    assert_eq!(lines.len(), 12);
    assert_eq!(lines[0], "@pRECTYPE=XYZ,@pNUM=123");
    assert_eq!(lines[11], "@pRECTYPE=ABC,@pNUM=134");
}

#[tokio::test]
async fn test_marker_ending_clusters() {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let seen = sizes.clone();

    let config = PipelineConfig {
        marker_starts_cluster: false,
        ..keyword_config()
    };
    let (pipeline, _sink) = pipeline_over(config, &keyword_lines());
    let pipeline = pipeline
        .with_cluster_marker(clustering::field_matches("RECTYPE", Regex::new("^XYZ$").unwrap()))
        .with_transformer(Transformer::cluster(move |cluster, _| {
            seen.lock().push(cluster.count());
            Ok(Some(cluster))
        }));

    let result = pipeline.execute().await;

    assert_eq!(result.completion_status, CompletionStatus::IntakeDepleted);
    // XYZ at lines 1 and 6 closes a cluster; the tail is flushed at the end
    assert_eq!(*sizes.lock(), vec![1, 5, 6]);
}

#[tokio::test]
async fn test_on_the_fly_positional_names() {
    let config = PipelineConfig {
        allow_on_the_fly_input_fields: true,
        ..Default::default()
    };
    let (pipeline, sink) = pipeline_over(config, &["1,2,3,4,5,6,7,8,9,10,11,12"]);

    let result = pipeline.execute().await;

    assert_eq!(result.completion_status, CompletionStatus::IntakeDepleted);
    let expected: Vec<String> = (1..=12).map(|i| format!("Fld{:03}", i)).collect();
    assert_eq!(pipeline.registry().fields(), expected);
    assert_eq!(sink.lines(1), vec!["1,2,3,4,5,6,7,8,9,10,11,12"]);
}

#[tokio::test]
async fn test_undeclared_fields_are_dropped() {
    let config = PipelineConfig {
        input_fields: vec!["ID".to_string(), "NAME".to_string()],
        ..Default::default()
    };
    let (pipeline, sink) = pipeline_over(config, &["1,Ann,extra", "2,Bob"]);

    let result = pipeline.execute().await;

    assert_eq!(result.rows_written, 2);
    assert_eq!(sink.lines(1), vec!["1,Ann", "2,Bob"]);
    assert_eq!(pipeline.registry().fields(), vec!["ID", "NAME"]);
}

#[tokio::test]
async fn test_headers_in_and_out() {
    let config = PipelineConfig {
        headers_in_first_input_row: true,
        headers_in_first_output_row: true,
        ..Default::default()
    };
    let (pipeline, sink) = pipeline_over(config, &["ID,NAME", "1,Ann", "2,Bob"]);

    let result = pipeline.execute().await;

    assert_eq!(result.rows_read, 2);
    assert_eq!(result.rows_written, 2);
    assert_eq!(sink.lines(1), vec!["ID,NAME", "1,Ann", "2,Bob"]);
}

#[rstest]
#[case::ignore(ActionOnDuplicateKey::IgnoreItem, vec!["A=1,B=2"])]
#[case::replace(ActionOnDuplicateKey::ReplaceItem, vec!["A=3,B=2"])]
#[case::default_key(ActionOnDuplicateKey::AssignDefaultKey, vec!["A=1,B=2,Fld003=3"])]
#[case::exclude(ActionOnDuplicateKey::ExcludeRecord, vec![])]
#[tokio::test]
async fn test_duplicate_key_policy(
    #[case] action: ActionOnDuplicateKey,
    #[case] expected: Vec<&str>,
) {
    let config = PipelineConfig {
        input_format: InputFormat::Keyword,
        output_format: OutputFormat::Keyword,
        allow_on_the_fly_input_fields: true,
        action_on_duplicate_key: action,
        ..Default::default()
    };
    let (pipeline, sink) = pipeline_over(config, &["A=1,B=2,A=3"]);

    let result = pipeline.execute().await;

    assert_eq!(result.completion_status, CompletionStatus::IntakeDepleted);
    assert_eq!(result.rows_read, 1);
    assert_eq!(sink.lines(1), expected);
}

#[tokio::test]
async fn test_record_transformer_and_filter() {
    let config = PipelineConfig {
        input_fields: vec!["ID".to_string(), "NAME".to_string()],
        ..Default::default()
    };
    let (pipeline, sink) = pipeline_over(config, &["1,ann", "2,bob", "3,cy"]);
    let pipeline = pipeline.with_transformer(Transformer::record(|mut record, _| {
        if record.get_str("ID") == "2" {
            return Ok(None);
        }
        let upper = record.get_str("NAME").to_uppercase();
        record.set_value("NAME", upper);
        Ok(Some(record))
    }));

    let result = pipeline.execute().await;

    assert_eq!(result.rows_read, 3);
    assert_eq!(result.clusters_read, 3);
    assert_eq!(result.rows_written, 2);
    // the emptied cluster is not written
    assert_eq!(result.clusters_written, 2);
    assert_eq!(sink.lines(1), vec!["1,ANN", "3,CY"]);
}

#[tokio::test]
async fn test_universal_transformer_splits_clusters() {
    let (pipeline, sink) = pipeline_over(keyword_config(), &keyword_lines());
    let pipeline = pipeline
        .with_cluster_marker(clustering::field_matches("RECTYPE", Regex::new("^XYZ$").unwrap()))
        .with_transformer(Transformer::universal(|cluster, _| {
            let clstr_no = cluster.clstr_no();
            let (heads, rest): (Vec<_>, Vec<_>) = cluster
                .into_records()
                .into_iter()
                .partition(|r| r.get_str("RECTYPE") == "XYZ");
            Ok(vec![
                Cluster::new(clstr_no, heads),
                Cluster::new(clstr_no, rest),
            ])
        }));

    let result = pipeline.execute().await;

    assert_eq!(result.clusters_read, 2);
    assert_eq!(result.clusters_written, 4);
    assert_eq!(result.rows_written, 12);
    assert_eq!(sink.lines(1).len(), 12);
}

#[tokio::test]
async fn test_deferred_indefinitely_keeps_clusters() {
    let config = PipelineConfig {
        defer_transformation: DeferTransformation::Indefinitely,
        ..keyword_config()
    };
    let (pipeline, sink) = pipeline_over(config, &keyword_lines());
    let pipeline = pipeline
        .with_cluster_marker(clustering::field_matches("RECTYPE", Regex::new("^XYZ$").unwrap()))
        .with_transformer(Transformer::cluster(|_, _| anyhow::bail!("never transformed")));

    let result = pipeline.execute().await;

    assert_eq!(result.completion_status, CompletionStatus::IntakeDepleted);
    assert_eq!(result.clusters_read, 2);
    assert_eq!(result.rows_written, 0);

    let deferred = pipeline.deferred_clusters();
    let sizes: Vec<usize> = deferred.iter().map(|c| c.count()).collect();
    assert_eq!(sizes, vec![5, 7]);
    assert!(pipeline.deferred_clusters().is_empty());
    assert_eq!(sink.collected().ends.get(&1), Some(&1));
}

#[tokio::test]
async fn test_transformation_waits_for_clustering() {
    let supplied = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(Mutex::new(Vec::new()));

    let counter = supplied.clone();
    let source = FnSource(move |_: &GlobalCache| -> anyhow::Result<Option<IntakeLine>> {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((n <= 6).then(|| IntakeLine::new(format!("{},x", n), 1)))
    });
    let sink = CollectingSink::new();
    let config = PipelineConfig {
        defer_transformation: DeferTransformation::UntilClusteringCompleted,
        allow_on_the_fly_input_fields: true,
        buffer_size: Some(1),
        ..Default::default()
    };

    let seen = observed.clone();
    let counter = supplied.clone();
    let pipeline = StreamPipeline::new(config, source, sink.clone())
        .unwrap()
        .with_transformer(Transformer::cluster(move |cluster, _| {
            seen.lock().push(counter.load(Ordering::SeqCst));
            Ok(Some(cluster))
        }));

    let result = pipeline.execute().await;

    assert_eq!(result.rows_written, 6);
    // the source had already reported its end for every transformation
    assert!(observed.lock().iter().all(|&n| n == 7));
    assert_eq!(sink.lines(1)[0], "1,x");
}

#[tokio::test]
async fn test_concurrent_transformation_delivers_everything() {
    let lines: Vec<String> = (1..=40).map(|i| format!("{}", i)).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let config = PipelineConfig {
        input_format: InputFormat::Raw,
        output_format: OutputFormat::Raw,
        concurrency_level: 4,
        buffer_size: Some(4),
        ..Default::default()
    };
    let (pipeline, sink) = pipeline_over(config, &refs);
    let pipeline = pipeline.with_transformer(Transformer::cluster(|cluster, _| {
        std::thread::sleep(std::time::Duration::from_millis((cluster.clstr_no() % 3) as u64));
        Ok(Some(cluster))
    }));

    let result = pipeline.execute().await;

    assert_eq!(result.completion_status, CompletionStatus::IntakeDepleted);
    assert_eq!(result.clusters_written, 40);
    let mut written: Vec<usize> = sink.lines(1).iter().map(|l| l.parse().unwrap()).collect();
    written.sort_unstable();
    assert_eq!(written, (1..=40).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_order_preserved_at_concurrency_one() {
    let lines: Vec<String> = (1..=25).map(|i| i.to_string()).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let config = PipelineConfig {
        input_format: InputFormat::Raw,
        output_format: OutputFormat::Raw,
        buffer_size: Some(2),
        ..Default::default()
    };
    let (pipeline, sink) = pipeline_over(config, &refs);

    pipeline.execute().await;

    assert_eq!(sink.lines(1), lines);
}

#[tokio::test]
async fn test_record_initiator_fills_trace_bin() {
    let traced = Arc::new(Mutex::new(Vec::new()));
    let seen = traced.clone();

    let (pipeline, sink) = pipeline_over(keyword_config(), &keyword_lines());
    let pipeline = pipeline
        .with_record_initiator(|record, bin| {
            let num: i64 = record.get_str("NUM").parse()?;
            if record.get_str("RECTYPE") == "XYZ" {
                bin.insert("head", true);
            }
            Ok(num % 2 == 0)
        })
        .with_transformer(Transformer::record(move |record, _| {
            let head = record.trace_bin().and_then(|bin| bin.get("head"));
            seen.lock().push((record.rec_no(), head.is_some()));
            Ok(Some(record))
        }));

    let result = pipeline.execute().await;

    assert_eq!(result.rows_read, 12);
    assert_eq!(result.rows_written, 6);
    assert_eq!(sink.lines(1)[0], "@pRECTYPE=ABC,@pNUM=124");
    // NUM=128 is the only even XYZ record
    let traced = traced.lock();
    assert_eq!(traced.iter().filter(|(_, head)| *head).count(), 1);
    assert!(traced.contains(&(6, true)));
}

#[tokio::test]
async fn test_rejected_records_can_be_retained() {
    let config = PipelineConfig {
        rejected_record_action: RejectedRecordAction::Retain,
        ..keyword_config()
    };
    let (pipeline, _sink) = pipeline_over(config, &keyword_lines());
    let pipeline = pipeline.with_record_initiator(|_, _| Ok(false));

    let result = pipeline.execute().await;

    assert_eq!(result.rows_written, 12);
}

#[tokio::test]
async fn test_routing_to_several_targets() {
    let (pipeline, sink) = pipeline_over(keyword_config(), &keyword_lines());
    let pipeline = pipeline.with_router(Router::per_record(|record, _| {
        Ok(if record.get_str("RECTYPE") == "XYZ" { 2 } else { 1 })
    }));

    let result = pipeline.execute().await;

    assert_eq!(result.rows_written, 12);
    let collected = sink.collected();
    assert_eq!(collected.lines.get(&1).map(Vec::len), Some(10));
    assert_eq!(collected.lines.get(&2).map(Vec::len), Some(2));
    assert_eq!(collected.ends.get(&1), Some(&1));
    assert_eq!(collected.ends.get(&2), Some(&1));
}

#[tokio::test]
async fn test_global_cache_from_transformer() {
    let config = PipelineConfig {
        global_cache_elements: vec!["Total|0".to_string(), "Label|\"sum\"".to_string()],
        concurrency_level: 3,
        ..keyword_config()
    };
    let (pipeline, _sink) = pipeline_over(config, &keyword_lines());
    let pipeline = pipeline.with_transformer(Transformer::record(|record, cache| {
        let num: i64 = record.get_str("NUM").parse()?;
        cache.increment_value("Total", num)?;
        Ok(Some(record))
    }));

    let result = pipeline.execute().await;

    assert_eq!(result.completion_status, CompletionStatus::IntakeDepleted);
    let expected: i64 = (123..=134).sum();
    assert_eq!(pipeline.global_cache().get("Total").unwrap().as_int(), Some(expected));
    assert_eq!(pipeline.global_cache().get("Label").unwrap().as_str(), Some("sum"));
}

#[tokio::test]
async fn test_marker_combines_preassigned_numbers_with_size_limit() {
    let config = PipelineConfig {
        input_format: InputFormat::Jsonl,
        output_format: OutputFormat::Jsonl,
        allow_on_the_fly_input_fields: true,
        ..Default::default()
    };
    let lines = [
        r#"[{"a":1},{"a":2},{"a":3}]"#,
        r#"[{"a":4}]"#,
        r#"[{"a":5},{"a":6},{"a":7},{"a":8},{"a":9}]"#,
    ];
    let clusters = Arc::new(Mutex::new(Vec::new()));
    let seen = clusters.clone();

    let (pipeline, sink) = pipeline_over(config, &lines);
    let pipeline = pipeline
        // keep the parser's grouping, but never more than two records per cluster
        .with_cluster_marker(Arc::new(
            |record: &linewright::Record, previous: Option<&linewright::Record>, count: usize| {
                let new_group = previous.map_or(true, |p| p.clstr_no() != record.clstr_no());
                Ok(new_group || count == 2)
            },
        ))
        .with_transformer(Transformer::cluster(move |cluster, _| {
            assert!(cluster.iter().all(|r| r.clstr_no() == cluster.clstr_no()));
            let values: Vec<i64> = cluster.iter().filter_map(|r| r.get("a").as_int()).collect();
            seen.lock().push((cluster.clstr_no(), values));
            Ok(Some(cluster))
        }));

    let result = pipeline.execute().await;

    assert_eq!(result.completion_status, CompletionStatus::IntakeDepleted);
    assert_eq!(result.clusters_read, 6);
    assert_eq!(
        *clusters.lock(),
        vec![
            (1, vec![1, 2]),
            (2, vec![3]),
            (3, vec![4]),
            (4, vec![5, 6]),
            (5, vec![7, 8]),
            (6, vec![9]),
        ]
    );
    assert_eq!(sink.lines(1).len(), 9);
}
