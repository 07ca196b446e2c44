// tests/format_tests.rs
mod common;

use common::pipeline_over;
use linewright::{
    CompletionStatus, InputFormat, OutputFormat, PipelineConfig, QuotationMode, Transformer,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn converting(input_format: InputFormat, output_format: OutputFormat) -> PipelineConfig {
    PipelineConfig {
        input_format,
        output_format,
        allow_on_the_fly_input_fields: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_jsonl_round_trip_is_byte_exact() {
    let lines = [
        r#"{"id":7,"price":1.50,"name":"Ann \"A\"","ok":false,"note":null}"#,
        r#"{"id":8,"price":1e3,"name":"Bo\\b","ok":true,"note":"x"}"#,
        r#"{"id":-12345678901234567890,"price":0.000,"name":"","ok":true,"note":null}"#,
    ];
    let (pipeline, sink) = pipeline_over(converting(InputFormat::Jsonl, OutputFormat::Jsonl), &lines);

    let result = pipeline.execute().await;

    assert_eq!(result.completion_status, CompletionStatus::IntakeDepleted);
    assert_eq!(sink.lines(1), lines);
}

#[tokio::test]
async fn test_delimited_round_trip_keeps_quoting() {
    let lines = [r#"1,"Smith, John",x"#, r#"2,"say ""hi""",y"#, "3,plain,z"];
    let (pipeline, sink) =
        pipeline_over(converting(InputFormat::Delimited, OutputFormat::Delimited), &lines);

    pipeline.execute().await;

    assert_eq!(sink.lines(1), lines);
}

#[tokio::test]
async fn test_delimited_with_header_to_keyword() {
    let config = PipelineConfig {
        headers_in_first_input_row: true,
        output_key_prefix: "@p".to_string(),
        ..converting(InputFormat::Delimited, OutputFormat::Keyword)
    };
    let (pipeline, sink) = pipeline_over(config, &["ID,NAME", "1,Ann", "2,Bob"]);

    let result = pipeline.execute().await;

    assert_eq!(result.rows_read, 2);
    assert_eq!(sink.lines(1), vec!["@pID=1,@pNAME=Ann", "@pID=2,@pNAME=Bob"]);
}

#[tokio::test]
async fn test_flat_input_to_delimited() {
    let config = PipelineConfig {
        input_fields: vec!["ID|3".to_string(), "NAME|6".to_string(), "CITY|8".to_string()],
        trim_input_values: true,
        ..converting(InputFormat::Flat, OutputFormat::Delimited)
    };
    let (pipeline, sink) = pipeline_over(config, &["001Ann   Boston  ", "002Bo    Rome"]);

    pipeline.execute().await;

    assert_eq!(sink.lines(1), vec!["001,Ann,Boston", "002,Bo,Rome"]);
}

#[tokio::test]
async fn test_delimited_to_flat_with_header() {
    let config = PipelineConfig {
        input_fields: vec!["ID".to_string(), "NAME".to_string()],
        output_fields: vec!["ID|4".to_string(), "NAME|5".to_string()],
        headers_in_first_output_row: true,
        ..converting(InputFormat::Delimited, OutputFormat::Flat)
    };
    let (pipeline, sink) = pipeline_over(config, &["1,Ann", "22,Bartholomew"]);

    pipeline.execute().await;

    assert_eq!(sink.lines(1), vec!["ID  NAME ", "1   Ann  ", "22  Barth"]);
}

#[tokio::test]
async fn test_typed_fields_and_quotation_mode() {
    let config = PipelineConfig {
        input_fields: vec!["NAME".to_string(), "AMT".to_string(), "DOB".to_string()],
        explicit_type_definitions: "AMT|M, DOB|D|%Y%m%d".to_string(),
        quotation_mode: QuotationMode::StringsAndDates,
        ..converting(InputFormat::Delimited, OutputFormat::Delimited)
    };
    let values = Arc::new(Mutex::new(Vec::new()));
    let seen = values.clone();
    let (pipeline, sink) = pipeline_over(config, &["Ann,12.50,19800101", "Bob,oops,19800230"]);
    let pipeline = pipeline.with_transformer(Transformer::record(move |record, _| {
        seen.lock().push(record.get("AMT").as_decimal());
        Ok(Some(record))
    }));

    pipeline.execute().await;

    // unparseable values become the zero value; the text is kept
    assert_eq!(*values.lock(), vec![Some(12.5), Some(0.0)]);
    assert_eq!(
        sink.lines(1),
        vec![r#""Ann",12.50,"19800101""#, r#""Bob",oops,"19800230""#]
    );
}

#[tokio::test]
async fn test_nested_json_is_flattened() {
    let (pipeline, sink) = pipeline_over(
        converting(InputFormat::Jsonl, OutputFormat::Keyword),
        &[r#"{"user":{"name":"Al","tags":["a","b"]},"n":1}"#],
    );

    pipeline.execute().await;

    assert_eq!(sink.lines(1), vec!["user.name=Al,user.tags.0=a,user.tags.1=b,n=1"]);
}

#[tokio::test]
async fn test_json_arrays_form_clusters() {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let seen = sizes.clone();
    let (pipeline, sink) = pipeline_over(
        converting(InputFormat::Jsonl, OutputFormat::Jsonl),
        &[r#"[{"a":1},{"a":2}]"#, r#"[{"a":3}]"#],
    );
    let pipeline = pipeline.with_transformer(Transformer::cluster(move |cluster, _| {
        seen.lock().push((cluster.clstr_no(), cluster.count()));
        Ok(Some(cluster))
    }));

    let result = pipeline.execute().await;

    assert_eq!(result.rows_read, 2);
    assert_eq!(result.clusters_read, 2);
    assert_eq!(result.rows_written, 3);
    assert_eq!(*sizes.lock(), vec![(1, 2), (2, 1)]);
    assert_eq!(sink.lines(1), vec![r#"{"a":1}"#, r#"{"a":2}"#, r#"{"a":3}"#]);
}

#[tokio::test]
async fn test_raw_lines_pass_through() {
    let lines = ["first line, with commas", "", "  indented"];
    let (pipeline, sink) = pipeline_over(converting(InputFormat::Raw, OutputFormat::Raw), &lines);

    pipeline.execute().await;

    assert_eq!(sink.lines(1), lines);
}
