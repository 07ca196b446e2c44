// tests/common/mod.rs
#![allow(dead_code)]

use linewright::{CollectingSink, IterSource, PipelineConfig, StreamPipeline};
use tracing_subscriber::EnvFilter;

/// Route pipeline logs through the test harness; `RUST_LOG` controls the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Pipeline over in-memory lines, plus a handle on what it writes
pub fn pipeline_over(config: PipelineConfig, lines: &[&str]) -> (StreamPipeline, CollectingSink) {
    init_tracing();
    let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    let sink = CollectingSink::new();
    let pipeline = StreamPipeline::new(config, IterSource::new(lines), sink.clone())
        .expect("valid pipeline configuration");
    (pipeline, sink)
}

/// Twelve keyword lines; `RECTYPE=XYZ` at lines 1 and 6
pub fn keyword_lines() -> Vec<&'static str> {
    vec![
        "@pRECTYPE=XYZ,@pNUM=123",
        "@pRECTYPE=ABC,@pNUM=124",
        "@pRECTYPE=ABC,@pNUM=125",
        "@pRECTYPE=ABC,@pNUM=126",
        "@pRECTYPE=ABC,@pNUM=127",
        "@pRECTYPE=XYZ,@pNUM=128",
        "@pRECTYPE=ABC,@pNUM=129",
        "@pRECTYPE=ABC,@pNUM=130",
        "@pRECTYPE=ABC,@pNUM=131",
        "@pRECTYPE=ABC,@pNUM=132",
        "@pRECTYPE=ABC,@pNUM=133",
        "@pRECTYPE=ABC,@pNUM=134",
    ]
}

pub fn keyword_config() -> PipelineConfig {
    PipelineConfig {
        input_format: linewright::InputFormat::Keyword,
        output_format: linewright::OutputFormat::Keyword,
        input_key_prefix: "@p".to_string(),
        output_key_prefix: "@p".to_string(),
        allow_on_the_fly_input_fields: true,
        ..Default::default()
    }
}
