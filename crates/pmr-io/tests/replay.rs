//! End-to-end: text trace -> parser -> replay -> process checker -> sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pmr_core::{parse_trace, EngineKind, OperationRegistry, Trace, TraceError, TraceOptions};
use pmr_io::{
    open_sink, Checker, FnChecker, JsonSink, MemoryImage, MemorySink, OutputLevel, ProcessChecker,
    ReplayConfig, Replayer, RunReport, SinkKind, Verdict,
};

/// Fails when the first byte of the image is 0x11.
const STALE_FIRST_BYTE: &str = r#"test "$(od -An -tx1 -N1 "$1" | tr -d ' ')" != 11"#;

fn parse(text: &str) -> Result<Trace, TraceError> {
    parse_trace(
        text.as_bytes(),
        &OperationRegistry::builtin(),
        &TraceOptions::default(),
    )
}

fn sh(script: &str) -> Arc<dyn Checker> {
    Arc::new(ProcessChecker::new(
        PathBuf::from("sh"),
        vec!["-c".into(), script.into(), "checker".into()],
        None,
    ))
}

fn target(dir: &Path) -> MemoryImage {
    let path = dir.join("pool.img");
    std::fs::write(&path, [0u8; 16]).unwrap();
    MemoryImage::open(&path).unwrap()
}

async fn replay(kind: EngineKind, trace: &Trace, checker: Arc<dyn Checker>) -> RunReport {
    let dir = tempfile::tempdir().unwrap();
    let replayer = Replayer::new(
        ReplayConfig::new(dir.path().join("scratch")),
        kind.engine(),
        checker,
    );
    let mut sink = MemorySink::default();
    replayer
        .run(trace, target(dir.path()), &mut sink)
        .await
        .unwrap()
}

/// Parse `text` and replay it; the checker only runs if parsing succeeds.
async fn check_text(
    text: &str,
    kind: EngineKind,
    checker: Arc<dyn Checker>,
) -> Result<RunReport, TraceError> {
    let trace = parse(text)?;
    Ok(replay(kind, &trace, checker).await)
}

#[tokio::test]
async fn test_single_store_with_passing_checker() {
    let trace = parse("STORE;0x0;0xAB;0x1\nFLUSH;0x0;0x1\nFENCE\n").unwrap();
    let report = replay(EngineKind::NoReorder, &trace, sh("exit 0")).await;
    assert_eq!(report.candidates, 1);
    assert_eq!(report.passed, 1);
    assert!(report.is_consistent());
}

#[tokio::test]
async fn test_overlapping_stores_detect_stale_ordering() {
    let trace = parse(
        "START\n\
         STORE;0x0;0x1111111111111111;0x8\n\
         STORE;0x0;0x2222222222222222;0x8\n\
         FLUSH;0x0;0x8\n\
         FENCE\n\
         STOP\n",
    )
    .unwrap();

    let report = replay(EngineKind::Full, &trace, sh(STALE_FIRST_BYTE)).await;
    assert_eq!(report.candidates, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].descriptor.applied, vec![2, 1]);

    let baseline = replay(EngineKind::NoReorder, &trace, sh(STALE_FIRST_BYTE)).await;
    assert!(baseline.is_consistent());
}

#[tokio::test]
async fn test_single_line_trace_with_record_separator() {
    let trace =
        parse("START|STORE;0x0;0x1;0x1|STORE;0x8;0x2;0x1|FLUSH;0x0;0x10|FENCE|STOP").unwrap();
    let report = replay(EngineKind::PartialAccumulative, &trace, sh("exit 0")).await;
    assert_eq!(report.candidates, 4);
}

#[tokio::test]
async fn test_unmatched_start_never_reaches_checker() {
    let checker = Arc::new(FnChecker::new("counting", |_: &[u8]| Verdict::pass()));

    let err = check_text(
        "START\nSTORE;0x0;0x1;0x1\nSTART\nSTOP\n",
        EngineKind::Full,
        checker.clone(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TraceError::MalformedTrace { record: 2, .. }));

    let err = check_text("START\nSTORE;0x0;0x1;0x1\n", EngineKind::Full, checker.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::MalformedTrace { record: 0, .. }));
    assert_eq!(checker.calls(), 0);

    // The same path does reach the checker once the trace is well formed.
    let report = check_text("START\nSTORE;0x0;0x1;0x1\nSTOP\n", EngineKind::Full, checker.clone())
        .await
        .unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(checker.calls(), 1);
}

#[tokio::test]
async fn test_json_sink_writes_one_line_per_candidate_and_summary() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("results.jsonl");
    let trace = parse("STORE;0x0;0x1;0x1\nSTORE;0x1;0x2;0x1\nFLUSH;0x0;0x2\nFENCE\n").unwrap();

    let replayer = Replayer::new(
        ReplayConfig::new(dir.path().join("scratch")),
        EngineKind::Partial.engine(),
        sh("exit 0"),
    );
    let mut sink = open_sink(SinkKind::Json, Some(&output), OutputLevel::Debug).unwrap();
    let report = replayer
        .run(&trace, target(dir.path()), sink.as_mut())
        .await
        .unwrap();
    drop(sink);

    assert_eq!(report.candidates, 2);
    let text = std::fs::read_to_string(&output).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2]["type"], "summary");
    assert_eq!(lines[2]["passed"], 2);
}

#[tokio::test]
async fn test_json_sink_respects_level() {
    let dir = tempfile::tempdir().unwrap();
    let trace = parse("STORE;0x0;0x1;0x1\nFLUSH;0x0;0x1\nFENCE\n").unwrap();
    let replayer = Replayer::new(
        ReplayConfig::new(dir.path().join("scratch")),
        EngineKind::NoReorder.engine(),
        sh("exit 0"),
    );
    let mut sink = JsonSink::new(Vec::new(), OutputLevel::Warning);
    replayer
        .run(&trace, target(dir.path()), &mut sink)
        .await
        .unwrap();
    let text = String::from_utf8(sink.into_inner()).unwrap();
    assert_eq!(text.lines().count(), 1);
}
