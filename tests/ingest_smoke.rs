mod common;

use async_compression::tokio::write::GzipEncoder;
use common::{ids, orders_csv, MemoryStore};
use csv_fk_ingest::{
    reader_from_path, Compression, Identifier, IngestConfig, IngestError, Pipeline,
    PipelineState, RecordSource, SourceLocation,
};
use httpmock::prelude::*;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

async fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(data).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

const EXPORT_PATH: &str = "/exports/orders.csv";

#[tokio::test]
async fn parses_gzip_and_counts_rows() -> anyhow::Result<()> {
    let known = ids(3);
    let rows: Vec<_> = (0..100_000)
        .map(|i| (Identifier::new_random(), known[i % 3], "chair", (i % 7) as i32))
        .collect();

    let dir = tempfile::tempdir()?;
    let gz_path = dir.path().join("orders.csv.gz");
    tokio::fs::write(&gz_path, gzip(&orders_csv(&rows)).await?).await?;

    let (reader, meta) = reader_from_path(&gz_path, encoding_rs::UTF_8).await?;
    assert_eq!(meta.compression(), Compression::Gzip);

    let mut source = RecordSource::open(reader, &IngestConfig::default().format).await?;
    let mut count = 0u64;
    while let Some(record) = source.next_record().await? {
        let record = record?;
        assert_eq!(record.get("item"), Some("chair"));
        count += 1;
    }
    assert_eq!(count, 100_000);
    Ok(())
}

#[tokio::test]
async fn loads_local_file_location() -> anyhow::Result<()> {
    let known = ids(2);
    let rows = vec![
        (Identifier::new_random(), known[0], "lamp", 1),
        (Identifier::new_random(), Identifier::new_random(), "lamp", 2),
        (Identifier::new_random(), known[1], "lamp", 3),
    ];
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("orders.csv");
    tokio::fs::write(&path, orders_csv(&rows)).await?;

    let store = MemoryStore::new(known);
    let mut pipeline = Pipeline::new(IngestConfig::default(), store.clone())?;
    let result = pipeline.run(&SourceLocation::File(path)).await;

    assert!(result.is_success(), "{result}");
    assert_eq!(result.inserted, 2);
    assert_eq!(result.missing_parent, 1);
    Ok(())
}

#[tokio::test]
async fn missing_local_file_is_a_transport_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = MemoryStore::new(ids(1));
    let mut pipeline = Pipeline::new(IngestConfig::default(), store.clone())?;
    let result = pipeline
        .run(&SourceLocation::File(dir.path().join("absent.csv")))
        .await;

    assert_eq!(result.status, PipelineState::Failed);
    assert!(matches!(result.error, Some(IngestError::Transport(_))));
    // the snapshot was taken first
    assert_eq!(store.identifier_queries(), 1);
    Ok(())
}

#[tokio::test]
async fn streams_gzip_encoded_http_body() -> anyhow::Result<()> {
    let known = ids(2);
    let rows: Vec<_> = (0..1_000)
        .map(|i| {
            let customer = if i % 10 == 0 {
                Identifier::new_random()
            } else {
                known[i % 2]
            };
            (Identifier::new_random(), customer, "keyboard", 1)
        })
        .collect();
    let body = gzip(&orders_csv(&rows)).await?;

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path(EXPORT_PATH);
            then.status(200)
                .header("content-type", "text/csv")
                .header("content-encoding", "gzip")
                .body(body);
        })
        .await;

    let store = MemoryStore::new(known);
    let mut pipeline = Pipeline::new(IngestConfig::default(), store.clone())?;
    let result = pipeline
        .run(&server.url(EXPORT_PATH).parse::<SourceLocation>()?)
        .await;

    mock.assert_async().await;
    assert!(result.is_success(), "{result}");
    assert_eq!(result.read, 1_000);
    assert_eq!(result.missing_parent, 100);
    assert_eq!(result.inserted, 900);
    assert_eq!(store.committed_rows().len(), 900);
    Ok(())
}

#[tokio::test]
async fn non_success_status_is_a_transport_error() -> anyhow::Result<()> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(EXPORT_PATH);
            then.status(404);
        })
        .await;

    let store = MemoryStore::new(ids(1));
    let mut pipeline = Pipeline::new(IngestConfig::default(), store.clone())?;
    let result = pipeline
        .run(&server.url(EXPORT_PATH).parse::<SourceLocation>()?)
        .await;

    assert_eq!(result.status, PipelineState::Failed);
    match &result.error {
        Some(IngestError::Transport(msg)) => assert!(msg.contains("404"), "{msg}"),
        other => panic!("expected transport error, got {other:?}"),
    }
    assert_eq!(result.read, 0);
    assert!(store.statements().is_empty());
    Ok(())
}

#[tokio::test]
async fn silent_source_times_out_as_transport_error() -> anyhow::Result<()> {
    let known = ids(1);
    let rows = vec![(Identifier::new_random(), known[0], "sofa", 1)];

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(EXPORT_PATH);
            then.status(200)
                .header("content-type", "text/csv")
                .body(orders_csv(&rows))
                .delay(Duration::from_secs(30));
        })
        .await;

    let config = IngestConfig {
        read_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let store = MemoryStore::new(known);
    let mut pipeline = Pipeline::new(config, store.clone())?;
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        pipeline.run(&server.url(EXPORT_PATH).parse::<SourceLocation>()?),
    )
    .await?;

    assert_eq!(result.status, PipelineState::Failed);
    assert!(matches!(result.error, Some(IngestError::Transport(_))), "{result}");
    assert_eq!(result.inserted, 0);
    assert!(store.committed_rows().is_empty());
    Ok(())
}

#[tokio::test]
async fn transcodes_latin1_source() -> anyhow::Result<()> {
    let known = ids(1);
    let mut body = b"orderId,customerId,item,quantity\n".to_vec();
    body.extend_from_slice(
        format!("{},{},", Identifier::new_random(), known[0]).as_bytes(),
    );
    body.extend_from_slice(b"caf\xe9 table,2\n");

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("orders.csv");
    tokio::fs::write(&path, body).await?;

    let config = IngestConfig {
        charset: encoding_rs::WINDOWS_1252,
        ..Default::default()
    };
    let store = MemoryStore::new(known);
    let mut pipeline = Pipeline::new(config, store.clone())?;
    let result = pipeline.run(&SourceLocation::File(path)).await;

    assert!(result.is_success(), "{result}");
    assert_eq!(store.committed_rows()[0][2], "café table");
    Ok(())
}
