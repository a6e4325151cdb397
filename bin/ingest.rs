use std::process::ExitCode;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use csv_fk_ingest::{
    ddl, logging, IngestConfig, IngestError, LoadResult, PgStore, Pipeline, SourceLocation,
};

fn cli() -> Command {
    Command::new("ingest")
        .about("Stream a CSV into PostgreSQL, keeping rows whose parent exists")
        .subcommand_required(true)
        .arg(
            Arg::new("database-url")
                .long("database-url")
                .env("DATABASE_URL")
                .required(true)
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value(logging::DEFAULT_LOG_LEVEL)
                .global(true),
        )
        .arg(
            Arg::new("store-timeout")
                .long("store-timeout")
                .help("Seconds to wait on any store round trip")
                .value_parser(clap::value_parser!(u64))
                .default_value("30")
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("Load the CSV at --source")
                .arg(
                    Arg::new("source")
                        .long("source")
                        .env("SOURCE_URL")
                        .help("http(s) URL or local path; .gz/.zst handled")
                        .value_parser(clap::value_parser!(SourceLocation))
                        .required(true),
                )
                .arg(Arg::new("delimiter").long("delimiter").default_value(","))
                .arg(Arg::new("quote").long("quote").default_value("\""))
                .arg(
                    Arg::new("escape")
                        .long("escape")
                        .help("Escape character; quotes are doubled when unset"),
                )
                .arg(
                    Arg::new("charset")
                        .long("charset")
                        .help("Source encoding label, e.g. windows-1252")
                        .default_value("utf-8"),
                )
                .arg(
                    Arg::new("abort-on-row-error")
                        .long("abort-on-row-error")
                        .help("Fail the run on the first malformed row instead of skipping it")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("channel-capacity")
                        .long("channel-capacity")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("1024"),
                )
                .arg(
                    Arg::new("flush-bytes")
                        .long("flush-bytes")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("4194304"),
                )
                .arg(
                    Arg::new("read-timeout")
                        .long("read-timeout")
                        .help("Seconds the source may stay silent before the run fails")
                        .default_value("60")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("fetch-timeout")
                        .long("fetch-timeout")
                        .help("Seconds allowed for the whole download")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(Command::new("create-tables").about("Create parent and target tables"))
        .subcommand(Command::new("drop-tables").about("Drop target and parent tables"))
        .subcommand(
            Command::new("seed-parents")
                .about("Insert placeholder parents and print their ids")
                .arg(
                    Arg::new("count")
                        .long("count")
                        .value_parser(clap::value_parser!(u32))
                        .default_value("50"),
                ),
        )
}

fn single_byte(matches: &ArgMatches, name: &str) -> anyhow::Result<u8> {
    let value = matches.get_one::<String>(name).map(String::as_str).unwrap_or_default();
    match value.as_bytes() {
        [b] => Ok(*b),
        b"\\t" => Ok(b'\t'),
        _ => Err(anyhow::anyhow!("--{name} must be a single byte, got {value:?}")),
    }
}

fn run_config(matches: &ArgMatches, store_timeout: Duration) -> anyhow::Result<IngestConfig> {
    let mut config = IngestConfig {
        abort_on_row_error: matches.get_flag("abort-on-row-error"),
        store_timeout,
        fetch_timeout: matches
            .get_one::<u64>("fetch-timeout")
            .map(|s| Duration::from_secs(*s)),
        ..Default::default()
    };
    if let Some(secs) = matches.get_one::<u64>("read-timeout") {
        config.read_timeout = Duration::from_secs(*secs);
    }
    if let Some(capacity) = matches.get_one::<usize>("channel-capacity") {
        config.channel_capacity = *capacity;
    }
    if let Some(flush) = matches.get_one::<usize>("flush-bytes") {
        config.flush_bytes = *flush;
    }
    config.format.delimiter = single_byte(matches, "delimiter")?;
    config.format.quote = single_byte(matches, "quote")?;
    if matches.contains_id("escape") {
        config.format.escape = Some(single_byte(matches, "escape")?);
    }
    if let Some(label) = matches.get_one::<String>("charset") {
        config.charset = encoding_rs::Encoding::for_label(label.as_bytes())
            .ok_or_else(|| anyhow::anyhow!("unknown charset {label:?}"))?;
    }
    Ok(config)
}

async fn run(
    database_url: &str,
    store_timeout: Duration,
    matches: &ArgMatches,
) -> anyhow::Result<LoadResult> {
    let config = run_config(matches, store_timeout)?;
    let location = matches
        .get_one::<SourceLocation>("source")
        .ok_or_else(|| anyhow::anyhow!("--source is required"))?;

    config.validate()?;

    let store = match PgStore::connect(database_url, store_timeout).await {
        Ok(store) => store,
        Err(e) => return Ok(LoadResult::failed(IngestError::StoreUnavailable(e.to_string()))),
    };
    let mut pipeline = Pipeline::new(config, store)?;

    let cancel = pipeline.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let result = pipeline.run(location).await;
    interrupt.abort();
    pipeline.into_store().close().await;
    Ok(result)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let matches = cli().get_matches();
    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or(logging::DEFAULT_LOG_LEVEL);
    logging::init(log_level);

    let database_url = matches
        .get_one::<String>("database-url")
        .ok_or_else(|| anyhow::anyhow!("--database-url or DATABASE_URL is required"))?;
    let store_timeout = Duration::from_secs(*matches.get_one::<u64>("store-timeout").unwrap_or(&30));
    let schema = IngestConfig::default().schema;

    match matches.subcommand() {
        Some(("run", sub)) => {
            let result = run(database_url, store_timeout, sub).await?;
            if let Some(err) = &result.error {
                tracing::error!(kind = err.kind(), error = %err, "ingest failed");
            }
            println!("{result}");
            Ok(result.exit_code())
        }
        Some(("create-tables", _)) => {
            let store = PgStore::connect(database_url, store_timeout).await?;
            ddl::create_tables(&store, &schema).await?;
            store.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Some(("drop-tables", _)) => {
            let store = PgStore::connect(database_url, store_timeout).await?;
            ddl::drop_tables(&store, &schema).await?;
            store.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Some(("seed-parents", sub)) => {
            let count = *sub.get_one::<u32>("count").unwrap_or(&50);
            let store = PgStore::connect(database_url, store_timeout).await?;
            let ids = ddl::seed_parents(&store, &schema, count).await?;
            store.close().await;
            for id in ids {
                println!("{id}");
            }
            Ok(ExitCode::SUCCESS)
        }
        _ => unreachable!("subcommand_required"),
    }
}
