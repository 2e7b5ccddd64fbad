use std::sync::Arc;

use clap::Parser;
use docubot::{
    DataDir,
    DocService,
    MetadataStore,
    cli::{self, Cli, Command, ConfigAction},
    deletion::DeleteOutcome,
    error::{self, Error},
    mcp,
    settings,
    web,
};
use kdam::{BarExt, tqdm};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCUBOT_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    // Settings edits must work even when a stored value is invalid, so
    // they only open the metadata store.
    if let Command::Config { action } = &cli.command {
        let store = MetadataStore::open(&data_dir.metadata_db())?;
        return cmd_config(&store, action);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let service = Arc::new(DocService::open(data_dir)?);
        run(cli.command, service).await
    })
}

async fn run(command: Command, service: Arc<DocService>) -> error::Result<()> {
    match command {
        Command::Ingest(args) => cmd_ingest(&service, &args).await?,
        Command::List(args) => cmd_list(&service, args.json).await?,
        Command::Delete(args) => match service.delete(&args.id).await? {
            outcome @ DeleteOutcome::Deleted { .. } => {
                println!("{}", outcome.message());
            }
            DeleteOutcome::NotFound { id } => {
                return Err(Error::NotFound {
                    kind: "document",
                    name: id,
                });
            }
        },
        Command::Reset(args) => {
            if !args.yes {
                return Err(Error::Validation(
                    "reset deletes every document; pass --yes to confirm".into(),
                ));
            }
            let report = service.reset().await?;
            println!(
                "Removed {} documents and {} chunks",
                report.documents_removed, report.chunks_removed
            );
        }
        Command::Chat(args) => {
            let answer =
                service.chat(&args.query, args.session.as_deref()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("{}", answer.answer);
                if !answer.sources.is_empty() {
                    println!();
                    println!("Sources: {}", answer.sources.join(", "));
                }
            }
        }
        Command::Reconcile => {
            let report = service.reconcile().await?;
            println!(
                "Removed {} orphaned chunks and {} unfinished uploads",
                report.orphan_chunks_removed, report.stale_documents_removed
            );
        }
        Command::Status(args) => cmd_status(&service, args.json).await?,
        Command::Serve(args) => {
            let bind = args
                .bind
                .unwrap_or_else(|| service.settings().server_bind.clone());
            web::serve(service, &bind).await?;
        }
        Command::Mcp => mcp::run_mcp(service).await?,
        Command::Config { .. } | Command::Completions(_) => {}
    }
    Ok(())
}

async fn cmd_ingest(
    service: &DocService,
    args: &cli::IngestArgs,
) -> error::Result<()> {
    let mut pb = tqdm!(total = args.files.len(), desc = "Ingesting");
    let mut reports = Vec::with_capacity(args.files.len());
    let mut failures = 0;

    for path in &args.files {
        match service.ingest_path(path).await {
            Ok(report) => {
                if !args.json {
                    pb.write(format!(
                        "{} {} ({} chunks)",
                        report.id, report.filename, report.chunk_count
                    ))?;
                }
                reports.push(report);
            }
            Err(e) => {
                failures += 1;
                pb.write(format!("{}: {e}", path.display()))?;
            }
        }
        pb.update(1)?;
    }
    eprintln!();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    if failures > 0 {
        return Err(Error::Ingest(format!(
            "{failures} of {} files failed",
            args.files.len()
        )));
    }
    Ok(())
}

async fn cmd_list(service: &DocService, json: bool) -> error::Result<()> {
    let records = service.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No documents uploaded.");
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {:<9}  {}",
            record.id,
            record.status.to_string(),
            record.filename
        );
    }
    Ok(())
}

async fn cmd_status(service: &DocService, json: bool) -> error::Result<()> {
    let status = service.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Data directory: {}", status.data_dir);
        println!("Embedder: {}", status.embedder);
        println!("Answerer: {}", status.answerer);
        println!(
            "Documents: {} ({} pending)",
            status.documents, status.pending
        );
        println!("Chunks: {}", status.chunks);
        if let Some(dim) = status.dimension {
            println!("Dimension: {dim}");
        }
        if status.unsaved_changes > 0 {
            println!("Unsaved index changes: {}", status.unsaved_changes);
        }
    }
    Ok(())
}

fn cmd_config(store: &MetadataStore, action: &ConfigAction) -> error::Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let values = settings::effective_values(store)?;
            if *json {
                let map: serde_json::Map<String, serde_json::Value> = values
                    .iter()
                    .map(|(key, value, _)| {
                        (key.to_string(), serde_json::Value::from(value.as_str()))
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (key, value, source) in &values {
                    println!("{key:<24} {value}  ({source})");
                }
            }
        }
        ConfigAction::Set { key, value } => {
            settings::validate(key, value)?;
            store.set_setting(key, value)?;
            println!("{key} = {value}");
            let env = settings::env_var_name(key);
            if std::env::var_os(&env).is_some() {
                eprintln!("note: {env} is set and takes precedence");
            }
        }
        ConfigAction::Clear { key } => {
            if store.remove_setting(key)? {
                println!("Cleared {key}");
            } else {
                println!("{key} was not set");
            }
        }
    }
    Ok(())
}
