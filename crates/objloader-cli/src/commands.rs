use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use colored::Colorize;
use futures_util::StreamExt;
use objloader_sdk::{
    Base, Database, FileDatabase, LoaderOptions, MemoryDatabase, ObjectLoader,
    ServerDownloaderOptions,
};
use serde_json::json;
use tracing::debug;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let options = load_options(cli.config.as_deref())?;
    if cli.verbose {
        eprintln!("{} {:?}", "options:".dimmed(), options);
    }
    match cli.command {
        Command::Load(args) => cmd_load(args, options, &cli.format).await,
        Command::Count(args) => cmd_count(args, options).await,
        Command::File(args) => cmd_file(args, options, &cli.format).await,
        Command::Store(args) => cmd_store(args, &cli.format),
        Command::Config(_) => cmd_config(&options, &cli.format),
    }
}

fn load_options(path: Option<&str>) -> anyhow::Result<LoaderOptions> {
    match path {
        Some(path) => LoaderOptions::load(Path::new(path))
            .with_context(|| format!("reading loader options from {path}")),
        None => Ok(LoaderOptions::default()),
    }
}

fn parse_header(header: &str) -> anyhow::Result<(String, String)> {
    match header.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("header must look like NAME=VALUE: {header}"),
    }
}

fn server_options(args: ServerArgs) -> anyhow::Result<ServerDownloaderOptions> {
    let headers = args
        .headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(ServerDownloaderOptions {
        server_url: args.server,
        stream_id: args.stream,
        object_id: args.object,
        token: args.token,
        headers,
    })
}

fn open_database(path: Option<&str>) -> anyhow::Result<Arc<dyn Database>> {
    Ok(match path {
        Some(path) => Arc::new(
            FileDatabase::open(Path::new(path))
                .with_context(|| format!("opening object store {path}"))?,
        ),
        None => Arc::new(MemoryDatabase::new()),
    })
}

async fn cmd_load(
    args: LoadArgs,
    mut options: LoaderOptions,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    options.use_read_worker |= args.read_worker;
    options.use_write_worker |= args.write_worker;
    let database = open_database(args.db.as_deref())?;
    let loader = ObjectLoader::from_server(server_options(args.server)?, database, options)?;
    drain(loader, format, args.quiet).await
}

async fn cmd_count(args: CountArgs, options: LoaderOptions) -> anyhow::Result<()> {
    let database = open_database(args.db.as_deref())?;
    let loader = ObjectLoader::from_server(server_options(args.server)?, database, options)?;
    let total = loader.get_total_object_count().await;
    loader.dispose_async().await;
    println!("{}", total?);
    Ok(())
}

async fn cmd_file(args: FileArgs, options: LoaderOptions, format: &OutputFormat) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&args.path)
        .with_context(|| format!("reading {}", args.path))?;
    let loader = ObjectLoader::from_json(&text, options)?;
    drain(loader, format, args.quiet).await
}

/// Walk the whole graph, printing each object as it arrives.
async fn drain(loader: ObjectLoader, format: &OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let total = match loader.get_total_object_count().await {
        Ok(total) => total,
        Err(e) => {
            loader.dispose_async().await;
            return Err(e.into());
        }
    };
    if total == 0 {
        loader.dispose_async().await;
        bail!("root object {} not found", loader.root_id());
    }

    debug!(root = %loader.root_id(), total, "loading graph");
    let started = Instant::now();
    let mut loaded = 0usize;
    let mut failure = None;
    {
        let mut objects = std::pin::pin!(loader.get_object_iterator());
        while let Some(next) = objects.next().await {
            match next {
                Ok(base) => {
                    loaded += 1;
                    if !quiet {
                        print_object(&base, loaded, total, format);
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
    }
    loader.dispose_async().await;
    if let Some(e) = failure {
        return Err(e).context(format!("loading stopped after {loaded} of {total} objects"));
    }

    let elapsed = started.elapsed();
    match format {
        OutputFormat::Text => {
            println!(
                "{} Loaded {} of {} objects in {:.2}s ({} stored)",
                "✓".green().bold(),
                loaded.to_string().bold(),
                total,
                elapsed.as_secs_f64(),
                loader.written()
            );
        }
        OutputFormat::Json => {
            let summary = json!({
                "root": loader.root_id().as_str(),
                "loaded": loaded,
                "total": total,
                "stored": loader.written(),
                "elapsed_ms": elapsed.as_millis() as u64,
            });
            println!("{summary}");
        }
    }
    Ok(())
}

fn print_object(base: &Base, index: usize, total: usize, format: &OutputFormat) {
    match format {
        OutputFormat::Text => {
            let width = total.to_string().len();
            println!("  [{index:>width$}/{total}] {}", base.id().yellow());
        }
        OutputFormat::Json => println!("{}", base.value()),
    }
}

fn cmd_store(args: StoreArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let database = FileDatabase::open(Path::new(&args.db))
        .with_context(|| format!("opening object store {}", args.db))?;
    if args.clear {
        let removed = database.len();
        database.clear()?;
        println!("{} Removed {} objects from {}", "✓".green(), removed, args.db.bold());
        database.dispose()?;
        return Ok(());
    }

    let mut ids: Vec<String> = database
        .all_items()?
        .into_iter()
        .map(|item| item.base_id.into_string())
        .collect();
    ids.sort();
    match format {
        OutputFormat::Text => {
            println!("{} objects in {}", ids.len().to_string().bold(), args.db.bold());
            for id in &ids {
                println!("  {}", id.dimmed());
            }
        }
        OutputFormat::Json => println!("{}", json!({ "path": args.db, "objects": ids })),
    }
    database.dispose()?;
    Ok(())
}

fn cmd_config(options: &LoaderOptions, format: &OutputFormat) -> anyhow::Result<()> {
    let rendered = match format {
        OutputFormat::Text => toml::to_string_pretty(options)?,
        OutputFormat::Json => serde_json::to_string_pretty(options)?,
    };
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_split_on_first_equals() {
        assert_eq!(
            parse_header("X-Trace = a=b").unwrap(),
            ("X-Trace".to_string(), "a=b".to_string())
        );
        assert!(parse_header("no-value").is_err());
        assert!(parse_header("=value").is_err());
    }

    #[test]
    fn default_options_without_config() {
        assert_eq!(load_options(None).unwrap(), LoaderOptions::default());
        assert!(load_options(Some("/nonexistent/loader.toml")).is_err());
    }

    #[test]
    fn config_renders_as_toml() {
        let rendered = toml::to_string_pretty(&LoaderOptions::default()).unwrap();
        let parsed = LoaderOptions::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, LoaderOptions::default());
    }
}
