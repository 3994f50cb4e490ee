use anyhow::{bail, Context};
use serde::Serialize;

use feed_enricher::scheduler::TickOutcome;
use feed_enricher::vector::DEFAULT_SEARCH_LIMIT;
use feed_enricher::{App, Config};

const USAGE: &str = "usage: feed-enricher [--refresh | --refresh-feed <id> | --add-feed <url> \
                     | --search <query> | --analyze <id>...]";

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_id(raw: &str) -> anyhow::Result<i64> {
    raw.parse().with_context(|| format!("not a valid id: {raw}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (info for this crate unless RUST_LOG says otherwise)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,feed_enricher=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let config = Config::load().context("failed to load configuration")?;
    let app = App::new(&config).await.context("failed to initialize")?;

    match args.first().map(String::as_str) {
        None => run_daemon(&app).await,
        Some("--refresh") => {
            let outcome = app.scheduler.trigger_refresh().await;
            if outcome == TickOutcome::Skipped {
                eprintln!("A refresh is already running");
            }
            print_json(&outcome)
        }
        Some("--refresh-feed") => {
            let id = parse_id(args.get(1).context(USAGE)?)?;
            print_json(&app.fetcher.refresh_feed(id).await?)
        }
        Some("--add-feed") => {
            let url = args.get(1).context(USAGE)?;
            let (feed, outcome) = app.fetcher.add_feed(url, None).await?;
            print_json(&serde_json::json!({ "feed": feed, "outcome": outcome }))
        }
        Some("--search") => {
            let query = args[1..].join(" ");
            if query.trim().is_empty() {
                bail!(USAGE);
            }
            let hits = app.vectors()?.search(&query, DEFAULT_SEARCH_LIMIT).await?;
            print_json(&hits)
        }
        Some("--analyze") => {
            let ids = args[1..]
                .iter()
                .map(|raw| parse_id(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let (results, summary) = app.tagging.analyze_entries(&ids).await?;
            print_json(&serde_json::json!({ "results": results, "summary": summary }))
        }
        Some(other) => bail!("unknown argument {other}\n{USAGE}"),
    }
}

async fn run_daemon(app: &App) -> anyhow::Result<()> {
    app.scheduler.start().await;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    app.scheduler.stop().await;
    Ok(())
}
