mod config;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cascade_engine::{
    BudgetGovernor, CascadeEngine, CascadeResult, EngineSnapshot, EventFilter, FetchOptions, NullSink,
    ProviderRegistry, RequestDescriptor, SharedClock, SharedEventSink, SystemClock,
};
use clap::{Parser, Subcommand};
use config::{HostConfig, CONFIG_ENV};
use serde_json::json;
use tracing::{info, warn};

/// Characters of body printed when `--full` is not given.
const PREVIEW_CHARS: usize = 512;

#[derive(Debug, Parser)]
#[command(name = "cascade-fetch", version, about = "Fetch URLs through a cost-aware provider cascade")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, env = CONFIG_ENV, default_value = "cascade.toml", global = true)]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    /// Load provider health and budget spend from this file, and write them back on exit.
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    /// Only log engine events of this type (e.g. `provider_failure`). Repeatable.
    #[arg(long = "log-event", value_name = "TYPE", global = true)]
    log_events: Vec<String>,

    /// Only log engine events about this provider.
    #[arg(long, value_name = "NAME", global = true)]
    log_provider: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn event_filter(&self) -> EventFilter {
        let mut filter = EventFilter::new();
        if !self.log_events.is_empty() {
            filter = filter.types(self.log_events.iter().map(String::as_str).collect());
        }
        if let Some(name) = &self.log_provider {
            filter = filter.provider(name);
        }
        filter
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch one URL and print the result as JSON.
    Fetch(FetchArgs),
    /// Show provider health and the order the cascade would try them in.
    Providers,
    /// Validate the configuration without contacting any provider.
    CheckConfig,
}

#[derive(Debug, clap::Args)]
struct FetchArgs {
    url: String,

    #[arg(long, default_value = "GET")]
    method: String,

    /// Request header as `Name:Value`. Repeatable.
    #[arg(long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,

    #[arg(long)]
    body: Option<String>,

    #[arg(long)]
    bypass_cache: bool,

    /// Per-request cost ceiling in USD.
    #[arg(long)]
    max_cost: Option<f64>,

    #[arg(long)]
    force_provider: Option<String>,

    #[arg(long)]
    priority_hint: Option<String>,

    /// Issue the same request this many times concurrently.
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Print the whole response body.
    #[arg(long)]
    full: bool,
}

impl FetchArgs {
    fn request(&self) -> Result<RequestDescriptor> {
        let mut request = RequestDescriptor::new(&self.method, &self.url);
        for raw in &self.headers {
            let (name, value) = parse_header(raw)?;
            request = request.with_header(name, value);
        }
        if let Some(body) = &self.body {
            request = request.with_body(body.as_bytes().to_vec());
        }
        Ok(request)
    }

    fn options(&self) -> FetchOptions {
        let mut options = FetchOptions::default();
        if self.bypass_cache {
            options = options.bypass_cache();
        }
        if let Some(usd) = self.max_cost {
            options = options.max_cost(usd);
        }
        if let Some(name) = &self.force_provider {
            options = options.force_provider(name);
        }
        if let Some(name) = &self.priority_hint {
            options = options.priority_hint(name);
        }
        options
    }
}

fn parse_header(raw: &str) -> Result<(&str, &str)> {
    let Some((name, value)) = raw.split_once(':') else {
        bail!("header '{raw}' is not in Name:Value form");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("header '{raw}' has an empty name");
    }
    Ok((name, value.trim()))
}

fn preview(mut result: CascadeResult, full: bool) -> CascadeResult {
    if !full && result.content.chars().count() > PREVIEW_CHARS {
        let total = result.content.len();
        let cut: String = result.content.chars().take(PREVIEW_CHARS).collect();
        result.content = format!("{cut}... [{total} bytes]");
    }
    result
}

fn load_snapshot(path: Option<&Path>) -> Result<Option<EngineSnapshot>> {
    let Some(path) = path else {
        return Ok(None);
    };
    EngineSnapshot::load(path).with_context(|| format!("failed to read snapshot {}", path.display()))
}

async fn fetch(
    config: HostConfig,
    args: FetchArgs,
    filter: EventFilter,
    snapshot: Option<PathBuf>,
) -> Result<bool> {
    if args.repeat == 0 {
        bail!("--repeat must be at least 1");
    }
    let adapters = config.build_adapters()?;
    let sink: SharedEventSink = Arc::new(telemetry::LogSink::new(filter));
    let engine = CascadeEngine::builder(config.engine)
        .providers(adapters)
        .events(sink)
        .build()
        .context("failed to build engine")?;

    if let Some(saved) = load_snapshot(snapshot.as_deref())? {
        engine.restore(&saved);
    }

    let request = args.request()?;
    let options = args.options();
    let outcomes = futures::future::join_all(
        (0..args.repeat).map(|_| engine.fetch(request.clone(), options.clone())),
    )
    .await;

    let mut all_ok = true;
    let rendered: Vec<serde_json::Value> = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(result) => json!({ "ok": preview(result, args.full) }),
            Err(err) => {
                all_ok = false;
                json!({ "error": err, "message": err.to_string() })
            }
        })
        .collect();
    let output = if rendered.len() == 1 {
        rendered.into_iter().next().unwrap_or_default()
    } else {
        serde_json::Value::Array(rendered)
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    let metrics = engine.metrics();
    info!(
        requests = metrics.totals.requests,
        cache_hits = metrics.totals.cache_hits,
        deduped = metrics.totals.deduped,
        saved_usd = metrics.savings.total(),
        "run complete"
    );

    if let Some(path) = &snapshot {
        engine
            .snapshot()
            .save(path)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
    }
    Ok(all_ok)
}

fn providers(config: &HostConfig, snapshot: Option<&Path>) -> Result<()> {
    let clock: SharedClock = Arc::new(SystemClock);
    let sink: SharedEventSink = Arc::new(NullSink);
    let registry = ProviderRegistry::new(&config.engine, clock.clone(), sink.clone());
    let budget = BudgetGovernor::new(&config.engine.budget, clock, sink);
    if let Some(saved) = load_snapshot(snapshot)? {
        registry.restore(&saved.providers);
        budget.restore(&saved.budget);
    }

    let order = match registry.compute_order(&FetchOptions::default(), &budget) {
        Ok(order) => order.into_iter().map(|p| p.name).collect::<Vec<_>>(),
        Err(err) => {
            warn!(error = %err, "no provider is currently eligible");
            Vec::new()
        }
    };
    let output = json!({
        "order": order,
        "settings": config.engine.providers,
        "health": registry.all_stats(),
        "budget": budget.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.json);

    let config = HostConfig::load(&cli.config)?;
    info!(
        config = %cli.config.display(),
        providers = config.engine.enabled_providers().count(),
        "cascade-fetch starting"
    );

    let filter = cli.event_filter();
    match cli.command {
        Command::Fetch(args) => {
            if !fetch(config, args, filter, cli.snapshot).await? {
                std::process::exit(1);
            }
        }
        Command::Providers => providers(&config, cli.snapshot.as_deref())?,
        Command::CheckConfig => {
            config.engine.validate()?;
            println!("ok: {} provider(s) configured", config.engine.enabled_providers().count());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parsing() {
        assert_eq!(parse_header("Accept: text/html").unwrap(), ("Accept", "text/html"));
        assert_eq!(parse_header("X-Token:a:b").unwrap(), ("X-Token", "a:b"));
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn fetch_flags_map_to_options() {
        let cli = Cli::parse_from([
            "cascade-fetch",
            "fetch",
            "https://example.com",
            "--bypass-cache",
            "--max-cost",
            "0.01",
            "--priority-hint",
            "premium",
            "--header",
            "Accept:text/html",
        ]);
        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        let options = args.options();
        assert!(options.bypass_cache);
        assert_eq!(options.max_cost, Some(0.01));
        assert_eq!(options.priority_hint.as_deref(), Some("premium"));
        assert!(options.force_provider.is_none());
        assert!(cli.log_events.is_empty());
        let request = args.request().unwrap();
        assert_eq!(request.method(), "GET");
        assert_eq!(request.url(), "https://example.com");
    }

    #[test]
    fn log_flags_build_event_filter() {
        let cli = Cli::parse_from([
            "cascade-fetch",
            "--log-event",
            "provider_failure",
            "--log-provider",
            "premium",
            "providers",
        ]);
        let filter = cli.event_filter();
        assert_eq!(filter.provider.as_deref(), Some("premium"));
        assert_eq!(filter.event_types, Some(vec!["provider_failure".to_string()]));
    }

    #[test]
    fn long_content_is_truncated() {
        let mut result = CascadeResult {
            success: true,
            provider: "solver".into(),
            url: "https://example.com".into(),
            status_code: 200,
            content: "x".repeat(PREVIEW_CHARS * 2),
            headers: Default::default(),
            cookies: Vec::new(),
            cost: 0.0,
            response_time_ms: 10,
            cached: false,
            deduped: false,
            attempts: Vec::new(),
        };
        let short = preview(result.clone(), false);
        assert!(short.content.ends_with(&format!("[{} bytes]", PREVIEW_CHARS * 2)));
        result = preview(result, true);
        assert_eq!(result.content.len(), PREVIEW_CHARS * 2);
    }
}
