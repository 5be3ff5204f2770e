// Chatwatch CLI - realtime chat alert monitor and periodic digest

mod shutdown;

use anyhow::{Context, Result};
use chatwatch_core::{
    AlertStatistics, AlertStore, ChatPoster, DigestGenerator, LlmClient, MessageSource, MonitorCapabilities,
    NotificationRouter, OpenAiCompatibleClient, RealtimeMonitor, RuntimeConfig, SlackClient,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chatwatch")]
#[command(about = "Classify, deduplicate and route alerts from chat channels", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $CHATWATCH_CONFIG, then ./chatwatch.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single polling cycle and exit
    #[arg(long)]
    once: bool,

    /// Send a digest immediately and exit
    #[arg(long)]
    digest_now: bool,

    /// Print alert statistics for the last HOURS (default 24) and exit
    #[arg(long, value_name = "HOURS", num_args = 0..=1, default_missing_value = "24")]
    stats: Option<i64>,

    /// Delete alerts older than DAYS (default 30) and exit
    #[arg(long, value_name = "DAYS", num_args = 0..=1, default_missing_value = "30")]
    clear_old: Option<i64>,

    /// Classify only: no notifications, nothing written to the store
    #[arg(long)]
    dry_run: bool,

    /// Record alerts but do not send notifications
    #[arg(long)]
    no_notify: bool,

    /// Disable LLM tie-break and digest summaries
    #[arg(long)]
    no_llm: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn capabilities(&self, config: &RuntimeConfig) -> MonitorCapabilities {
        MonitorCapabilities {
            persist_alerts: !self.dry_run,
            notifications: !self.no_notify && !self.dry_run,
            secondary_classifier: !self.no_llm && config.realtime.llm.enabled,
        }
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("chatwatch={}", level).parse()?)
                .add_directive(format!("chatwatch_core={}", level).parse()?),
        )
        .init();
    Ok(())
}

fn render_statistics(stats: &AlertStatistics) -> String {
    let mut out = vec![
        format!("📊 Alert statistics (last {}h)", stats.hours),
        format!("  Total alerts:     {}", stats.total),
        format!("  Notified:         {}", stats.sent),
        format!(
            "  Filtered:         {} ({:.1}%)",
            stats.filtered,
            stats.filter_rate_percent()
        ),
        format!("  Critical:         {}", stats.critical),
        format!("  Important:        {}", stats.important),
        format!("  Normal:           {}", stats.normal),
        format!("  Ignored:          {}", stats.ignored),
        format!("  Active patterns:  {}", stats.active_patterns),
    ];
    if !stats.top_channels.is_empty() {
        out.push("  Top channels:".to_string());
        for (channel, count) in &stats.top_channels {
            out.push(format!("    #{}: {}", channel, count));
        }
    }
    out.join("\n")
}

fn build_llm(enabled: bool, config: &chatwatch_core::LlmConfig) -> Result<Option<Arc<dyn LlmClient>>> {
    if !enabled || !config.enabled {
        return Ok(None);
    }
    let client = OpenAiCompatibleClient::from_config(config).context("LLM configuration invalid")?;
    info!(model = client.model(), "LLM client enabled");
    let client: Arc<dyn LlmClient> = Arc::new(client);
    Ok(Some(client))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config_path = RuntimeConfig::resolve_path(cli.config.as_deref());
    let config = RuntimeConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let database_path = config.database_path();
    let store = AlertStore::open(&database_path)
        .await
        .with_context(|| format!("Failed to open alert store at {}", database_path.display()))?;

    if let Some(hours) = cli.stats {
        let stats = store.statistics(hours.max(1)).await.context("Failed to compute statistics")?;
        println!("{}", render_statistics(&stats));
        return Ok(());
    }

    if let Some(days) = cli.clear_old {
        let deleted = store.purge_older_than(days.max(0)).await.context("Failed to purge alerts")?;
        println!("🧹 Deleted {} alert(s) older than {} day(s)", deleted, days);
        return Ok(());
    }

    let token = config.bot_token().context("Slack credentials missing")?;
    let slack = Arc::new(SlackClient::new(token).context("Failed to build Slack client")?);
    let poster: Arc<dyn ChatPoster> = slack.clone();
    let source: Arc<dyn MessageSource> = slack;
    let router = Arc::new(NotificationRouter::from_config(&config, Some(poster)));

    let mut digest = DigestGenerator::new(store.clone(), router.clone(), &config.digest, &config.slack);
    if let Some(llm) = build_llm(!cli.no_llm, &config.digest.llm)? {
        digest = digest.with_llm(llm);
    }

    if cli.digest_now {
        let outcome = digest.send_digest().await.context("Digest failed")?;
        println!(
            "📨 Digest with {} alert(s): primary {}, secondary {}",
            outcome.alert_count,
            if outcome.primary_sent { "sent" } else { "not sent" },
            match outcome.secondary_sent {
                Some(true) => "sent",
                Some(false) => "not sent",
                None => "disabled",
            }
        );
        return Ok(());
    }

    let capabilities = cli.capabilities(&config);
    let mut monitor = RealtimeMonitor::new(
        store.clone(),
        source,
        router,
        &config.realtime,
        config.channels.clone(),
        capabilities,
    );
    if let Some(llm) = build_llm(capabilities.secondary_classifier, &config.realtime.llm)? {
        monitor = monitor.with_llm(llm);
    }

    if cli.once {
        if !config.realtime.enabled {
            println!("Realtime monitor disabled in configuration");
            store.close().await;
            return Ok(());
        }
        let report = monitor.run_once().await;
        println!(
            "✓ Cycle complete: {} polled, {} bootstrapped, {} failed, {} fetched, {} recorded, {} duplicate(s), {} notification(s) sent, {} failed",
            report.channels_polled,
            report.channels_bootstrapped,
            report.channels_failed,
            report.messages_fetched,
            report.alerts_recorded,
            report.duplicates,
            report.notifications_sent,
            report.notifications_failed
        );
        store.close().await;
        return Ok(());
    }

    if !config.realtime.enabled && !config.digest.enabled {
        warn!("Both realtime monitor and digest are disabled; nothing to do");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.realtime.enabled {
        let monitor = Arc::new(monitor);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { monitor.run_forever(rx).await }));
    } else {
        info!("Realtime monitor disabled in configuration");
    }

    if config.digest.enabled {
        let digest = Arc::new(digest);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { digest.run_forever(rx).await }));
    }

    shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        warn!("All loops already stopped");
    }

    for task in tasks {
        if let Err(e) = task.await {
            error!("Background loop panicked: {}", e);
        }
    }

    store.close().await;
    info!("Chatwatch stopped");
    Ok(())
}
