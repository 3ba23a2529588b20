use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ret_core::{
    AlertSeverity, ConversationId, DelayPolicy, EmployeeId, InMemoryDirectory,
    InMemoryMessageStore, InboundMessage, LogNotifier, LogSettings, MessageId, PolicySettings,
    PolicySnapshot, Sender, SenderId, StageSpec, TrackerConfig, TrackerRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "RET_LOG";
const SIM_EMPLOYEE: EmployeeId = EmployeeId(1);
const SIM_CONVERSATION: ConversationId = ConversationId(1);

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .value_parser(value_parser!(PathBuf))
        .help("Path to a TOML configuration file (defaults apply when omitted)")
}

fn json_arg() -> Arg {
    Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Output as JSON")
}

fn cli() -> Command {
    Command::new("ret")
        .version(ret_core::VERSION)
        .about("Response Escalation Tracker")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("check-config")
                .about("Validate configuration and print the effective policy")
                .arg(config_arg())
                .arg(json_arg()),
        )
        .subcommand(
            Command::new("simulate")
                .about("Track one message against in-memory collaborators")
                .arg(config_arg())
                .arg(
                    Arg::new("reply-after-secs")
                        .long("reply-after-secs")
                        .value_parser(value_parser!(u64))
                        .help("Resolve the message after this many (real) seconds"),
                )
                .arg(
                    Arg::new("scale")
                        .long("scale")
                        .default_value("1.0")
                        .value_parser(value_parser!(f64))
                        .help("Divide every stage threshold by this factor"),
                )
                .arg(json_arg()),
        )
}

fn load_config(args: &ArgMatches) -> Result<TrackerConfig> {
    if let Some(path) = args.get_one::<PathBuf>("config") {
        return TrackerConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    let config = TrackerConfig::default()
        .apply_env()
        .context("applying environment overrides")?;
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn init_tracing(settings: &LogSettings) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&settings.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if settings.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_policy(config: &TrackerConfig, snapshot: &PolicySnapshot, json: bool) -> Result<()> {
    if json {
        let stages: Vec<_> = snapshot
            .stages()
            .iter()
            .map(|s| {
                serde_json::json!({
                    "label": s.label,
                    "after_secs": s.threshold.as_secs(),
                    "severity": AlertSeverity::for_threshold(s.threshold),
                })
            })
            .collect();
        let out = serde_json::json!({
            "enabled": snapshot.is_enabled(),
            "stages": stages,
            "delivery_timeout_ms": config.delivery_timeout_ms,
            "policy_cache_ttl_secs": config.policy_cache_ttl_secs,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Escalation: {}", if snapshot.is_enabled() { "enabled" } else { "disabled" });
    for stage in snapshot.stages() {
        println!(
            "  #{} {:<16} after {:>6}s  ({:?})",
            stage.ordinal + 1,
            stage.label,
            stage.threshold.as_secs(),
            AlertSeverity::for_threshold(stage.threshold)
        );
    }
    println!("Delivery timeout: {}ms", config.delivery_timeout_ms);
    println!("Policy cache TTL: {}s", config.policy_cache_ttl_secs);
    Ok(())
}

fn check_config(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    init_tracing(&config.log);
    let snapshot = config.escalation.validate()?;
    print_policy(&config, &snapshot, args.get_flag("json"))
}

/// Settings with every threshold divided by `scale`, in whole seconds
fn scaled(settings: &PolicySettings, scale: f64) -> Result<PolicySettings> {
    let mut stages = Vec::with_capacity(settings.stages.len());
    for spec in &settings.stages {
        let threshold = spec.threshold()?;
        let secs = (threshold.as_secs_f64() / scale).ceil().max(1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        stages.push(StageSpec::secs(spec.label.clone(), secs as u64));
    }
    Ok(PolicySettings::with_stages(stages).enabled(settings.enabled))
}

async fn simulate(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    init_tracing(&config.log);

    let scale = args.get_one::<f64>("scale").copied().unwrap_or(1.0);
    if !(scale.is_finite() && scale > 0.0) {
        bail!("--scale must be a positive number, got {scale}");
    }
    let reply_after = args
        .get_one::<u64>("reply-after-secs")
        .map(|s| Duration::from_secs(*s));

    let settings = scaled(&config.escalation, scale)?;
    let snapshot = settings
        .validate()
        .context("scaled thresholds collapse; use a smaller --scale")?;

    let store = InMemoryMessageStore::shared();
    let registry = TrackerRegistry::builder(
        store.clone(),
        Arc::new(LogNotifier),
        Arc::new(InMemoryDirectory::with_active([SIM_EMPLOYEE])),
    )
    .with_policy(DelayPolicy::fixed(settings))
    .with_delivery_timeout(config.delivery_timeout())
    .build();

    let message = InboundMessage::new(SIM_CONVERSATION, MessageId(1))
        .with_sender(
            Sender::new(SenderId(1))
                .with_username("simulated-client")
                .with_display_name("Simulated Client"),
        )
        .with_text("Is anyone there?");
    let handle = registry.track(&message, SIM_EMPLOYEE).await?;

    let last_stage = snapshot
        .armed_stages()
        .last()
        .map_or(Duration::ZERO, |s| s.threshold);
    let horizon = last_stage + config.delivery_timeout() + Duration::from_secs(1);

    let mut resolution = None;
    if let Some(after) = reply_after {
        tokio::time::sleep(after).await;
        resolution = registry.resolve(SIM_CONVERSATION, SIM_EMPLOYEE).await?;
        if let Some(rest) = horizon.checked_sub(after) {
            tokio::time::sleep(rest).await;
        }
    } else {
        tokio::time::sleep(horizon).await;
    }

    let stats = registry.stats();
    let stages = handle.stages();
    let audit = store.notifications();
    registry.shutdown().await;

    if args.get_flag("json") {
        let out = serde_json::json!({
            "stats": stats,
            "stages": stages,
            "resolution": resolution,
            "notifications": audit.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Simulation finished");
    for (label, state) in &stages {
        println!("  {label:<16} {state:?}");
    }
    match &resolution {
        Some(r) => println!(
            "Resolved after {:.2} min, {} stage(s) canceled",
            r.latency_minutes, r.canceled_stages
        ),
        None => println!("Never resolved"),
    }
    println!(
        "Delivered: {}  Skipped: {}  Failed: {}  Audit records: {}",
        stats.stages.delivered,
        stats.stages.skipped_resolved + stats.stages.skipped_inactive,
        stats.stages.delivery_failed + stats.stages.store_failed,
        audit.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("check-config", args)) => check_config(args),
        Some(("simulate", args)) => simulate(args).await,
        _ => unreachable!("subcommand_required"),
    }
}
