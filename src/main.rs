// Exercise a store end to end: connect, ping, then fire a burst of limited calls.
// Run this with: cargo run --bin ratelimit-probe

use anyhow::Result;
use prometheus::TextEncoder;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use window_ratelimit::{
    load_settings_from_file, Decision, Metrics, RateLimitKey, RateLimiter, RateSpec, Settings,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "window_ratelimit=debug,ratelimit_probe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = match std::env::var("CONFIG_PATH") {
        Ok(path) => {
            info!("Loading settings from: {}", path);
            load_settings_from_file(&path)?
        }
        Err(_) => Settings::from_env()?,
    };
    info!(
        "Using {} backend at {}",
        settings.store.backend, settings.store.url
    );

    let spec = probe_spec(&settings)?;
    let calls = env_or("PROBE_CALLS", 10u64);
    let key = RateLimitKey::new(std::env::var("PROBE_KEY").unwrap_or_else(|_| "probe".to_string()))?;

    let metrics = Arc::new(Metrics::new()?);
    let limiter = RateLimiter::from_settings(&settings, spec, key).with_metrics(metrics.clone());

    let start_time = Instant::now();
    let outcome = limiter
        .run(|limiter| async move {
            limiter.ping().await?;
            info!("Store reachable in {:?}", start_time.elapsed());
            burst(&limiter, calls).await
        })
        .await;

    if let Err(e) = outcome {
        error!("Probe failed: {}", e);
        return Err(e.into());
    }

    let encoder = TextEncoder::new();
    let report = encoder.encode_to_string(&metrics.registry().gather())?;
    println!("{}", report);

    info!("Probe finished in {:?}", start_time.elapsed());
    Ok(())
}

/// `PROBE_LIMIT`/`PROBE_PERIOD_MS`, falling back to a limit named `probe` in the settings
fn probe_spec(settings: &Settings) -> Result<RateSpec> {
    if let Ok(spec) = settings.rate("probe") {
        return Ok(spec);
    }
    let limit = env_or("PROBE_LIMIT", 5u64);
    let period_ms = env_or("PROBE_PERIOD_MS", 1_000u64);
    Ok(RateSpec::new(limit, Duration::from_millis(period_ms))?)
}

fn env_or(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={}, using {}", name, value, default);
            default
        }),
        Err(_) => default,
    }
}

async fn burst(limiter: &RateLimiter, calls: u64) -> window_ratelimit::Result<()> {
    info!(
        "Firing {} calls at {} ({})",
        calls,
        limiter.store_key(),
        limiter.spec()
    );

    let mut admitted = 0;
    for call in 1..=calls {
        match limiter.check().await? {
            Decision::Admitted { count } => {
                admitted += 1;
                info!("call {}: admitted ({}/{})", call, count, limiter.spec().limit());
            }
            Decision::Rejected {
                count, reset_after, ..
            } => {
                info!(
                    "call {}: rejected ({} seen, resets in {:?})",
                    call, count, reset_after
                );
            }
        }
    }

    info!("{} of {} calls admitted", admitted, calls);
    Ok(())
}
