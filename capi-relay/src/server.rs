use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::dedup::DeduplicationCache;
use crate::limiters::RateLimiter;
use crate::pipeline::{AdmissionPipeline, EventDefaults};
use crate::router;
use crate::sinks::graph::GraphSink;
use crate::sinks::print::PrintSink;
use crate::time::SystemTime;

fn create_pipeline(config: &Config) -> anyhow::Result<AdmissionPipeline> {
    let dedup = DeduplicationCache::new(
        Duration::from_secs(config.dedup_ttl_secs),
        config.dedup_max_entries,
    );
    let limiter = RateLimiter::new(
        config.rate_limit_per_window,
        Duration::from_secs(config.rate_limit_window_secs),
    );
    let defaults = EventDefaults {
        event_name: config.default_event_name.clone(),
        action_source: config.default_action_source.clone(),
    };

    if config.print_sink {
        // Print sink is only used for local debug, nothing reaches the Conversions API
        tracing::warn!("print sink enabled, events will not be forwarded");
        Ok(AdmissionPipeline::new(
            SystemTime {},
            PrintSink {},
            dedup,
            limiter,
            defaults,
        ))
    } else {
        let sink = GraphSink::new(&config.graph).context("failed to create graph API sink")?;
        Ok(AdmissionPipeline::new(
            SystemTime {},
            sink,
            dedup,
            limiter,
            defaults,
        ))
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let pipeline = create_pipeline(&config)?;

    if config.export_prometheus {
        let limiter = pipeline.limiter.clone();
        tokio::spawn(async move {
            limiter.report_metrics().await;
        });
    }

    {
        // Ensure that the rate limiter state does not grow unbounded
        let limiter = pipeline.limiter.clone();
        tokio::spawn(async move {
            limiter.clean_state().await;
        });
    }

    let app = router::router(
        pipeline,
        &config.allowed_origins(),
        config.max_body_bytes,
        config.export_prometheus,
    );

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error")?;

    Ok(())
}
