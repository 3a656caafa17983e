//! `leadflowd`, the orchestration server.
//!
//! Reads configuration from the environment, opens (and replays) the
//! store journal, loads and validates the funnel library (refusing to
//! start on any configuration conflict), then serves the webhook and
//! read-model endpoints while the follow-up scheduler ticks in the
//! background.

use std::error::Error;
use std::sync::Arc;

use leadflow::{
    build_router, AppState, AssetLibrary, BillingProcessor, FunnelLibrary, HttpOutboundSender,
    IngressDispatcher, LeadflowConfig, OpenAiCompatClient, ResponseProcessor, Scheduler, Store,
    ThreadLocks, TokenBucket,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let config = Arc::new(LeadflowConfig::from_env());

    let store = Arc::new(match &config.journal_dir {
        Some(dir) => Store::open(dir)?,
        None => {
            log::warn!("JOURNAL_DIR unset; state will not survive a restart");
            Store::in_memory()
        }
    });

    let assets = Arc::new(AssetLibrary::default_library());
    let library = Arc::new(match &config.funnel_file {
        Some(path) => FunnelLibrary::load(path, &assets)?,
        None => {
            let library = FunnelLibrary::default_library(config.cart_recovery_delay);
            library.validate(&assets)?;
            library
        }
    });
    log::info!(
        "Funnel library loaded: {} funnel(s), default {}",
        library.funnels.len(),
        library.default_funnel
    );

    let sender: Arc<dyn leadflow::OutboundSender> = Arc::new(HttpOutboundSender::new(
        &config.sender_endpoint,
        config.sender_token.as_deref(),
        config.sender_timeout,
    ));
    let llm: Arc<dyn leadflow::LlmBackend> = Arc::new(OpenAiCompatClient::new(
        &config.llm_base_url,
        &config.llm_api_key,
        &config.llm_model,
        TokenBucket::new(config.llm_rate_capacity, config.llm_rate_refill_per_sec),
    ));

    let locks = Arc::new(ThreadLocks::new());
    let processor = Arc::new(ResponseProcessor::new(
        store.clone(),
        assets.clone(),
        sender.clone(),
        library.clone(),
        &config.public_base_url,
        config.send_retry_backoff,
    ));
    let dispatcher = Arc::new(IngressDispatcher::new(
        store.clone(),
        processor.clone(),
        llm,
        library.clone(),
        locks.clone(),
        config.clone(),
    ));
    let billing = Arc::new(BillingProcessor::new(
        store.clone(),
        processor.clone(),
        library.clone(),
        locks.clone(),
        config.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        processor,
        locks.clone(),
        config.scheduler_tick,
        config.job_lease,
    ));
    let _scheduler_task = scheduler.spawn();

    let app = build_router(AppState {
        dispatcher,
        billing,
        store,
        sender,
        locks,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    log::info!("leadflowd listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
