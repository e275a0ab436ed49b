//! Composition root: wires the repositories, the executor, the trigger
//! dispatcher, and the three tick workers together and serves the HTTP
//! surface, the way the teacher's `api-gateway::main` boots its server.

use ai_service::HttpAiProvider;
use server::{create_server, AppState, DispatchOnFlush};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workflow_engine::channel::ChannelIngestion;
use workflow_engine::dispatcher::TriggerDispatcher;
use workflow_engine::nodes::NullChannelManager;
use workflow_engine::repos::{
    ChannelBufferConfigRegistry, ContinuationRepository, InMemoryContinuationRepository,
    InMemoryScheduleRepository, InMemoryWorkflowRepository, MokaBufferStore, WorkflowRepository,
    WorkflowScheduleRepository,
};
use workflow_engine::{ChannelBufferWorker, ContinuationWorker, ScheduleWorker, WorkflowExecutor};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "server=info,workflow_engine=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = common::config::AppConfig::default();

    let workflow_repo: Arc<dyn WorkflowRepository> = Arc::new(InMemoryWorkflowRepository::new());
    let schedule_repo: Arc<dyn WorkflowScheduleRepository> = Arc::new(InMemoryScheduleRepository::new());
    let continuation_repo: Arc<dyn ContinuationRepository> = Arc::new(InMemoryContinuationRepository::new());
    let buffer_store = Arc::new(MokaBufferStore::new());
    let buffer_configs = Arc::new(ChannelBufferConfigRegistry::new());

    let executor = Arc::new(WorkflowExecutor::new(
        Arc::new(HttpAiProvider::new()),
        None,
        Arc::new(NullChannelManager),
        continuation_repo.clone(),
        config.workflow_engine.hop_limit_multiplier,
        config.workflow_engine.sync_delay_threshold_secs,
        config.workflow_engine.max_delay_secs,
    ));

    let dispatcher = Arc::new(TriggerDispatcher::new(executor.clone(), workflow_repo.clone()));
    let channel_ingestion = Arc::new(ChannelIngestion::new(buffer_store.clone()));

    let continuation_worker = Arc::new(ContinuationWorker::new(
        executor.clone(),
        continuation_repo.clone(),
        workflow_repo.clone(),
        Duration::from_secs(config.workflow_engine.continuation_tick_secs),
        config.workflow_engine.tick_batch_limit,
    ));
    tokio::spawn(continuation_worker.run());

    let schedule_worker = Arc::new(ScheduleWorker::new(
        dispatcher.clone(),
        schedule_repo.clone(),
        workflow_repo.clone(),
        Duration::from_secs(config.workflow_engine.schedule_tick_secs),
        config.workflow_engine.tick_batch_limit,
    ));
    tokio::spawn(schedule_worker.run());

    let buffer_worker = Arc::new(ChannelBufferWorker::new(
        buffer_store.clone(),
        Arc::new(DispatchOnFlush::new(dispatcher.clone())),
        Duration::from_secs(config.workflow_engine.buffer_tick_secs),
    ));
    tokio::spawn(buffer_worker.run());

    let state = AppState {
        dispatcher,
        channel_ingestion,
        buffer_configs,
        channel_credentials: Arc::new(RwLock::new(HashMap::new())),
        workflow_repo,
        executor,
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(%addr, "starting workflow engine server");

    let app = create_server(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));
    axum::serve(listener, app).await.expect("server error");
}
