use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Tunables for the workflow engine's timing decisions (spec.md §4.D/§5/§9).
/// None of these are persisted; they're process-level knobs loaded once at
/// startup, the same way `DatabaseConfig`/`RedisConfig` are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEngineConfig {
    /// Delays shorter than this run synchronously (spec.md §4.D). The spec
    /// leaves the exact threshold as an implementer choice; 60s is the
    /// recommended default and is configurable per Design Note §9.
    pub sync_delay_threshold_secs: u64,
    /// Delays longer than this are rejected at validation time.
    pub max_delay_secs: u64,
    /// Continuation tick-worker cadence.
    pub continuation_tick_secs: u64,
    /// Schedule tick-worker cadence.
    pub schedule_tick_secs: u64,
    /// Buffer tick-worker cadence.
    pub buffer_tick_secs: u64,
    /// Batch size bound for each tick-worker's due-record selection.
    pub tick_batch_limit: usize,
    /// Multiplier applied to node count for the workflow executor's hop
    /// limit (spec.md §4.C step 1: `hop_limit = 2 × |nodes|`).
    pub hop_limit_multiplier: usize,
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            sync_delay_threshold_secs: std::env::var("WORKFLOW_SYNC_DELAY_THRESHOLD_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            max_delay_secs: std::env::var("WORKFLOW_MAX_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24 * 3600),
            continuation_tick_secs: std::env::var("WORKFLOW_CONTINUATION_TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            schedule_tick_secs: std::env::var("WORKFLOW_SCHEDULE_TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            buffer_tick_secs: std::env::var("WORKFLOW_BUFFER_TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            tick_batch_limit: std::env::var("WORKFLOW_TICK_BATCH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            hop_limit_multiplier: std::env::var("WORKFLOW_HOP_LIMIT_MULTIPLIER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub server: ServerConfig,
    pub workflow_engine: WorkflowEngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/ai_workflow".to_string()),
                max_connections: 10,
                min_connections: 2,
            },
            redis: RedisConfig {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                pool_size: 10,
            },
            server: ServerConfig {
                host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
            },
            workflow_engine: WorkflowEngineConfig::default(),
        }
    }
}
