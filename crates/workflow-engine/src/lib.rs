pub mod ai_node;
pub mod channel;
pub mod delay;
pub mod dispatcher;
pub mod executor;
pub mod expression;
pub mod http_node;
pub mod nodes;
pub mod repos;
pub mod schedule;
pub mod validator;

pub use channel::{ChannelBufferWorker, ChannelIngestion};
pub use delay::ContinuationWorker;
pub use dispatcher::TriggerDispatcher;
pub use executor::{suggest_recovery, RecoveryAction, WorkflowExecutor};
pub use schedule::{ScheduleEngine, ScheduleWorker};
pub use validator::{ValidationResult, WorkflowValidator};
