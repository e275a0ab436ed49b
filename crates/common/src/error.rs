use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("workflow has no nodes")]
    EmptyWorkflow,

    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("on_success/on_failure of node {0} references unknown node: {1}")]
    DanglingEdge(String, String),

    #[error("cycle detected reachable from entry node: {0}")]
    CycleDetected(String),
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("execution exceeded hop limit ({0} visits)")]
    HopLimitExceeded(u32),

    #[error("cyclic workflow detected at node: {0}")]
    CyclicWorkflow(String),

    #[error("node {0} timed out after {1} seconds")]
    Timeout(String, u64),

    #[error("node {0} failed: {1}")]
    NodeExecutionFailed(String, String),

    #[error("workflow validation failed: {0}")]
    ValidationFailed(String),

    #[error("delay cancelled")]
    DelayCancelled,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule not found: {0}")]
    NotFound(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("interval must be between {min}s and {max}s, got {actual}s")]
    IntervalOutOfRange { min: u64, max: u64, actual: u64 },

    #[error("`once` schedules must fire in the future")]
    OnceInPast,

    #[error("workflow {0} already has the maximum of {1} schedules")]
    TooManySchedules(String, usize),

    #[error("schedule config must set exactly one of cron_expression/interval_seconds/scheduled_at")]
    AmbiguousScheduleKind,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("workflow repository unavailable: {0}")]
    RepositoryUnavailable(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("channel not found: {0}")]
    ChannelMissing(String),

    #[error("channel is inactive: {0}")]
    ChannelInactive(String),

    #[error("malformed provider payload: {0}")]
    MalformedPayload(String),

    #[error("send failed: {0}")]
    SendFailed(String),
}

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("syntax error in expression `{0}`: {1}")]
    Syntax(String, String),

    #[error("type error: {0}")]
    TypeError(String),

    #[error("expression nesting exceeds maximum depth ({0})")]
    MaxDepthExceeded(u32),
}
