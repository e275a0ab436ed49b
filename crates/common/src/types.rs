use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type JsonValue = serde_json::Value;
pub type TenantId = Uuid;
pub type WorkflowId = Uuid;
pub type NodeId = String;
pub type ScheduleId = Uuid;
pub type ContinuationId = Uuid;
pub type ChannelId = String;
pub type SenderId = String;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub trigger: WorkflowTrigger,
    pub nodes: Vec<WorkflowNode>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// The entry node is the first node in declaration order.
    pub fn entry_node(&self) -> Option<&WorkflowNode> {
        self.nodes.first()
    }

    pub fn find_node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub filters: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Webhook,
    ChannelWebhook,
    Schedule,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: NodeId,
    pub name: String,
    #[serde(flatten)]
    pub config: NodeConfig,
    #[serde(default)]
    pub on_success: Option<NodeId>,
    #[serde(default)]
    pub on_failure: Option<NodeId>,
    /// Per-node execution deadline, in seconds. Falls back to the executor's
    /// per-kind default when absent (see `NodeConfig::default_timeout_secs`).
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Node configuration as a tagged sum type — the source's duck-typed
/// `HashMap<String, JsonValue>` plus kind-specific `Extract*` helpers,
/// collapsed into one discriminated union per Design Note in spec.md §9.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeConfig {
    #[serde(rename = "HTTP")]
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<JsonValue>,
        #[serde(default)]
        timeout: Option<u64>,
        #[serde(default = "default_success_codes")]
        success_codes: Vec<u16>,
        #[serde(default)]
        retry_on_failure: bool,
        #[serde(default)]
        max_retries: u32,
    },
    #[serde(rename = "SWITCH")]
    Switch {
        field: String,
        cases: HashMap<String, NodeId>,
        #[serde(default)]
        default: Option<NodeId>,
    },
    #[serde(rename = "TRANSFORM")]
    Transform {
        mappings: HashMap<String, JsonValue>,
    },
    #[serde(rename = "LOOP")]
    Loop {
        iterate_over: String,
        item_var: String,
        #[serde(default)]
        index_var: Option<String>,
        body_node: NodeId,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
    #[serde(rename = "VALIDATE")]
    Validate {
        schema: HashMap<String, String>,
        #[serde(default)]
        fail_on_error: bool,
    },
    #[serde(rename = "DELAY")]
    Delay {
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        duration: Option<String>,
        #[serde(default)]
        duration_seconds: Option<u64>,
    },
    #[serde(rename = "AI_AGENT")]
    AiAgent {
        provider: String,
        model: String,
        system_prompt: String,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default)]
        use_memory: bool,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default = "default_max_auto_iterations")]
        max_auto_iterations: u32,
        #[serde(default = "default_max_total_iterations")]
        max_total_iterations: u32,
    },
    #[serde(rename = "CONDITION")]
    Condition {
        field: String,
        operator: ConditionOperator,
        value: JsonValue,
    },
    #[serde(rename = "ACTION")]
    Action {
        #[serde(flatten)]
        action: ActionConfig,
    },
    #[serde(rename = "SEND_MESSAGE")]
    SendMessage {
        channel_id: String,
        recipient_id: String,
        content: JsonValue,
    },
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_success_codes() -> Vec<u16> {
    vec![200, 201, 202, 204]
}

fn default_max_iterations() -> u32 {
    1000
}

fn default_max_auto_iterations() -> u32 {
    3
}

fn default_max_total_iterations() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionConfig {
    SetContext { key: String, value: JsonValue },
    SetState { value: JsonValue },
    ConsoleLog { message: JsonValue },
    Response { body: JsonValue },
}

pub const MAX_LOOP_ITERATIONS: u32 = 10_000;

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// The mutable key-value map carried through a single workflow run.
///
/// Internally JSON-ish (a `serde_json::Map`) so the expression evaluator can
/// interoperate with it directly; `merge_under` is how node output becomes
/// addressable as `step_id.output.field` for later nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    values: serde_json::Map<String, JsonValue>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, JsonValue>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => Self { values: map },
            _ => Self::default(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        self.values.insert(key.into(), value);
    }

    /// Merge a node's output under its node id, so later expressions can
    /// reference `<node_id>.<field>`.
    pub fn merge_under(&mut self, node_id: &str, output: JsonValue) {
        self.values.insert(node_id.to_string(), output);
    }

    /// Resolve a dotted path (`a.b.c`) against the context.
    pub fn get_path(&self, path: &str) -> Option<&JsonValue> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.values.get(first)?;
        for segment in segments {
            current = match current {
                JsonValue::Object(map) => map.get(segment)?,
                JsonValue::Array(items) => {
                    let idx: usize = segment.parse().ok()?;
                    items.get(idx)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn snapshot(&self) -> JsonValue {
        JsonValue::Object(self.values.clone())
    }

    pub fn as_object(&self) -> &serde_json::Map<String, JsonValue> {
        &self.values
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<JsonValue>,
    pub executed_nodes: Vec<NodeResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub name: String,
    pub success: bool,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub tenant_id: TenantId,
    pub workflow_id: WorkflowId,
    #[serde(flatten)]
    pub schedule_type: ScheduleType,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub timezone: String,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum ScheduleType {
    Cron { cron_expression: String },
    Interval { interval_seconds: u64 },
    Once { scheduled_at: DateTime<Utc> },
}

pub const MIN_SCHEDULE_INTERVAL_SECS: u64 = 60;
pub const MAX_SCHEDULE_INTERVAL_SECS: u64 = 7 * 86_400;
pub const MAX_SCHEDULES_PER_WORKFLOW: usize = 10;

// ---------------------------------------------------------------------------
// Continuations (delay resumption)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuation {
    pub id: ContinuationId,
    pub workflow_id: WorkflowId,
    pub tenant_id: TenantId,
    pub node_id: NodeId,
    pub next_node_id: Option<NodeId>,
    pub node_context: JsonValue,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Channel ingestion & buffering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: String,
    pub channel_id: ChannelId,
    pub sender_id: SenderId,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
    pub media_url: Option<String>,
    #[serde(default)]
    pub attachments: Vec<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub recipient_id: String,
    pub content: JsonValue,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub id: String,
    pub sender: SenderId,
    pub content: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<JsonValue>,
    #[serde(default)]
    pub metadata: JsonValue,
    pub message_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBuffer {
    pub tenant_id: TenantId,
    pub channel_id: ChannelId,
    pub sender_id: SenderId,
    pub messages: Vec<BufferedMessage>,
    pub first_message_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

impl MessageBuffer {
    pub fn new(tenant_id: TenantId, channel_id: ChannelId, sender_id: SenderId, message: BufferedMessage) -> Self {
        let now = message.received_at;
        Self {
            tenant_id,
            channel_id,
            sender_id,
            messages: vec![message],
            first_message_at: now,
            last_message_at: now,
        }
    }

    pub fn push(&mut self, message: BufferedMessage) {
        self.last_message_at = message.received_at;
        self.messages.push(message);
    }

    /// Collapses the buffer's messages into a single neutral `IncomingMessage`
    /// per spec.md §4.G.3: text joined by `\n` in arrival order, attachments
    /// concatenated, metadata tagged `buffered` with the coalescing stats.
    /// A single-message buffer (the unbuffered/immediate-dispatch path)
    /// coalesces to itself with `buffered=false`.
    pub fn coalesce(&self) -> IncomingMessage {
        let text = self
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let attachments = self.messages.iter().flat_map(|m| m.attachments.clone()).collect();
        let buffered = self.messages.len() > 1;
        let duration_seconds = (self.last_message_at - self.first_message_at).num_seconds().max(0);

        let last = self.messages.last();
        let metadata = serde_json::json!({
            "buffered": buffered,
            "message_count": self.messages.len(),
            "first_message_at": self.first_message_at,
            "last_message_at": self.last_message_at,
            "buffer_duration_seconds": duration_seconds,
        });

        IncomingMessage {
            message_id: last.map(|m| m.id.clone()).unwrap_or_default(),
            channel_id: self.channel_id.clone(),
            sender_id: self.sender_id.clone(),
            content: MessageContent {
                content_type: last.map(|m| m.message_type.clone()).unwrap_or_else(|| "text".to_string()),
                text: if text.is_empty() { None } else { Some(text) },
                media_url: None,
                attachments,
            },
            timestamp: self.last_message_at,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBufferConfig {
    pub enabled: bool,
    pub window_seconds: u64,
    pub reset_on_message: bool,
    pub max_messages_per_buffer: usize,
}

impl Default for ChannelBufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_seconds: 5,
            reset_on_message: false,
            max_messages_per_buffer: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffered(id: &str, text: &str, at: DateTime<Utc>) -> BufferedMessage {
        BufferedMessage {
            id: id.to_string(),
            sender: "sender-1".to_string(),
            content: text.to_string(),
            received_at: at,
            attachments: vec![],
            metadata: JsonValue::Null,
            message_type: "text".to_string(),
        }
    }

    #[test]
    fn coalesce_joins_text_in_arrival_order_and_tags_buffered() {
        let t0 = Utc::now();
        let mut buffer = MessageBuffer::new(Uuid::new_v4(), "c1".to_string(), "sender-1".to_string(), buffered("m1", "Hey", t0));
        buffer.push(buffered("m2", "Can you", t0 + chrono::Duration::seconds(2)));
        buffer.push(buffered("m3", "help me?", t0 + chrono::Duration::seconds(4)));

        let message = buffer.coalesce();
        assert_eq!(message.content.text.as_deref(), Some("Hey\nCan you\nhelp me?"));
        assert_eq!(message.metadata["buffered"], JsonValue::Bool(true));
        assert_eq!(message.metadata["message_count"], JsonValue::from(3));
        assert_eq!(message.metadata["buffer_duration_seconds"], JsonValue::from(4));
    }

    #[test]
    fn coalesce_single_message_is_not_marked_buffered() {
        let t0 = Utc::now();
        let buffer = MessageBuffer::new(Uuid::new_v4(), "c1".to_string(), "sender-1".to_string(), buffered("m1", "solo", t0));
        let message = buffer.coalesce();
        assert_eq!(message.content.text.as_deref(), Some("solo"));
        assert_eq!(message.metadata["buffered"], JsonValue::Bool(false));
        assert_eq!(message.metadata["message_count"], JsonValue::from(1));
    }
}
