use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Environment variable naming the file descriptor of the IPC socket in the bootstrap.
pub const IPC_FD_ENV: &str = "LEGACY_IPC_FD";
/// File descriptor the spawner places the child end of the socketpair on.
pub const IPC_CHILD_FD: i32 = 3;
/// Upper bound for `call` replies in the child, as a humantime string such as `30s`.
pub const CALL_TIMEOUT_ENV: &str = "LEGACY_CALL_TIMEOUT";
pub const DEFAULT_ERROR_STATUS: u16 = 500;
/// Upper bound for a single framed envelope.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Every value written to the IPC channel, one JSON object per line.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Ready {
        pid: u32,
    },
    Exec(ExecRequest),
    Help(ExecRequest),
    Call {
        id: String,
        path: String,
        #[serde(default)]
        data: Value,
    },
    Response {
        id: String,
        #[serde(default)]
        response: Value,
    },
    Error(ErrorPayload),
    Prompt {
        id: String,
        question: Question,
    },
    Answer {
        id: String,
        #[serde(default)]
        answer: Value,
    },
    Json {
        #[serde(default)]
        data: Value,
    },
    Log {
        #[serde(default)]
        args: Vec<Value>,
    },
    Telemetry {
        #[serde(default)]
        payload: Value,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ready { .. } => "ready",
            Message::Exec(_) => "exec",
            Message::Help(_) => "help",
            Message::Call { .. } => "call",
            Message::Response { .. } => "response",
            Message::Error(_) => "error",
            Message::Prompt { .. } => "prompt",
            Message::Answer { .. } => "answer",
            Message::Json { .. } => "json",
            Message::Log { .. } => "log",
            Message::Telemetry { .. } => "telemetry",
        }
    }

    /// The correlation id, for request and reply messages.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Call { id, .. }
            | Message::Response { id, .. }
            | Message::Prompt { id, .. }
            | Message::Answer { id, .. } => Some(id),
            Message::Error(payload) => payload.id.as_deref(),
            _ => None,
        }
    }
}

/// Payload of the initial `exec`/`help` envelope.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    #[serde(default)]
    pub argv: Map<String, Value>,
    pub command: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub sdk_path: PathBuf,
    #[serde(default)]
    pub prompting_enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Question>,
}

fn default_status() -> u16 {
    DEFAULT_ERROR_STATUS
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            id: None,
            message: message.into(),
            stack: None,
            status: DEFAULT_ERROR_STATUS,
            code: None,
            prompt: None,
        }
    }

    pub fn reply_to(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::new(message)
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_prompt(mut self, prompt: Option<Question>) -> Self {
        self.prompt = prompt;
        self
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// An interactive question the child wants the parent to ask.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Question {
    pub fn text(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "text".to_string(),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn select(name: impl Into<String>, message: impl Into<String>, choices: Vec<Choice>) -> Self {
        Self {
            name: name.into(),
            kind: "select".to_string(),
            message: Some(message.into()),
            choices,
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_select(&self) -> bool {
        self.kind == "select"
    }

    /// The value a select question resolves to without asking anyone.
    pub fn sole_choice(&self) -> Option<&Value> {
        match self.choices.as_slice() {
            [only] if self.is_select() => Some(&only.value),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub value: Value,
}

impl Choice {
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            message: None,
            value: value.into(),
        }
    }

    pub fn titled(message: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            message: Some(message.into()),
            value: value.into(),
        }
    }
}
