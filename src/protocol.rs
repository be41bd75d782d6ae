use crate::errors::{TransportError, TransportResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Outbound command written to the worker's stdin as one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    pub data: Value,
}

impl Command {
    pub fn new(command: impl Into<String>, data: Value) -> TransportResult<Self> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(TransportError::InvalidCommand(
                "command name cannot be empty".to_string(),
            ));
        }
        if command.chars().any(char::is_control) {
            return Err(TransportError::InvalidCommand(format!(
                "command name '{}' contains control characters",
                command.escape_debug()
            )));
        }
        Ok(Self { command, data })
    }

    /// Compact JSON followed by a single `\n`.
    pub fn encode_line(&self) -> TransportResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// A decoded `{ "event": ..., "data": ... }` line from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: String,
    pub data: Value,
}

impl EventRecord {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Returns `None` unless `value` is an object with a string `event` and a
    /// present `data` key. `data` may be `null`; extra keys are ignored.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut map) = value else {
            return None;
        };
        let event = match map.remove("event")? {
            Value::String(event) => event,
            _ => return None,
        };
        let data = map.remove("data")?;
        Some(Self { event, data })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PongPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncCompletedPayload {
    pub success: bool,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FailurePayload {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(alias = "message")]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Event vocabulary the worker is known to emit. Names that are not listed,
/// or known names whose payload does not match, decode as `Unknown`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum WorkerEvent {
    Pong(PongPayload),
    SyncCompleted(SyncCompletedPayload),
    SyncFailure(FailurePayload),
    LoginSuccess(Value),
    LoginFailure(FailurePayload),
    GetDocumentsSuccess(Value),
    GetDocumentsFailure(FailurePayload),
    SetMainPathSuccess(Value),
    SetMainPathFailure(FailurePayload),
    Error(ErrorPayload),
    #[serde(skip_deserializing)]
    Unknown { event: String, data: Value },
}

impl WorkerEvent {
    pub fn from_record(record: &EventRecord) -> Self {
        let tagged = json!({ "event": record.event, "data": record.data });
        serde_json::from_value(tagged).unwrap_or_else(|_| Self::Unknown {
            event: record.event.clone(),
            data: record.data.clone(),
        })
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown { .. })
    }
}

/// Pair of event names that carry the success and failure result of one
/// command family, e.g. `loginSuccess` / `loginFailure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFamily {
    pub success_event: String,
    pub failure_event: String,
}

impl CommandFamily {
    pub fn new(family: &str) -> Self {
        Self {
            success_event: format!("{family}Success"),
            failure_event: format!("{family}Failure"),
        }
    }

    pub fn with_events(success_event: impl Into<String>, failure_event: impl Into<String>) -> Self {
        Self {
            success_event: success_event.into(),
            failure_event: failure_event.into(),
        }
    }

    pub fn sync_documents() -> Self {
        Self::with_events("syncCompleted", "syncFailure")
    }

    pub fn outcome<'a>(&self, record: &'a EventRecord) -> Option<Result<&'a Value, String>> {
        if record.event == self.success_event {
            Some(Ok(&record.data))
        } else if record.event == self.failure_event {
            Some(Err(failure_message(&record.data)))
        } else {
            None
        }
    }
}

/// Human-readable message carried by a failure event payload.
pub fn failure_message(data: &Value) -> String {
    for key in ["error", "message"] {
        if let Some(message) = data.get(key).and_then(Value::as_str) {
            return message.to_string();
        }
    }
    match data {
        Value::String(message) => message.clone(),
        Value::Null => "unknown failure".to_string(),
        other => other.to_string(),
    }
}

/// Commands understood by the bundled document worker.
#[derive(Clone, PartialEq)]
pub enum WorkerCommand {
    Ping,
    SyncDocuments,
    Login { email: String, password: String },
    GetDocuments { document_id: Option<i64> },
    SetMainPath { path: String },
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::SyncDocuments => "syncDocuments",
            Self::Login { .. } => "login",
            Self::GetDocuments { .. } => "getDocuments",
            Self::SetMainPath { .. } => "setMainPath",
        }
    }

    /// `None` means the channel's default data is sent.
    pub fn payload(&self) -> Option<Value> {
        match self {
            Self::Ping | Self::SyncDocuments => None,
            Self::Login { email, password } => Some(json!({ "email": email, "password": password })),
            Self::GetDocuments { document_id } => {
                document_id.map(|id| json!({ "document_id": id }))
            }
            Self::SetMainPath { path } => Some(json!({ "path": path })),
        }
    }

    pub fn family(&self) -> Option<CommandFamily> {
        match self {
            Self::Ping => None,
            Self::SyncDocuments => Some(CommandFamily::sync_documents()),
            Self::Login { .. } => Some(CommandFamily::new("login")),
            Self::GetDocuments { .. } => Some(CommandFamily::new("getDocuments")),
            Self::SetMainPath { .. } => Some(CommandFamily::new("setMainPath")),
        }
    }
}

impl std::fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Login { email, .. } => f
                .debug_struct("Login")
                .field("email", email)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::GetDocuments { document_id } => f
                .debug_struct("GetDocuments")
                .field("document_id", document_id)
                .finish(),
            Self::SetMainPath { path } => f.debug_struct("SetMainPath").field("path", path).finish(),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, CommandFamily, EventRecord, WorkerCommand, WorkerEvent};
    use serde_json::json;

    #[test]
    fn command_line_is_compact_with_single_terminator() {
        let command = Command::new("ping", json!({})).expect("command");
        assert_eq!(command.encode_line().expect("encode"), "{\"command\":\"ping\",\"data\":{}}\n");
    }

    #[test]
    fn rejects_blank_command_names() {
        assert!(Command::new("", json!({})).is_err());
        assert!(Command::new("   ", json!({})).is_err());
        assert!(Command::new("sync\nDocuments", json!({})).is_err());
    }

    #[test]
    fn record_shape_requires_string_event_and_present_data() {
        assert_eq!(
            EventRecord::from_value(json!({ "event": "x", "data": null })),
            Some(EventRecord::new("x", serde_json::Value::Null))
        );
        assert_eq!(EventRecord::from_value(json!({ "data": 5 })), None);
        assert_eq!(EventRecord::from_value(json!({ "event": "x" })), None);
        assert_eq!(EventRecord::from_value(json!({ "event": 7, "data": 1 })), None);
        assert_eq!(EventRecord::from_value(json!(["event", "data"])), None);
    }

    #[test]
    fn decodes_known_events_and_falls_back_to_unknown() {
        let pong = EventRecord::new("pong", json!({ "message": "Backend activo", "timestamp": 1.5 }));
        match WorkerEvent::from_record(&pong) {
            WorkerEvent::Pong(payload) => {
                assert_eq!(payload.message, "Backend activo");
                assert_eq!(payload.timestamp, Some(1.5));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let failure = EventRecord::new("loginFailure", json!({ "success": false, "error": "Faltan credenciales" }));
        assert!(matches!(
            WorkerEvent::from_record(&failure),
            WorkerEvent::LoginFailure(ref payload) if payload.error == "Faltan credenciales"
        ));

        let error = EventRecord::new("error", json!({ "message": "Comando desconocido: foo" }));
        assert!(matches!(WorkerEvent::from_record(&error), WorkerEvent::Error(_)));

        let future = EventRecord::new("documentIndexed", json!({ "id": 3 }));
        assert!(WorkerEvent::from_record(&future).is_unknown());

        let mismatched = EventRecord::new("syncCompleted", json!("done"));
        assert!(WorkerEvent::from_record(&mismatched).is_unknown());
    }

    #[test]
    fn family_maps_success_and_failure_events() {
        let family = CommandFamily::new("getDocuments");
        let ok = EventRecord::new("getDocumentsSuccess", json!([1, 2]));
        let err = EventRecord::new("getDocumentsFailure", json!({ "success": false, "error": "Documento no encontrado" }));
        let other = EventRecord::new("pong", json!({}));

        assert_eq!(family.outcome(&ok), Some(Ok(&json!([1, 2]))));
        assert_eq!(family.outcome(&err), Some(Err("Documento no encontrado".to_string())));
        assert_eq!(family.outcome(&other), None);

        let sync = WorkerCommand::SyncDocuments.family().expect("family");
        assert_eq!(sync.success_event, "syncCompleted");
    }

    #[test]
    fn login_debug_output_hides_password() {
        let login = WorkerCommand::Login {
            email: "ana@example.com".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", login);
        assert!(rendered.contains("ana@example.com"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(login.payload(), Some(json!({ "email": "ana@example.com", "password": "hunter2" })));
    }
}
