use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Event broadcast to every subscriber of the supervisor.
///
/// Serializes as `{"channel": ..., "payload": {...}}`, the channel being the name the desktop
/// shell listens on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", content = "payload")]
pub enum BackendEvent {
    #[serde(rename = "python-output")]
    Output {
        #[serde(rename = "type")]
        stream: OutputStream,
        data: String,
    },
    #[serde(rename = "backend-ready")]
    Ready {},
    #[serde(rename = "python-process-crashed")]
    Crashed {
        code: Option<i32>,
        signal: Option<String>,
    },
    #[serde(rename = "python-process-error")]
    Error { error: String },
}

impl BackendEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            BackendEvent::Output { .. } => "python-output",
            BackendEvent::Ready {} => "backend-ready",
            BackendEvent::Crashed { .. } => "python-process-crashed",
            BackendEvent::Error { .. } => "python-process-error",
        }
    }
}

/// Answer to a status query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub running: bool,
    pub ready: bool,
}

/// Answer to a restart request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_their_channel() {
        let output = BackendEvent::Output {
            stream: OutputStream::Stderr,
            data: "Traceback".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!({"channel": "python-output", "payload": {"type": "stderr", "data": "Traceback"}})
        );

        assert_eq!(
            serde_json::to_value(BackendEvent::Ready {}).unwrap(),
            json!({"channel": "backend-ready", "payload": {}})
        );

        let crashed = BackendEvent::Crashed {
            code: None,
            signal: Some("SIGKILL".to_string()),
        };
        assert_eq!(crashed.channel(), "python-process-crashed");
        assert_eq!(
            serde_json::to_value(&crashed).unwrap(),
            json!({"channel": "python-process-crashed", "payload": {"code": null, "signal": "SIGKILL"}})
        );
    }

    #[test]
    fn restart_outcome_omits_missing_error() {
        let outcome = RestartOutcome {
            success: true,
            error: None,
        };
        assert_eq!(
            serde_json::to_string(&outcome).unwrap(),
            r#"{"success":true}"#
        );
    }
}
