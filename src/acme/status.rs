use serde::Serialize;
use serde_json::json;

/// Per-stage progress. A stage only moves forward within a cycle:
/// `unknown -> pending -> (ok | error)`. The next cycle resets everything
/// back to `unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Unknown,
    Pending,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageError {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stage {
    pub status: StageState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl Default for Stage {
    fn default() -> Self {
        Self {
            status: StageState::Unknown,
            error: None,
        }
    }
}

impl Stage {
    pub fn pending(&mut self) {
        self.status = StageState::Pending;
    }

    pub fn ok(&mut self) {
        self.status = StageState::Ok;
    }

    pub fn fail(&mut self, kind: &str, data: serde_json::Value) {
        self.status = StageState::Error;
        self.error = Some(StageError {
            kind: kind.to_string(),
            data: Some(data),
        });
    }

    pub fn fail_with_message(&mut self, kind: &str, message: &str) {
        self.fail(kind, json!({ "message": message }));
    }
}

/// The certificate stage additionally carries the parsed expiry and the
/// armed renewal time, both as epoch seconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CertificateStage {
    #[serde(flatten)]
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal: Option<i64>,
}

/// Machine-readable status document served by `GET /acme/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusModel {
    pub directory: Stage,
    pub account: Stage,
    pub certificate: CertificateStage,
}

impl StatusModel {
    pub fn reset(&mut self) {
        *self = StatusModel::default();
    }

    pub fn any_pending(&self) -> bool {
        self.directory.status == StageState::Pending
            || self.account.status == StageState::Pending
            || self.certificate.stage.status == StageState::Pending
    }
}
