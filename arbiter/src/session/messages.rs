//! Typed frames for the line-delimited JSON session protocol. Inbound and
//! outbound frames are exhaustive sum types discriminated on `type`; an
//! unrecognized `type` is an error, never a silent drop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthUser;
use crate::classify::{Classification, MoveLabel};
use crate::error::{ClientError, ErrorCode};
use crate::eval::Phase;
use crate::suggest::SuggestionSet;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth(AuthRequest),
    /// Legacy one-shot suggestion request, answered with a `result` frame
    Analyze(SuggestionRequest),
    Suggestion(SuggestionRequest),
    AnalyzeNew(ReviewRequestFrame),
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub token: String,
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    pub fen: String,
    #[serde(default)]
    pub moves: Vec<String>,
    pub target_elo: u16,
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default)]
    pub multi_pv: Option<u8>,
    #[serde(default)]
    pub contempt: Option<u8>,
    #[serde(default)]
    pub disable_limit_strength: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequestFrame {
    pub request_id: String,
    pub fen_before: String,
    pub fen_after: String,
    #[serde(rename = "move")]
    pub mov: String,
    #[serde(default)]
    pub moves: Vec<String>,
    /// `"w"` or `"b"`
    pub player_color: String,
    pub target_elo: u16,
    #[serde(default)]
    pub book: bool,
}

/// Splits frame parsing from payload validation so the error kinds stay
/// distinguishable: broken JSON, foreign `type`, or a known request with bad
/// fields.
pub fn parse_client_frame(line: &str) -> Result<ClientMessage, ClientError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| ClientError::new(ErrorCode::InvalidJson, format!("malformed frame: {err}")))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ClientError::new(ErrorCode::UnknownMessageType, "frame has no type field"))?;

    match kind.as_str() {
        "auth" | "analyze" | "suggestion" | "analyze_new" => serde_json::from_value(value)
            .map_err(|err| ClientError::invalid_request(format!("invalid {kind} request: {err}"))),
        other => Err(ClientError::new(
            ErrorCode::UnknownMessageType,
            format!("unknown message type: {other}"),
        )),
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready(ReadyFrame),
    AuthSuccess(AuthSuccessFrame),
    AuthError(AuthErrorFrame),
    VersionError(VersionErrorFrame),
    /// Legacy response to `analyze`
    Result(SuggestionResultFrame),
    SuggestionResult(SuggestionResultFrame),
    AnalysisResult(AnalysisResultFrame),
    AnalysisError(AnalysisErrorFrame),
    Error(ErrorFrame),
}

#[derive(Debug, Serialize)]
pub struct ReadyFrame {
    pub version: VersionInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub min_version: u32,
    pub download_url: String,
}

#[derive(Debug, Serialize)]
pub struct AuthSuccessFrame {
    pub user: AuthUser,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthErrorFrame {
    pub error: ErrorCode,
    pub message: String,
    pub close_code: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionErrorFrame {
    pub min_version: u32,
    pub download_url: String,
    pub close_code: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionResultFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub result: SuggestionSet,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResultFrame {
    pub request_id: String,
    #[serde(rename = "move")]
    pub mov: String,
    pub classification: MoveLabel,
    pub cpl: i32,
    pub accuracy_impact: f64,
    pub weighted_impact: f64,
    pub phase: Phase,
    pub best_move: String,
    pub eval_before: i32,
    pub eval_after: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mate_in_after: Option<i8>,
}

impl AnalysisResultFrame {
    pub fn new(request_id: String, mov: String, classification: Classification) -> Self {
        Self {
            request_id,
            mov,
            classification: classification.label,
            cpl: classification.cpl,
            accuracy_impact: classification.accuracy_impact,
            weighted_impact: classification.weighted_impact,
            phase: classification.phase,
            best_move: classification.best_move,
            eval_before: classification.eval_before,
            eval_after: classification.eval_after,
            mate_in_after: classification.mate_in_after,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisErrorFrame {
    pub request_id: String,
    pub error: ErrorCode,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub error: ErrorCode,
    pub message: String,
    /// Present when the server closes the connection after this frame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_code: Option<u16>,
}

impl ErrorFrame {
    pub fn from_client_error(request_id: Option<String>, err: &ClientError) -> Self {
        Self {
            request_id,
            error: err.code,
            message: err.message.clone(),
            close_code: None,
        }
    }
}
