use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Short mnemonic error codes returned inside the API error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A request that must be authenticated carried no credentials.
    #[serde(rename = "ANONE")]
    CredentialsMissing,
    /// Credentials were present but incorrect.
    #[serde(rename = "AFAIL")]
    CredentialsIncorrect,
    /// The authentication service could not be reached.
    #[serde(rename = "ACONN")]
    AuthServiceUnreachable,
    /// A resource was requested with an unsupported HTTP method.
    #[serde(rename = "MINVAL")]
    MethodNotSupported,
    /// The request carried a malformed query string.
    #[serde(rename = "QINVAL")]
    UnableToParseQuery,
    /// A job submission body was not parseable JSON.
    #[serde(rename = "JPRS")]
    InvalidJobJson,
    /// A form-encoded job request body was malformed.
    #[serde(rename = "JFRM")]
    InvalidJobForm,
    /// A job is missing its "cmd" element.
    #[serde(rename = "JCMD")]
    MissingCommand,
    /// A job carries an invalid result source.
    #[serde(rename = "JRSRC")]
    InvalidResultSource,
    /// A job carries an invalid result type.
    #[serde(rename = "JRTYPE")]
    InvalidResultType,
    /// A job could not be enqueued in the storage engine.
    #[serde(rename = "JQUEUE")]
    EnqueueFailure,
    /// A job query could not be performed by the storage engine.
    #[serde(rename = "JLIST")]
    ListFailure,
    /// A running job's container could not be killed.
    #[serde(rename = "JKILL")]
    KillFailure,
    /// A job record could not be updated.
    #[serde(rename = "JUPD")]
    UpdateFailure,
    /// No job matches the requested jid.
    #[serde(rename = "JNF")]
    JobNotFound,
    /// A storage operation failed for no more specific reason.
    #[serde(rename = "STORE")]
    StorageFailure,
    /// An internal invariant was violated.
    #[serde(rename = "WTF")]
    Invariant,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CredentialsMissing => "ANONE",
            ErrorCode::CredentialsIncorrect => "AFAIL",
            ErrorCode::AuthServiceUnreachable => "ACONN",
            ErrorCode::MethodNotSupported => "MINVAL",
            ErrorCode::UnableToParseQuery => "QINVAL",
            ErrorCode::InvalidJobJson => "JPRS",
            ErrorCode::InvalidJobForm => "JFRM",
            ErrorCode::MissingCommand => "JCMD",
            ErrorCode::InvalidResultSource => "JRSRC",
            ErrorCode::InvalidResultType => "JRTYPE",
            ErrorCode::EnqueueFailure => "JQUEUE",
            ErrorCode::ListFailure => "JLIST",
            ErrorCode::KillFailure => "JKILL",
            ErrorCode::UpdateFailure => "JUPD",
            ErrorCode::JobNotFound => "JNF",
            ErrorCode::StorageFailure => "STORE",
            ErrorCode::Invariant => "WTF",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error report returned to API clients as `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retry: bool,
    #[serde(skip, default = "default_status")]
    pub status: StatusCode,
}

fn default_status() -> StatusCode {
    StatusCode::BAD_REQUEST
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    error: ApiError,
}

impl ApiError {
    pub fn credentials_missing() -> Self {
        ApiError {
            code: ErrorCode::CredentialsMissing,
            message: "You must authenticate.".to_string(),
            hint: Some("Supply an account name and API key with HTTP basic auth.".to_string()),
            retry: false,
            status: StatusCode::UNAUTHORIZED,
        }
    }

    pub fn credentials_incorrect(account: &str) -> Self {
        ApiError {
            code: ErrorCode::CredentialsIncorrect,
            message: format!("Unable to authenticate account [{}]", account),
            hint: Some("Double-check the account name and API key you're providing.".to_string()),
            retry: false,
            status: StatusCode::UNAUTHORIZED,
        }
    }

    pub fn auth_service_unreachable(err: impl std::fmt::Display) -> Self {
        ApiError {
            code: ErrorCode::AuthServiceUnreachable,
            message: format!("Unable to reach the authentication service: {}", err),
            hint: None,
            retry: true,
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn method_not_supported() -> Self {
        ApiError {
            code: ErrorCode::MethodNotSupported,
            message: "Method not supported".to_string(),
            hint: Some("Consult the API documentation for the methods this resource accepts.".to_string()),
            retry: false,
            status: StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    pub fn unable_to_parse_query(detail: impl std::fmt::Display) -> Self {
        ApiError {
            code: ErrorCode::UnableToParseQuery,
            message: format!("Unable to parse query parameters: {}", detail),
            hint: Some("Please only use valid query parameters.".to_string()),
            retry: false,
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn invalid_job_json(err: impl std::fmt::Display) -> Self {
        ApiError {
            code: ErrorCode::InvalidJobJson,
            message: format!("Unable to parse job payload as JSON: {}", err),
            hint: Some("Please supply valid JSON in your request.".to_string()),
            retry: false,
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn invalid_job_form(err: impl std::fmt::Display) -> Self {
        ApiError {
            code: ErrorCode::InvalidJobForm,
            message: format!("Unable to parse the request as a POST body: {}", err),
            hint: Some("Please use valid form encoding in your request.".to_string()),
            retry: false,
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn missing_command() -> Self {
        ApiError {
            code: ErrorCode::MissingCommand,
            message: "All jobs must specify a command to execute.".to_string(),
            hint: Some(r#"Specify a command to execute as a "cmd" element in your job."#.to_string()),
            retry: false,
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn invalid_result_source(raw: &str) -> Self {
        ApiError {
            code: ErrorCode::InvalidResultSource,
            message: format!("Invalid result source [{}]", raw),
            hint: Some(r#"The "result_source" must be either "stdout" or "file:{path}"."#.to_string()),
            retry: false,
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn invalid_result_type(raw: &str) -> Self {
        ApiError {
            code: ErrorCode::InvalidResultType,
            message: format!("Invalid result type [{}]", raw),
            hint: Some(r#"The "result_type" must be one of the following: binary, pickle"#.to_string()),
            retry: false,
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn enqueue_failure(err: impl std::fmt::Display) -> Self {
        ApiError {
            code: ErrorCode::EnqueueFailure,
            message: format!("Unable to enqueue your job: {}", err),
            hint: None,
            retry: true,
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn list_failure(err: impl std::fmt::Display) -> Self {
        ApiError {
            code: ErrorCode::ListFailure,
            message: format!("Unable to list jobs: {}", err),
            hint: Some("This is most likely a storage problem on our end.".to_string()),
            retry: true,
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn kill_failure(err: impl std::fmt::Display) -> Self {
        ApiError {
            code: ErrorCode::KillFailure,
            message: format!("Unable to kill a running job: {}", err),
            hint: Some("The container is misbehaving somehow.".to_string()),
            retry: true,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn update_failure(err: impl std::fmt::Display) -> Self {
        ApiError {
            code: ErrorCode::UpdateFailure,
            message: format!("Unable to update the job: {}", err),
            hint: Some("This is probably a storage error on our end.".to_string()),
            retry: true,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn job_not_found(jid: u64) -> Self {
        ApiError {
            code: ErrorCode::JobNotFound,
            message: format!("Unable to find a job with ID [{}].", jid),
            hint: Some("Make sure that the JID is still valid.".to_string()),
            retry: false,
            status: StatusCode::NOT_FOUND,
        }
    }

    pub fn storage_failure(err: impl std::fmt::Display) -> Self {
        ApiError {
            code: ErrorCode::StorageFailure,
            message: format!("Storage operation failed: {}", err),
            hint: None,
            retry: true,
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn duplicate_jid(jid: u64, count: usize) -> Self {
        ApiError {
            code: ErrorCode::Invariant,
            message: format!("Job query for JID [{}] returned [{}] results.", jid, count),
            hint: Some("Duplicate JID. No clue how that happened.".to_string()),
            retry: false,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(code = %self.code, message = %self.message, "request failed");
        let status = self.status;
        (status, Json(Envelope { error: self })).into_response()
    }
}
