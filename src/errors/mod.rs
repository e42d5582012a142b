//! Structured error codes for the synthesis engine.
//!
//! Every error that crosses a component boundary (spec loading, oracle calls,
//! HTTP transport, scenario materialization, configuration, internal bugs)
//! carries a stable four-digit code in addition to its message, so failures
//! are greppable in logs and reproducible from a bug report alone.
//!
//! ## Categories
//!
//! | Range | Category              |
//! |-------|-----------------------|
//! | E1xxx | Spec / validation     |
//! | E2xxx | LLM oracle            |
//! | E3xxx | Transport (HTTP)      |
//! | E4xxx | Scenario / assertion  |
//! | E5xxx | Configuration         |
//! | E6xxx | Internal              |

use std::fmt;

/// A four-digit structured error code.
///
/// First digit selects the category, the rest identifies the specific
/// failure within it (see the module docs table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // E1xxx: spec loading, resolution, flatten/unflatten.
    pub const SPEC_UNREADABLE: Self = Self(1001);
    pub const SPEC_UNRESOLVABLE_REF: Self = Self(1002);
    pub const SPEC_REF_CYCLE: Self = Self(1003);
    pub const SPEC_UNKNOWN_OPERATION: Self = Self(1004);
    pub const SPEC_FLATTEN_CYCLE: Self = Self(1005);
    pub const SPEC_INVALID_DOCUMENT: Self = Self(1006);

    // E2xxx: LLM oracle.
    pub const ORACLE_UNAVAILABLE: Self = Self(2001);
    pub const ORACLE_TIMEOUT: Self = Self(2002);
    pub const ORACLE_MALFORMED_OUTPUT: Self = Self(2003);
    pub const ORACLE_RETRIES_EXHAUSTED: Self = Self(2004);
    pub const ORACLE_PLAN_INVALID: Self = Self(2005);

    // E3xxx: transport.
    pub const TRANSPORT_CONNECTION_ERROR: Self = Self(3001);
    pub const TRANSPORT_TIMEOUT: Self = Self(3002);
    pub const TRANSPORT_INVALID_ENCODING: Self = Self(3003);
    pub const TRANSPORT_SERVER_ERROR: Self = Self(3004);

    // E4xxx: scenario / value resolution / replay assertions.
    pub const DEPENDENCY_UNRESOLVED: Self = Self(4001);
    pub const OVERLAY_INVALID: Self = Self(4002);
    pub const MATERIALIZATION_EXHAUSTED: Self = Self(4003);
    pub const ASSERTION_STATUS_CODE: Self = Self(4004);
    pub const ASSERTION_CAPTURE_PATH_NOT_FOUND: Self = Self(4005);

    // E5xxx: configuration.
    pub const MISSING_PROVIDER_CONFIG: Self = Self(5001);
    pub const INVALID_RUN_LIMITS: Self = Self(5002);
    pub const INVALID_ENV_INIT_SCRIPT: Self = Self(5003);
    pub const SPEC_PATH_NOT_FOUND: Self = Self(5004);

    // E6xxx: internal.
    pub const INTERNAL_ERROR: Self = Self(6001);
    pub const NO_HANDLER_FOR_ACTION: Self = Self(6002);
    pub const SERIALIZATION_ERROR: Self = Self(6003);

    pub fn code(&self) -> u16 {
        self.0
    }

    /// `E` followed by four digits, e.g. `E4002`.
    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Spec,
            2 => ErrorCategory::Oracle,
            3 => ErrorCategory::Transport,
            4 => ErrorCategory::Scenario,
            5 => ErrorCategory::Configuration,
            6 => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "specification could not be read",
            1002 => "$ref could not be resolved",
            1003 => "$ref cycle detected",
            1004 => "operation id not found in specification",
            1005 => "flatten/unflatten encountered a cyclic structure",
            1006 => "specification document is not valid JSON or YAML",
            2001 => "oracle endpoint unavailable",
            2002 => "oracle call timed out",
            2003 => "oracle returned malformed output",
            2004 => "oracle retries exhausted",
            2005 => "oracle-selected plan failed validation",
            3001 => "connection error",
            3002 => "request timed out",
            3003 => "response could not be decoded",
            3004 => "server returned a 5xx response",
            4001 => "value slot references an unresolved key",
            4002 => "scenario overlay is invalid",
            4003 => "scenario materialization exhausted its retry budget",
            4004 => "replay assertion on status code failed",
            4005 => "replay capture path not found in response",
            5001 => "no LLM provider environment group is configured",
            5002 => "run configuration exceeds a safety limit",
            5003 => "environment-init script has an unsupported extension",
            5004 => "specification path does not exist",
            6001 => "internal error",
            6002 => "no handler registered for this action",
            6003 => "serialization failed",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Spec,
    Oracle,
    Transport,
    Scenario,
    Configuration,
    Internal,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spec => write!(f, "spec"),
            Self::Oracle => write!(f, "oracle"),
            Self::Transport => write!(f, "transport"),
            Self::Scenario => write!(f, "scenario"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// An error with a stable code, a message, and optional reproduction context.
#[derive(Debug)]
pub struct StructuredError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<ErrorContext>,
}

/// Everything needed to reproduce a failure without re-running the engine.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub target_op_id: Option<String>,
    pub step_id: Option<String>,
    pub attempt: Option<u32>,
    pub path: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_target(mut self, target_op_id: impl Into<String>) -> Self {
        self.context.get_or_insert_with(Default::default).target_op_id = Some(target_op_id.into());
        self
    }

    pub fn with_step_id(mut self, step_id: impl Into<String>) -> Self {
        self.context.get_or_insert_with(Default::default).step_id = Some(step_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.context.get_or_insert_with(Default::default).attempt = Some(attempt);
        self
    }

    pub fn user_message(&self) -> String {
        let mut msg = format!("[{}] {}", self.code, self.message);

        if let Some(ctx) = &self.context {
            if let Some(target) = &ctx.target_op_id {
                msg.push_str(&format!(" (target: {})", target));
            }
            if let Some(step_id) = &ctx.step_id {
                msg.push_str(&format!(" (step: {})", step_id));
            }
            if let Some(attempt) = ctx.attempt {
                msg.push_str(&format!(" (attempt: {})", attempt));
            }
            if let (Some(expected), Some(actual)) = (&ctx.expected, &ctx.actual) {
                msg.push_str(&format!(" [expected: {}, got: {}]", expected, actual));
            }
        }

        msg
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for StructuredError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_four_digits() {
        assert_eq!(ErrorCode::SPEC_UNREADABLE.formatted(), "E1001");
        assert_eq!(ErrorCode::ORACLE_TIMEOUT.formatted(), "E2002");
        assert_eq!(ErrorCode::ASSERTION_STATUS_CODE.formatted(), "E4004");
    }

    #[test]
    fn categorizes_by_leading_digit() {
        assert_eq!(ErrorCode::SPEC_UNREADABLE.category(), ErrorCategory::Spec);
        assert_eq!(ErrorCode::ORACLE_TIMEOUT.category(), ErrorCategory::Oracle);
        assert_eq!(ErrorCode::TRANSPORT_TIMEOUT.category(), ErrorCategory::Transport);
        assert_eq!(ErrorCode::OVERLAY_INVALID.category(), ErrorCategory::Scenario);
        assert_eq!(
            ErrorCode::MISSING_PROVIDER_CONFIG.category(),
            ErrorCategory::Configuration
        );
        assert_eq!(ErrorCode::INTERNAL_ERROR.category(), ErrorCategory::Internal);
    }

    #[test]
    fn user_message_includes_context() {
        let err = StructuredError::new(ErrorCode::DEPENDENCY_UNRESOLVED, "missing key")
            .with_target("createOrder")
            .with_step_id("createOrder_1")
            .with_attempt(2);

        let msg = err.user_message();
        assert!(msg.contains("E4001"));
        assert!(msg.contains("createOrder"));
        assert!(msg.contains("attempt: 2"));
    }
}
