//! Output envelope and exit-code mapping.
//!
//! JSON mode emits `{status: "success"|"error", data?, error?}` on stdout;
//! human mode prints data plainly and errors to stderr. Exit codes follow
//! the error taxonomy: 0 success, 2 validation, 3 printer offline, 4 file
//! error, 5 confirmation required, 6 auth, 1 internal.

use serde_json::{json, Value};

use kiln_printers::PrinterError;

/// CLI failure carrying its taxonomy exit code.
#[derive(Debug)]
pub struct CliError {
    pub message: String,
    pub exit_code: i32,
}

impl CliError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 2,
        }
    }

    pub fn offline(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 3,
        }
    }

    pub fn file(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 4,
        }
    }

    pub fn confirmation_required(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 5,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 6,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: 1,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CliError {}

impl From<PrinterError> for CliError {
    fn from(err: PrinterError) -> Self {
        match &err {
            PrinterError::Unreachable { .. } | PrinterError::Timeout { .. } => {
                CliError::offline(err.to_string())
            }
            PrinterError::Auth(_) => CliError::auth(err.to_string()),
            PrinterError::Validation(_) | PrinterError::Unsupported(_) => {
                CliError::validation(err.to_string())
            }
            PrinterError::File(_) => CliError::file(err.to_string()),
            _ => CliError::internal(err.to_string()),
        }
    }
}

impl From<kiln_engine::EngineError> for CliError {
    fn from(err: kiln_engine::EngineError) -> Self {
        match &err {
            kiln_engine::EngineError::Validation(_)
            | kiln_engine::EngineError::InvalidStateTransition { .. }
            | kiln_engine::EngineError::JobNotFound(_)
            | kiln_engine::EngineError::PreflightFailed(_) => CliError::validation(err.to_string()),
            kiln_engine::EngineError::Printer(inner_ref) => {
                // Borrowed match above; rebuild from the display string with
                // the printer mapping.
                match inner_ref {
                    PrinterError::Unreachable { .. } | PrinterError::Timeout { .. } => {
                        CliError::offline(err.to_string())
                    }
                    PrinterError::Auth(_) => CliError::auth(err.to_string()),
                    PrinterError::File(_) => CliError::file(err.to_string()),
                    _ => CliError::internal(err.to_string()),
                }
            }
            _ => CliError::internal(err.to_string()),
        }
    }
}

impl From<kiln_store::StoreError> for CliError {
    fn from(err: kiln_store::StoreError) -> Self {
        CliError::internal(err.to_string())
    }
}

impl From<kiln_credentials::CredentialStoreError> for CliError {
    fn from(err: kiln_credentials::CredentialStoreError) -> Self {
        CliError::internal(err.to_string())
    }
}

/// Emit a success payload.
pub fn print_success(json_mode: bool, data: Value) {
    if json_mode {
        println!("{}", json!({"status": "success", "data": data}));
    } else {
        match &data {
            Value::String(s) => println!("{s}"),
            other => println!(
                "{}",
                serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
            ),
        }
    }
}

/// Emit an error payload and return the exit code.
pub fn print_error(json_mode: bool, err: &CliError) -> i32 {
    if json_mode {
        println!(
            "{}",
            json!({"status": "error", "error": {"message": err.message, "exit_code": err.exit_code}})
        );
    } else {
        eprintln!("error: {}", err.message);
    }
    err.exit_code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printer_errors_map_to_taxonomy_codes() {
        let offline: CliError = PrinterError::Unreachable {
            message: "gone".into(),
            source: None,
        }
        .into();
        assert_eq!(offline.exit_code, 3);

        let auth: CliError = PrinterError::Auth("denied".into()).into();
        assert_eq!(auth.exit_code, 6);

        let file: CliError = PrinterError::File("missing".into()).into();
        assert_eq!(file.exit_code, 4);

        let validation: CliError = PrinterError::Validation("bad".into()).into();
        assert_eq!(validation.exit_code, 2);

        let internal: CliError = PrinterError::Http {
            status: 500,
            message: "boom".into(),
        }
        .into();
        assert_eq!(internal.exit_code, 1);
    }

    #[test]
    fn constructors_carry_expected_codes() {
        assert_eq!(CliError::validation("x").exit_code, 2);
        assert_eq!(CliError::offline("x").exit_code, 3);
        assert_eq!(CliError::file("x").exit_code, 4);
        assert_eq!(CliError::confirmation_required("x").exit_code, 5);
        assert_eq!(CliError::auth("x").exit_code, 6);
        assert_eq!(CliError::internal("x").exit_code, 1);
    }
}
