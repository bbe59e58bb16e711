use legacy_tunnel::TunnelError;
use tunnel_protocol::{ErrorPayload, Question, DEFAULT_ERROR_STATUS};

use crate::hooks::HookError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Invalid command \"{0}\"")]
    InvalidCommand(String),

    /// A value is missing or invalid and asking the user could fix it.
    #[error("{message}")]
    Prompt {
        message: String,
        prompt: Box<Question>,
    },

    /// The command itself failed, optionally asking for a specific exit code.
    #[error("{message}")]
    Command {
        message: String,
        status: u16,
        exit_code: i32,
    },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn prompt(message: impl Into<String>, question: Question) -> Self {
        CliError::Prompt {
            message: message.into(),
            prompt: Box::new(question),
        }
    }

    pub fn command(message: impl Into<String>, exit_code: i32) -> Self {
        CliError::Command {
            message: message.into(),
            status: DEFAULT_ERROR_STATUS,
            exit_code,
        }
    }

    /// Recovers a `CliError` that travelled through an `anyhow::Error`.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<CliError>() {
            Ok(err) => err,
            Err(err) => match err.downcast::<TunnelError>() {
                Ok(err) => CliError::Tunnel(err),
                Err(err) => CliError::Other(err),
            },
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Command { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }

    /// The `error` envelope reported to the parent.
    pub fn to_payload(&self) -> ErrorPayload {
        if let CliError::Tunnel(TunnelError::Remote(remote)) = self {
            return ErrorPayload::new(remote.message.clone())
                .with_code(remote.code.clone())
                .with_status(remote.status)
                .with_stack(remote.stack.clone())
                .with_prompt(remote.prompt.clone());
        }
        let mut payload = ErrorPayload::new(self.to_string());
        match self {
            CliError::Prompt { prompt, .. } => {
                payload = payload.with_prompt(Some(prompt.as_ref().clone()));
            }
            CliError::Command { status, .. } => payload = payload.with_status(*status),
            CliError::Hook(HookError::Failed { source, .. }) | CliError::Other(source) => {
                payload = payload.with_stack(Some(format!("{source:?}")));
            }
            _ => {}
        }
        payload
    }
}
