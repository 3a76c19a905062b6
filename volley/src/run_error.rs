use crate::exit_codes::ExitCode;

#[derive(Debug)]
pub enum RunError {
    InvalidInput(anyhow::Error),
    RuntimeError(anyhow::Error),
}

impl RunError {
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::InvalidInput(_) => ExitCode::InvalidInput,
            Self::RuntimeError(_) => ExitCode::RuntimeError,
        }
    }

    #[must_use]
    pub fn anyhow(&self) -> &anyhow::Error {
        match self {
            Self::InvalidInput(e) | Self::RuntimeError(e) => e,
        }
    }
}

impl From<volley_core::Error> for RunError {
    fn from(err: volley_core::Error) -> Self {
        match err {
            err @ (volley_core::Error::Config(_)
            | volley_core::Error::NoEngine(_)
            | volley_core::Error::UnknownPlugin(_)) => Self::InvalidInput(err.into()),
            err => Self::RuntimeError(err.into()),
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.anyhow())
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.anyhow().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_invalid_input() {
        let err = RunError::from(volley_core::Error::Config(volley_core::ConfigError::NoPhases));
        assert_eq!(err.exit_code(), ExitCode::InvalidInput);

        let err = RunError::from(volley_core::Error::PluginInit {
            name: "x".to_string(),
            source: volley_core::PluginError::new("boom"),
        });
        assert_eq!(err.exit_code(), ExitCode::RuntimeError);
    }
}
