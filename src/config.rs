use crate::authz::AuthzMode;
use crate::errors::AppError;

pub const DEFAULT_WRITE_CONCURRENCY: usize = crate::authz::DEFAULT_WRITE_CONCURRENCY;

/// Authorization settings read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthzConfig {
    pub mode: AuthzMode,
    /// Upper bound on concurrent store writes within one matrix batch
    pub write_concurrency: usize,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            mode: AuthzMode::Strict,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }
}

impl AuthzConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let mode = AuthzMode::parse(&std::env::var("AUTHZ_MODE").unwrap_or_default())?;
        let write_concurrency = std::env::var("PERMISSION_WRITE_CONCURRENCY")
            .map(|val| val.parse::<usize>())
            .unwrap_or(Ok(DEFAULT_WRITE_CONCURRENCY))
            .map_err(|_| AppError::configuration("PERMISSION_WRITE_CONCURRENCY must be a positive integer"))?;

        if write_concurrency == 0 {
            return Err(AppError::configuration("PERMISSION_WRITE_CONCURRENCY must be a positive integer"));
        }

        Ok(Self { mode, write_concurrency })
    }
}

pub fn app_port() -> u16 {
    std::env::var("APP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8000)
}
