use thiserror::Error;

/// An environment variable required by the application is not set.
#[derive(Debug, Error)]
#[error("Missing environment variable: {0}")]
pub struct MissingEnvVarError(pub String);

/// Reads an environment variable, returning a structured error if it's missing.
///
/// This is a thin wrapper around `std::env::var` that provides a more
/// ergonomic and specific error type for missing variables.
///
/// # Arguments
/// * `name` - The name of the environment variable to read.
pub fn get_env_var(name: &str) -> Result<String, MissingEnvVarError> {
    std::env::var(name).map_err(|_| MissingEnvVarError(name.to_string()))
}

/// Resolve the store location from `DATABASE_URL`, falling back to `default`
/// when the variable is absent.
pub fn database_url_or(default: &str) -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_yields_typed_error() {
        let err = get_env_var("SHARED_UTILS_DEFINITELY_UNSET").unwrap_err();
        assert!(err.to_string().contains("SHARED_UTILS_DEFINITELY_UNSET"));
    }
}
