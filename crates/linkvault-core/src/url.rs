use crate::error::{RepositoryError, Result};

/// Validates that `raw` is an absolute http(s) URL with a host.
///
/// Invalid input is rejected before any storage is touched.
pub fn validate_url(raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(RepositoryError::InvalidUrl("URL cannot be empty".to_string()));
    }

    let parsed = ::url::Url::parse(raw)
        .map_err(|e| RepositoryError::InvalidUrl(format!("{raw}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(RepositoryError::InvalidUrl(format!(
                "URL scheme must be http or https: {scheme}"
            )))
        }
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(RepositoryError::InvalidUrl(format!("URL must have a host: {raw}")));
    }

    Ok(())
}
