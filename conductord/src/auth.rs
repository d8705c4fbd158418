use axum::http::HeaderValue;

/// Optional bearer token guarding the control plane.
#[derive(Clone)]
pub(crate) struct AuthManager {
    token: Option<String>,
}

impl AuthManager {
    pub(crate) fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub(crate) fn validate(&self, header: Option<&HeaderValue>) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return true;
        };

        let raw = match header.and_then(|value| value.to_str().ok()) {
            Some(value) => value.trim(),
            None => return false,
        };

        let presented = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .map(str::trim);

        presented == Some(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_when_no_token() {
        assert!(AuthManager::new(None).validate(None));
    }

    #[test]
    fn requires_matching_bearer() {
        let auth = AuthManager::new(Some("s3cret".into()));
        assert!(!auth.validate(None));
        assert!(!auth.validate(Some(&HeaderValue::from_static("s3cret"))));
        assert!(!auth.validate(Some(&HeaderValue::from_static("Bearer nope"))));
        assert!(auth.validate(Some(&HeaderValue::from_static("Bearer s3cret"))));
        assert!(auth.validate(Some(&HeaderValue::from_static("bearer  s3cret "))));
    }
}
