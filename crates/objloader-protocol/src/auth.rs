use serde::{Deserialize, Serialize};

/// Authentication for requests to an object server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    Bearer(String),
    #[default]
    Anonymous,
}

impl AuthMethod {
    /// Bearer auth when a non-empty token is given, anonymous otherwise.
    pub fn from_token(token: Option<&str>) -> Self {
        match token {
            Some(token) if !token.is_empty() => Self::Bearer(token.to_string()),
            _ => Self::Anonymous,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Anonymous)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Bearer(_) => "bearer-token",
            Self::Anonymous => "anonymous",
        }
    }

    /// Value for the `Authorization` header, if any.
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            Self::Bearer(token) => Some(format!("Bearer {token}")),
            Self::Anonymous => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_anonymous() {
        assert_eq!(AuthMethod::from_token(None), AuthMethod::Anonymous);
        assert_eq!(AuthMethod::from_token(Some("")), AuthMethod::Anonymous);
        assert!(AuthMethod::from_token(Some("t")).is_authenticated());
    }

    #[test]
    fn bearer_header() {
        assert_eq!(
            AuthMethod::Bearer("abc".into()).authorization_header().as_deref(),
            Some("Bearer abc")
        );
        assert_eq!(AuthMethod::Anonymous.authorization_header(), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(AuthMethod::Anonymous.display_name(), "anonymous");
        assert_eq!(AuthMethod::Bearer("x".into()).display_name(), "bearer-token");
    }
}
