use kiln_core::SessionId;

use crate::error::SourceError;

pub const LOCAL_SCHEME: &str = "local";

/// Points a build at one of the host directories the daemon exposes, plus
/// the per-build knobs that shape the snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalDirectoryIdentifier {
    /// Configured directory name, not a path. The source maps it to a host
    /// path at resolve time.
    pub name: String,
    /// Overrides the context session for cache-key computation only.
    pub session_id: Option<SessionId>,
    /// Extra discriminator mixed into the shared key, so two builds can
    /// keep separate incremental trees for the same directory.
    pub shared_key_hint: String,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl LocalDirectoryIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        LocalDirectoryIdentifier {
            name: name.into(),
            session_id: None,
            shared_key_hint: String::new(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session_id = Some(session);
        self
    }

    pub fn with_shared_key_hint(mut self, hint: impl Into<String>) -> Self {
        self.shared_key_hint = hint.into();
        self
    }

    pub fn with_include_patterns(mut self, patterns: Vec<String>) -> Self {
        self.include_patterns = patterns;
        self
    }

    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }
}

/// Every identifier kind the source registry understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceIdentifier {
    LocalDirectory(LocalDirectoryIdentifier),
}

impl SourceIdentifier {
    /// Parses `"<scheme>://<name>"`.
    pub fn parse(input: &str) -> Result<Self, SourceError> {
        let Some((scheme, rest)) = input.split_once("://") else {
            return Err(SourceError::InvalidIdentifier(format!(
                "{input:?} is not a <scheme>://<name> identifier"
            )));
        };
        match scheme {
            LOCAL_SCHEME => {
                if rest.is_empty() {
                    return Err(SourceError::InvalidIdentifier(format!(
                        "{input:?} is missing a directory name"
                    )));
                }
                Ok(SourceIdentifier::LocalDirectory(
                    LocalDirectoryIdentifier::new(rest),
                ))
            }
            other => Err(SourceError::InvalidIdentifier(format!(
                "unknown source scheme {other:?}"
            ))),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            SourceIdentifier::LocalDirectory(_) => LOCAL_SCHEME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_identifiers() {
        let id = SourceIdentifier::parse("local://workspace").unwrap();
        assert_eq!(id.scheme(), "local");
        let SourceIdentifier::LocalDirectory(local) = id;
        assert_eq!(local.name, "workspace");
        assert_eq!(local.session_id, None);
        assert!(local.include_patterns.is_empty());
    }

    #[test]
    fn rejects_unknown_schemes_and_malformed_input() {
        for input in ["git://repo", "workspace", "local://"] {
            let err = SourceIdentifier::parse(input).unwrap_err();
            assert!(
                matches!(err, SourceError::InvalidIdentifier(_)),
                "{input}: {err}"
            );
        }
    }

    #[test]
    fn builders_fill_every_field() {
        let id = LocalDirectoryIdentifier::new("workspace")
            .with_session(SessionId::new("build-1"))
            .with_shared_key_hint("ci")
            .with_include_patterns(vec!["src/**/*.rs".to_string()])
            .with_exclude_patterns(vec!["target".to_string()]);
        assert_eq!(id.session_id, Some(SessionId::new("build-1")));
        assert_eq!(id.shared_key_hint, "ci");
        assert_eq!(id.include_patterns, vec!["src/**/*.rs"]);
        assert_eq!(id.exclude_patterns, vec!["target"]);
    }
}
