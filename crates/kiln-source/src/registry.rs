use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kiln_cache::ImmutableRef;
use kiln_core::BuildContext;

use crate::error::SourceError;
use crate::identifier::SourceIdentifier;

/// One resolver family, registered under its identifier scheme.
pub trait Source: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Binds an identifier to a handler that can compute cache keys and
    /// build snapshots for it.
    fn resolve(
        &self,
        ctx: &BuildContext,
        id: &SourceIdentifier,
    ) -> Result<Box<dyn SourceHandler>, SourceError>;
}

/// A source bound to one concrete identifier.
pub trait SourceHandler {
    /// Stable key for the current source definition. Computed from the
    /// identifier and session alone; never touches the filesystem.
    fn cache_key(&self, ctx: &BuildContext) -> Result<String, SourceError>;

    /// Materializes the source into a committed snapshot.
    fn snapshot(&self, ctx: &BuildContext) -> Result<ImmutableRef, SourceError>;
}

impl fmt::Debug for dyn SourceHandler + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn SourceHandler")
    }
}

/// Dispatches identifiers to the source registered for their scheme.
#[derive(Default)]
pub struct SourceRegistry {
    sources: HashMap<&'static str, Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` under its scheme, replacing any previous entry.
    pub fn register(&mut self, source: Arc<dyn Source>) {
        self.sources.insert(source.scheme(), source);
    }

    pub fn resolve(
        &self,
        ctx: &BuildContext,
        id: &SourceIdentifier,
    ) -> Result<Box<dyn SourceHandler>, SourceError> {
        let Some(source) = self.sources.get(id.scheme()) else {
            return Err(SourceError::InvalidIdentifier(format!(
                "no source registered for scheme {:?}",
                id.scheme()
            )));
        };
        source.resolve(ctx, id)
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.sources.keys().collect();
        schemes.sort();
        f.debug_struct("SourceRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::LocalDirectoryIdentifier;

    struct FixedKeySource;

    struct FixedKeyHandler;

    impl Source for FixedKeySource {
        fn scheme(&self) -> &'static str {
            "local"
        }

        fn resolve(
            &self,
            _ctx: &BuildContext,
            _id: &SourceIdentifier,
        ) -> Result<Box<dyn SourceHandler>, SourceError> {
            Ok(Box::new(FixedKeyHandler))
        }
    }

    impl SourceHandler for FixedKeyHandler {
        fn cache_key(&self, _ctx: &BuildContext) -> Result<String, SourceError> {
            Ok("fixed".to_string())
        }

        fn snapshot(&self, _ctx: &BuildContext) -> Result<ImmutableRef, SourceError> {
            Err(SourceError::InvalidIdentifier("not materializable".into()))
        }
    }

    #[test]
    fn dispatches_to_the_registered_scheme() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(FixedKeySource));
        let ctx = BuildContext::detached();
        let id = SourceIdentifier::LocalDirectory(LocalDirectoryIdentifier::new("workspace"));
        let handler = registry.resolve(&ctx, &id).unwrap();
        assert_eq!(handler.cache_key(&ctx).unwrap(), "fixed");
    }

    #[test]
    fn unregistered_schemes_are_invalid_identifiers() {
        let registry = SourceRegistry::new();
        let ctx = BuildContext::detached();
        let id = SourceIdentifier::LocalDirectory(LocalDirectoryIdentifier::new("workspace"));
        let err = registry.resolve(&ctx, &id).unwrap_err();
        assert!(matches!(err, SourceError::InvalidIdentifier(_)));
    }
}
