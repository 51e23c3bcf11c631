//! Kind identifier to [`DataService`] constructor mapping

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::postgresql::{PostgreSql, POSTGRESQL_KIND};
use super::service::DataService;
use super::DataServiceError;

type Constructor = Box<dyn Fn() -> Arc<dyn DataService> + Send + Sync>;

/// Lookup table of the data services a run can exercise.
///
/// New kinds register a constructor; call sites only ever ask for a kind by
/// name.
pub struct DataServiceRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl DataServiceRegistry {
    /// A registry with nothing registered
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Register `constructor` under `kind`, replacing any earlier entry
    pub fn register<F>(&mut self, kind: &str, constructor: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn DataService> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Box::new(constructor));
        self
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn DataService>, DataServiceError> {
        self.constructors
            .get(kind)
            .map(|constructor| constructor())
            .ok_or_else(|| DataServiceError::UnknownKind {
                kind: kind.to_string(),
                known: self.kinds().join(", "),
            })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kinds in sorted order
    pub fn kinds(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl Default for DataServiceRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(POSTGRESQL_KIND, || Arc::new(PostgreSql));
        registry
    }
}

impl fmt::Debug for DataServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataServiceRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgresql_registered_by_default() {
        let registry = DataServiceRegistry::default();
        assert!(registry.contains("postgresql"));
        assert_eq!(registry.get("postgresql").unwrap().kind(), "postgresql");
    }

    #[test]
    fn test_unknown_kind() {
        let registry = DataServiceRegistry::default();
        let err = registry.get("mongodb").err().unwrap();
        assert!(matches!(err, DataServiceError::UnknownKind { .. }));
        assert!(err.to_string().contains("postgresql"));
    }

    #[test]
    fn test_register_alias() {
        let mut registry = DataServiceRegistry::empty();
        assert!(registry.get("postgresql").is_err());
        registry
            .register("pg", || Arc::new(PostgreSql))
            .register("postgresql", || Arc::new(PostgreSql));
        assert_eq!(registry.kinds(), vec!["pg", "postgresql"]);
        assert_eq!(registry.get("pg").unwrap().kind(), "postgresql");
    }
}
