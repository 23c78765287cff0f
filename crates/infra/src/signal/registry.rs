//! Registry of known signal types.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ConfigurationError;

use super::{Signal, SignalModel, TypedSignalModel};

/// Which signal types an operation applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    /// Every registered type.
    #[default]
    All,
    /// Only the named types, in the given order.
    Named(Vec<String>),
}

impl Selection {
    pub fn named<I, N>(names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self::Named(names.into_iter().map(Into::into).collect())
    }

    pub fn one(name: impl Into<String>) -> Self {
        Self::Named(vec![name.into()])
    }
}

/// Every signal type known to a bus, keyed by name (the table name).
#[derive(Clone, Default)]
pub struct SignalRegistry {
    models: BTreeMap<String, Arc<dyn SignalModel>>,
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.models.keys()).finish()
    }
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed signal.
    pub fn register<S: Signal>(&mut self) -> Result<&mut Self, ConfigurationError> {
        self.register_model(Arc::new(TypedSignalModel::<S>::new()))
    }

    /// Register a type-erased signal model.
    ///
    /// Fails on a duplicate name or a zero `burst_count`.
    pub fn register_model(&mut self, model: Arc<dyn SignalModel>) -> Result<&mut Self, ConfigurationError> {
        let name = model.name().to_string();
        if model.settings().burst_count == 0 {
            return Err(ConfigurationError::InvalidBurstCount { name });
        }
        if self.models.contains_key(&name) {
            return Err(ConfigurationError::DuplicateSignalType(name));
        }
        self.models.insert(name, model);
        Ok(self)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<S: Signal>(mut self) -> Result<Self, ConfigurationError> {
        self.register::<S>()?;
        Ok(self)
    }

    /// Look up a signal type by name.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn SignalModel>, ConfigurationError> {
        self.models
            .get(name)
            .ok_or_else(|| ConfigurationError::NotASignalType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Every registered signal type, sorted by name.
    pub fn signal_types(&self) -> impl Iterator<Item = &Arc<dyn SignalModel>> {
        self.models.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Resolve a selection into models.
    ///
    /// Named selections keep their order and drop repeats; an unknown name
    /// fails the whole resolution.
    pub fn resolve(&self, selection: &Selection) -> Result<Vec<Arc<dyn SignalModel>>, ConfigurationError> {
        match selection {
            Selection::All => Ok(self.models.values().cloned().collect()),
            Selection::Named(names) => {
                let mut resolved: Vec<Arc<dyn SignalModel>> = Vec::with_capacity(names.len());
                for name in names {
                    let model = self.get(name)?;
                    if !resolved.iter().any(|m| m.name() == name) {
                        resolved.push(Arc::clone(model));
                    }
                }
                Ok(resolved)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::JsonSignalModel;
    use signalbus_core::{KeyColumn, SignalSettings, TableSchema};

    fn model(name: &str, burst: usize) -> Arc<dyn SignalModel> {
        Arc::new(
            JsonSignalModel::new(TableSchema::owned(name, vec![KeyColumn::int("id")]), name)
                .with_settings(SignalSettings::default().with_burst_count(burst)),
        )
    }

    #[test]
    fn lists_types_by_name() {
        let mut registry = SignalRegistry::new();
        registry
            .register_model(model("b_signal", 1))
            .unwrap()
            .register_model(model("a_signal", 1))
            .unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a_signal", "b_signal"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn rejects_duplicates_and_zero_burst() {
        let mut registry = SignalRegistry::new();
        registry.register_model(model("a_signal", 1)).unwrap();

        assert_eq!(
            registry.register_model(model("a_signal", 1)).err(),
            Some(ConfigurationError::DuplicateSignalType("a_signal".to_string()))
        );
        assert_eq!(
            registry.register_model(model("z_signal", 0)).err(),
            Some(ConfigurationError::InvalidBurstCount {
                name: "z_signal".to_string()
            })
        );
    }

    #[test]
    fn unknown_names_are_not_signal_types() {
        let mut registry = SignalRegistry::new();
        registry.register_model(model("a_signal", 1)).unwrap();

        assert!(matches!(
            registry.resolve(&Selection::named(["a_signal", "users"])),
            Err(ConfigurationError::NotASignalType(name)) if name == "users"
        ));

        let resolved = registry
            .resolve(&Selection::named(["a_signal", "a_signal"]))
            .unwrap();
        assert_eq!(resolved.len(), 1);
    }
}
