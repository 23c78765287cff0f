//! TOML manifest of signal tables.
//!
//! ```toml
//! [[signal]]
//! table = "job_signal"
//! primary_key = [{ name = "id", kind = "int" }]
//! routing_key = "jobs"
//! burst_count = 100
//!
//! [[signal]]
//! table = "ledger_signal"
//! primary_key = [{ name = "account", kind = "text" }, { name = "seq", kind = "int" }]
//! order_by = [{ column = "seq" }]
//! autoflush = false
//! ```
//!
//! Every entry becomes a [`JsonSignalModel`]: each row is published as a JSON
//! message to `exchange` with `routing_key` (the table name by default).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use signalbus_core::{KeyColumn, OrderBy, SignalSettings, TableSchema};
use signalbus_infra::{ConfigurationError, JsonSignalModel, SignalRegistry};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("signal table '{0}' declares no primary key columns")]
    MissingPrimaryKey(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default, rename = "signal")]
    pub signals: Vec<SignalEntry>,
}

/// One signal table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalEntry {
    pub table: String,
    pub primary_key: Vec<KeyColumn>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default = "default_burst_count")]
    pub burst_count: usize,
    #[serde(default = "default_autoflush")]
    pub autoflush: bool,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub routing_key: Option<String>,
}

fn default_burst_count() -> usize {
    1
}

fn default_autoflush() -> bool {
    true
}

impl SignalEntry {
    pub fn model(&self) -> Result<JsonSignalModel, ManifestError> {
        if self.primary_key.is_empty() {
            return Err(ManifestError::MissingPrimaryKey(self.table.clone()));
        }
        let schema = TableSchema::owned(self.table.clone(), self.primary_key.clone());
        let settings = SignalSettings::default()
            .with_burst_count(self.burst_count)
            .with_order_by(self.order_by.iter().cloned())
            .with_autoflush(self.autoflush);
        let routing_key = self.routing_key.clone().unwrap_or_else(|| self.table.clone());

        Ok(JsonSignalModel::new(schema, routing_key)
            .with_exchange(self.exchange.clone())
            .with_settings(settings))
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(text)?)
    }

    /// Register every entry; duplicate tables and a zero `burst_count` are
    /// rejected.
    pub fn registry(&self) -> Result<SignalRegistry, ManifestError> {
        let mut registry = SignalRegistry::new();
        for entry in &self.signals {
            registry.register_model(Arc::new(entry.model()?))?;
        }
        tracing::debug!(signals = registry.len(), "loaded signal manifest");
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalbus_core::{Direction, KeyKind};

    const MANIFEST: &str = r#"
        [[signal]]
        table = "job_signal"
        primary_key = [{ name = "id", kind = "int" }]
        routing_key = "jobs"
        exchange = "outbox"
        burst_count = 100

        [[signal]]
        table = "ledger_signal"
        primary_key = [{ name = "account", kind = "text" }, { name = "seq", kind = "int" }]
        order_by = [{ column = "seq" }, { column = "account", direction = "desc" }]
        autoflush = false
    "#;

    #[test]
    fn parses_entries_with_defaults() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.signals.len(), 2);

        let job = &manifest.signals[0];
        assert_eq!(job.burst_count, 100);
        assert!(job.autoflush);
        assert_eq!(job.routing_key.as_deref(), Some("jobs"));

        let ledger = &manifest.signals[1];
        assert_eq!(ledger.burst_count, 1);
        assert!(!ledger.autoflush);
        assert_eq!(ledger.primary_key[0].kind, KeyKind::Text);
        assert_eq!(ledger.order_by[1].direction, Direction::Desc);
        assert_eq!(ledger.exchange, "");
    }

    #[test]
    fn builds_a_registry() {
        let registry = Manifest::parse(MANIFEST).unwrap().registry().unwrap();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["job_signal", "ledger_signal"]
        );

        let ledger = registry.get("ledger_signal").unwrap();
        assert!(ledger.settings().is_ordered());
        assert_eq!(ledger.schema().primary_key().len(), 2);
    }

    #[test]
    fn routing_key_defaults_to_table_name() {
        let manifest = Manifest::parse(
            r#"
            [[signal]]
            table = "mail_signal"
            primary_key = [{ name = "id", kind = "uuid" }]
            "#,
        )
        .unwrap();
        let model = manifest.signals[0].model().unwrap();
        assert_eq!(model.routing_key(), "mail_signal");
        assert_eq!(model.exchange(), "");
    }

    #[test]
    fn rejects_invalid_entries() {
        let no_key = Manifest::parse("[[signal]]\ntable = \"t\"\nprimary_key = []\n").unwrap();
        assert!(matches!(no_key.registry(), Err(ManifestError::MissingPrimaryKey(t)) if t == "t"));

        let zero_burst =
            Manifest::parse("[[signal]]\ntable = \"t\"\nprimary_key = [{ name = \"id\", kind = \"int\" }]\nburst_count = 0\n")
                .unwrap();
        assert!(matches!(
            zero_burst.registry(),
            Err(ManifestError::Configuration(ConfigurationError::InvalidBurstCount { .. }))
        ));

        let duplicate = format!("{MANIFEST}\n[[signal]]\ntable = \"job_signal\"\nprimary_key = [{{ name = \"id\", kind = \"int\" }}]\n");
        assert!(matches!(
            Manifest::parse(&duplicate).unwrap().registry(),
            Err(ManifestError::Configuration(ConfigurationError::DuplicateSignalType(_)))
        ));

        assert!(matches!(
            Manifest::parse("[[signal]]\ntable = \"t\"\n"),
            Err(ManifestError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Manifest::load(Path::new("/nonexistent/signalbus.toml")).unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
    }
}
