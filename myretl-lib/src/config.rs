//! Configuration model for the ETL pipeline
//!
//! The configuration is a single JSON document with `sources`, `targets`,
//! `replication` and `mapping` sections. Parsing is pure serde; everything
//! that can be rejected before workers start is rejected by
//! [`EtlConfig::validate`], and [`EtlConfig::resolve_mappings`] turns the raw
//! mapping entries into the resolved rules the workers run on.

use crate::error::{EtlError, EtlResult};
use crate::filter::Predicate;
use crate::transform::TransformRegistry;
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Database connection configuration shared by sources and targets
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
}

fn default_port() -> u16 {
    3306
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

/// Target connection configuration: a database plus batching knobs
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    #[serde(flatten)]
    pub database: DatabaseConfig,
    /// Rows accumulated per table before a batch upsert is issued
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds the oldest pending row may wait before a time-based flush
    #[serde(default = "default_batch_flush_interval")]
    pub batch_flush_interval: f64,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_flush_interval() -> f64 {
    1.0
}

impl TargetConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.batch_flush_interval.max(0.01))
    }
}

/// Binlog replication stream configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_server_id")]
    pub server_id: u32,
    /// Binlog file to resume from; `null` starts from the current tail
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_log_pos")]
    pub log_pos: u64,
    /// Accepted for config compatibility. The stream always resumes from the
    /// configured position (or the current tail when `log_file` is null).
    #[serde(default = "default_true")]
    pub resume_stream: bool,
    /// Accepted for config compatibility; reads are always blocking with an
    /// idle-timeout bound.
    #[serde(default = "default_true")]
    pub blocking: bool,
}

fn default_server_id() -> u32 {
    100
}

fn default_log_pos() -> u64 {
    4
}

fn default_true() -> bool {
    true
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            log_file: None,
            log_pos: default_log_pos(),
            resume_stream: true,
            blocking: true,
        }
    }
}

/// Column spec: exactly one of copy / static value / named transform.
///
/// The JSON form is either the shorthand `"src_col": "target_col"` or the
/// full object `{"column": ..., "transform": ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpecDe {
    Short(String),
    Full(ColumnSpec),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub column: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl ColumnSpecDe {
    /// Transform name carried by this spec, if any
    pub fn transform_name(&self) -> Option<&str> {
        match self {
            ColumnSpecDe::Short(_) => None,
            ColumnSpecDe::Full(spec) => spec.transform.as_deref(),
        }
    }

    fn normalize(self) -> ColumnSpec {
        match self {
            ColumnSpecDe::Short(column) => ColumnSpec {
                column,
                primary_key: false,
                transform: None,
                value: None,
            },
            ColumnSpecDe::Full(spec) => spec,
        }
    }
}

/// Raw mapping entry as it appears in the configuration document
#[derive(Debug, Clone, Deserialize)]
pub struct TableMapping {
    /// `"{source}.{table}"`; overrides the mapping key when present
    #[serde(default)]
    pub source_table: Option<String>,
    /// `"{target}.{target_table}"`
    pub target: String,
    pub primary_key: String,
    pub column_mapping: IndexMap<String, ColumnSpecDe>,
    #[serde(default)]
    pub filter: Option<serde_json::Value>,
    #[serde(default)]
    pub init_query: Option<String>,
}

/// Optional monitoring section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Top-level ETL configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EtlConfig {
    pub sources: HashMap<String, DatabaseConfig>,
    pub targets: HashMap<String, TargetConfig>,
    #[serde(default)]
    pub replication: ReplicationConfig,
    pub mapping: HashMap<String, TableMapping>,
    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// A mapping entry resolved against the source/target sections.
///
/// Built once at startup; immutable afterwards (hot reload is a non-goal).
#[derive(Debug, Clone)]
pub struct MappingRule {
    /// Mapping key from the config document
    pub key: String,
    pub source_name: String,
    /// Source table name (schema is the source connection's database)
    pub table: String,
    pub schema: String,
    pub target_name: String,
    pub target_table: String,
    pub primary_key: String,
    /// Target columns in document order
    pub columns: Vec<(String, ColumnSpec)>,
    pub filter: Option<Predicate>,
    pub init_query: Option<String>,
}

impl EtlConfig {
    /// Parse a configuration document from a JSON string
    pub fn from_json_str(json: &str) -> EtlResult<Self> {
        let config: EtlConfig = serde_json::from_str(json)
            .map_err(|e| EtlError::config(format!("invalid configuration JSON: {e}")))?;
        Ok(config)
    }

    /// Load and parse a configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> EtlResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EtlError::config(format!(
                "cannot read configuration file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    /// Split `"target1.users"` into `("target1", "users")`
    pub fn parse_target(&self, target: &str) -> EtlResult<(String, String)> {
        let (name, table) = target.split_once('.').ok_or_else(|| {
            EtlError::config(format!(
                "target must be in 'target_name.table_name' format, got '{target}'"
            ))
        })?;
        if !self.targets.contains_key(name) {
            return Err(EtlError::config(format!(
                "target '{name}' referenced by '{target}' is not configured"
            )));
        }
        Ok((name.to_string(), table.to_string()))
    }

    /// Split a mapping key (or `source_table` override) into source + table
    fn parse_source_table(&self, key: &str, mapping: &TableMapping) -> EtlResult<(String, String)> {
        let effective = mapping.source_table.as_deref().unwrap_or(key);
        let (source, table) = effective.split_once('.').ok_or_else(|| {
            EtlError::config(format!(
                "mapping '{key}' must address its source as 'source_name.table_name'"
            ))
        })?;
        if !self.sources.contains_key(source) {
            return Err(EtlError::config(format!(
                "source '{source}' referenced by mapping '{key}' is not configured"
            )));
        }
        Ok((source.to_string(), table.to_string()))
    }

    pub fn get_source_config(&self, name: &str) -> EtlResult<&DatabaseConfig> {
        self.sources
            .get(name)
            .ok_or_else(|| EtlError::config(format!("source '{name}' not found")))
    }

    pub fn get_target_config(&self, name: &str) -> EtlResult<&TargetConfig> {
        self.targets
            .get(name)
            .ok_or_else(|| EtlError::config(format!("target '{name}' not found")))
    }

    /// Effective metrics port: `metrics_port` wins over the monitoring section
    pub fn effective_metrics_port(&self) -> Option<u16> {
        self.metrics_port.or_else(|| {
            self.monitoring
                .as_ref()
                .and_then(|m| m.metrics_port)
        })
    }

    /// Resolve every mapping entry into a [`MappingRule`].
    ///
    /// This is also where configuration errors that need cross-section
    /// knowledge are raised: unknown source/target references, empty column
    /// mappings, invalid filter trees, unresolved transform names.
    pub fn resolve_mappings(
        &self,
        registry: &TransformRegistry,
    ) -> EtlResult<Vec<Arc<MappingRule>>> {
        if self.sources.is_empty() {
            return Err(EtlError::config("at least one source is required"));
        }
        if self.targets.is_empty() {
            return Err(EtlError::config("at least one target is required"));
        }
        if self.mapping.is_empty() {
            return Err(EtlError::config("at least one mapping is required"));
        }

        let mut rules = Vec::with_capacity(self.mapping.len());
        // Deterministic order for startup logs and tests
        let mut keys: Vec<&String> = self.mapping.keys().collect();
        keys.sort();

        for key in keys {
            let mapping = &self.mapping[key];
            let (source_name, table) = self.parse_source_table(key, mapping)?;
            let (target_name, target_table) = self.parse_target(&mapping.target)?;
            let schema = self.sources[&source_name].database.clone();

            if mapping.column_mapping.is_empty() {
                return Err(EtlError::config(format!(
                    "mapping '{key}' has an empty column_mapping"
                )));
            }
            if mapping.primary_key.is_empty() {
                return Err(EtlError::config(format!(
                    "mapping '{key}' has an empty primary_key"
                )));
            }

            let mut columns = Vec::with_capacity(mapping.column_mapping.len());
            for (source_col, spec) in &mapping.column_mapping {
                let spec = spec.clone().normalize();
                if spec.column.is_empty() {
                    return Err(EtlError::config(format!(
                        "mapping '{key}': column spec for '{source_col}' has an empty target column"
                    )));
                }
                if spec.transform.is_some() && spec.value.is_some() {
                    return Err(EtlError::config(format!(
                        "mapping '{key}': column '{source_col}' specifies both transform and static value"
                    )));
                }
                if let Some(name) = &spec.transform {
                    if registry.resolve(name).is_none() {
                        return Err(EtlError::config(format!(
                            "mapping '{key}': transform '{name}' is not registered"
                        )));
                    }
                }
                columns.push((source_col.clone(), spec));
            }

            // primary_key names a target-space column; a key no column spec
            // produces would make every upsert reference a missing column
            if !columns
                .iter()
                .any(|(_, spec)| spec.column == mapping.primary_key)
            {
                return Err(EtlError::config(format!(
                    "mapping '{key}': primary_key '{}' is not produced by any column_mapping entry",
                    mapping.primary_key
                )));
            }

            let filter = match &mapping.filter {
                Some(raw) => Some(Predicate::parse(raw).map_err(|e| {
                    EtlError::config(format!("mapping '{key}': invalid filter: {e}"))
                })?),
                None => None,
            };

            if let Some(q) = &mapping.init_query {
                if q.trim().is_empty() {
                    return Err(EtlError::config(format!(
                        "mapping '{key}' has an empty init_query"
                    )));
                }
            }

            rules.push(Arc::new(MappingRule {
                key: key.clone(),
                source_name,
                table,
                schema,
                target_name,
                target_table,
                primary_key: mapping.primary_key.clone(),
                columns,
                filter,
                init_query: mapping.init_query.clone(),
            }));
        }

        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "sources": {
            "source1": {
                "host": "127.0.0.1",
                "user": "repl",
                "password": "secret",
                "database": "shop"
            }
        },
        "targets": {
            "target1": {
                "host": "127.0.0.1",
                "port": 3307,
                "user": "etl",
                "password": "secret",
                "database": "warehouse",
                "batch_size": 50,
                "batch_flush_interval": 0.5
            }
        },
        "replication": {"server_id": 401},
        "mapping": {
            "source1.users": {
                "target": "target1.users",
                "primary_key": "id",
                "column_mapping": {
                    "id": {"column": "id", "primary_key": true},
                    "name": {"column": "name", "transform": "transform.uppercase"},
                    "email": "email"
                },
                "filter": {"status": {"eq": "active"}},
                "init_query": "SELECT * FROM users"
            }
        }
    }"#;

    #[test]
    fn test_parse_full_document() {
        let config = EtlConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.replication.server_id, 401);
        assert_eq!(config.sources["source1"].port, 3306);
        assert_eq!(config.targets["target1"].batch_size, 50);
        assert_eq!(
            config.targets["target1"].flush_interval(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_resolve_mappings() {
        let config = EtlConfig::from_json_str(SAMPLE).unwrap();
        let registry = TransformRegistry::with_builtins();
        let rules = config.resolve_mappings(&registry).unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.source_name, "source1");
        assert_eq!(rule.table, "users");
        assert_eq!(rule.schema, "shop");
        assert_eq!(rule.target_name, "target1");
        assert_eq!(rule.target_table, "users");
        // Column order follows the document
        let cols: Vec<&str> = rule.columns.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(cols, vec!["id", "name", "email"]);
        // Shorthand string form means plain copy
        let email = &rule.columns[2].1;
        assert!(email.transform.is_none() && email.value.is_none());
        assert!(rule.filter.is_some());
    }

    #[test]
    fn test_unknown_target_rejected() {
        let raw = SAMPLE.replace("target1.users", "nosuch.users");
        let config = EtlConfig::from_json_str(&raw).unwrap();
        let registry = TransformRegistry::with_builtins();
        let err = config.resolve_mappings(&registry).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)), "got {err:?}");
    }

    #[test]
    fn test_empty_column_mapping_rejected() {
        let raw = SAMPLE.replace(
            r#""column_mapping": {
                    "id": {"column": "id", "primary_key": true},
                    "name": {"column": "name", "transform": "transform.uppercase"},
                    "email": "email"
                },"#,
            r#""column_mapping": {},"#,
        );
        let config = EtlConfig::from_json_str(&raw).unwrap();
        let registry = TransformRegistry::with_builtins();
        let err = config.resolve_mappings(&registry).unwrap_err();
        assert!(err.to_string().contains("empty column_mapping"));
    }

    #[test]
    fn test_primary_key_must_be_a_target_column() {
        let raw = SAMPLE.replace(r#""primary_key": "id","#, r#""primary_key": "user_id","#);
        let config = EtlConfig::from_json_str(&raw).unwrap();
        let registry = TransformRegistry::with_builtins();
        let err = config.resolve_mappings(&registry).unwrap_err();
        assert!(
            err.to_string().contains("primary_key 'user_id'"),
            "got {err}"
        );
    }

    #[test]
    fn test_unresolved_transform_rejected() {
        let raw = SAMPLE.replace("transform.uppercase", "transform.nope");
        let config = EtlConfig::from_json_str(&raw).unwrap();
        let registry = TransformRegistry::with_builtins();
        let err = config.resolve_mappings(&registry).unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn test_source_table_override() {
        let raw = SAMPLE.replace(
            r#""source1.users": {
                "target": "target1.users","#,
            r#""users_rule": {
                "source_table": "source1.users",
                "target": "target1.users","#,
        );
        let config = EtlConfig::from_json_str(&raw).unwrap();
        let registry = TransformRegistry::with_builtins();
        let rules = config.resolve_mappings(&registry).unwrap();
        assert_eq!(rules[0].key, "users_rule");
        assert_eq!(rules[0].source_name, "source1");
        assert_eq!(rules[0].table, "users");
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = EtlConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.sources.len(), 1);

        let err = EtlConfig::load_from_file("/nonexistent/config.json").unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_metrics_port_precedence() {
        let mut config = EtlConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.effective_metrics_port(), None);
        config.monitoring = Some(MonitoringConfig {
            metrics_port: Some(9100),
        });
        assert_eq!(config.effective_metrics_port(), Some(9100));
        config.metrics_port = Some(8081);
        assert_eq!(config.effective_metrics_port(), Some(8081));
    }
}
