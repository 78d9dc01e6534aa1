//! Column transform registry and user-module loader
//!
//! Transforms are named functions addressed as `"<module>.<function>"` from
//! the configuration. The `transform.*` built-ins are always present; user
//! functions come from dynamically loaded transform modules — native
//! libraries (cdylib) that export a [`TRANSFORM_MODULE_ENTRY`] registration
//! symbol. A module is loaded at most once per process, first from the
//! configuration file's directory (`<module>.so` / `.dylib` / `.dll` beside
//! the config), then by library name through the platform loader.
//!
//! A module that cannot be loaded, or a transform name that resolves to
//! nothing after loading, is a configuration error at startup. A name that
//! disappears at runtime degrades to passing the original value through with
//! one warning per function name.
//!
//! A transform module looks like this:
//!
//! ```rust,ignore
//! // crate-type = ["cdylib"], built with the same toolchain as myretl
//! use myretl_lib::TransformRegistry;
//!
//! #[no_mangle]
//! pub fn myretl_register_transforms(registry: &mut TransformRegistry) {
//!     registry.register("transform.mask_email", |value, _row, _table| {
//!         // …
//!         Ok(value.clone())
//!     });
//! }
//! ```

use crate::config::{ColumnSpec, EtlConfig};
use crate::error::{EtlError, EtlResult};
use crate::events::Row;
use libloading::Library;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Transform contract: `f(value, full_row, source_table) -> value`
pub type TransformFn = Arc<dyn Fn(&Value, &Row, &str) -> EtlResult<Value> + Send + Sync>;

/// Registration entry point a transform module must export
pub type TransformModuleEntry = fn(&mut TransformRegistry);

/// Symbol name of the registration entry point
pub const TRANSFORM_MODULE_ENTRY: &[u8] = b"myretl_register_transforms";

#[cfg(target_os = "windows")]
const DYLIB_EXT: &str = "dll";
#[cfg(target_os = "macos")]
const DYLIB_EXT: &str = "dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const DYLIB_EXT: &str = "so";

/// Named-function registry for column transforms
pub struct TransformRegistry {
    // Dropped before `libraries` (declaration order) so registered closures
    // never outlive the code they point into.
    functions: HashMap<String, TransformFn>,
    /// Function names already warned about, so degraded lookups log once
    warned: Mutex<HashSet<String>>,
    /// Modules loaded in this process; each is loaded at most once
    loaded_modules: HashSet<String>,
    libraries: Vec<Library>,
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry")
            .field("functions", &names)
            .field("loaded_modules", &self.loaded_modules)
            .finish()
    }
}

impl TransformRegistry {
    /// Empty registry, no built-ins
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
            warned: Mutex::new(HashSet::new()),
            loaded_modules: HashSet::new(),
            libraries: Vec::new(),
        }
    }

    /// Registry with the `transform.*` built-ins registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("transform.uppercase", |value, _, _| {
            Ok(map_string(value, |s| s.to_uppercase()))
        });
        registry.register("transform.lowercase", |value, _, _| {
            Ok(map_string(value, |s| s.to_lowercase()))
        });
        registry.register("transform.trim", |value, _, _| {
            Ok(map_string(value, |s| s.trim().to_string()))
        });
        registry.register("transform.length", |value, _, _| {
            Ok(match value {
                Value::Null => Value::Null,
                Value::String(s) => Value::from(s.chars().count()),
                other => Value::from(other.to_string().chars().count()),
            })
        });
        registry
    }

    /// Register a transform under its full `"<module>.<function>"` name.
    /// Registering an existing name replaces it.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Value, &Row, &str) -> EtlResult<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
    }

    /// Look up a transform by its full name
    pub fn resolve(&self, name: &str) -> Option<TransformFn> {
        self.functions.get(name).cloned()
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load every transform module the configuration references and the
    /// registry cannot resolve yet. `config_dir` is the directory of the
    /// configuration file; a `<module>.<ext>` library beside the config wins
    /// over the platform library search.
    ///
    /// Called before mapping resolution so unresolved names fail startup.
    pub fn load_required_modules(
        &mut self,
        config: &EtlConfig,
        config_dir: Option<&Path>,
    ) -> EtlResult<()> {
        let mut modules: Vec<String> = Vec::new();
        for (key, mapping) in &config.mapping {
            for spec in mapping.column_mapping.values() {
                let Some(name) = spec.transform_name() else {
                    continue;
                };
                if self.resolve(name).is_some() {
                    continue;
                }
                let Some((module, _)) = name.split_once('.') else {
                    return Err(EtlError::config(format!(
                        "mapping '{key}': transform '{name}' must be named '<module>.<function>'"
                    )));
                };
                if !modules.iter().any(|m| m == module) {
                    modules.push(module.to_string());
                }
            }
        }
        modules.sort();

        for module in modules {
            self.load_module(&module, config_dir)?;
        }
        Ok(())
    }

    /// Load one transform module and run its registration entry point.
    ///
    /// Resolution order: `<config_dir>/<module>.<ext>`, then
    /// `<config_dir>/lib<module>.<ext>`, then the platform library search by
    /// name. A module already loaded in this process is not loaded again.
    pub fn load_module(&mut self, module: &str, config_dir: Option<&Path>) -> EtlResult<()> {
        if self.loaded_modules.contains(module) {
            return Ok(());
        }

        let sibling = config_dir.and_then(|dir| {
            let candidates = [
                dir.join(format!("{module}.{DYLIB_EXT}")),
                dir.join(libloading::library_filename(module)),
            ];
            candidates.into_iter().find(|p| p.exists())
        });

        let library = match &sibling {
            // SAFETY: loading a library runs its initializers; the module is
            // operator-provided code, trusted the same way the config is.
            Some(path) => unsafe { Library::new(path) }.map_err(|e| {
                EtlError::config(format!(
                    "cannot load transform module '{}' from {}: {e}",
                    module,
                    path.display()
                ))
            })?,
            None => {
                let by_name = libloading::library_filename(module);
                // SAFETY: as above; resolution goes through the platform
                // library search when no sibling file exists.
                unsafe { Library::new(&by_name) }.map_err(|e| {
                    EtlError::config(format!(
                        "cannot load transform module '{module}': no {module}.{DYLIB_EXT} next to \
                         the configuration and the platform loader failed: {e}"
                    ))
                })?
            }
        };

        {
            // SAFETY: the entry point contract is part of the module ABI;
            // modules must be built against this crate's TransformRegistry.
            let entry: libloading::Symbol<TransformModuleEntry> =
                unsafe { library.get(TRANSFORM_MODULE_ENTRY) }.map_err(|e| {
                    EtlError::config(format!(
                        "transform module '{module}' does not export a registration entry point: {e}"
                    ))
                })?;
            entry(self);
        }

        info!(
            module,
            path = %sibling
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| PathBuf::from(libloading::library_filename(module)).display().to_string()),
            "transform module loaded"
        );
        self.loaded_modules.insert(module.to_string());
        self.libraries.push(library);
        Ok(())
    }

    /// Apply a mapping's column specs to a source row, producing the target
    /// row in column-mapping order.
    ///
    /// A transform that cannot be resolved anymore passes the original value
    /// through (warned once); a transform that fails aborts the event with a
    /// transform error, which the target worker counts and drops.
    pub fn apply_columns(
        &self,
        row: &Row,
        columns: &[(String, ColumnSpec)],
        source_table: &str,
    ) -> EtlResult<Row> {
        let mut out = Row::new();
        for (source_col, spec) in columns {
            let original = row.get(source_col).cloned().unwrap_or(Value::Null);

            let value = if let Some(literal) = &spec.value {
                literal.clone()
            } else if let Some(name) = &spec.transform {
                match self.resolve(name) {
                    Some(f) => f(&original, row, source_table).map_err(|e| {
                        EtlError::transform(format!(
                            "transform '{name}' failed on column '{source_col}' of {source_table}: {e}"
                        ))
                    })?,
                    None => {
                        self.warn_once(name, source_table);
                        original
                    }
                }
            } else {
                original
            };

            out.insert(spec.column.clone(), value);
        }
        Ok(out)
    }

    fn warn_once(&self, name: &str, source_table: &str) {
        let mut warned = self.warned.lock().expect("warned set poisoned");
        if warned.insert(name.to_string()) {
            warn!(
                transform = name,
                source_table, "transform function not found, passing original value through"
            );
        }
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Built-ins tolerate null by returning null and leave non-strings untouched
fn map_string<F: Fn(&str) -> String>(value: &Value, f: F) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(column: &str, transform: Option<&str>, value: Option<Value>) -> ColumnSpec {
        ColumnSpec {
            column: column.to_string(),
            primary_key: false,
            transform: transform.map(String::from),
            value,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        let mut r = Row::new();
        for (k, v) in pairs {
            r.insert(k.to_string(), v.clone());
        }
        r
    }

    fn config_with_transform(name: &str) -> EtlConfig {
        let raw = format!(
            r#"{{
            "sources": {{"s1": {{"host": "h", "user": "u", "password": "p", "database": "d"}}}},
            "targets": {{"t1": {{"host": "h", "user": "u", "password": "p", "database": "d"}}}},
            "mapping": {{
                "s1.users": {{
                    "target": "t1.users",
                    "primary_key": "id",
                    "column_mapping": {{
                        "id": {{"column": "id", "primary_key": true}},
                        "name": {{"column": "name", "transform": "{name}"}}
                    }}
                }}
            }}
        }}"#
        );
        EtlConfig::from_json_str(&raw).unwrap()
    }

    #[test]
    fn test_builtins_null_tolerant() {
        let registry = TransformRegistry::with_builtins();
        let empty = Row::new();
        for name in [
            "transform.uppercase",
            "transform.lowercase",
            "transform.trim",
            "transform.length",
        ] {
            let f = registry.resolve(name).unwrap();
            assert_eq!(f(&Value::Null, &empty, "db.t").unwrap(), Value::Null, "{name}");
        }
    }

    #[test]
    fn test_seed_scenario_uppercase_lowercase() {
        // Spec seed 1: name→uppercase, email→lowercase, id copied
        let registry = TransformRegistry::with_builtins();
        let columns = vec![
            ("id".to_string(), spec("id", None, None)),
            ("name".to_string(), spec("name", Some("transform.uppercase"), None)),
            ("email".to_string(), spec("email", Some("transform.lowercase"), None)),
        ];
        let input = row(&[
            ("id", json!(1)),
            ("name", json!("John")),
            ("email", json!("J@X")),
        ]);
        let out = registry.apply_columns(&input, &columns, "shop.users").unwrap();
        assert_eq!(out.get("id"), Some(&json!(1)));
        assert_eq!(out.get("name"), Some(&json!("JOHN")));
        assert_eq!(out.get("email"), Some(&json!("j@x")));
        // Output preserves column-mapping order
        let keys: Vec<&String> = out.keys().collect();
        assert_eq!(keys, vec!["id", "name", "email"]);
    }

    #[test]
    fn test_static_value_and_copy_of_missing() {
        let registry = TransformRegistry::with_builtins();
        let columns = vec![
            ("ignored".to_string(), spec("origin", None, Some(json!("replica-a")))),
            ("gone".to_string(), spec("gone", None, None)),
        ];
        let out = registry
            .apply_columns(&row(&[("x", json!(1))]), &columns, "db.t")
            .unwrap();
        assert_eq!(out.get("origin"), Some(&json!("replica-a")));
        assert_eq!(out.get("gone"), Some(&Value::Null));
    }

    #[test]
    fn test_unresolved_transform_passes_through() {
        let registry = TransformRegistry::with_builtins();
        let columns = vec![(
            "name".to_string(),
            spec("name", Some("transform.vanished"), None),
        )];
        let input = row(&[("name", json!("keep me"))]);
        let out = registry.apply_columns(&input, &columns, "db.t").unwrap();
        assert_eq!(out.get("name"), Some(&json!("keep me")));
    }

    #[test]
    fn test_failing_transform_aborts_event() {
        let mut registry = TransformRegistry::with_builtins();
        registry.register("user.explode", |_, _, _| Err(EtlError::generic("boom")));
        let columns = vec![("name".to_string(), spec("name", Some("user.explode"), None))];
        let err = registry
            .apply_columns(&row(&[("name", json!("x"))]), &columns, "db.t")
            .unwrap_err();
        assert!(matches!(err, EtlError::Transform(_)));
    }

    #[test]
    fn test_user_function_sees_full_row() {
        let mut registry = TransformRegistry::with_builtins();
        registry.register("user.full_name", |_, full_row, _| {
            let first = full_row.get("first").and_then(Value::as_str).unwrap_or("");
            let last = full_row.get("last").and_then(Value::as_str).unwrap_or("");
            Ok(Value::String(format!("{first} {last}")))
        });
        let columns = vec![("first".to_string(), spec("full_name", Some("user.full_name"), None))];
        let input = row(&[("first", json!("Ada")), ("last", json!("Lovelace"))]);
        let out = registry.apply_columns(&input, &columns, "db.people").unwrap();
        assert_eq!(out.get("full_name"), Some(&json!("Ada Lovelace")));
    }

    #[test]
    fn test_length_counts_chars() {
        let registry = TransformRegistry::with_builtins();
        let f = registry.resolve("transform.length").unwrap();
        assert_eq!(f(&json!("héllo"), &Row::new(), "t").unwrap(), json!(5));
        assert_eq!(f(&json!(1234), &Row::new(), "t").unwrap(), json!(4));
    }

    #[test]
    fn test_resolvable_names_need_no_module() {
        // Every referenced transform is a built-in, so nothing gets loaded
        let config = config_with_transform("transform.uppercase");
        let mut registry = TransformRegistry::with_builtins();
        registry.load_required_modules(&config, None).unwrap();
        assert!(registry.loaded_modules.is_empty());
    }

    #[test]
    fn test_missing_module_is_config_error() {
        let config = config_with_transform("no_such_module.masker");
        let mut registry = TransformRegistry::with_builtins();
        let dir = tempfile::tempdir().unwrap();
        let err = registry
            .load_required_modules(&config, Some(dir.path()))
            .unwrap_err();
        assert!(matches!(err, EtlError::Config(_)), "got {err:?}");
        assert!(err.to_string().contains("no_such_module"));
    }

    #[test]
    fn test_unqualified_transform_name_rejected() {
        let config = config_with_transform("not_qualified");
        let mut registry = TransformRegistry::with_builtins();
        let err = registry.load_required_modules(&config, None).unwrap_err();
        assert!(err.to_string().contains("'<module>.<function>'"));
    }

    #[test]
    fn test_sibling_file_that_is_not_a_library_fails() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("junk.{DYLIB_EXT}"));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"not a shared object")
            .unwrap();

        let mut registry = TransformRegistry::with_builtins();
        let err = registry.load_module("junk", Some(dir.path())).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
        assert!(err.to_string().contains("junk"));
    }
}
