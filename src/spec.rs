//! Job specification and the executable/handler registries.
//!
//! A spec is a JSON (or YAML) object with required `exec_type` and
//! `exec_info` keys and optional `memory_estimate` / `cpu_estimate`
//! fields. `exec_type` is either a registry key (`"python3"`) or an inline
//! `{executable, handler}` pair where either value may start with `!` to
//! reference the registries. `exec_info` is opaque to the supervisor and
//! serialized verbatim to each worker on startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::warn;

use crate::protocol::SetupError;

/// Default per-worker memory estimate: 64 MiB.
pub const DEFAULT_MEMORY_ESTIMATE: f64 = 64.0 * 1024.0 * 1024.0;
/// Default per-worker CPU estimate: one core.
pub const DEFAULT_CPU_ESTIMATE: f64 = 1.0;

/// Environment variable overriding where built-in handler runners live.
pub const HANDLERS_DIR_ENV: &str = "MULTIRUN_HANDLERS_DIR";

/// An immutable job specification.
///
/// Kept as the raw object it was loaded from; accessors surface the fields
/// the supervisor needs, with the error phases the run reports
/// (`getting exec_type`, `getting exec_info`).
#[derive(Debug, Clone)]
pub struct JobSpec {
    raw: Value,
}

/// How workers for this job are launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecType {
    /// A registry key: both the command vector and the handler path come
    /// from the registries.
    Named(String),
    /// Inline pair; either element may be a `!name` registry reference.
    Inline { executable: String, handler: String },
}

impl JobSpec {
    pub fn from_value(raw: Value) -> Self {
        JobSpec { raw }
    }

    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    pub fn exec_type(&self) -> std::result::Result<ExecType, SetupError> {
        let when = "getting exec_type";
        match self.raw.get("exec_type") {
            Some(Value::String(name)) => Ok(ExecType::Named(name.clone())),
            Some(Value::Object(map)) => {
                let field = |key: &str| {
                    map.get(key)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            SetupError::new(when, format!("exec_type object is missing '{key}'"))
                        })
                };
                Ok(ExecType::Inline {
                    executable: field("executable")?,
                    handler: field("handler")?,
                })
            }
            Some(other) => Err(SetupError::new(
                when,
                format!("exec_type must be a string or object, got: {other}"),
            )),
            None => Err(SetupError::new(when, "spec has no exec_type")),
        }
    }

    pub fn exec_info(&self) -> std::result::Result<&Value, SetupError> {
        self.raw
            .get("exec_info")
            .ok_or_else(|| SetupError::new("getting exec_info", "spec has no exec_info"))
    }

    pub fn memory_estimate(&self) -> f64 {
        self.raw
            .get("memory_estimate")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_MEMORY_ESTIMATE)
    }

    pub fn cpu_estimate(&self) -> f64 {
        self.raw
            .get("cpu_estimate")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_CPU_ESTIMATE)
    }

    /// Custom registry entries carried in the spec file itself, merged
    /// over the built-ins by [`Registry::merge_spec`].
    fn table(&self, key: &str) -> Option<&serde_json::Map<String, Value>> {
        self.raw.get(key).and_then(Value::as_object)
    }
}

/// Process-wide mapping from runner names to launch commands and handler
/// paths.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    /// Runner name → argv prefix used to launch a worker.
    pub executables: HashMap<String, Vec<String>>,
    /// Runner name → handler-runner path passed as the last argv element.
    pub handlers: HashMap<String, PathBuf>,
}

impl Registry {
    /// Built-in runners: python variants and node, probed on PATH, with
    /// handler runners under the handlers directory.
    pub fn builtin() -> Self {
        let python3 = first_on_path(&["python3", "python"], "python3");
        let python2 = first_on_path(&["python2", "python"], "python");
        let node = first_on_path(&["node"], "node");
        let dir = handlers_dir();

        let mut executables = HashMap::new();
        executables.insert("python".into(), vec![python3.clone(), "-u".into()]);
        executables.insert("python3".into(), vec![python3, "-u".into()]);
        executables.insert("python2".into(), vec![python2, "-u".into()]);
        executables.insert("node".into(), vec![node, "--no-deprecation".into()]);

        let mut handlers = HashMap::new();
        for name in ["python", "python2", "python3"] {
            handlers.insert(name.into(), dir.join("python.py"));
        }
        handlers.insert("node".into(), dir.join("node.js"));

        Registry {
            executables,
            handlers,
        }
    }

    /// Merge `executables` / `handlers` tables from the spec file over the
    /// built-ins. Entries with unexpected shapes are skipped with a
    /// warning.
    pub fn merge_spec(&mut self, spec: &JobSpec) {
        if let Some(table) = spec.table("executables") {
            for (name, value) in table {
                match serde_json::from_value::<Vec<String>>(value.clone()) {
                    Ok(argv) if !argv.is_empty() => {
                        self.executables.insert(name.clone(), argv);
                    }
                    _ => warn!(name = %name, "ignoring malformed executables entry in spec"),
                }
            }
        }
        if let Some(table) = spec.table("handlers") {
            for (name, value) in table {
                match value.as_str() {
                    Some(path) => {
                        self.handlers.insert(name.clone(), PathBuf::from(path));
                    }
                    None => warn!(name = %name, "ignoring malformed handlers entry in spec"),
                }
            }
        }
    }

    /// Resolve an exec type into the worker launch command: the argv
    /// prefix plus the handler path appended as the final element.
    pub fn resolve(&self, exec_type: &ExecType) -> std::result::Result<Vec<String>, SetupError> {
        let when = "resolving executable/handler paths";
        let (executable, handler) = match exec_type {
            ExecType::Named(name) => {
                let exe = self.executables.get(name).cloned().ok_or_else(|| {
                    SetupError::new(when, format!("unknown exec_type '{name}'"))
                })?;
                let handler = self.handlers.get(name).cloned().ok_or_else(|| {
                    SetupError::new(when, format!("no handler registered for '{name}'"))
                })?;
                (exe, handler)
            }
            ExecType::Inline {
                executable,
                handler,
            } => {
                let exe = match executable.strip_prefix('!') {
                    Some(name) => self.executables.get(name).cloned().ok_or_else(|| {
                        SetupError::new(when, format!("unknown executable reference '!{name}'"))
                    })?,
                    None => vec![executable.clone()],
                };
                let handler = match handler.strip_prefix('!') {
                    Some(name) => self.handlers.get(name).cloned().ok_or_else(|| {
                        SetupError::new(when, format!("unknown handler reference '!{name}'"))
                    })?,
                    None => PathBuf::from(handler),
                };
                (exe, handler)
            }
        };

        let mut argv = executable;
        argv.push(handler.to_string_lossy().into_owned());
        Ok(argv)
    }
}

/// Where the built-in handler runners live: `MULTIRUN_HANDLERS_DIR`, or a
/// `handlers` directory next to the executable.
fn handlers_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HANDLERS_DIR_ENV) {
        return PathBuf::from(dir);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join("handlers")))
        .unwrap_or_else(|| PathBuf::from("handlers"))
}

/// Pick the first of `candidates` present on PATH, falling back to
/// `default`.
fn first_on_path(candidates: &[&str], default: &str) -> String {
    for candidate in candidates {
        if command_on_path(candidate) {
            return (*candidate).to_string();
        }
    }
    default.to_string()
}

fn command_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(name)))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// ---------- Spec file loading (CLI collaborator) ----------

/// Overrides applied onto the loaded spec from CLI options.
#[derive(Debug, Default)]
pub struct SpecOverrides<'a> {
    pub exec_type: Option<&'a str>,
    /// Becomes `exec_info.code = {type: "path", data: <value>}`.
    pub code: Option<&'a str>,
    pub handler: Option<&'a str>,
    pub setup_hook: Option<&'a str>,
}

/// Load a spec file: JSON when the extension is `.json`, YAML otherwise
/// (when built with the `yaml` feature; without it everything is parsed as
/// JSON, with a warning for non-`.json` extensions).
pub fn load_spec_file(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("open spec file {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let value: Value = if is_json {
        serde_json::from_str(&text)
            .with_context(|| format!("parse JSON spec {}", path.display()))?
    } else {
        parse_non_json(&text, path)?
    };

    anyhow::ensure!(value.is_object(), "spec must be a mapping at top level");
    Ok(value)
}

#[cfg(feature = "yaml")]
fn parse_non_json(text: &str, path: &Path) -> Result<Value> {
    serde_yaml::from_str(text).with_context(|| format!("parse YAML spec {}", path.display()))
}

#[cfg(not(feature = "yaml"))]
fn parse_non_json(text: &str, path: &Path) -> Result<Value> {
    warn!("built without YAML support; parsing spec as JSON");
    serde_json::from_str(text).with_context(|| format!("parse JSON spec {}", path.display()))
}

/// Apply CLI overrides onto a (possibly empty) spec object.
pub fn apply_overrides(spec: &mut Value, overrides: &SpecOverrides<'_>) {
    if !spec.is_object() {
        *spec = Value::Object(serde_json::Map::new());
    }

    if let Some(exec_type) = overrides.exec_type {
        spec["exec_type"] = Value::String(exec_type.to_string());
    }

    let needs_exec_info = overrides.code.is_some()
        || overrides.handler.is_some()
        || overrides.setup_hook.is_some();
    if needs_exec_info && spec.get("exec_info").map(Value::is_object) != Some(true) {
        spec["exec_info"] = Value::Object(serde_json::Map::new());
    }

    if let Some(code) = overrides.code {
        spec["exec_info"]["code"] = serde_json::json!({"type": "path", "data": code});
    }
    if let Some(handler) = overrides.handler {
        spec["exec_info"]["handler"] = Value::String(handler.to_string());
    }
    if let Some(setup_hook) = overrides.setup_hook {
        spec["exec_info"]["setup_hook"] = Value::String(setup_hook.to_string());
    }
}

/// Validate the assembled spec; returns one message per missing field.
pub fn validate(spec: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    if spec.get("exec_type").is_none() {
        errors.push("you must specify an exec_type".to_string());
    }
    if spec.get("exec_info").is_none() {
        errors.push("you must specify exec_info".to_string());
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with(name: &str, argv: &[&str], handler: &str) -> Registry {
        let mut reg = Registry::default();
        reg.executables
            .insert(name.into(), argv.iter().map(|s| s.to_string()).collect());
        reg.handlers.insert(name.into(), PathBuf::from(handler));
        reg
    }

    #[test]
    fn named_exec_type_resolves_through_registry() {
        let reg = registry_with("python3", &["python3", "-u"], "/opt/handlers/python.py");
        let spec = JobSpec::from_value(json!({"exec_type": "python3", "exec_info": {}}));
        let argv = reg.resolve(&spec.exec_type().unwrap()).unwrap();
        assert_eq!(argv, ["python3", "-u", "/opt/handlers/python.py"]);
    }

    #[test]
    fn inline_exec_type_uses_literal_values() {
        let reg = Registry::default();
        let spec = JobSpec::from_value(json!({
            "exec_type": {"executable": "/bin/sh", "handler": "/tmp/run.sh"},
            "exec_info": {},
        }));
        let argv = reg.resolve(&spec.exec_type().unwrap()).unwrap();
        assert_eq!(argv, ["/bin/sh", "/tmp/run.sh"]);
    }

    #[test]
    fn bang_references_resolve_through_registry() {
        let reg = registry_with("node", &["node", "--no-deprecation"], "/h/node.js");
        let spec = JobSpec::from_value(json!({
            "exec_type": {"executable": "!node", "handler": "!node"},
            "exec_info": {},
        }));
        let argv = reg.resolve(&spec.exec_type().unwrap()).unwrap();
        assert_eq!(argv, ["node", "--no-deprecation", "/h/node.js"]);
    }

    #[test]
    fn unknown_references_report_resolution_phase() {
        let reg = Registry::default();
        let spec = JobSpec::from_value(json!({"exec_type": "zig", "exec_info": {}}));
        let err = reg.resolve(&spec.exec_type().unwrap()).unwrap_err();
        assert_eq!(err.when, "resolving executable/handler paths");
    }

    #[test]
    fn missing_exec_type_reports_phase() {
        let spec = JobSpec::from_value(json!({"exec_info": {}}));
        let err = spec.exec_type().unwrap_err();
        assert_eq!(err.when, "getting exec_type");
        let err = JobSpec::from_value(json!({"exec_type": 3, "exec_info": {}}))
            .exec_type()
            .unwrap_err();
        assert_eq!(err.when, "getting exec_type");
    }

    #[test]
    fn missing_exec_info_reports_phase() {
        let spec = JobSpec::from_value(json!({"exec_type": "python3"}));
        assert_eq!(spec.exec_info().unwrap_err().when, "getting exec_info");
    }

    #[test]
    fn estimates_default_when_absent() {
        let spec = JobSpec::from_value(json!({"exec_type": "x", "exec_info": {}}));
        assert_eq!(spec.memory_estimate(), DEFAULT_MEMORY_ESTIMATE);
        assert_eq!(spec.cpu_estimate(), DEFAULT_CPU_ESTIMATE);
    }

    #[test]
    fn spec_tables_merge_over_builtins() {
        let mut reg = registry_with("python3", &["python3", "-u"], "/h/python.py");
        let spec = JobSpec::from_value(json!({
            "exec_type": "python3",
            "exec_info": {},
            "executables": {"python3": ["/custom/python", "-u"], "bad": "nope"},
            "handlers": {"python3": "/custom/python.py"},
        }));
        reg.merge_spec(&spec);
        let argv = reg.resolve(&spec.exec_type().unwrap()).unwrap();
        assert_eq!(argv, ["/custom/python", "-u", "/custom/python.py"]);
        // Malformed entry was skipped.
        assert!(!reg.executables.contains_key("bad"));
    }

    #[test]
    fn overrides_build_exec_info() {
        let mut spec = json!({});
        apply_overrides(
            &mut spec,
            &SpecOverrides {
                exec_type: Some("python3"),
                code: Some("/tmp/job.py"),
                handler: Some("process"),
                setup_hook: Some("init"),
            },
        );
        assert_eq!(spec["exec_type"], "python3");
        assert_eq!(
            spec["exec_info"]["code"],
            json!({"type": "path", "data": "/tmp/job.py"})
        );
        assert_eq!(spec["exec_info"]["handler"], "process");
        assert_eq!(spec["exec_info"]["setup_hook"], "init");
    }

    #[test]
    fn overrides_preserve_existing_exec_info_fields() {
        let mut spec = json!({"exec_type": "node", "exec_info": {"mod_name": "job"}});
        apply_overrides(
            &mut spec,
            &SpecOverrides {
                handler: Some("process"),
                ..Default::default()
            },
        );
        assert_eq!(spec["exec_type"], "node");
        assert_eq!(spec["exec_info"]["mod_name"], "job");
        assert_eq!(spec["exec_info"]["handler"], "process");
    }

    #[test]
    fn validate_reports_missing_fields() {
        assert_eq!(validate(&json!({})).len(), 2);
        assert_eq!(validate(&json!({"exec_type": "python3"})).len(), 1);
        assert!(validate(&json!({"exec_type": "python3", "exec_info": {}})).is_empty());
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn yaml_spec_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.yml");
        std::fs::write(&path, "exec_type: python3\nexec_info:\n  handler: main\n").unwrap();
        let value = load_spec_file(&path).unwrap();
        assert_eq!(value["exec_type"], "python3");
        assert_eq!(value["exec_info"]["handler"], "main");
    }

    #[test]
    fn json_spec_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, r#"{"exec_type": "node", "exec_info": {}}"#).unwrap();
        let value = load_spec_file(&path).unwrap();
        assert_eq!(value["exec_type"], "node");
    }
}
