//! ETL configuration: sections of actions plus the shared defaults, paths,
//! variables and data endpoints they draw on.
//!
//! A configuration file is a [`ConfigurationDocument`] whose reserved keys
//! (`defaults`, `endpoints`, `paths`, `global`, `variables`, `module`) hold
//! shared settings and whose every other key is a section: an ordered array
//! of action objects. Loading applies defaults to each action, instantiates
//! every endpoint it references through the [`EndpointRegistry`] and turns
//! the result into typed [`ActionOptions`].

use crate::document::ConfigurationDocument;
use crate::endpoint::{DataEndpoint, EndpointRegistry, EndpointSpec};
use crate::error::{EtlError, Result};
use crate::options::ActionOptions;
use crate::paths::{
    qualify_path, validate_name, BASE_DIR_KEY, DEFAULTS_KEY, DEFAULT_MODULE, ENDPOINTS_KEY,
    GLOBAL_KEY, LOCAL_CONFIG_DIR_KEY, MODULE_KEY, NAME_SEPARATOR, PATHS_KEY, RESERVED_KEYS,
    VARIABLES_KEY,
};
use crate::variables::VariableStore;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

type Object = Map<String, Value>;

/// Endpoint roles an action may declare under `endpoints`.
const ENDPOINT_ROLES: &[&str] = &["utility", "source", "destination"];

/// Name of the global endpoint used for resource-code lookups.
pub const UTILITY_ENDPOINT: &str = "utility";

/// Inputs that take precedence over anything in the configuration files.
#[derive(Debug, Clone)]
pub struct ConfigSettings {
    /// Variables from the command line. They win over paths, file variables
    /// and action variables.
    pub variables: VariableStore,
    /// `key=value` overrides applied to every action's options.
    pub option_overrides: Vec<(String, String)>,
    pub default_module: String,
}

impl Default for ConfigSettings {
    fn default() -> Self {
        ConfigSettings {
            variables: VariableStore::new(),
            option_overrides: Vec::new(),
            default_module: DEFAULT_MODULE.to_string(),
        }
    }
}

/// One section: a named, ordered list of actions.
#[derive(Debug, Clone)]
pub struct EtlSection {
    name: String,
    actions: Vec<ActionOptions>,
}

impl EtlSection {
    /// Fully qualified `module.section` name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[ActionOptions] {
        &self.actions
    }
}

pub struct EtlConfiguration {
    path: PathBuf,
    base_dir: PathBuf,
    module: String,
    paths: Object,
    variables: VariableStore,
    sections: Vec<EtlSection>,
    endpoints: BTreeMap<String, Rc<dyn DataEndpoint>>,
    global_endpoints: BTreeMap<String, String>,
}

/// Everything a section needs from the file that declares it.
struct Scope<'a> {
    base_dir: &'a Path,
    paths: &'a Object,
    defaults: &'a Object,
}

impl EtlConfiguration {
    pub fn load(
        path: impl Into<PathBuf>,
        registry: &EndpointRegistry,
        settings: &ConfigSettings,
    ) -> Result<Self> {
        let (doc_path, base_dir, entries) = read_sections(path.into())?;
        let (reserved, sections) = split_reserved(entries);

        let paths = match reserved.get(PATHS_KEY) {
            Some(Value::Object(p)) => qualify_paths(p, &base_dir)?,
            Some(_) => {
                return Err(EtlError::ConfigInvalid(format!(
                    "'{PATHS_KEY}' must be an object in {}",
                    doc_path.display()
                )))
            }
            None => {
                return Err(EtlError::ConfigInvalid(format!(
                    "'{PATHS_KEY}' is required in {}",
                    doc_path.display()
                )))
            }
        };

        let module = match reserved.get(MODULE_KEY) {
            Some(Value::String(m)) if !m.is_empty() => m.clone(),
            None | Some(Value::Null) => settings.default_module.clone(),
            Some(other) => {
                return Err(EtlError::ConfigInvalid(format!(
                    "'{MODULE_KEY}' must be a string, got {other}"
                )))
            }
        };
        validate_name("module", &module)?;

        let mut config = EtlConfiguration {
            path: doc_path,
            base_dir: base_dir.clone(),
            module,
            paths,
            variables: settings.variables.clone(),
            sections: Vec::new(),
            endpoints: BTreeMap::new(),
            global_endpoints: BTreeMap::new(),
        };

        // Command-line variables are already in place, so paths and file
        // variables only fill the gaps.
        for (name, value) in &config.paths {
            config.variables.set_json(name, value)?;
        }
        if let Some(vars) = object_entry(&reserved, VARIABLES_KEY)? {
            for (name, value) in vars {
                config.variables.set_json(name, value)?;
            }
        }

        let mut defaults = object_entry(&reserved, DEFAULTS_KEY)?
            .cloned()
            .unwrap_or_default();
        inject_global_paths(&mut defaults, &config.paths);

        config.register_global_endpoints(&reserved, &defaults, registry)?;

        let paths = config.paths.clone();
        let scope = Scope {
            base_dir: &base_dir,
            paths: &paths,
            defaults: &defaults,
        };
        for (name, value) in sections {
            config.add_section(&name, value, &scope, registry, settings)?;
        }

        config.load_local_configs(&defaults, registry, settings)?;
        info!(
            config = %config.path.display(),
            sections = config.sections.len(),
            endpoints = config.endpoints.len(),
            "loaded etl configuration"
        );
        Ok(config)
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    fn register_global_endpoints(
        &mut self,
        reserved: &Object,
        defaults: &Object,
        registry: &EndpointRegistry,
    ) -> Result<()> {
        let paths = self.paths.clone();
        let base_dir = self.base_dir.clone();
        if let Some(named) = object_entry(reserved, ENDPOINTS_KEY)? {
            for (name, endpoint) in named {
                let cfg = endpoint.as_object().ok_or_else(|| {
                    EtlError::ConfigInvalid(format!("endpoint '{name}' must be an object"))
                })?;
                let mut cfg = cfg.clone();
                cfg.entry("name").or_insert_with(|| Value::String(name.clone()));
                let key = self.register_endpoint(&cfg, &paths, &base_dir, registry)?;
                self.global_endpoints.insert(name.clone(), key);
            }
        }

        let utility = defaults
            .get(GLOBAL_KEY)
            .and_then(|g| g.get(ENDPOINTS_KEY))
            .and_then(|e| e.get(UTILITY_ENDPOINT));
        match utility {
            Some(Value::Object(cfg)) => {
                let key = self.register_endpoint(cfg, &paths, &base_dir, registry)?;
                self.global_endpoints.insert(UTILITY_ENDPOINT.to_string(), key);
            }
            Some(Value::String(name)) => {
                let key = self.global_endpoints.get(name).cloned().ok_or_else(|| {
                    EtlError::ConfigInvalid(format!("undefined global endpoint '{name}'"))
                })?;
                self.global_endpoints.insert(UTILITY_ENDPOINT.to_string(), key);
            }
            _ => {}
        }
        Ok(())
    }

    /// Instantiate an endpoint unless one with the same key already exists.
    fn register_endpoint(
        &mut self,
        cfg: &Object,
        paths: &Object,
        base_dir: &Path,
        registry: &EndpointRegistry,
    ) -> Result<String> {
        let spec = EndpointSpec::from_config(cfg, paths, base_dir)?;
        let endpoint = registry.create(&spec)?;
        let key = endpoint.key().to_string();
        if !self.endpoints.contains_key(&key) {
            debug!(endpoint = %key, "registered data endpoint");
            self.endpoints.insert(key.clone(), endpoint);
        }
        Ok(key)
    }

    fn add_section(
        &mut self,
        name: &str,
        value: Value,
        scope: &Scope<'_>,
        registry: &EndpointRegistry,
        settings: &ConfigSettings,
    ) -> Result<()> {
        validate_name("section", name)?;
        let Value::Array(items) = value else {
            return Err(EtlError::ConfigInvalid(format!(
                "section '{name}' must be an array of actions"
            )));
        };
        let qualified = format!("{}{NAME_SEPARATOR}{name}", self.module);
        let index = match self.sections.iter().position(|s| s.name == qualified) {
            Some(i) => i,
            None => {
                self.sections.push(EtlSection {
                    name: qualified.clone(),
                    actions: Vec::new(),
                });
                self.sections.len() - 1
            }
        };

        for item in items {
            let Value::Object(obj) = item else {
                return Err(EtlError::ConfigInvalid(format!(
                    "section '{name}' contains a non-object action"
                )));
            };
            let options = self.build_action(name, &qualified, obj, scope, registry, settings)?;
            let section = &mut self.sections[index];
            if section.actions.iter().any(|a| a.name == options.name) {
                warn!(action = %options.name, section = %qualified, "duplicate action, skipping");
                continue;
            }
            section.actions.push(options);
        }
        Ok(())
    }

    fn build_action(
        &mut self,
        short_section: &str,
        section: &str,
        mut obj: Object,
        scope: &Scope<'_>,
        registry: &EndpointRegistry,
        settings: &ConfigSettings,
    ) -> Result<ActionOptions> {
        if let Some(Value::String(short)) = obj.get("name") {
            validate_name("action", short)?;
            let qualified = format!("{section}{NAME_SEPARATOR}{short}");
            obj.insert("name".into(), Value::String(qualified));
        }

        for defaults_key in [short_section, GLOBAL_KEY] {
            if let Some(Value::Object(defaults)) = scope.defaults.get(defaults_key) {
                apply_defaults(&mut obj, defaults);
            }
        }
        obj.entry(PATHS_KEY)
            .or_insert_with(|| Value::Object(scope.paths.clone()));

        let mut variables = match obj.remove(VARIABLES_KEY) {
            Some(Value::Object(v)) => v,
            None | Some(Value::Null) => Object::new(),
            Some(other) => {
                return Err(EtlError::invalid_option(
                    VARIABLES_KEY,
                    format!("expected an object, got {other}"),
                ))
            }
        };
        for (name, value) in settings.variables.iter() {
            variables.insert(name.to_string(), value.to_json());
        }
        obj.insert(VARIABLES_KEY.into(), Value::Object(variables));

        for (key, raw) in &settings.option_overrides {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            obj.insert(key.clone(), value);
        }

        if let Some(endpoints) = obj.remove(ENDPOINTS_KEY) {
            let Value::Object(endpoints) = endpoints else {
                return Err(EtlError::invalid_option(ENDPOINTS_KEY, "expected an object"));
            };
            for (role, cfg) in endpoints {
                if !ENDPOINT_ROLES.contains(&role.as_str()) {
                    warn!(role = %role, "ignoring unknown endpoint role");
                    continue;
                }
                let key = match cfg {
                    Value::Object(cfg) => {
                        self.register_endpoint(&cfg, scope.paths, scope.base_dir, registry)?
                    }
                    Value::String(name) => {
                        self.global_endpoints.get(&name).cloned().ok_or_else(|| {
                            EtlError::ConfigInvalid(format!("undefined global endpoint '{name}'"))
                        })?
                    }
                    Value::Null => continue,
                    other => {
                        return Err(EtlError::invalid_option(
                            &role,
                            format!("expected an endpoint object, got {other}"),
                        ))
                    }
                };
                obj.insert(role, Value::String(key));
            }
        }

        ActionOptions::from_object(section, &obj)
    }

    fn load_local_configs(
        &mut self,
        defaults: &Object,
        registry: &EndpointRegistry,
        settings: &ConfigSettings,
    ) -> Result<()> {
        let Some(dir) = self.paths.get(LOCAL_CONFIG_DIR_KEY).and_then(Value::as_str) else {
            return Ok(());
        };
        let dir = PathBuf::from(dir);
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "no local configuration directory");
            return Ok(());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        for file in files {
            let (_, base_dir, entries) = read_sections(file.clone())?;
            let (reserved, sections) = split_reserved(entries);

            let mut paths = self.paths.clone();
            if let Some(local) = object_entry(&reserved, PATHS_KEY)? {
                paths.extend(qualify_paths(local, &base_dir)?);
            }
            let mut local_defaults = defaults.clone();
            if let Some(local) = object_entry(&reserved, DEFAULTS_KEY)? {
                for (key, value) in local {
                    match (local_defaults.get_mut(key), value) {
                        (Some(Value::Object(parent)), Value::Object(child)) => {
                            parent.extend(child.clone());
                        }
                        _ => {
                            local_defaults.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            inject_global_paths(&mut local_defaults, &paths);

            let scope = Scope {
                base_dir: &base_dir,
                paths: &paths,
                defaults: &local_defaults,
            };
            for (name, value) in sections {
                self.add_section(&name, value, &scope, registry, settings)?;
            }
            info!(config = %file.display(), "merged local configuration");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn paths(&self) -> &Object {
        &self.paths
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn sections(&self) -> &[EtlSection] {
        &self.sections
    }

    pub fn section_names(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.name.as_str()).collect()
    }

    /// Prefix the module unless `name` is already qualified.
    pub fn qualify_section_name(&self, name: &str) -> String {
        if name.contains(NAME_SEPARATOR) {
            name.to_string()
        } else {
            format!("{}{NAME_SEPARATOR}{name}", self.module)
        }
    }

    pub fn section(&self, name: &str) -> Option<&EtlSection> {
        let qualified = self.qualify_section_name(name);
        self.sections.iter().find(|s| s.name == qualified)
    }

    pub fn section_exists(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    fn require_section(&self, name: &str) -> Result<&EtlSection> {
        self.section(name)
            .ok_or_else(|| EtlError::UnknownSections(vec![self.qualify_section_name(name)]))
    }

    pub fn section_action_names(&self, section: &str) -> Result<Vec<&str>> {
        Ok(self
            .require_section(section)?
            .actions
            .iter()
            .map(|a| a.name.as_str())
            .collect())
    }

    pub fn enabled_action_names(&self, section: &str) -> Result<Vec<&str>> {
        Ok(self
            .require_section(section)?
            .actions
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.name.as_str())
            .collect())
    }

    pub fn disabled_action_names(&self, section: &str) -> Result<Vec<&str>> {
        Ok(self
            .require_section(section)?
            .actions
            .iter()
            .filter(|a| !a.enabled)
            .map(|a| a.name.as_str())
            .collect())
    }

    /// Options of `name` (short or qualified) within `section`.
    pub fn action_options(&self, name: &str, section: &str) -> Result<&ActionOptions> {
        let section = self.require_section(section)?;
        let short = name.rsplit(NAME_SEPARATOR).next().unwrap_or(name);
        section
            .actions
            .iter()
            .find(|a| a.short_name() == short)
            .ok_or_else(|| EtlError::UnknownAction {
                action: name.to_string(),
                section: section.name.clone(),
            })
    }

    /// Split `section.action` or `module.section.action` into the qualified
    /// section name and the qualified action name.
    pub fn parse_action_name(&self, name: &str) -> Result<(String, String)> {
        let parts: Vec<&str> = name.split(NAME_SEPARATOR).collect();
        let (module, section, action) = match parts.as_slice() {
            [section, action] => (self.module.as_str(), *section, *action),
            [module, section, action] => (*module, *section, *action),
            _ => return Err(EtlError::InvalidActionName(name.to_string())),
        };
        if module.is_empty() || section.is_empty() || action.is_empty() {
            return Err(EtlError::InvalidActionName(name.to_string()));
        }
        let section = format!("{module}{NAME_SEPARATOR}{section}");
        let action = format!("{section}{NAME_SEPARATOR}{action}");
        Ok((section, action))
    }

    pub fn data_endpoint(&self, key: &str) -> Option<Rc<dyn DataEndpoint>> {
        self.endpoints.get(key).cloned()
    }

    pub fn data_endpoints(&self) -> impl Iterator<Item = &Rc<dyn DataEndpoint>> {
        self.endpoints.values()
    }

    pub fn global_endpoint(&self, name: &str) -> Option<Rc<dyn DataEndpoint>> {
        self.global_endpoints
            .get(name)
            .and_then(|key| self.data_endpoint(key))
    }

    pub fn global_endpoint_names(&self) -> impl Iterator<Item = &str> {
        self.global_endpoints.keys().map(String::as_str)
    }
}

impl fmt::Debug for EtlConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtlConfiguration")
            .field("path", &self.path)
            .field("module", &self.module)
            .field("sections", &self.section_names())
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_sections(path: PathBuf) -> Result<(PathBuf, PathBuf, Vec<(String, Value)>)> {
    let mut doc = ConfigurationDocument::new(path);
    doc.parse(false)?;
    let path = doc.path().to_path_buf();
    let base_dir = doc.base_dir().to_path_buf();
    Ok((path, base_dir, doc.into_sections()))
}

fn split_reserved(entries: Vec<(String, Value)>) -> (Object, Vec<(String, Value)>) {
    let mut reserved = Object::new();
    let mut sections = Vec::new();
    for (key, value) in entries {
        if RESERVED_KEYS.contains(&key.as_str()) {
            reserved.insert(key, value);
        } else {
            sections.push((key, value));
        }
    }
    (reserved, sections)
}

fn object_entry<'a>(obj: &'a Object, key: &str) -> Result<Option<&'a Object>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(o)) => Ok(Some(o)),
        Some(other) => Err(EtlError::ConfigInvalid(format!(
            "'{key}' must be an object, got {other}"
        ))),
    }
}

/// Qualify every path against `base_dir` and add `base_dir` itself.
fn qualify_paths(paths: &Object, base_dir: &Path) -> Result<Object> {
    let mut out = Object::new();
    out.insert(
        BASE_DIR_KEY.into(),
        Value::String(base_dir.display().to_string()),
    );
    for (name, value) in paths {
        let Value::String(p) = value else {
            return Err(EtlError::ConfigInvalid(format!(
                "path '{name}' must be a string"
            )));
        };
        let qualified = qualify_path(p, base_dir);
        out.insert(name.clone(), Value::String(qualified.display().to_string()));
    }
    Ok(out)
}

fn inject_global_paths(defaults: &mut Object, paths: &Object) {
    let global = defaults
        .entry(GLOBAL_KEY)
        .or_insert_with(|| Value::Object(Object::new()));
    if !global.is_object() {
        *global = Value::Object(Object::new());
    }
    if let Value::Object(global) = global {
        global.insert(PATHS_KEY.into(), Value::Object(paths.clone()));
    }
}

/// Fill keys missing from `obj`. Endpoint and variable objects merge key by
/// key instead.
fn apply_defaults(obj: &mut Object, defaults: &Object) {
    for (key, value) in defaults {
        match (key.as_str(), obj.get_mut(key), value) {
            (ENDPOINTS_KEY | VARIABLES_KEY, Some(Value::Object(current)), Value::Object(d)) => {
                for (k, v) in d {
                    current.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            (_, None, _) => {
                obj.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, value: Value) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        path
    }

    fn sample(dir: &Path) -> PathBuf {
        fs::create_dir_all(dir.join("data")).unwrap();
        fs::write(dir.join("data/codes.json"), r#"{"frearson": 1}"#).unwrap();
        write(
            dir,
            "etl.json",
            json!({
                "#": "sample",
                "paths": {"data_dir": "data", "local_config_dir": "etl.d"},
                "variables": {"TABLE": "jobs"},
                "defaults": {
                    "global": {
                        "factory": "MaintenanceFactory",
                        "enabled": true,
                        "variables": {"REGION": "us"},
                        "endpoints": {
                            "utility": {"type": "jsonfile", "name": "codes", "path": "codes.json"}
                        }
                    },
                    "jobs": {"class": "ExecuteCommand"}
                },
                "jobs": [
                    {"name": "first", "commands": ["true"], "variables": {"REGION": "eu"}},
                    {"name": "second", "enabled": false, "commands": "true",
                     "endpoints": {"source": {"type": "jsonfile", "path": "codes.json"}}}
                ],
                "cleanup": []
            }),
        )
    }

    fn load(path: &Path) -> EtlConfiguration {
        EtlConfiguration::load(path, &EndpointRegistry::with_builtin(), &ConfigSettings::default())
            .unwrap()
    }

    #[test]
    fn sections_are_qualified_in_file_order() {
        let dir = TempDir::new().unwrap();
        let config = load(&sample(dir.path()));
        assert_eq!(config.section_names(), ["etl.jobs", "etl.cleanup"]);
        assert!(config.section_exists("jobs"));
        assert!(config.section_exists("etl.jobs"));
        assert!(!config.section_exists("other"));
        assert_eq!(
            config.section_action_names("jobs").unwrap(),
            ["etl.jobs.first", "etl.jobs.second"]
        );
        assert_eq!(config.enabled_action_names("jobs").unwrap(), ["etl.jobs.first"]);
        assert_eq!(config.disabled_action_names("jobs").unwrap(), ["etl.jobs.second"]);
    }

    #[test]
    fn defaults_apply_in_precedence_order() {
        let dir = TempDir::new().unwrap();
        let config = load(&sample(dir.path()));
        let first = config.action_options("first", "jobs").unwrap();
        assert_eq!(first.class, "ExecuteCommand");
        assert!(first.enabled);
        assert_eq!(first.variables["REGION"], "eu");
        // Endpoint objects merge: the global utility lands on every action.
        assert!(first.endpoints.utility.is_some());
        let second = config.action_options("etl.jobs.second", "jobs").unwrap();
        assert_eq!(second.endpoints.utility, first.endpoints.utility);
        assert!(second.endpoints.source.is_some());
    }

    #[test]
    fn endpoints_are_shared_by_key() {
        let dir = TempDir::new().unwrap();
        let config = load(&sample(dir.path()));
        assert_eq!(config.data_endpoints().count(), 1);
        let utility = config.global_endpoint(UTILITY_ENDPOINT).unwrap();
        assert_eq!(utility.resource_code_map().unwrap()["frearson"], 1);
    }

    #[test]
    fn paths_are_qualified_and_become_variables() {
        let dir = TempDir::new().unwrap();
        let config = load(&sample(dir.path()));
        let data_dir = config.paths()["data_dir"].as_str().unwrap();
        assert!(Path::new(data_dir).is_absolute());
        assert!(data_dir.ends_with("data"));
        assert!(config.paths().contains_key(BASE_DIR_KEY));
        assert_eq!(
            config.variables().get("data_dir").unwrap().to_string(),
            data_dir
        );
        assert_eq!(config.variables().get("TABLE").unwrap().to_string(), "jobs");
        let first = config.action_options("first", "jobs").unwrap();
        assert_eq!(first.path("data_dir"), Some(data_dir));
    }

    #[test]
    fn command_line_variables_and_overrides_win() {
        let dir = TempDir::new().unwrap();
        let path = sample(dir.path());
        let mut settings = ConfigSettings::default();
        settings.variables.set("REGION", "ap");
        settings.variables.set("data_dir", "/elsewhere");
        settings.option_overrides = vec![
            ("stop_on_exception".into(), "false".into()),
            ("comment".into(), "plain text".into()),
        ];
        let config =
            EtlConfiguration::load(&path, &EndpointRegistry::with_builtin(), &settings).unwrap();
        assert_eq!(config.variables().get("data_dir").unwrap().to_string(), "/elsewhere");
        let first = config.action_options("first", "jobs").unwrap();
        assert_eq!(first.variables["REGION"], "ap");
        assert!(!first.stop_on_exception);
        assert_eq!(first.extra_str("comment"), Some("plain text"));
    }

    #[test]
    fn local_configs_merge_and_skip_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = sample(dir.path());
        write(
            dir.path(),
            "etl.d/20-more.json",
            json!({"jobs": [{"name": "third", "commands": "true"}]}),
        );
        write(
            dir.path(),
            "etl.d/10-dup.json",
            json!({
                "jobs": [{"name": "first", "commands": "false"}],
                "extra": [{"name": "solo", "class": "ExecuteCommand", "commands": "true"}]
            }),
        );
        let config = load(&path);
        assert_eq!(
            config.section_action_names("jobs").unwrap(),
            ["etl.jobs.first", "etl.jobs.second", "etl.jobs.third"]
        );
        let first = config.action_options("first", "jobs").unwrap();
        assert_eq!(first.extra("commands"), Some(&json!(["true"])));
        assert!(config.section_exists("extra"));
    }

    #[test]
    fn module_prefixes_names() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "c.json",
            json!({"module": "xdmod", "paths": {}, "jobs": []}),
        );
        let config = load(&path);
        assert_eq!(config.module(), "xdmod");
        assert_eq!(config.section_names(), ["xdmod.jobs"]);
        assert_eq!(
            config.parse_action_name("jobs.load").unwrap(),
            ("xdmod.jobs".to_string(), "xdmod.jobs.load".to_string())
        );
        assert_eq!(
            config.parse_action_name("m.s.a").unwrap(),
            ("m.s".to_string(), "m.s.a".to_string())
        );
        assert!(matches!(
            config.parse_action_name("load"),
            Err(EtlError::InvalidActionName(_))
        ));
    }

    #[test]
    fn structural_errors() {
        let dir = TempDir::new().unwrap();
        let registry = EndpointRegistry::with_builtin();
        let settings = ConfigSettings::default();

        let no_paths = write(dir.path(), "a.json", json!({"jobs": []}));
        assert!(matches!(
            EtlConfiguration::load(&no_paths, &registry, &settings),
            Err(EtlError::ConfigInvalid(_))
        ));

        let bad_section = write(dir.path(), "b.json", json!({"paths": {}, "jobs": {}}));
        assert!(matches!(
            EtlConfiguration::load(&bad_section, &registry, &settings),
            Err(EtlError::ConfigInvalid(_))
        ));

        let dotted = write(dir.path(), "c.json", json!({"paths": {}, "a.b": []}));
        assert!(matches!(
            EtlConfiguration::load(&dotted, &registry, &settings),
            Err(EtlError::ConfigInvalid(_))
        ));

        let missing = write(
            dir.path(),
            "d.json",
            json!({"paths": {}, "jobs": [{"name": "x"}]}),
        );
        match EtlConfiguration::load(&missing, &registry, &settings) {
            Err(EtlError::MissingOptions { name, missing }) => {
                assert_eq!(name, "etl.jobs.x");
                assert_eq!(missing, ["factory"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let bad_endpoint = write(
            dir.path(),
            "e.json",
            json!({"paths": {}, "jobs": [{
                "name": "x", "factory": "MaintenanceFactory",
                "endpoints": {"source": {"type": "mysql"}}
            }]}),
        );
        assert!(matches!(
            EtlConfiguration::load(&bad_endpoint, &registry, &settings),
            Err(EtlError::EndpointType(_))
        ));

        assert!(matches!(
            EtlConfiguration::load(dir.path().join("nope.json"), &registry, &settings),
            Err(EtlError::ConfigFileNotFound(_))
        ));
    }

    #[test]
    fn unknown_section_and_action_queries() {
        let dir = TempDir::new().unwrap();
        let config = load(&sample(dir.path()));
        assert!(matches!(
            config.section_action_names("nope"),
            Err(EtlError::UnknownSections(_))
        ));
        assert!(matches!(
            config.action_options("nope", "jobs"),
            Err(EtlError::UnknownAction { .. })
        ));
    }
}
