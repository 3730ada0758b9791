//! Actions: the units of work an overseer run verifies, initializes and
//! executes.
//!
//! Concrete actions implement [`Action`] and hold an [`ActionBase`] for the
//! parts every action shares: options, variables, the optional definition
//! file, resolved endpoints and lifecycle flags. The overseer only talks to
//! the trait; [`ActionRegistry`] maps configured class names to constructors.

mod command;
mod registry;
mod structured_file;

pub use command::ExecuteCommand;
pub use registry::{ActionConstructor, ActionRegistry};
pub use structured_file::StructuredFileIngestor;

use crate::dates::{format_date, DateChunk};
use crate::document::ConfigurationDocument;
use crate::endpoint::DataEndpoint;
use crate::error::{EtlError, Result};
use crate::etl_config::{EtlConfiguration, UTILITY_ENDPOINT};
use crate::options::ActionOptions;
use crate::overseer_options::{OverseerOptions, RestrictionOverrides};
use crate::paths::{qualify_path, ACTION_DEFINITION_DIR_KEY, BASE_DIR_KEY};
use crate::types::ActionKind;
use crate::variables::VariableStore;
use chrono::Local;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info};

pub trait Action: fmt::Display {
    fn base(&self) -> &ActionBase;

    fn base_mut(&mut self) -> &mut ActionBase;

    /// Check options, definition file and resource codes. Verifying an
    /// already verified action does nothing.
    fn verify(&mut self, run: &OverseerOptions) -> Result<()>;

    /// Run the action over one chunk of the date window.
    fn execute(&mut self, run: &OverseerOptions, chunk: &DateChunk) -> Result<()>;

    fn initialize(&mut self, run: &OverseerOptions) -> Result<()> {
        self.base_mut().initialize(run)
    }

    /// Whether the overseer should call [`execute`](Self::execute) once per
    /// chunk instead of once for the whole window.
    fn supports_date_range_chunking(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn class(&self) -> &str {
        &self.base().options().class
    }

    fn kind(&self) -> ActionKind {
        self.base().options().kind
    }

    fn options(&self) -> &ActionOptions {
        self.base().options()
    }

    fn is_enabled(&self) -> bool {
        self.base().options().enabled
    }

    fn is_verified(&self) -> bool {
        self.base().is_verified()
    }

    fn is_initialized(&self) -> bool {
        self.base().is_initialized()
    }

    fn restriction_overrides(&self) -> RestrictionOverrides {
        RestrictionOverrides::from_action(self.base().options())
    }
}

// ---------------------------------------------------------------------------
// ActionBase
// ---------------------------------------------------------------------------

pub struct ActionBase {
    options: ActionOptions,
    variables: VariableStore,
    definition: Option<ConfigurationDocument>,
    definition_root: PathBuf,
    utility: Option<Rc<dyn DataEndpoint>>,
    source: Option<Rc<dyn DataEndpoint>>,
    destination: Option<Rc<dyn DataEndpoint>>,
    global_utility: Option<Rc<dyn DataEndpoint>>,
    verified: bool,
    initialized: bool,
}

impl ActionBase {
    pub fn new(options: ActionOptions, config: &EtlConfiguration) -> Result<Self> {
        let mut variables = VariableStore::from_json_map(&options.variables)?;
        variables.merge_missing(config.variables());

        let resolve = |role: &str, key: Option<&str>| -> Result<Option<Rc<dyn DataEndpoint>>> {
            let Some(key) = key else { return Ok(None) };
            config.data_endpoint(key).map(Some).ok_or_else(|| {
                EtlError::ConfigInvalid(format!(
                    "action '{}' references undefined {role} endpoint '{key}'",
                    options.name
                ))
            })
        };
        let utility = resolve("utility", options.endpoints.utility.as_deref())?;
        let source = resolve("source", options.endpoints.source.as_deref())?;
        let destination = resolve("destination", options.endpoints.destination.as_deref())?;

        let definition_root = options
            .path(ACTION_DEFINITION_DIR_KEY)
            .or_else(|| options.path(BASE_DIR_KEY))
            .map(PathBuf::from)
            .unwrap_or_else(|| config.base_dir().to_path_buf());

        Ok(ActionBase {
            variables,
            definition: None,
            definition_root,
            utility,
            source,
            destination,
            global_utility: config.global_endpoint(UTILITY_ENDPOINT),
            verified: false,
            initialized: false,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &ActionOptions {
        &self.options
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut VariableStore {
        &mut self.variables
    }

    pub fn utility(&self) -> Option<&Rc<dyn DataEndpoint>> {
        self.utility.as_ref()
    }

    pub fn source(&self) -> Option<&Rc<dyn DataEndpoint>> {
        self.source.as_ref()
    }

    pub fn destination(&self) -> Option<&Rc<dyn DataEndpoint>> {
        self.destination.as_ref()
    }

    /// Endpoint used to resolve resource codes: the action's own utility
    /// endpoint, else the global one.
    pub fn resource_endpoint(&self) -> Option<&Rc<dyn DataEndpoint>> {
        self.utility.as_ref().or(self.global_utility.as_ref())
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn mark_verified(&mut self) {
        self.verified = true;
    }

    // -----------------------------------------------------------------------
    // Definition file
    // -----------------------------------------------------------------------

    /// Location of the definition file after variable substitution, resolved
    /// against `paths.action_definition_dir`.
    pub fn definition_path(&self) -> Result<Option<PathBuf>> {
        let Some(file) = self.options.definition_file.as_deref() else {
            return Ok(None);
        };
        let prefix = format!("{}: definition_file", self.options.name);
        let file = self.variables.substitute(file, Some(&prefix))?;
        Ok(Some(qualify_path(&file, &self.definition_root)))
    }

    /// Parse the definition file once, if the action has one.
    pub fn load_definition(&mut self) -> Result<Option<&ConfigurationDocument>> {
        if self.definition.is_none() {
            if let Some(path) = self.definition_path()? {
                let mut doc = ConfigurationDocument::new(path);
                doc.parse(false)?;
                debug!(action = %self.options.name, file = %doc.path().display(), "parsed definition file");
                self.definition = Some(doc);
            }
        }
        Ok(self.definition.as_ref())
    }

    pub fn definition(&self) -> Option<&ConfigurationDocument> {
        self.definition.as_ref()
    }

    // -----------------------------------------------------------------------
    // Verification and initialization
    // -----------------------------------------------------------------------

    /// Make sure every resource code this action filters on resolves. The
    /// run's resource map is loaded on demand from [`resource_endpoint`](Self::resource_endpoint).
    pub fn verify_resources(&self, run: &OverseerOptions) -> Result<()> {
        let overrides = RestrictionOverrides::from_action(&self.options);
        let codes: Vec<String> = overrides
            .include_only_resource_codes
            .iter()
            .chain(overrides.exclude_resource_codes.iter())
            .flatten()
            .cloned()
            .collect();
        if codes.is_empty() {
            return Ok(());
        }
        if run.resource_code_map().is_none() {
            let endpoint = self.resource_endpoint().ok_or_else(|| {
                EtlError::ConfigInvalid(format!(
                    "action '{}' restricts resources but no utility endpoint is configured",
                    self.options.name
                ))
            })?;
            run.load_resource_code_map(endpoint.as_ref())?;
        }
        run.resource_ids(&codes).map(|_| ())
    }

    /// Seed the run variables. Values already present (command-line
    /// definitions) are kept.
    pub fn initialize(&mut self, run: &OverseerOptions) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let vars = &mut self.variables;
        vars.set("START_DATE", format_date(&run.start_date()));
        vars.set("END_DATE", format_date(&run.end_date()));
        if let Some(days) = run.number_of_days() {
            vars.set("NUMBER_OF_DAYS", days);
        }
        if let Some(date) = run.last_modified_start_date() {
            vars.set("LAST_MODIFIED_START_DATE", format_date(&date));
            vars.set("LAST_MODIFIED", format_date(&date));
        }
        if let Some(date) = run.last_modified_end_date() {
            vars.set("LAST_MODIFIED_END_DATE", format_date(&date));
        }

        if let Some(code) = run.include_only_resource_codes().first() {
            let id = run.resource_id(code)?;
            if run.include_only_resource_codes().len() > 1 {
                info!(
                    action = %self.options.name,
                    resource = %code,
                    id,
                    "several resources included, using the first for RESOURCE"
                );
            }
            vars.set("RESOURCE", code.as_str());
            vars.set("RESOURCE_ID", id);
        }

        vars.set("TIMEZONE", timezone());

        for (role, endpoint) in [
            ("UTILITY", &self.utility),
            ("SOURCE", &self.source),
            ("DESTINATION", &self.destination),
        ] {
            if let Some(schema) = endpoint.as_ref().and_then(|e| e.schema()) {
                vars.set(&format!("{role}_SCHEMA"), schema);
            }
        }

        self.set_current_chunk(&run.full_range());
        self.initialized = true;
        Ok(())
    }

    /// Expose the chunk being processed as `CURRENT_START_DATE` and
    /// `CURRENT_END_DATE`.
    pub fn set_current_chunk(&mut self, chunk: &DateChunk) {
        self.variables
            .overwrite("CURRENT_START_DATE", format_date(&chunk.start));
        self.variables
            .overwrite("CURRENT_END_DATE", format_date(&chunk.end));
    }

    /// `name (namespace::Class)` rendering shared by the concrete actions.
    pub fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.options.name,
            ActionRegistry::resolve_class_name(&self.options)
        )
    }
}

fn timezone() -> String {
    std::env::var("TZ")
        .ok()
        .filter(|tz| !tz.is_empty())
        .unwrap_or_else(|| Local::now().format("%:z").to_string())
}
