use super::{Action, ExecuteCommand, StructuredFileIngestor};
use crate::error::{EtlError, Result};
use crate::etl_config::EtlConfiguration;
use crate::options::ActionOptions;
use crate::types::ActionKind;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// Separates namespace and class in a registry key.
pub const NAMESPACE_SEPARATOR: &str = "::";

pub type ActionConstructor =
    Rc<dyn Fn(ActionOptions, &EtlConfiguration) -> Result<Box<dyn Action>>>;

#[derive(Clone)]
struct Registration {
    kind: ActionKind,
    constructor: ActionConstructor,
}

/// Maps `<namespace>::<Class>` keys to action constructors. Configuration
/// selects the implementation through `class` (and optionally `namespace`);
/// the namespace defaults to the action category.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    entries: BTreeMap<String, Registration>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "maintenance::ExecuteCommand",
            ActionKind::Maintenance,
            Rc::new(ExecuteCommand::create),
        );
        registry.register(
            "ingestor::StructuredFileIngestor",
            ActionKind::Ingestor,
            Rc::new(StructuredFileIngestor::create),
        );
        registry
    }

    /// Register `constructor` under `key`, replacing any earlier entry.
    pub fn register(&mut self, key: &str, kind: ActionKind, constructor: ActionConstructor) {
        self.entries
            .insert(key.to_string(), Registration { kind, constructor });
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// `class` as given when it is already namespaced, otherwise prefixed with
    /// the configured namespace or the category default.
    pub fn resolve_class_name(options: &ActionOptions) -> String {
        if options.class.contains(NAMESPACE_SEPARATOR) {
            return options.class.clone();
        }
        let namespace = options
            .namespace
            .as_deref()
            .unwrap_or(options.kind.default_namespace());
        format!("{namespace}{NAMESPACE_SEPARATOR}{}", options.class)
    }

    pub fn create(
        &self,
        options: ActionOptions,
        config: &EtlConfiguration,
    ) -> Result<Box<dyn Action>> {
        let class = Self::resolve_class_name(&options);
        let Some(entry) = self.entries.get(&class) else {
            return Err(EtlError::ClassNotFound {
                requested: options.class.clone(),
                class,
            });
        };
        if entry.kind != options.kind {
            return Err(EtlError::InterfaceNotImplemented {
                class,
                expected: options.kind.factory_name().to_string(),
            });
        }
        debug!(action = %options.name, class = %class, "creating action");
        (entry.constructor)(options, config)
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}
