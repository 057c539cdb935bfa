//! Action Registry
//!
//! Ordered name → definition mapping assembled from primitive groups and
//! domain action sources. Insertion order is primitives first (in subset
//! order, `noop` leading), then domain actions in file order.
//!
//! ```text
//! subsets ──► RegistryBuilder ──► primitive groups   (static table)
//!                    │
//!                    └──────────► domain sources     (actions/<domain>.py)
//!                                        │
//!                                  parse + doc check
//!                                        ▼
//!                                  ActionRegistry
//! ```

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use super::parser::{parse_module, ActionNames};
use super::primitives::{self, NOOP};
use super::types::{render_signature, split_doc, ActionDefinition, ActionError, ActionOrigin};

/// Subsets used when none are given
pub const DEFAULT_SUBSETS: &[&str] = &["chat", "infeas", "bid", "nav", "tab"];

/// Ordered, immutable set of actions available to one run
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: Vec<ActionDefinition>,
    index: HashMap<String, usize>,
}

impl ActionRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&ActionDefinition> {
        self.index.get(name).map(|&i| &self.actions[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }

    /// Names of actions contributed by one domain
    pub fn domain_names(&self, domain: &str) -> Vec<&str> {
        self.actions
            .iter()
            .filter(|a| matches!(&a.origin, ActionOrigin::Domain(d) if d == domain))
            .map(|a| a.name.as_str())
            .collect()
    }

    fn insert(&mut self, def: ActionDefinition) -> Result<(), ActionError> {
        if self.index.contains_key(&def.name) {
            return Err(ActionError::DuplicateName(def.name));
        }
        self.index.insert(def.name.clone(), self.actions.len());
        self.actions.push(def);
        Ok(())
    }
}

impl ActionNames for ActionRegistry {
    fn is_action(&self, name: &str) -> bool {
        self.contains(name)
    }
}

/// Builder collecting subsets and explicit registrations
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    subsets: Vec<String>,
    sources: HashMap<String, String>,
    actions_dir: Option<PathBuf>,
    extra: Vec<ActionDefinition>,
}

impl RegistryBuilder {
    /// Add a primitive group or a domain name
    pub fn subset(mut self, name: impl Into<String>) -> Self {
        self.subsets.push(name.into());
        self
    }

    pub fn subsets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subsets.extend(names.into_iter().map(Into::into));
        self
    }

    /// Supply the source of a domain directly
    pub fn domain_source(mut self, domain: impl Into<String>, source: impl Into<String>) -> Self {
        self.sources.insert(domain.into(), source.into());
        self
    }

    /// Directory holding `<domain>.py` backing stores
    pub fn actions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.actions_dir = Some(dir.into());
        self
    }

    /// Register a definition explicitly, after all subsets
    pub fn register(mut self, def: ActionDefinition) -> Self {
        self.extra.push(def);
        self
    }

    pub fn build(self) -> Result<ActionRegistry, ActionError> {
        let subsets: Vec<String> = if self.subsets.is_empty() {
            DEFAULT_SUBSETS.iter().map(|s| s.to_string()).collect()
        } else {
            self.subsets.clone()
        };

        let mut registry = ActionRegistry::default();
        let mut seen_primitives: HashSet<&str> = HashSet::new();

        let mut add_primitive = |registry: &mut ActionRegistry, name: &'static str| {
            if !seen_primitives.insert(name) {
                return Ok(());
            }
            match primitives::definition(name) {
                Some(def) => registry.insert(def.clone()),
                None => Err(ActionError::UnknownSubset(name.to_string())),
            }
        };

        add_primitive(&mut registry, NOOP)?;
        let mut domains = Vec::new();
        for subset in &subsets {
            match primitives::group(subset) {
                Some(members) => {
                    for &member in members {
                        add_primitive(&mut registry, member)?;
                    }
                }
                None => domains.push(subset.as_str()),
            }
        }

        for domain in domains {
            let source = self.domain_text(domain)?;
            for def in domain_definitions(domain, &source, &registry)? {
                registry.insert(def)?;
            }
        }

        for def in self.extra {
            registry.insert(def)?;
        }

        debug!(actions = registry.len(), "Built action registry");
        Ok(registry)
    }

    fn domain_text(&self, domain: &str) -> Result<String, ActionError> {
        if let Some(source) = self.sources.get(domain) {
            return Ok(source.clone());
        }
        if let Some(ref dir) = self.actions_dir {
            let path = dir.join(format!("{}.py", domain));
            match fs::read_to_string(&path) {
                Ok(source) => return Ok(source),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ActionError::Load {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
        Err(ActionError::UnknownSubset(domain.to_string()))
    }
}

/// Parse a domain source into definitions, checking the doc separator
///
/// Calls in domain bodies may target any primitive of the catalogue, any
/// action already registered, or another function of the same source.
pub fn domain_definitions(
    domain: &str,
    source: &str,
    registry: &ActionRegistry,
) -> Result<Vec<ActionDefinition>, ActionError> {
    let known = DomainScope { registry };
    let module = parse_module(source, &known)?;

    let mut defs = Vec::with_capacity(module.functions.len());
    for function in module.functions {
        let doc = function
            .docstring
            .as_deref()
            .ok_or_else(|| ActionError::MalformedDoc(function.name.clone()))?;
        let (description, examples) =
            split_doc(doc).ok_or_else(|| ActionError::MalformedDoc(function.name.clone()))?;

        defs.push(ActionDefinition {
            name: function.name.clone(),
            signature: render_signature(&function.name, &function.params),
            description,
            examples,
            source_text: function.source.clone(),
            origin: ActionOrigin::Domain(domain.to_string()),
            params: function.params.clone(),
            body: Some(Arc::new(function)),
        });
    }
    Ok(defs)
}

/// Parse-time name resolution for domain modules
struct DomainScope<'a> {
    registry: &'a ActionRegistry,
}

impl ActionNames for DomainScope<'_> {
    fn is_action(&self, name: &str) -> bool {
        self.registry.contains(name) || primitives::lookup(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SHOPPING: &str = r#"
def search_product(search_bar_id: str, query: str):
    """Search for a product.

    Examples:
        search_product('567', 'switch case')
    """
    click(search_bar_id)
    fill(search_bar_id, query)
    keyboard_press('Enter')

def open_reviews(tab_id: str):
    """Open the reviews tab.

    Examples:
        open_reviews('1689')
    """
    click(tab_id)
    scroll(0, 300)
"#;

    #[test]
    fn test_default_subsets_order() {
        let registry = ActionRegistry::builder().build().unwrap();
        let names = registry.names();
        assert_eq!(names[0], "noop");
        assert_eq!(names[1], "send_msg_to_user");
        assert_eq!(names[2], "report_infeasible");
        assert_eq!(names[3], "scroll");
        assert_eq!(*names.last().unwrap(), "new_tab");
    }

    #[test]
    fn test_overlapping_groups_dedup() {
        let registry = ActionRegistry::builder()
            .subsets(["bid", "webarena"])
            .build()
            .unwrap();
        let clicks = registry.iter().filter(|a| a.name == "click").count();
        assert_eq!(clicks, 1);
        assert!(registry.contains("keyboard_press"));
    }

    #[test]
    fn test_domain_actions_after_primitives() {
        let registry = ActionRegistry::builder()
            .subsets(["webarena", "shopping"])
            .domain_source("shopping", SHOPPING)
            .build()
            .unwrap();
        let names = registry.names();
        assert_eq!(names[names.len() - 2..], ["search_product", "open_reviews"]);
        let action = registry.get("search_product").unwrap();
        assert!(action.is_inducible_source());
        assert_eq!(action.description, "Search for a product.");
        assert_eq!(action.examples, vec!["search_product('567', 'switch case')"]);
        assert_eq!(registry.domain_names("shopping"), vec!["search_product", "open_reviews"]);
    }

    #[test]
    fn test_domain_collision_is_fatal() {
        let source = "def click(bid: str):\n    \"\"\"Shadow.\n\n    Examples:\n        click('1')\n    \"\"\"\n    hover(bid)\n";
        let err = ActionRegistry::builder()
            .subsets(["bid", "shopping"])
            .domain_source("shopping", source)
            .build()
            .unwrap_err();
        assert_eq!(err, ActionError::DuplicateName("click".to_string()));
    }

    #[test]
    fn test_missing_examples_is_fatal() {
        let source = "def open_reviews(tab_id: str):\n    \"\"\"Open the reviews tab.\"\"\"\n    click(tab_id)\n";
        let err = ActionRegistry::builder()
            .subsets(["bid", "shopping"])
            .domain_source("shopping", source)
            .build()
            .unwrap_err();
        assert!(matches!(err, ActionError::MalformedDoc(ref n) if n == "open_reviews"));
    }

    #[test]
    fn test_unknown_subset() {
        let err = ActionRegistry::builder().subset("gitlab").build().unwrap_err();
        assert!(matches!(err, ActionError::UnknownSubset(_)));
    }

    #[test]
    fn test_actions_dir_lookup() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("shopping.py"), SHOPPING).unwrap();
        let registry = ActionRegistry::builder()
            .subsets(["webarena", "shopping"])
            .actions_dir(dir.path())
            .build()
            .unwrap();
        assert!(registry.contains("open_reviews"));
    }

    #[test]
    fn test_unreadable_domain_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("shopping.py"), [0x64, 0x65, 0x66, 0xff, 0xfe]).unwrap();
        let err = ActionRegistry::builder()
            .subsets(["webarena", "shopping"])
            .actions_dir(dir.path())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), "IOError");
        assert!(err.to_string().contains("shopping.py"));

        // a missing file is still an unknown subset
        let err = ActionRegistry::builder()
            .subsets(["webarena", "gitlab"])
            .actions_dir(dir.path())
            .build()
            .unwrap_err();
        assert_eq!(err, ActionError::UnknownSubset("gitlab".to_string()));
    }
}
