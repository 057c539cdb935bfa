//! Action-Set Compiler
//!
//! Two read projections over an [`ActionRegistry`]: a textual description
//! of the action vocabulary for the prompt, and compilation of one model
//! response into an executable program.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::parser::{dedent, parse_script, Script};
use super::registry::ActionRegistry;
use super::types::{ActionDefinition, ActionError};

const FENCE: &str = "```";

/// Language tags stripped from the first line of a fenced action
const LANGUAGE_TAGS: &[&str] = &["python", "py", "python3"];

/// Actions whose examples are preferred for `example_action`
const EXAMPLE_SOURCES: &[&str] = &["fill", "click", "mouse_click", "keyboard_type"];

/// Element highlighting mode of the browser environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum DemoMode {
    Off,
    Default,
    AllBlue,
    OnlyVisibleElements,
}

impl fmt::Display for DemoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::Default => "default",
            Self::AllBlue => "all_blue",
            Self::OnlyVisibleElements => "only_visible_elements",
        };
        f.write_str(s)
    }
}

/// Output of [`CustomActionSet::compile`]
#[derive(Debug, Clone)]
pub struct CompiledAction {
    /// Prelude followed by the action text
    pub program: String,
    /// Action text as extracted from the response
    pub action: String,
    pub script: Script,
}

/// Action space of one agent run
#[derive(Debug, Clone)]
pub struct CustomActionSet {
    registry: Arc<ActionRegistry>,
    multiaction: bool,
    demo_mode: Option<DemoMode>,
    retry_with_force: bool,
    prelude: String,
}

impl CustomActionSet {
    pub fn new(registry: ActionRegistry) -> Self {
        Self::from_shared(Arc::new(registry))
    }

    pub fn from_shared(registry: Arc<ActionRegistry>) -> Self {
        let mut set = Self {
            registry,
            multiaction: true,
            demo_mode: None,
            retry_with_force: false,
            prelude: String::new(),
        };
        set.prelude = set.build_prelude();
        set
    }

    pub fn with_multiaction(mut self, multiaction: bool) -> Self {
        self.multiaction = multiaction;
        self
    }

    pub fn with_demo_mode(mut self, demo_mode: Option<DemoMode>) -> Self {
        self.demo_mode = demo_mode;
        self.prelude = self.build_prelude();
        self
    }

    pub fn with_retry_with_force(mut self, retry: bool) -> Self {
        self.retry_with_force = retry;
        self.prelude = self.build_prelude();
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn multiaction(&self) -> bool {
        self.multiaction
    }

    pub fn prelude(&self) -> &str {
        &self.prelude
    }

    fn build_prelude(&self) -> String {
        let demo_mode = match self.demo_mode {
            Some(mode) => format!("'{}'", mode),
            None => "None".to_string(),
        };
        let retry = if self.retry_with_force { "True" } else { "False" };

        let mut prelude = format!("demo_mode={}\nretry_with_force={}\n\n", demo_mode, retry);
        for action in self.registry.iter() {
            prelude.push_str(&action.source_text);
            prelude.push_str("\n\n\n");
        }
        prelude
    }

    /// Documentation block for one action
    pub fn action_doc(action: &ActionDefinition, long_description: bool, examples: bool) -> String {
        if long_description && examples && action.is_inducible_source() {
            return format!("{}\n", action.source_text);
        }

        let mut doc = format!("{}\n", action.signature);
        if long_description {
            doc.push_str(&format!("    Description: {}\n", action.description));
        }
        if examples && !action.examples.is_empty() {
            doc.push_str("    Examples:\n");
            for example in &action.examples {
                doc.push_str(&format!("        {}\n\n", example));
            }
        }
        doc
    }

    /// Describe the action space for the prompt
    pub fn describe(&self, long_description: bool, examples: bool) -> String {
        let mut description = format!(
            "\n{} different types of actions are available.\n\n",
            self.registry.len()
        );
        for action in self.registry.iter() {
            description.push_str(&Self::action_doc(action, long_description, examples));
        }

        if self.multiaction {
            description.push_str(
                "Multiple actions can be provided at once. An action can consume the output of a previous action by using the output variable.",
            );
        } else {
            description.push_str("Only a single action can be provided at once.");
        }
        description
    }

    /// Example action text for the prompt
    pub fn example_action(&self, abstract_only: bool, max_examples: usize) -> String {
        if abstract_only {
            return if self.multiaction {
                "One or several actions, separated by new lines.".to_string()
            } else {
                "One single action to be executed. You can only use one action at a time."
                    .to_string()
            };
        }

        let mut picked: Vec<String> = EXAMPLE_SOURCES
            .iter()
            .filter_map(|name| self.registry.get(name))
            .flat_map(|a| a.examples.iter().cloned())
            .collect();
        if picked.is_empty() {
            picked = self
                .registry
                .iter()
                .flat_map(|a| a.examples.iter().cloned())
                .collect();
        }

        let mut rng = StdRng::seed_from_u64(1);
        picked.shuffle(&mut rng);

        if self.multiaction {
            picked.truncate(max_examples);
            picked.join("\n")
        } else {
            picked.into_iter().next().unwrap_or_default()
        }
    }

    /// Extract the action between the first pair of fences and compile it
    pub fn compile(&self, text: &str) -> Result<CompiledAction, ActionError> {
        let action = extract_action(text).ok_or(ActionError::EmptyAction)?;
        let script = parse_script(&action, self.registry.as_ref())?;
        let program = format!("{}{}", self.prelude, action);
        Ok(CompiledAction {
            program,
            action,
            script,
        })
    }
}

/// Text between the first pair of fences, an unterminated fence running to the end
fn extract_action(text: &str) -> Option<String> {
    let piece = text.split(FENCE).nth(1)?;

    let piece = match piece.split_once('\n') {
        Some((first, rest)) if LANGUAGE_TAGS.contains(&first.trim()) => rest,
        _ if LANGUAGE_TAGS.contains(&piece.trim()) => "",
        _ => piece,
    };

    let action = dedent(piece);
    let action = action.trim_matches('\n');
    if action.trim().is_empty() {
        None
    } else {
        Some(action.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOPPING: &str = r#"def open_reviews(tab_id: str):
    """Open the reviews tab.

    Examples:
        open_reviews('1689')
    """
    click(tab_id)
    scroll(0, 300)
"#;

    fn action_set() -> CustomActionSet {
        let registry = ActionRegistry::builder()
            .subsets(["webarena", "shopping"])
            .domain_source("shopping", SHOPPING)
            .build()
            .unwrap();
        CustomActionSet::new(registry)
    }

    #[test]
    fn test_describe_format() {
        let set = action_set();
        let text = set.describe(true, true);
        assert!(text.starts_with("\n16 different types of actions are available.\n\n"));
        assert!(text.contains("noop(wait_ms: float = 1000)\n    Description: Do nothing"));
        assert!(text.contains("    Examples:\n        noop()\n\n        noop(500)\n\n"));
        // domain actions show their source
        assert!(text.contains("def open_reviews(tab_id: str):\n    \"\"\"Open the reviews tab."));
        assert!(text.ends_with("by using the output variable."));

        let short = set.describe(false, false);
        assert!(short.contains("open_reviews(tab_id: str)\n"));
        assert!(!short.contains("Description:"));
    }

    #[test]
    fn test_describe_is_deterministic() {
        let set = action_set();
        assert_eq!(set.describe(true, true), set.describe(true, true));
        assert_eq!(action_set().describe(true, false), set.describe(true, false));
    }

    #[test]
    fn test_single_action_tail() {
        let set = action_set().with_multiaction(false);
        assert!(set.describe(false, false).ends_with("Only a single action can be provided at once."));
        assert_eq!(
            set.example_action(true, 3),
            "One single action to be executed. You can only use one action at a time."
        );
    }

    #[test]
    fn test_example_action_is_seeded() {
        let set = action_set();
        let a = set.example_action(false, 3);
        let b = set.example_action(false, 3);
        assert_eq!(a, b);
        assert_eq!(a.lines().count(), 3);
        assert!(a.lines().all(|l| l.starts_with("fill(") || l.starts_with("click(")));
    }

    #[test]
    fn test_compile_extracts_first_fence() {
        let set = action_set();
        let compiled = set
            .compile("I will open the reviews.\n```open_reviews('1689')```\n```click('2')```")
            .unwrap();
        assert_eq!(compiled.action, "open_reviews('1689')");
        assert!(compiled.program.starts_with("demo_mode=None\nretry_with_force=False\n\n"));
        assert!(compiled.program.ends_with("open_reviews('1689')"));

        let tagged = set.compile("```python\nclick('12')\nscroll(0, 200)\n```").unwrap();
        assert_eq!(tagged.action, "click('12')\nscroll(0, 200)");
    }

    #[test]
    fn test_compile_errors() {
        let set = action_set();
        assert_eq!(set.compile("click('12')").unwrap_err(), ActionError::EmptyAction);
        assert_eq!(set.compile("``````").unwrap_err(), ActionError::EmptyAction);

        let err = set.compile("```click('12')\n__import__('os')```").unwrap_err();
        assert_eq!(err.kind(), "SyntaxError");
        assert!(err.to_string().starts_with("SyntaxError: line 2"));
    }

    #[test]
    fn test_prelude_flags() {
        let set = action_set()
            .with_demo_mode(Some(DemoMode::AllBlue))
            .with_retry_with_force(true);
        assert!(set.prelude().starts_with("demo_mode='all_blue'\nretry_with_force=True\n"));
        assert!(set.prelude().contains("def open_reviews"));
    }
}
