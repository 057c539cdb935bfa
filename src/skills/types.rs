//! Action Type Definitions
//!
//! Core data structures for the action system: literal values of the
//! constrained action language, action definitions and the error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::parser::{FunctionDef, ParseError};

/// Literal value in the constrained action language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    /// Render the value the way it would be written in action source
    pub fn to_source(&self) -> String {
        match self {
            Self::None => "None".to_string(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            Self::Str(s) => quote(s),
            Self::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::to_source).collect();
                format!("[{}]", inner.join(", "))
            }
        }
    }

    /// Name of the value's type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_source())
    }
}

/// Single-quote a string, escaping like a Python repr
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Formal parameter of an action
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// Type annotation exactly as declared
    pub annotation: Option<String>,
    pub default: Option<Value>,
    /// `*name` parameter collecting the remaining positional arguments
    pub variadic: bool,
}

impl Param {
    /// Render as it appears in a signature
    pub fn render(&self) -> String {
        let mut s = String::new();
        if self.variadic {
            s.push('*');
        }
        s.push_str(&self.name);
        if let Some(ref annotation) = self.annotation {
            s.push_str(": ");
            s.push_str(annotation);
        }
        if let Some(ref default) = self.default {
            if self.annotation.is_some() {
                s.push_str(" = ");
            } else {
                s.push('=');
            }
            s.push_str(&default.to_source());
        }
        s
    }
}

/// Where an action comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOrigin {
    /// Fixed primitive executed by the environment
    Primitive,
    /// Induced action read from a domain backing store
    Domain(String),
}

/// One callable action exposed to the agent
#[derive(Debug, Clone)]
pub struct ActionDefinition {
    /// Unique function name within a registry
    pub name: String,
    /// `name(param: type, ...)`
    pub signature: String,
    pub description: String,
    pub examples: Vec<String>,
    /// Full textual definition
    pub source_text: String,
    pub origin: ActionOrigin,
    pub params: Vec<Param>,
    /// Parsed body for domain actions, `None` for primitives
    pub body: Option<Arc<FunctionDef>>,
}

impl ActionDefinition {
    /// True for actions from a user-extensible domain module
    pub fn is_inducible_source(&self) -> bool {
        matches!(self.origin, ActionOrigin::Domain(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.origin, ActionOrigin::Primitive)
    }
}

/// Render `name(params...)`
pub fn render_signature(name: &str, params: &[Param]) -> String {
    let rendered: Vec<String> = params.iter().map(Param::render).collect();
    format!("{}({})", name, rendered.join(", "))
}

/// Split a docstring on the mandatory `Examples:` separator
///
/// Returns the description and the non-empty example lines, or `None`
/// when the separator is missing.
pub fn split_doc(doc: &str) -> Option<(String, Vec<String>)> {
    let (description, examples) = doc.split_once(EXAMPLES_SEPARATOR)?;
    let examples = examples
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    Some((description.trim().to_string(), examples))
}

/// Literal token separating description from examples in action docs
pub const EXAMPLES_SEPARATOR: &str = "Examples:";

/// Action errors
///
/// The display form starts with the error kind so the message can be fed
/// back to the agent verbatim as the last action error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("SyntaxError: {0}")]
    Syntax(#[from] ParseError),

    #[error("MalformedActionDocError: docstring of action '{0}' has no 'Examples:' section")]
    MalformedDoc(String),

    #[error("DuplicateNameError: duplicated action '{0}'")]
    DuplicateName(String),

    #[error("EmptyActionError: no code block found in action text")]
    EmptyAction,

    #[error("TimeoutError: {0}")]
    Timeout(String),

    #[error("ValueError: unknown action subset '{0}'")]
    UnknownSubset(String),

    #[error("TypeError: {0}")]
    Arity(String),

    #[error("IOError: cannot read {path}: {message}")]
    Load { path: String, message: String },

    /// Error reported by the environment while executing a primitive
    #[error("{0}")]
    Environment(String),
}

impl ActionError {
    /// Kind name as it prefixes the display form
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Syntax(_) => "SyntaxError",
            Self::MalformedDoc(_) => "MalformedActionDocError",
            Self::DuplicateName(_) => "DuplicateNameError",
            Self::EmptyAction => "EmptyActionError",
            Self::Timeout(_) => "TimeoutError",
            Self::UnknownSubset(_) => "ValueError",
            Self::Arity(_) => "TypeError",
            Self::Environment(_) => "EnvironmentError",
            Self::Load { .. } => "IOError",
        }
    }

    /// Errors reported to the agent as a step error rather than aborting
    pub fn is_step_level(&self) -> bool {
        matches!(
            self,
            Self::Syntax(_)
                | Self::EmptyAction
                | Self::Timeout(_)
                | Self::Arity(_)
                | Self::Environment(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_source() {
        assert_eq!(Value::Str("it's".into()).to_source(), r"'it\'s'");
        assert_eq!(Value::Float(300.0).to_source(), "300.0");
        assert_eq!(Value::Int(-500).to_source(), "-500");
        assert_eq!(
            Value::List(vec![Value::Str("a".into()), Value::Bool(true), Value::None]).to_source(),
            "['a', True, None]"
        );
    }

    #[test]
    fn test_param_render() {
        let param = Param {
            name: "button".to_string(),
            annotation: Some("str".to_string()),
            default: Some(Value::Str("left".to_string())),
            variadic: false,
        };
        assert_eq!(param.render(), "button: str = 'left'");

        let rest = Param {
            name: "ids".to_string(),
            annotation: None,
            default: None,
            variadic: true,
        };
        assert_eq!(render_signature("visit", &[param, rest]), "visit(button: str = 'left', *ids)");
    }

    #[test]
    fn test_split_doc() {
        let doc = "Open the reviews tab.\n\n    Examples:\n        open_reviews('1689')\n\n        open_reviews('12')\n";
        let (description, examples) = split_doc(doc).unwrap();
        assert_eq!(description, "Open the reviews tab.");
        assert_eq!(examples, vec!["open_reviews('1689')", "open_reviews('12')"]);

        assert!(split_doc("No separator here").is_none());
    }

    #[test]
    fn test_error_display_has_kind_prefix() {
        let err = ActionError::EmptyAction;
        assert!(err.to_string().starts_with(err.kind()));
        let err = ActionError::Timeout("Timeout 500ms exceeded.".to_string());
        assert_eq!(err.to_string(), "TimeoutError: Timeout 500ms exceeded.");
        assert!(err.is_step_level());
        assert!(!ActionError::MalformedDoc("x".into()).is_step_level());
    }
}
