//! Primitive Action Catalogue
//!
//! Fixed actions executed directly by the browser environment, grouped the
//! way the environment exposes them. Each entry is registered statically;
//! its parameter list is parsed once from the declared signature so the
//! interpreter can bind arguments against it.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use super::parser::parse_module;
use super::types::{render_signature, ActionDefinition, ActionError, ActionOrigin};

/// Statically declared primitive
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveSpec {
    pub name: &'static str,
    /// Parameter list as declared, without parentheses
    pub params: &'static str,
    pub description: &'static str,
    pub examples: &'static [&'static str],
}

/// Always part of any action set
pub const NOOP: &str = "noop";

/// Group names accepted as action subsets
pub const GROUPS: &[&str] = &["chat", "infeas", "bid", "nav", "tab", "webarena"];

pub static PRIMITIVES: &[PrimitiveSpec] = &[
    PrimitiveSpec {
        name: "noop",
        params: "wait_ms: float = 1000",
        description: "Do nothing, and optionally wait for the given time (in milliseconds).",
        examples: &["noop()", "noop(500)"],
    },
    PrimitiveSpec {
        name: "send_msg_to_user",
        params: "text: str",
        description: "Sends a message to the user.",
        examples: &["send_msg_to_user('Based on the results of my search, the city was built in 1751.')"],
    },
    PrimitiveSpec {
        name: "report_infeasible",
        params: "reason: str",
        description: "Notifies the user that their instructions are infeasible.",
        examples: &["report_infeasible('I cannot follow these instructions because there is no email field in this form.')"],
    },
    PrimitiveSpec {
        name: "scroll",
        params: "delta_x: float, delta_y: float",
        description: "Scroll horizontally and vertically. Amounts in pixels, positive for right or down scrolling, negative for left or up scrolling. Dispatches a wheel event.",
        examples: &["scroll(0, 200)", "scroll(-50.2, -100.5)"],
    },
    PrimitiveSpec {
        name: "fill",
        params: "bid: str, value: str",
        description: "Fill out a form field. It focuses the element and triggers an input event with the entered text. It works for <input>, <textarea> and [contenteditable] elements.",
        examples: &[
            "fill('237', 'example value')",
            "fill('45', 'multi-line\\nexample')",
            "fill('a12', 'example with \"quotes\"')",
        ],
    },
    PrimitiveSpec {
        name: "select_option",
        params: "bid: str, options: str | list[str]",
        description: "Select one or multiple options in a <select> element. You can specify option value or label to select. Multiple options can be selected.",
        examples: &["select_option('a48', 'blue')", "select_option('c48', ['red', 'green', 'blue'])"],
    },
    PrimitiveSpec {
        name: "click",
        params: "bid: str, button: Literal['left', 'middle', 'right'] = 'left', modifiers: list[Literal['Alt', 'Control', 'ControlOrMeta', 'Meta', 'Shift']] = []",
        description: "Click an element.",
        examples: &["click('a51')", "click('b22', button='right')", "click('48', button='middle', modifiers=['Shift'])"],
    },
    PrimitiveSpec {
        name: "dblclick",
        params: "bid: str, button: Literal['left', 'middle', 'right'] = 'left', modifiers: list[Literal['Alt', 'Control', 'ControlOrMeta', 'Meta', 'Shift']] = []",
        description: "Double click an element.",
        examples: &["dblclick('12')", "dblclick('ca42', button='right')", "dblclick('178', button='middle', modifiers=['Shift'])"],
    },
    PrimitiveSpec {
        name: "hover",
        params: "bid: str",
        description: "Hover over an element.",
        examples: &["hover('b8')"],
    },
    PrimitiveSpec {
        name: "press",
        params: "bid: str, key_comb: str",
        description: "Focus the matching element and press a combination of keys. It accepts the logical key names that are emitted in the keyboardEvent.key property of the keyboard events: Backquote, Minus, Equal, Backslash, Backspace, Tab, Delete, Escape, ArrowDown, End, Enter, Home, Insert, PageDown, PageUp, ArrowRight, ArrowUp, F1 - F12, Digit0 - Digit9, KeyA - KeyZ, etc. You can alternatively specify a single character you'd like to produce such as \"a\" or \"#\". Following modification shortcuts are also supported: Shift, Control, Alt, Meta, ShiftLeft, ControlOrMeta. ControlOrMeta resolves to Control on Windows and Linux and to Meta on macOS.",
        examples: &["press('88', 'Backspace')", "press('a26', 'ControlOrMeta+a')", "press('a61', 'Meta+Shift+t')"],
    },
    PrimitiveSpec {
        name: "focus",
        params: "bid: str",
        description: "Focus the matching element.",
        examples: &["focus('b455')"],
    },
    PrimitiveSpec {
        name: "clear",
        params: "bid: str",
        description: "Clear the input field.",
        examples: &["clear('996')"],
    },
    PrimitiveSpec {
        name: "drag_and_drop",
        params: "from_bid: str, to_bid: str",
        description: "Perform a drag & drop. Hover the element that will be dragged. Press left mouse button. Move mouse to the element that will receive the drop. Release left mouse button.",
        examples: &["drag_and_drop('56', '498')"],
    },
    PrimitiveSpec {
        name: "upload_file",
        params: "bid: str, file: str | list[str]",
        description: "Click an element and wait for a \"filechooser\" event, then select one or multiple input files for upload. Relative file paths are resolved relative to the current working directory. An absolute file path is recommended.",
        examples: &["upload_file('572', '/home/user/my_receipt.pdf')", "upload_file('63', ['/home/bob/Documents/image.jpg', '/home/bob/Documents/file.zip'])"],
    },
    PrimitiveSpec {
        name: "go_back",
        params: "",
        description: "Navigate to the previous page in history.",
        examples: &["go_back()"],
    },
    PrimitiveSpec {
        name: "go_forward",
        params: "",
        description: "Navigate to the next page in history.",
        examples: &["go_forward()"],
    },
    PrimitiveSpec {
        name: "goto",
        params: "url: str",
        description: "Navigate to a url.",
        examples: &["goto('http://www.example.com')"],
    },
    PrimitiveSpec {
        name: "tab_close",
        params: "",
        description: "Close the current tab.",
        examples: &["tab_close()"],
    },
    PrimitiveSpec {
        name: "tab_focus",
        params: "index: int",
        description: "Bring tab to front (activate tab).",
        examples: &["tab_focus(2)"],
    },
    PrimitiveSpec {
        name: "new_tab",
        params: "",
        description: "Open a new tab. It will become the active one.",
        examples: &["new_tab()"],
    },
    PrimitiveSpec {
        name: "keyboard_press",
        params: "key: str",
        description: "Press a combination of keys. Accepts the logical key names that are emitted in the keyboardEvent.key property of the keyboard events: Backquote, Minus, Equal, Backslash, Backspace, Tab, Delete, Escape, ArrowDown, End, Enter, Home, Insert, PageDown, PageUp, ArrowRight, ArrowUp, F1 - F12, Digit0 - Digit9, KeyA - KeyZ, etc. You can alternatively specify a single character you'd like to produce such as \"a\" or \"#\". Following modification shortcuts are also supported: Shift, Control, Alt, Meta, ShiftLeft, ControlOrMeta. ControlOrMeta resolves to Control on Windows and Linux and to Meta on macOS.",
        examples: &["keyboard_press('Backspace')", "keyboard_press('ControlOrMeta+a')", "keyboard_press('Meta+Shift+t')"],
    },
];

/// Members of a primitive group, in the order the group declares them
pub fn group(name: &str) -> Option<&'static [&'static str]> {
    let members: &'static [&'static str] = match name {
        "chat" => &["send_msg_to_user"],
        "infeas" => &["report_infeasible"],
        "bid" => &[
            "scroll",
            "fill",
            "select_option",
            "click",
            "dblclick",
            "hover",
            "press",
            "focus",
            "clear",
            "drag_and_drop",
            "upload_file",
        ],
        "nav" => &["go_back", "go_forward", "goto"],
        "tab" => &["tab_close", "tab_focus", "new_tab"],
        "webarena" => &[
            "click",
            "hover",
            "fill",
            "keyboard_press",
            "scroll",
            "tab_focus",
            "new_tab",
            "tab_close",
            "go_back",
            "go_forward",
            "goto",
            "send_msg_to_user",
            "report_infeasible",
            "select_option",
        ],
        _ => return None,
    };
    Some(members)
}

pub fn lookup(name: &str) -> Option<&'static PrimitiveSpec> {
    PRIMITIVES.iter().find(|p| p.name == name)
}

/// Parsed definitions of the whole catalogue
static CATALOGUE: Lazy<Vec<ActionDefinition>> = Lazy::new(|| {
    PRIMITIVES
        .iter()
        .filter_map(|spec| spec.definition().ok())
        .collect()
});

/// Definition of a primitive by name, whether or not it is in an action set
pub fn definition(name: &str) -> Option<&'static ActionDefinition> {
    CATALOGUE.iter().find(|d| d.name == name)
}

impl PrimitiveSpec {
    /// Stub definition shown in the execution prelude
    pub fn stub_source(&self) -> String {
        let mut doc = format!("    \"\"\"{}\n\n    Examples:\n", self.description);
        for example in self.examples {
            doc.push_str("        ");
            doc.push_str(example);
            doc.push('\n');
        }
        doc.push_str("    \"\"\"");
        format!("def {}({}):\n{}\n    pass", self.name, self.params, doc)
    }

    /// Build the registry entry for this primitive
    pub fn definition(&self) -> Result<ActionDefinition, ActionError> {
        let header = format!("def {}({}):\n    pass\n", self.name, self.params);
        let module = parse_module(&header, &HashSet::<String>::new())?;
        let params = module
            .functions
            .into_iter()
            .next()
            .map(|f| f.params)
            .unwrap_or_default();

        Ok(ActionDefinition {
            name: self.name.to_string(),
            signature: render_signature(self.name, &params),
            description: self.description.to_string(),
            examples: self.examples.iter().map(|e| e.to_string()).collect(),
            source_text: self.stub_source(),
            origin: ActionOrigin::Primitive,
            params,
            body: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_primitive_parses() {
        for spec in PRIMITIVES {
            let def = spec.definition().unwrap_or_else(|e| panic!("{}: {}", spec.name, e));
            assert!(def.is_primitive());
        }
        assert_eq!(CATALOGUE.len(), PRIMITIVES.len());
    }

    #[test]
    fn test_group_members_exist() {
        for name in GROUPS {
            for member in group(name).unwrap() {
                assert!(lookup(member).is_some(), "{} missing from catalogue", member);
            }
        }
        assert_eq!(group("webarena").unwrap().len(), 14);
        assert!(group("custom").is_none());
    }

    #[test]
    fn test_signature_rendering() {
        let click = definition("click").unwrap();
        assert_eq!(
            click.signature,
            "click(bid: str, button: Literal['left', 'middle', 'right'] = 'left', modifiers: list[Literal['Alt', 'Control', 'ControlOrMeta', 'Meta', 'Shift']] = [])"
        );
        assert_eq!(definition("go_back").unwrap().signature, "go_back()");
        assert_eq!(definition("noop").unwrap().signature, "noop(wait_ms: float = 1000)");
    }

    #[test]
    fn test_stub_source_parses_with_docstring() {
        let spec = lookup("fill").unwrap();
        let module = parse_module(&spec.stub_source(), &HashSet::<String>::new()).unwrap();
        let doc = module.functions[0].docstring.clone().unwrap();
        assert!(doc.contains("Examples:"));
    }
}
