//! Prompt builder
//!
//! Turns a change request into the instruction text handed to the agent.

use crate::memory::ElementDescriptor;

/// Label written by the agent in front of the commit hash
pub const COMMIT_MARKER: &str = "COMMIT_HASH:";

/// Computed style properties worth showing, with accepted key spellings
const STYLE_PROPERTIES: &[(&str, &[&str])] = &[
    ("width", &["width"]),
    ("height", &["height"]),
    ("background", &["background", "background-color", "backgroundColor"]),
    ("color", &["color"]),
    ("font-size", &["font-size", "fontSize"]),
    ("display", &["display"]),
    ("position", &["position"]),
];

/// Build the agent prompt. Pure and deterministic.
pub fn build_prompt(
    feedback: &str,
    descriptor: &ElementDescriptor,
    page_url: Option<&str>,
    memory_context: Option<&str>,
) -> String {
    let mut out = String::new();

    out.push_str("A user marked up an element on a running web page and asked for a change.\n\n");
    out.push_str("## Requested change\n");
    for line in feedback.trim().lines() {
        out.push_str("> ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');

    out.push_str("## Element\n");
    out.push_str(&format!("- Tag: <{}>\n", descriptor.tag_name.to_lowercase()));
    if let Some(selector) = non_empty(descriptor.selector.as_deref()) {
        out.push_str(&format!("- Selector: `{}`\n", selector));
    }
    if let Some(id) = non_empty(descriptor.id.as_deref()) {
        out.push_str(&format!("- Id: #{}\n", id));
    }
    let classes = descriptor.normalized_classes();
    if !classes.is_empty() {
        out.push_str(&format!("- Classes: {}\n", classes.join(" ")));
    }
    if let Some(text) = non_empty(descriptor.text_content.as_deref()) {
        out.push_str(&format!("- Text: \"{}\"\n", truncate(text, 120)));
    }
    if !descriptor.dom_path.is_empty() {
        out.push_str(&format!("- DOM path: {}\n", descriptor.dom_path.join(" > ")));
    }

    let styles: Vec<String> = STYLE_PROPERTIES
        .iter()
        .filter_map(|(label, keys)| {
            keys.iter()
                .find_map(|k| non_empty(descriptor.computed_styles.get(*k).map(String::as_str)))
                .map(|v| format!("  - {}: {}", label, v))
        })
        .collect();
    if !styles.is_empty() {
        out.push_str("- Computed styles:\n");
        for s in styles {
            out.push_str(&s);
            out.push('\n');
        }
    }

    if let Some(url) = non_empty(page_url) {
        out.push_str(&format!("- Page: {}\n", url));
    }
    out.push('\n');

    if let Some(context) = non_empty(memory_context) {
        out.push_str("## History\n");
        out.push_str(context.trim_end());
        out.push_str("\n\n");
    }

    out.push_str("## Instructions\n");
    out.push_str("1. Find the source file(s) in this project that render this element.\n");
    out.push_str("2. Make the requested change with the smallest edit that achieves it.\n");
    out.push_str("3. Commit the change with a short descriptive message.\n");
    out.push_str(&format!(
        "4. When done, print `{} <full 40-character commit hash>` on its own line.\n",
        COMMIT_MARKER
    ));

    out
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ElementDescriptor {
        let mut d = ElementDescriptor {
            tag_name: "BUTTON".to_string(),
            id: Some("buy".to_string()),
            class_names: vec!["primary".to_string(), "btn".to_string()],
            selector: Some("form > button#buy".to_string()),
            dom_path: vec!["body".to_string(), "main".to_string(), "form".to_string()],
            ..Default::default()
        };
        d.computed_styles.insert("fontSize".to_string(), "14px".to_string());
        d.computed_styles.insert("color".to_string(), "rgb(0, 0, 0)".to_string());
        d.computed_styles.insert("margin".to_string(), "4px".to_string());
        d
    }

    #[test]
    fn test_prompt_contains_element_context() {
        let p = build_prompt("Make it green", &descriptor(), Some("http://localhost:5173/cart"), None);

        assert!(p.contains("> Make it green"));
        assert!(p.contains("- Tag: <button>"));
        assert!(p.contains("- Selector: `form > button#buy`"));
        assert!(p.contains("- Id: #buy"));
        assert!(p.contains("- Classes: btn primary"));
        assert!(p.contains("- DOM path: body > main > form"));
        assert!(p.contains("  - font-size: 14px"));
        assert!(p.contains("  - color: rgb(0, 0, 0)"));
        assert!(p.contains("- Page: http://localhost:5173/cart"));
        assert!(!p.contains("## History"));
    }

    #[test]
    fn test_only_known_styles_are_listed() {
        let p = build_prompt("x", &descriptor(), None, None);
        assert!(!p.contains("margin"));
        assert!(!p.contains("width"));
        assert!(!p.contains("- Page:"));
    }

    #[test]
    fn test_style_order_is_fixed() {
        let p = build_prompt("x", &descriptor(), None, None);
        let color = p.find("  - color:").unwrap();
        let font = p.find("  - font-size:").unwrap();
        assert!(color < font);
    }

    #[test]
    fn test_memory_context_included() {
        let p = build_prompt("x", &descriptor(), None, Some("- 2026-01-01 10:00 ✓ \"make it red\"\n"));
        assert!(p.contains("## History\n- 2026-01-01 10:00 ✓ \"make it red\"\n"));
    }

    #[test]
    fn test_asks_for_commit_marker() {
        let p = build_prompt("x", &ElementDescriptor::default(), None, None);
        assert!(p.contains(COMMIT_MARKER));
    }

    #[test]
    fn test_deterministic() {
        let a = build_prompt("Same", &descriptor(), Some("u"), Some("ctx"));
        let b = build_prompt("Same", &descriptor(), Some("u"), Some("ctx"));
        assert_eq!(a, b);
    }
}
