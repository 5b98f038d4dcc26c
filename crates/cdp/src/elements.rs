//! In-page JavaScript for element work: enumeration of clickable
//! candidates, selector synthesis, and the expression builders the click
//! and type paths evaluate.
//!
//! Selector synthesis happens in the page because only the live DOM can
//! tell which handle is unique; the Rust side parses the returned JSON
//! and classifies element kinds.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tabpilot_core::{ElementKind, InteractiveElement};

/// Hard cap on enumeration results shipped out of the page.
pub const MAX_CLICKABLE: usize = 30;

/// Selectors the enumerator queries, in priority order.
const CANDIDATE_SELECTORS: &str = "input:not([type=hidden]), textarea, select, \
     [contenteditable=true], a[href], button, input[type=button], \
     input[type=submit], [onclick], [role=button], [role=link], [role=textbox]";

/// Embed a Rust string as a JS string literal.
pub fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Expression returning up to [`MAX_CLICKABLE`] visible interactive
/// elements as `[{selector, tag, text, role}]`.
pub fn enumerate_expression() -> String {
    format!(
        r#"(() => {{
  const seen = new Set();
  const out = [];
  const nodes = document.querySelectorAll({query});
  for (const el of nodes) {{
    if (seen.has(el)) continue;
    seen.add(el);
    const rect = el.getBoundingClientRect();
    if (rect.width <= 0 || rect.height <= 0) continue;
    if (rect.x < 0 || rect.y < 0 || rect.x > 2000 || rect.y > 2000) continue;
    let selector = el.tagName.toLowerCase();
    if (el.id) {{
      selector = '#' + CSS.escape(el.id);
    }} else if (el.getAttribute('name')) {{
      selector = selector + '[name="' + el.getAttribute('name') + '"]';
    }} else if (el.getAttribute('data-testid')) {{
      selector = selector + '[data-testid="' + el.getAttribute('data-testid') + '"]';
    }} else if (el.getAttribute('aria-label')) {{
      selector = selector + '[aria-label="' + el.getAttribute('aria-label') + '"]';
    }} else if (el.classList.length > 0) {{
      selector = selector + '.' + CSS.escape(el.classList[0]);
    }}
    let text = (el.innerText || el.textContent || '').trim();
    if (!text) text = el.getAttribute('placeholder') || '';
    if (!text) text = el.value || '';
    text = String(text).replace(/\s+/g, ' ').slice(0, 50);
    out.push({{
      selector: selector,
      tag: el.tagName.toLowerCase(),
      text: text,
      role: el.getAttribute('role') || null,
    }});
    if (out.length >= {max}) break;
  }}
  return out;
}})()"#,
        query = js_string(CANDIDATE_SELECTORS),
        max = MAX_CLICKABLE,
    )
}

/// Expression that scrolls the first match of `selector` to the viewport
/// centre and returns its centre-point rectangle.
pub fn locate_expression(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return {{ found: false }};
  el.scrollIntoView({{ block: 'center', inline: 'center' }});
  const rect = el.getBoundingClientRect();
  return {{
    found: true,
    x: rect.x + rect.width / 2,
    y: rect.y + rect.height / 2,
    width: rect.width,
    height: rect.height,
  }};
}})()"#,
        sel = js_string(selector),
    )
}

/// Expression invoking the element's own click handler.
pub fn js_click_expression(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return false;
  el.click();
  return true;
}})()"#,
        sel = js_string(selector),
    )
}

/// Expression focusing the element, for the focus-and-Enter fallback.
pub fn focus_expression(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return false;
  el.focus();
  return true;
}})()"#,
        sel = js_string(selector),
    )
}

/// Expression clearing an input's value and notifying framework listeners.
pub fn clear_value_expression(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return false;
  el.value = '';
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return true;
}})()"#,
        sel = js_string(selector),
    )
}

/// Expression returning the current length of an input's value.
pub fn value_length_expression(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return -1;
  return (el.value || '').length;
}})()"#,
        sel = js_string(selector),
    )
}

/// Expression finding the first anchor or button whose visible text
/// contains `text`, scrolling it into view and returning its centre.
pub fn text_fallback_expression(text: &str) -> String {
    format!(
        r#"(() => {{
  const needle = {needle}.toLowerCase();
  const nodes = document.querySelectorAll('a, button, input[type=button], input[type=submit]');
  for (const el of nodes) {{
    const label = ((el.innerText || el.textContent || el.value || '') + '').toLowerCase();
    if (!label.includes(needle)) continue;
    el.scrollIntoView({{ block: 'center', inline: 'center' }});
    const rect = el.getBoundingClientRect();
    if (rect.width <= 0 || rect.height <= 0) continue;
    return {{
      found: true,
      x: rect.x + rect.width / 2,
      y: rect.y + rect.height / 2,
    }};
  }}
  return {{ found: false }};
}})()"#,
        needle = js_string(text),
    )
}

static CONTAINS_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#":contains\(\s*['"]([^'"]*)['"]\s*\)"#).unwrap());

/// Heuristic guard for selectors a real CSS engine would reject:
/// jQuery-style pseudo-classes and stray `$`. Not an exhaustive parser.
pub fn is_invalid_selector(selector: &str) -> bool {
    selector.contains(":contains(") || selector.contains(":has(") || selector.contains('$')
}

/// Pull the quoted text out of a `:contains('...')` pseudo-class, if any.
pub fn contains_text(selector: &str) -> Option<String> {
    CONTAINS_TEXT
        .captures(selector)
        .map(|caps| caps[1].to_string())
}

/// Parse the enumeration result into typed elements, 1-indexed.
pub fn parse_elements(raw: &Value) -> Vec<InteractiveElement> {
    let items = match raw.as_array() {
        Some(items) => items,
        None => return Vec::new(),
    };
    items
        .iter()
        .take(MAX_CLICKABLE)
        .enumerate()
        .map(|(i, item)| {
            let tag = item
                .get("tag")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_lowercase();
            let role = item.get("role").and_then(|v| v.as_str());
            InteractiveElement {
                index: (i + 1) as u32,
                kind: ElementKind::from_tag(&tag, role),
                selector: item
                    .get("selector")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&tag)
                    .to_string(),
                tag,
                text: item
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invalid_selector_heuristics() {
        assert!(is_invalid_selector("a:contains('More')"));
        assert!(is_invalid_selector("div:has(> span)"));
        assert!(is_invalid_selector("$('#go')"));
        assert!(!is_invalid_selector("button.go"));
        assert!(!is_invalid_selector("#main input[name=q]"));
    }

    #[test]
    fn test_contains_text_extraction() {
        assert_eq!(
            contains_text("a:contains('Sign in')").as_deref(),
            Some("Sign in")
        );
        assert_eq!(
            contains_text(r#"button:contains("Go")"#).as_deref(),
            Some("Go")
        );
        assert_eq!(contains_text("button.go"), None);
    }

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string(r#"a"b"#), r#""a\"b""#);
        let expr = locate_expression("a[title=\"x\"]");
        assert!(expr.contains(r#"a[title=\"x\"]"#));
    }

    #[test]
    fn test_parse_elements_caps_and_indexes() {
        let raw: Vec<Value> = (0..40)
            .map(|i| json!({"selector": format!("#e{}", i), "tag": "a", "text": "x"}))
            .collect();
        let elements = parse_elements(&Value::Array(raw));
        assert_eq!(elements.len(), MAX_CLICKABLE);
        assert_eq!(elements[0].index, 1);
        assert_eq!(elements.last().unwrap().index, MAX_CLICKABLE as u32);
    }

    #[test]
    fn test_parse_elements_classification() {
        let raw = json!([
            {"selector": "#home", "tag": "A", "text": "Home"},
            {"selector": "div.menu", "tag": "div", "text": "Menu", "role": "button"},
            {"selector": "select[name=lang]", "tag": "select", "text": ""},
        ]);
        let elements = parse_elements(&raw);
        assert_eq!(elements[0].kind, ElementKind::Link);
        assert_eq!(elements[0].tag, "a");
        assert_eq!(elements[1].kind, ElementKind::Button);
        assert_eq!(elements[2].kind, ElementKind::Select);
    }

    #[test]
    fn test_enumerate_expression_mentions_candidates() {
        let expr = enumerate_expression();
        assert!(expr.contains("input:not([type=hidden])"));
        assert!(expr.contains("[contenteditable=true]"));
        assert!(expr.contains("[role=textbox]"));
    }
}
