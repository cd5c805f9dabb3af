use select::document::Document;
use select::node::Node;
use select::predicate::Predicate;
use serde::{Deserialize, Serialize};

pub const PROMPT_INPUT: &str = "prompt_input";
pub const GENERATE_BUTTON: &str = "generate_button";
pub const RESULT_IMAGES: &str = "result_images";

/// Element roles every provider recipe is expected to define.
pub const ROLES: &[&str] = &[PROMPT_INPUT, GENERATE_BUTTON, RESULT_IMAGES];

/// A recursive, serializable definition of a CSS selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec")]
pub enum CssSelector {
    /// Matches an HTML tag name (e.g., "textarea", "button")
    Tag(String),

    /// Matches a CSS class (e.g., "generate-btn")
    Class(String),

    /// Matches an HTML ID (e.g., "prompt")
    Id(String),

    /// Matches an attribute existence or specific value
    Attribute { key: String, value: Option<String> },

    /// Matches an attribute whose value contains a substring: `[key*='value']`
    AttributeContains { key: String, value: String },

    /// AND Logic: Matches if ALL sub-selectors match
    And(Vec<CssSelector>),

    /// OR Logic: Matches if ANY sub-selector matches
    Or(Vec<CssSelector>),

    /// Descendant Logic: .ancestor .descendant
    Descendant {
        ancestor: Box<CssSelector>,
        descendant: Box<CssSelector>,
    },

    /// Child Logic: .parent > .child
    Child {
        parent: Box<CssSelector>,
        child: Box<CssSelector>,
    },
}

impl CssSelector {
    /// Converts the structured selector into a standard CSS selector string.
    pub fn to_css_string(&self) -> String {
        match self {
            CssSelector::Tag(tag) => tag.clone(),
            CssSelector::Class(cls) => format!(".{}", cls),
            CssSelector::Id(id) => format!("#{}", id),
            CssSelector::Attribute { key, value } => match value {
                Some(v) => format!("[{}='{}']", key, v),
                None => format!("[{}]", key),
            },
            CssSelector::AttributeContains { key, value } => format!("[{}*='{}']", key, value),
            CssSelector::And(selectors) => selectors
                .iter()
                .map(|s| s.to_css_string())
                .collect::<Vec<_>>()
                .join(""),
            CssSelector::Or(selectors) => selectors
                .iter()
                .map(|s| s.to_css_string())
                .collect::<Vec<_>>()
                .join(", "),
            CssSelector::Descendant {
                ancestor,
                descendant,
            } => {
                format!(
                    "{} {}",
                    ancestor.to_css_string(),
                    descendant.to_css_string()
                )
            }
            CssSelector::Child { parent, child } => {
                format!("{} > {}", parent.to_css_string(), child.to_css_string())
            }
        }
    }

    /// True if any element of the page matches.
    pub fn found_in(&self, document: &Document) -> bool {
        document.find(self).next().is_some()
    }
}

impl Predicate for CssSelector {
    fn matches(&self, node: &Node) -> bool {
        match self {
            CssSelector::Tag(tag) => node.name() == Some(tag.as_str()),
            CssSelector::Class(cls) => node
                .attr("class")
                .map(|classes| classes.split_whitespace().any(|c| c == cls))
                .unwrap_or(false),
            CssSelector::Id(id) => node.attr("id") == Some(id.as_str()),
            CssSelector::Attribute { key, value } => match value {
                Some(v) => node.attr(key.as_str()) == Some(v.as_str()),
                None => node.attr(key.as_str()).is_some(),
            },
            CssSelector::AttributeContains { key, value } => node
                .attr(key.as_str())
                .is_some_and(|v| v.contains(value.as_str())),
            CssSelector::And(selectors) => selectors.iter().all(|s| s.matches(node)),
            CssSelector::Or(selectors) => selectors.iter().any(|s| s.matches(node)),
            CssSelector::Descendant {
                ancestor,
                descendant,
            } => {
                if !descendant.matches(node) {
                    return false;
                }
                let mut current = node.parent();
                while let Some(parent) = current {
                    if ancestor.matches(&parent) {
                        return true;
                    }
                    current = parent.parent();
                }
                false
            }
            CssSelector::Child { parent, child } => {
                child.matches(node) && node.parent().map(|p| parent.matches(&p)).unwrap_or(false)
            }
        }
    }
}

impl<'a> Predicate for &'a CssSelector {
    fn matches(&self, node: &Node) -> bool {
        (*self).matches(node)
    }
}

fn tag(name: &str) -> CssSelector {
    CssSelector::Tag(name.to_string())
}

fn contains(key: &str, value: &str) -> CssSelector {
    CssSelector::AttributeContains {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn class(name: &str) -> CssSelector {
    CssSelector::Class(name.to_string())
}

fn id(name: &str) -> CssSelector {
    CssSelector::Id(name.to_string())
}

fn within(ancestor: CssSelector, descendant: CssSelector) -> CssSelector {
    CssSelector::Descendant {
        ancestor: Box::new(ancestor),
        descendant: Box::new(descendant),
    }
}

/// Fallback selectors for an element role, best guess first.
pub fn candidates(role: &str) -> Option<Vec<CssSelector>> {
    let list = match role {
        PROMPT_INPUT => vec![
            CssSelector::And(vec![tag("textarea"), contains("name", "prompt")]),
            CssSelector::And(vec![tag("input"), contains("name", "prompt")]),
            id("prompt"),
            class("prompt-input"),
            contains("data-testid", "prompt"),
        ],
        GENERATE_BUTTON => vec![
            CssSelector::And(vec![tag("button"), contains("data-testid", "generate")]),
            CssSelector::And(vec![tag("button"), contains("aria-label", "generate")]),
            class("generate-btn"),
            id("generate"),
            CssSelector::And(vec![
                tag("input"),
                CssSelector::Attribute {
                    key: "type".to_string(),
                    value: Some("submit".to_string()),
                },
                contains("value", "generate"),
            ]),
        ],
        RESULT_IMAGES => vec![
            CssSelector::And(vec![tag("img"), contains("src", "generated")]),
            CssSelector::And(vec![tag("img"), contains("src", "result")]),
            within(class("result"), tag("img")),
            within(class("generated-image"), tag("img")),
        ],
        _ => return None,
    };
    Some(list)
}

/// The first candidate for `role` that matches an element of `html`.
pub fn first_match(role: &str, html: &str) -> Option<CssSelector> {
    let document = Document::from(html);
    candidates(role)?
        .into_iter()
        .find(|candidate| candidate.found_in(&document))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_render_to_css() {
        let prompt: Vec<String> = candidates(PROMPT_INPUT)
            .unwrap()
            .iter()
            .map(CssSelector::to_css_string)
            .collect();
        assert_eq!(prompt[0], "textarea[name*='prompt']");
        assert_eq!(prompt[2], "#prompt");
        assert_eq!(prompt[4], "[data-testid*='prompt']");

        let button = candidates(GENERATE_BUTTON).unwrap();
        assert_eq!(
            button[4].to_css_string(),
            "input[type='submit'][value*='generate']"
        );
        let images = candidates(RESULT_IMAGES).unwrap();
        assert_eq!(images[2].to_css_string(), ".result img");
        assert!(candidates("download_link").is_none());
    }

    #[test]
    fn first_match_skips_candidates_absent_from_the_page() {
        let html = r#"
            <html><body>
              <div class="toolbar"><button class="generate-btn">Go</button></div>
              <div class="result"><img src="/cdn/abc.png"></div>
            </body></html>
        "#;
        assert_eq!(
            first_match(GENERATE_BUTTON, html).map(|s| s.to_css_string()),
            Some(".generate-btn".to_string())
        );
        assert_eq!(
            first_match(RESULT_IMAGES, html).map(|s| s.to_css_string()),
            Some(".result img".to_string())
        );
        assert!(first_match(PROMPT_INPUT, html).is_none());
    }

    #[test]
    fn attribute_contains_matches_substrings() {
        let html = r#"<textarea name="main-prompt-field"></textarea>"#;
        let doc = Document::from(html);
        assert!(contains("name", "prompt").found_in(&doc));
        assert!(!contains("name", "negative").found_in(&doc));
    }
}
