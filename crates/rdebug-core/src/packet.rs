use crate::xml::Node;
use std::collections::BTreeMap;

/// Flat attribute mapping of one protocol element.
pub type Attrs = BTreeMap<String, String>;

/// Container tags whose responses carry an ordered list of child elements.
pub const LIST_TAGS: [&str; 3] = ["breakpoints", "frames", "variables"];

/// One decoded engine message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Top-level element name, recorded by the parser.
    pub tag: String,
    pub attrs: Attrs,
    /// Attribute mappings of the child elements, in document order.
    pub items: Vec<Attrs>,
    pub text: String,
    /// Extra top-level elements that arrived in the same body and were not
    /// turned into packets of their own.
    pub trailing: usize,
}

impl Packet {
    pub(crate) fn from_node(node: Node, trailing: usize) -> Self {
        Self {
            items: node.children.into_iter().map(|child| child.attrs).collect(),
            tag: node.tag,
            attrs: node.attrs,
            text: node.text,
            trailing,
        }
    }

    pub fn is_list(&self) -> bool {
        LIST_TAGS.contains(&self.tag.as_str())
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// True when the attribute parses to the given integer.
    pub fn attr_is(&self, key: &str, expected: i64) -> bool {
        self.attr(key)
            .and_then(|value| value.trim().parse::<i64>().ok())
            .map(|value| value == expected)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty() && self.items.is_empty() && self.text.trim().is_empty()
    }
}
