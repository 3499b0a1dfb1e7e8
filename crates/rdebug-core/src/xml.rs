//! Minimal element tree decoding on top of `quick-xml`.

use crate::error::ProtocolError;
use crate::packet::Attrs;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub children: Vec<Node>,
    pub text: String,
}

impl Node {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

/// Decodes the first top-level element of `text` into a tree.
pub fn decode(text: &str) -> Result<Node, ProtocolError> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|err| ProtocolError::Decode(err.to_string()))?;
        match event {
            Event::Start(start) => stack.push(open_node(&start)?),
            Event::Empty(start) => {
                let node = open_node(&start)?;
                attach(&mut stack, &mut root, node);
            }
            Event::End(_) => {
                let Some(node) = stack.pop() else {
                    return Err(ProtocolError::Decode("unbalanced closing tag".to_string()));
                };
                attach(&mut stack, &mut root, node);
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|err| ProtocolError::Decode(err.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&value);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(ProtocolError::Decode(format!("unclosed element <{}>", open.tag)));
    }
    root.ok_or(ProtocolError::Empty)
}

fn open_node(start: &BytesStart<'_>) -> Result<Node, ProtocolError> {
    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Attrs::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|err| ProtocolError::Decode(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| ProtocolError::Decode(err.to_string()))?;
        attrs.insert(key, value.into_owned());
    }
    Ok(Node {
        tag,
        attrs,
        children: Vec::new(),
        text: String::new(),
    })
}

fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    } else if root.is_none() {
        *root = Some(node);
    }
}
