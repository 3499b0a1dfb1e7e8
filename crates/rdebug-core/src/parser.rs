use crate::error::ProtocolError;
use crate::packet::Packet;
use crate::xml;

const PACKET_ROOT: &str = "rdebug-packet";

/// List containers the engine may split across several writes.
const CONTAINERS: [Container; 3] = [
    Container {
        list: "breakpoints",
        item: "breakpoint",
    },
    Container {
        list: "frames",
        item: "frame",
    },
    Container {
        list: "variables",
        item: "variable",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Container {
    list: &'static str,
    item: &'static str,
}

impl Container {
    fn closing(&self) -> String {
        format!("</{}>", self.list)
    }
}

/// Turns raw engine text into packets, reassembling list responses that
/// arrive in fragments.
#[derive(Debug, Default)]
pub struct PacketParser {
    buffer: String,
    open: Option<Container>,
}

impl PacketParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_buffering(&self) -> bool {
        self.open.is_some()
    }

    pub fn feed(&mut self, chunk: &str) -> Result<Vec<Packet>, ProtocolError> {
        if let Some(container) = self.open {
            if chunk.contains(&container.closing()) {
                self.buffer.push_str(chunk);
                self.open = None;
                let body = std::mem::take(&mut self.buffer);
                return parse_body(&body).map(|packet| vec![packet]);
            }
            if starts_with_tag(chunk.trim_start(), container.item) {
                self.buffer.push_str(chunk);
                return Ok(Vec::new());
            }
        }

        if let Some(container) = opens_unclosed(chunk) {
            self.buffer.clear();
            self.buffer.push_str(chunk);
            self.open = Some(container);
            return Ok(Vec::new());
        }

        parse_body(chunk).map(|packet| vec![packet])
    }
}

fn opens_unclosed(chunk: &str) -> Option<Container> {
    CONTAINERS.into_iter().find(|container| {
        let Some(start) = find_tag(chunk, container.list) else {
            return false;
        };
        let Some(end) = chunk[start..].find('>') else {
            return true;
        };
        let self_closing = chunk[start..start + end].ends_with('/');
        !self_closing && !chunk.contains(&container.closing())
    })
}

fn find_tag(text: &str, name: &str) -> Option<usize> {
    let needle = format!("<{name}");
    let mut offset = 0;
    while let Some(found) = text[offset..].find(&needle) {
        let start = offset + found;
        if starts_with_tag(&text[start..], name) {
            return Some(start);
        }
        offset = start + needle.len();
    }
    None
}

fn starts_with_tag(text: &str, name: &str) -> bool {
    let Some(rest) = text.strip_prefix('<').and_then(|rest| rest.strip_prefix(name)) else {
        return false;
    };
    matches!(rest.chars().next(), None | Some('>' | '/' | ' ' | '\t' | '\r' | '\n'))
}

fn parse_body(body: &str) -> Result<Packet, ProtocolError> {
    let trimmed = body.trim();
    if !(trimmed.starts_with('<') && trimmed.ends_with('>')) {
        return Err(ProtocolError::framing(body));
    }
    let wrapped = format!("<{PACKET_ROOT}>{trimmed}</{PACKET_ROOT}>");
    let root = xml::decode(&wrapped)?;
    let mut elements = root.children.into_iter();
    let first = elements.next().ok_or(ProtocolError::Empty)?;
    Ok(Packet::from_node(first, elements.count()))
}
