use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The chunk does not look like an XML element.
    #[error("cannot parse chunk, not in XML format: {preview:?}")]
    Framing { preview: String },
    #[error("xml decode failed: {0}")]
    Decode(String),
    #[error("packet body has no element")]
    Empty,
}

impl ProtocolError {
    pub(crate) fn framing(chunk: &str) -> Self {
        Self::Framing {
            preview: chunk.chars().take(64).collect(),
        }
    }
}
