//! Minimal element tree built on top of `quick-xml` events.
//!
//! Feed documents are small enough to hold in memory, and walking a tree is
//! far simpler than threading state through a streaming parser. Element names
//! are kept as written in the document (`itunes:duration`), attributes as
//! decoded key/value pairs, and all text/CDATA content of an element is
//! concatenated into `text` exactly as written. Whitespace is only trimmed when
//! a value is read through [`Element::child_text`].
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// SEC-003: Maximum allowed element nesting depth.
/// Real feeds stay well under ten levels; anything deeper is treated as hostile.
const MAX_XML_DEPTH: usize = 64;

/// Errors raised while turning text into an element tree.
#[derive(Debug, Error)]
pub enum XmlError {
    /// The underlying XML reader rejected the document.
    #[error("XML syntax error at byte {position}: {message}")]
    Syntax { position: u64, message: String },

    /// SEC-003: Element nesting exceeds the safety limit.
    #[error("XML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// The document ended while elements were still open.
    #[error("Unexpected end of document: <{0}> is never closed")]
    UnclosedElement(String),

    /// More than one top-level element.
    #[error("Document has more than one root element")]
    MultipleRoots,

    /// No element at all (empty input, only a declaration or comments).
    #[error("Document has no root element")]
    NoRoot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    fn new(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// Value of the attribute `key`, if present.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First child element called `name`.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Every child element called `name`, in document order.
    ///
    /// This is what removes the one-vs-many ambiguity: a single `<item>` and
    /// fifty of them come back through the same iterator.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of the first child called `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.trim())
    }
}

/// Parses `content` into its root [`Element`].
///
/// # Errors
///
/// Any [`XmlError`]; none of them are recoverable, the document is unusable.
pub(crate) fn parse_document(content: &str) -> Result<Element, XmlError> {
    // SEC-002: quick-xml (0.37) only resolves the five predefined entities; custom
    // entities declared in a DOCTYPE are never expanded and fail in `unescape()`.
    // No per-event trimming: text and CDATA chunks of one element are joined raw
    let mut reader = Reader::from_str(content);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event().map_err(|e| XmlError::Syntax {
            position: reader.error_position(),
            message: e.to_string(),
        })?;

        match event {
            Event::Start(e) => {
                if stack.len() >= MAX_XML_DEPTH {
                    return Err(XmlError::MaxDepthExceeded(MAX_XML_DEPTH));
                }
                stack.push(open_element(&e, &reader));
            }
            Event::Empty(e) => {
                if stack.len() >= MAX_XML_DEPTH {
                    return Err(XmlError::MaxDepthExceeded(MAX_XML_DEPTH));
                }
                let element = open_element(&e, &reader);
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                // quick-xml already verified the end tag matches the open one
                if let Some(element) = stack.pop() {
                    attach(&mut stack, &mut root, element)?;
                }
            }
            Event::Text(e) => {
                if let Some(current) = stack.last_mut() {
                    let text = e.unescape().map_err(|err| XmlError::Syntax {
                        position: reader.buffer_position(),
                        message: err.to_string(),
                    })?;
                    current.text.push_str(&text);
                }
            }
            Event::CData(e) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(XmlError::UnclosedElement(open.name));
    }

    root.ok_or(XmlError::NoRoot)
}

fn open_element(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Element {
    let mut element = Element::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(err) => {
                tracing::warn!(element = %element.name, error = %err, "Skipping malformed XML attribute");
                continue;
            }
        };
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        match attr.decode_and_unescape_value(reader.decoder()) {
            Ok(value) => element.attributes.push((key, value.into_owned())),
            Err(err) => {
                tracing::warn!(element = %element.name, attribute = %key, error = %err, "Skipping undecodable XML attribute");
            }
        }
    }

    element
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(XmlError::MultipleRoots),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builds_nested_tree_with_attributes() {
        let doc = parse_document(
            r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Show</title><enclosure url="a.mp3" length="10"/></channel></rss>"#,
        )
        .unwrap();

        assert_eq!(doc.name, "rss");
        assert_eq!(doc.attr("version"), Some("2.0"));
        let channel = doc.child("channel").unwrap();
        assert_eq!(channel.child_text("title"), Some("Show"));
        let enclosure = channel.child("enclosure").unwrap();
        assert_eq!(enclosure.attr("url"), Some("a.mp3"));
        assert_eq!(enclosure.attr("length"), Some("10"));
        assert!(enclosure.children.is_empty());
    }

    #[test]
    fn test_cdata_and_entities_become_text() {
        let doc = parse_document(
            "<root><a><![CDATA[<b>bold</b>]]></a><b>Tom &amp; Jerry</b></root>",
        )
        .unwrap();
        assert_eq!(doc.child_text("a"), Some("<b>bold</b>"));
        assert_eq!(doc.child_text("b"), Some("Tom & Jerry"));
    }

    #[test]
    fn test_mixed_text_and_cdata_keep_spacing() {
        let doc = parse_document(
            "<root><a>Episode <![CDATA[One]]></a><b>Tom &amp; Jerry <![CDATA[<b>rock</b>]]> today</b></root>",
        )
        .unwrap();
        assert_eq!(doc.child_text("a"), Some("Episode One"));
        assert_eq!(doc.child_text("b"), Some("Tom & Jerry <b>rock</b> today"));
    }

    #[test]
    fn test_raw_text_is_untrimmed() {
        let doc = parse_document("<root><a>  padded\n</a></root>").unwrap();
        assert_eq!(doc.child("a").unwrap().text, "  padded\n");
        assert_eq!(doc.child_text("a"), Some("padded"));
    }

    #[test]
    fn test_children_named_preserves_order() {
        let doc = parse_document("<c><i>1</i><x/><i>2</i><i>3</i></c>").unwrap();
        let texts: Vec<&str> = doc.children_named("i").map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_unclosed_document_is_rejected() {
        let err = parse_document("<rss><channel>").unwrap_err();
        assert!(matches!(err, XmlError::UnclosedElement(ref name) if name == "channel"));
    }

    #[test]
    fn test_mismatched_end_tag_is_syntax_error() {
        let err = parse_document("<rss><channel></rss>").unwrap_err();
        assert!(matches!(err, XmlError::Syntax { .. }));
    }

    #[test]
    fn test_empty_input_has_no_root() {
        assert!(matches!(parse_document("").unwrap_err(), XmlError::NoRoot));
        assert!(matches!(
            parse_document("<?xml version=\"1.0\"?>").unwrap_err(),
            XmlError::NoRoot
        ));
    }

    #[test]
    fn test_multiple_roots_rejected() {
        assert!(matches!(
            parse_document("<a/><b/>").unwrap_err(),
            XmlError::MultipleRoots
        ));
    }

    // SEC-003: Depth limit
    #[test]
    fn test_excessive_nesting_rejected() {
        let depth = MAX_XML_DEPTH + 1;
        let doc = format!("{}{}", "<n>".repeat(depth), "</n>".repeat(depth));
        assert!(matches!(
            parse_document(&doc).unwrap_err(),
            XmlError::MaxDepthExceeded(MAX_XML_DEPTH)
        ));
    }

    #[test]
    fn test_nesting_at_limit_accepted() {
        let doc = format!(
            "{}{}",
            "<n>".repeat(MAX_XML_DEPTH),
            "</n>".repeat(MAX_XML_DEPTH)
        );
        assert!(parse_document(&doc).is_ok());
    }
}
