//! Owned HTML document tree with pre-order visiting and serialization
//!
//! Documents are parsed with `scraper` (html5ever) and copied into a small
//! tagged tree that can be edited freely and rendered back to markup.

use scraper::{ElementRef, Html, Node as ParsedNode};

/// Elements that never have children or an end tag
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Elements whose text content is emitted without escaping
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "style", "script", "xmp", "iframe", "noembed", "noframes", "plaintext", "noscript",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Doctype(String),
    Element(Element),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub children: Vec<Node>,
}

/// Callbacks invoked for each node in document order.
///
/// Elements are visited before their children.
pub trait Visitor {
    fn visit_element(&mut self, _element: &mut Element) {}
    fn visit_text(&mut self, _text: &mut String) {}
    fn visit_comment(&mut self, _comment: &mut String) {}
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.children.push(Node::Text(text.to_string()));
        self
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing an existing one with the same name
    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attrs.push((name.to_string(), value.to_string())),
        }
    }

    /// Replace the leading text child, or insert one if the element starts with markup
    pub fn set_text(&mut self, text: &str) {
        match self.children.first_mut() {
            Some(Node::Text(existing)) => *existing = text.to_string(),
            _ => self.children.insert(0, Node::Text(text.to_string())),
        }
    }
}

impl Document {
    pub fn parse(html: &str) -> Self {
        let parsed = Html::parse_document(html);
        let mut children = Vec::new();

        for child in parsed.tree.root().children() {
            match child.value() {
                ParsedNode::Doctype(doctype) => {
                    children.push(Node::Doctype(doctype.name().to_string()))
                }
                ParsedNode::Comment(comment) => children.push(Node::Comment(String::from(&**comment))),
                ParsedNode::Element(_) => {
                    if let Some(element) = ElementRef::wrap(child) {
                        children.push(Node::Element(convert_element(element)));
                    }
                }
                _ => {}
            }
        }

        Self { children }
    }

    /// Visit every node in pre-order (document order)
    pub fn walk_mut<V: Visitor>(&mut self, visitor: &mut V) {
        for node in &mut self.children {
            walk_node(node, visitor);
        }
    }

    /// Index path of the first element matching `pred` in document order
    pub fn find_first<F>(&self, pred: F) -> Option<Vec<usize>>
    where
        F: Fn(&Element) -> bool,
    {
        let mut found = None;
        collect_paths(&self.children, &mut Vec::new(), &pred, &mut |path| {
            if found.is_none() {
                found = Some(path.to_vec());
            }
        });
        found
    }

    /// Index path of the last element matching `pred` in document order
    pub fn find_last<F>(&self, pred: F) -> Option<Vec<usize>>
    where
        F: Fn(&Element) -> bool,
    {
        let mut found = None;
        collect_paths(&self.children, &mut Vec::new(), &pred, &mut |path| {
            found = Some(path.to_vec());
        });
        found
    }

    /// Insert `node` as the preceding sibling of the node at `path`
    pub fn insert_before(&mut self, path: &[usize], node: Node) -> bool {
        let Some((&index, parents)) = path.split_last() else {
            return false;
        };

        let mut siblings = &mut self.children;
        for &i in parents {
            match siblings.get_mut(i) {
                Some(Node::Element(element)) => siblings = &mut element.children,
                _ => return false,
            }
        }

        if index > siblings.len() {
            return false;
        }
        siblings.insert(index, node);
        true
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            render_node(node, false, &mut out);
        }
        out
    }
}

fn convert_element(element: ElementRef<'_>) -> Element {
    let value = element.value();
    let mut children = Vec::new();

    for child in element.children() {
        match child.value() {
            ParsedNode::Element(_) => {
                if let Some(nested) = ElementRef::wrap(child) {
                    children.push(Node::Element(convert_element(nested)));
                }
            }
            ParsedNode::Text(text) => children.push(Node::Text(String::from(&**text))),
            ParsedNode::Comment(comment) => children.push(Node::Comment(String::from(&**comment))),
            _ => {}
        }
    }

    Element {
        name: value.name().to_string(),
        // prefixed foreign attributes (xlink:href, xml:lang) keep their prefix
        attrs: value
            .attrs
            .iter()
            .map(|(name, v)| {
                let key = match &name.prefix {
                    Some(prefix) => format!("{}:{}", prefix, name.local),
                    None => name.local.to_string(),
                };
                (key, v.to_string())
            })
            .collect(),
        children,
    }
}

fn walk_node<V: Visitor>(node: &mut Node, visitor: &mut V) {
    match node {
        Node::Element(element) => {
            visitor.visit_element(element);
            for child in &mut element.children {
                walk_node(child, visitor);
            }
        }
        Node::Text(text) => visitor.visit_text(text),
        Node::Comment(comment) => visitor.visit_comment(comment),
        Node::Doctype(_) => {}
    }
}

fn collect_paths<F, G>(nodes: &[Node], prefix: &mut Vec<usize>, pred: &F, on_match: &mut G)
where
    F: Fn(&Element) -> bool,
    G: FnMut(&[usize]),
{
    for (i, node) in nodes.iter().enumerate() {
        if let Node::Element(element) = node {
            prefix.push(i);
            if pred(element) {
                on_match(prefix);
            }
            collect_paths(&element.children, prefix, pred, on_match);
            prefix.pop();
        }
    }
}

fn render_node(node: &Node, raw_text: bool, out: &mut String) {
    match node {
        Node::Doctype(name) => {
            out.push_str("<!DOCTYPE ");
            out.push_str(name);
            out.push('>');
        }
        Node::Comment(comment) => {
            out.push_str("<!--");
            out.push_str(comment);
            out.push_str("-->");
        }
        Node::Text(text) => {
            if raw_text {
                out.push_str(text);
            } else {
                escape_into(text, false, out);
            }
        }
        Node::Element(element) => {
            out.push('<');
            out.push_str(&element.name);
            for (name, value) in &element.attrs {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                escape_into(value, true, out);
                out.push('"');
            }
            out.push('>');

            let name = element.name.to_ascii_lowercase();
            if VOID_ELEMENTS.contains(&name.as_str()) {
                return;
            }

            let raw = RAW_TEXT_ELEMENTS.contains(&name.as_str());
            for child in &element.children {
                render_node(child, raw, out);
            }

            out.push_str("</");
            out.push_str(&element.name);
            out.push('>');
        }
    }
}

fn escape_into(text: &str, attribute: bool, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '"' if attribute => out.push_str("&quot;"),
            '<' if !attribute => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Order(Vec<String>);

    impl Visitor for Order {
        fn visit_element(&mut self, element: &mut Element) {
            self.0.push(element.name.clone());
        }
        fn visit_text(&mut self, text: &mut String) {
            self.0.push(format!("#{}", text));
        }
    }

    #[test]
    fn test_parse_and_render() {
        let doc = Document::parse(
            r#"<!DOCTYPE html><html><head><title>A &amp; B</title></head><body><p class="x">hi<br>there</p><script>if (a < b) {}</script></body></html>"#,
        );
        assert_eq!(
            doc.render(),
            r#"<!DOCTYPE html><html><head><title>A &amp; B</title></head><body><p class="x">hi<br>there</p><script>if (a < b) {}</script></body></html>"#
        );
    }

    #[test]
    fn test_walk_is_pre_order() {
        let mut doc = Document::parse("<html><head><title>t</title></head><body><div><p>a</p></div><p>b</p></body></html>");
        let mut order = Order(Vec::new());
        doc.walk_mut(&mut order);
        assert_eq!(
            order.0,
            vec!["html", "head", "title", "#t", "body", "div", "p", "#a", "p", "#b"]
        );
    }

    #[test]
    fn test_insert_before_first_paragraph() {
        let mut doc = Document::parse("<html><body><div><p>one</p></div><p>two</p></body></html>");
        let path = doc.find_first(|e| e.is("p")).unwrap();
        let anchor = Element::new("a").with_attr("href", "/").with_text("Home");
        assert!(doc.insert_before(&path, Node::Element(anchor)));
        assert!(doc
            .render()
            .contains(r#"<div><a href="/">Home</a><p>one</p></div><p>two</p>"#));
    }

    #[test]
    fn test_find_last() {
        let doc = Document::parse("<html><body><div id=\"a\"></div><div id=\"b\"><div id=\"c\"></div></div></body></html>");
        let first = doc.find_first(|e| e.is("div")).unwrap();
        let last = doc.find_last(|e| e.is("div")).unwrap();
        assert!(last.len() > first.len());
    }

    #[test]
    fn test_set_text_and_attr() {
        let mut title = Element::new("title");
        title.set_text("new");
        assert_eq!(title.children, vec![Node::Text("new".to_string())]);
        title.set_text("newer");
        assert_eq!(title.children.len(), 1);

        let mut meta = Element::new("meta").with_attr("Content", "old");
        meta.set_attr("content", "new");
        assert_eq!(meta.attr("content"), Some("new"));
        assert_eq!(meta.attrs.len(), 1);
    }

    #[test]
    fn test_attribute_escaping() {
        let mut doc = Document::parse("<html><body></body></html>");
        let path = doc.find_first(|e| e.is("body")).unwrap();
        let mut child_path = path.clone();
        child_path.push(0);
        let img = Element::new("img").with_attr("alt", "say \"hi\" & <bye>");
        assert!(doc.insert_before(&child_path, Node::Element(img)));
        assert!(doc
            .render()
            .contains(r#"<img alt="say &quot;hi&quot; &amp; <bye>">"#));
    }

    #[test]
    fn test_prefixed_attributes_survive() {
        let doc = Document::parse(
            r##"<html><body><svg xml:lang="en"><use xlink:href="#icon"></use></svg></body></html>"##,
        );
        let html = doc.render();
        assert!(html.contains(r##"xlink:href="#icon""##), "{}", html);
        assert!(html.contains(r#"xml:lang="en""#), "{}", html);
    }
}
