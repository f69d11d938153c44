//! Template parser.
//!
//! A single left-to-right scan with an explicit frame stack builds an arena
//! of nodes. Parsing never fails: malformed input degrades to literal text.

/// Index of a node in its `NodeTree`
pub type NodeId = usize;

/// Characters a backslash escapes
const ESCAPABLE: [char; 5] = ['(', ')', '$', '|', '\\'];

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(String),
    /// `$name`, `$!name`, `$_name` or `$!_name`
    Variable {
        /// Parameter name, or `$_`-prefixed variable name when persisted
        name: String,
        silent: bool,
        persisted: bool,
        source: String,
    },
    /// `(name|arg|arg)`. Segment 0 is the name region, each later segment
    /// one `|`-separated argument region at this filter's depth.
    Filter {
        segments: Vec<Vec<NodeId>>,
        source: String,
    },
}

impl Node {
    /// Raw template text this node was parsed from
    pub fn source(&self) -> &str {
        match self {
            Node::Literal(text) => text,
            Node::Variable { source, .. } | Node::Filter { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTree {
    nodes: Vec<Node>,
    root: Vec<NodeId>,
}

impl NodeTree {
    /// Top-level nodes in order
    pub fn root(&self) -> &[NodeId] {
        &self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the tree contains any filter node
    pub fn has_filters(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| matches!(node, Node::Filter { .. }))
    }
}

struct Frame {
    /// Byte offset of the opening `(`
    start: usize,
    /// Arena length when the frame opened
    mark: usize,
    segments: Vec<Vec<NodeId>>,
}

struct Parser<'a> {
    input: &'a str,
    nodes: Vec<Node>,
    root: Vec<NodeId>,
    stack: Vec<Frame>,
    literal: String,
    /// Escape-resolved text since the outermost open `(`, kept in case it
    /// never closes
    pending: String,
}

/// Parse a template into a node tree.
pub fn parse(input: &str) -> NodeTree {
    let mut parser = Parser {
        input,
        nodes: Vec::new(),
        root: Vec::new(),
        stack: Vec::new(),
        literal: String::new(),
        pending: String::new(),
    };
    parser.run();
    NodeTree {
        nodes: parser.nodes,
        root: parser.root,
    }
}

impl Parser<'_> {
    fn run(&mut self) {
        let input = self.input;
        let mut chars = input.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.peek() {
                    Some(&(_, next)) if ESCAPABLE.contains(&next) => {
                        self.literal.push(next);
                        self.hold(next);
                        chars.next();
                    }
                    _ => {
                        self.literal.push('\\');
                        self.hold('\\');
                    }
                },
                '(' => {
                    self.flush();
                    self.stack.push(Frame {
                        start: i,
                        mark: self.nodes.len(),
                        segments: vec![Vec::new()],
                    });
                    self.hold('(');
                }
                ')' if !self.stack.is_empty() => {
                    self.flush();
                    self.hold(')');
                    if let Some(frame) = self.stack.pop() {
                        let source = input[frame.start..=i].to_string();
                        self.push(Node::Filter {
                            segments: frame.segments,
                            source,
                        });
                    }
                    if self.stack.is_empty() {
                        self.pending.clear();
                    }
                }
                '|' if !self.stack.is_empty() => {
                    self.flush();
                    if let Some(frame) = self.stack.last_mut() {
                        frame.segments.push(Vec::new());
                    }
                    self.hold('|');
                }
                '$' => match scan_variable(&input[i..]) {
                    Some(node) => {
                        // Variable syntax is ASCII, so bytes equal chars
                        let consumed = node.source().len() - 1;
                        self.flush();
                        if !self.stack.is_empty() {
                            self.pending.push_str(node.source());
                        }
                        self.push(node);
                        for _ in 0..consumed {
                            chars.next();
                        }
                    }
                    None => {
                        self.literal.push('$');
                        self.hold('$');
                    }
                },
                _ => {
                    self.literal.push(c);
                    self.hold(c);
                }
            }
        }

        self.finish();
    }

    /// Turn everything from the outermost unmatched `(` into one literal,
    /// with escapes applied.
    fn finish(&mut self) {
        let Some(outer) = self.stack.first() else {
            self.flush();
            return;
        };

        let start = outer.start;
        self.nodes.truncate(outer.mark);
        self.stack.clear();
        self.literal.clear();

        let tail = std::mem::take(&mut self.pending);
        tracing::debug!(offset = start, "Unmatched parenthesis in template, keeping literal");

        if let Some(&last) = self.root.last() {
            if let Node::Literal(text) = &mut self.nodes[last] {
                text.push_str(&tail);
                return;
            }
        }
        self.literal = tail;
        self.flush();
    }

    /// Record a character of the open outermost frame
    fn hold(&mut self, c: char) {
        if !self.stack.is_empty() {
            self.pending.push(c);
        }
    }

    fn flush(&mut self) {
        if !self.literal.is_empty() {
            let text = std::mem::take(&mut self.literal);
            self.push(Node::Literal(text));
        }
    }

    fn push(&mut self, node: Node) {
        let id = self.nodes.len();
        self.nodes.push(node);

        match self.stack.last_mut() {
            Some(frame) => match frame.segments.last_mut() {
                Some(segment) => segment.push(id),
                None => frame.segments.push(vec![id]),
            },
            None => self.root.push(id),
        }
    }
}

/// Scan `$` + optional `!` + optional `_` + `[A-Za-z0-9_]+`.
fn scan_variable(text: &str) -> Option<Node> {
    let mut rest = text.strip_prefix('$')?;

    let silent = rest.starts_with('!');
    if silent {
        rest = &rest[1..];
    }
    let persisted = rest.starts_with('_');
    if persisted {
        rest = &rest[1..];
    }

    let ident_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    if ident_len == 0 {
        return None;
    }

    let ident = &rest[..ident_len];
    let source_len = 1 + usize::from(silent) + usize::from(persisted) + ident_len;
    let name = if persisted {
        format!("$_{}", ident)
    } else {
        ident.to_string()
    };

    Some(Node::Variable {
        name,
        silent,
        persisted,
        source: text[..source_len].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_text(tree: &NodeTree) -> String {
        tree.root()
            .iter()
            .map(|&id| tree.node(id).source().to_string())
            .collect()
    }

    #[test]
    fn test_plain_text_is_one_literal() {
        let tree = parse("hello world");
        assert_eq!(tree.root().len(), 1);
        assert_eq!(tree.node(tree.root()[0]), &Node::Literal("hello world".to_string()));
    }

    #[test]
    fn test_filter_segments() {
        let tree = parse("a (api|http://x|y) b");
        assert_eq!(tree.root().len(), 3);

        let Node::Filter { segments, source } = tree.node(tree.root()[1]) else {
            panic!("expected filter");
        };
        assert_eq!(source, "(api|http://x|y)");
        assert_eq!(segments.len(), 3);
        assert_eq!(tree.node(segments[0][0]), &Node::Literal("api".to_string()));
        assert_eq!(tree.node(segments[2][0]), &Node::Literal("y".to_string()));
    }

    #[test]
    fn test_nested_filters_split_at_own_depth() {
        let tree = parse("(if 1==1|(a|b)|c)");
        let Node::Filter { segments, .. } = tree.node(tree.root()[0]) else {
            panic!("expected filter");
        };
        assert_eq!(segments.len(), 3);

        let Node::Filter { segments: inner, source } = tree.node(segments[1][0]) else {
            panic!("expected nested filter");
        };
        assert_eq!(source, "(a|b)");
        assert_eq!(inner.len(), 2);
    }

    #[test]
    fn test_variables() {
        let tree = parse("$sender $!_count $_x $! $");
        let vars: Vec<_> = tree
            .root()
            .iter()
            .filter_map(|&id| match tree.node(id) {
                Node::Variable {
                    name,
                    silent,
                    persisted,
                    ..
                } => Some((name.clone(), *silent, *persisted)),
                _ => None,
            })
            .collect();

        assert_eq!(
            vars,
            vec![
                ("sender".to_string(), false, false),
                ("$_count".to_string(), true, true),
                ("$_x".to_string(), false, true),
            ]
        );
        assert_eq!(literal_text(&tree), "$sender $!_count $_x $! $");
    }

    #[test]
    fn test_escapes() {
        let tree = parse(r"\(not a filter\) \$5 \| \\ \n");
        assert!(!tree.has_filters());
        assert_eq!(literal_text(&tree), r"(not a filter) $5 | \ \n");
    }

    #[test]
    fn test_unmatched_open_becomes_literal() {
        let tree = parse("x (a (b) $y");
        assert!(!tree.has_filters());
        assert_eq!(tree.root().len(), 1);
        assert_eq!(literal_text(&tree), "x (a (b) $y");
    }

    #[test]
    fn test_unmatched_open_keeps_escapes_applied() {
        let tree = parse(r"cost \$5 (open \) \$6 \| $x");
        assert!(!tree.has_filters());
        assert_eq!(tree.root().len(), 1);
        assert_eq!(literal_text(&tree), "cost $5 (open ) $6 | $x");
    }

    #[test]
    fn test_unmatched_close_and_top_level_pipe() {
        let tree = parse("a) | b");
        assert!(!tree.has_filters());
        assert_eq!(literal_text(&tree), "a) | b");
    }

    #[test]
    fn test_deep_nesting_does_not_recurse() {
        let depth = 10_000;
        let template = format!("{}x{}", "(".repeat(depth), ")".repeat(depth));
        let tree = parse(&template);
        assert_eq!(tree.len(), depth + 1);
    }
}
