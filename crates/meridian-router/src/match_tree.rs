//! Generic pattern trees for hosts, paths and free-form strings.
//!
//! A [`MatchTree`] stores `(pattern, value)` pairs where a pattern mixes
//! literal text with captures:
//!
//! - `*` captures a run of input,
//! - `${name}` captures a run of input under a name.
//!
//! What a run is depends on the tree's [`Delimiters`]. For hosts and paths a
//! capture takes the longest non-empty run up to the next delimiter; a
//! capture that ends its pattern may also take the whole remaining input.
//! In byte mode `*` is non-greedy and backtracks, while `${name}` takes a
//! token of alphanumerics, `.`, `_` and `-`.
//!
//! ```rust
//! use meridian_router::{Delimiters, MatchTree};
//!
//! let mut origins = MatchTree::new(Delimiters::Host);
//! origins.insert("https://*.example.com", "example").unwrap();
//!
//! let m = origins.find("https://api.example.com").unwrap();
//! assert_eq!(*m.value, "example");
//! assert_eq!(m.captures.get(1), Some("api"));
//! assert!(origins.find("https://a.b.example.com").is_none());
//! ```

use smallvec::SmallVec;

use crate::RouterError;

/// Which characters end a capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiters {
    /// `.`, `/` and `:` — hostnames and URLs.
    Host,
    /// `/` — request paths.
    Path,
    /// No delimiters; captures work character by character.
    Bytes,
}

impl Delimiters {
    fn is_delimiter(self, c: char) -> bool {
        match self {
            Delimiters::Host => matches!(c, '.' | '/' | ':'),
            Delimiters::Path => c == '/',
            Delimiters::Bytes => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Star,
    Named(String),
}

fn tokenize(pattern: &str) -> Result<Vec<Token>, RouterError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut rest = pattern;

    while let Some(c) = rest.chars().next() {
        if c == '*' {
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }
            if tokens.last().is_some_and(|t| !matches!(t, Token::Literal(_))) {
                return Err(RouterError::invalid_pattern(pattern, "adjacent captures"));
            }
            tokens.push(Token::Star);
            rest = &rest[1..];
        } else if let Some(body) = rest.strip_prefix("${") {
            let close = body
                .find('}')
                .ok_or_else(|| RouterError::invalid_pattern(pattern, "unterminated '${'"))?;
            let name = &body[..close];
            if name.is_empty() {
                return Err(RouterError::invalid_pattern(pattern, "empty capture name"));
            }
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }
            if tokens.last().is_some_and(|t| !matches!(t, Token::Literal(_))) {
                return Err(RouterError::invalid_pattern(pattern, "adjacent captures"));
            }
            tokens.push(Token::Named(name.to_string()));
            rest = &body[close + 1..];
        } else {
            literal.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    if tokens.is_empty() {
        return Err(RouterError::invalid_pattern(pattern, "empty pattern"));
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    pattern: String,
}

#[derive(Debug, Clone)]
struct MatchNode<V> {
    /// Literal text, or empty for capture nodes.
    path: String,
    /// `None` for literal nodes, `Some(None)` for `*`, `Some(Some(name))` for `${name}`.
    capture: Option<Option<String>>,
    literals: Vec<MatchNode<V>>,
    captures: Vec<MatchNode<V>>,
    slot: Option<Slot<V>>,
}

impl<V> MatchNode<V> {
    fn literal(path: String) -> Self {
        Self {
            path,
            capture: None,
            literals: Vec::new(),
            captures: Vec::new(),
            slot: None,
        }
    }

    fn first_char(&self) -> Option<char> {
        self.path.chars().next()
    }

    fn is_leaf(&self) -> bool {
        self.literals.is_empty() && self.captures.is_empty()
    }

    fn insert(&mut self, tokens: &[Token]) -> &mut MatchNode<V> {
        let Some((first, rest)) = tokens.split_first() else {
            return self;
        };
        let child = match first {
            Token::Literal(text) => self.literal_child(text),
            Token::Star => self.capture_child(None),
            Token::Named(name) => self.capture_child(Some(name.clone())),
        };
        child.insert(rest)
    }

    fn literal_child(&mut self, text: &str) -> &mut MatchNode<V> {
        let first = text.chars().next();
        match self.literals.binary_search_by(|c| c.first_char().cmp(&first)) {
            Ok(i) => {
                let child = &mut self.literals[i];
                let common = common_prefix(&child.path, text);
                if common < child.path.len() {
                    let suffix = child.path.split_off(common);
                    let tail = MatchNode {
                        path: suffix,
                        capture: None,
                        literals: std::mem::take(&mut child.literals),
                        captures: std::mem::take(&mut child.captures),
                        slot: child.slot.take(),
                    };
                    child.literals = vec![tail];
                }
                if common == text.len() {
                    return child;
                }
                child.literal_child(&text[common..])
            }
            Err(i) => {
                self.literals.insert(i, MatchNode::literal(text.to_string()));
                &mut self.literals[i]
            }
        }
    }

    fn capture_child(&mut self, name: Option<String>) -> &mut MatchNode<V> {
        let index = match self.captures.iter().position(|c| c.capture.as_ref() == Some(&name)) {
            Some(i) => i,
            None => {
                self.captures.push(MatchNode {
                    path: String::new(),
                    capture: Some(name),
                    literals: Vec::new(),
                    captures: Vec::new(),
                    slot: None,
                });
                self.captures.len() - 1
            }
        };
        &mut self.captures[index]
    }
}

/// Captured runs of a [`MatchTree`] match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captures<'a> {
    whole: &'a str,
    items: SmallVec<[(Option<&'a str>, &'a str); 4]>,
}

impl<'a> Captures<'a> {
    /// Returns capture `i`: `0` is the whole match, `1..` the runs in order.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<&'a str> {
        if i == 0 {
            Some(self.whole)
        } else {
            self.items.get(i - 1).map(|(_, v)| *v)
        }
    }

    /// Returns the run captured by `${name}`.
    #[must_use]
    pub fn name(&self, name: &str) -> Option<&'a str> {
        self.items
            .iter()
            .find(|(n, _)| *n == Some(name))
            .map(|(_, v)| *v)
    }

    /// Iterates over named captures.
    pub fn named(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.items.iter().filter_map(|(n, v)| n.map(|n| (n, *v)))
    }

    /// Number of runs captured (excluding the whole match).
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no runs were captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Substitutes `$0`..`$9` and `${name}` in `template`. `$$` is a literal `$`.
    /// Unknown references expand to nothing.
    #[must_use]
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(at) = rest.find('$') {
            out.push_str(&rest[..at]);
            let after = &rest[at + 1..];
            match after.chars().next() {
                Some('$') => {
                    out.push('$');
                    rest = &after[1..];
                }
                Some(d) if d.is_ascii_digit() => {
                    let index = (d as u8 - b'0') as usize;
                    out.push_str(self.get(index).unwrap_or(""));
                    rest = &after[1..];
                }
                Some('{') => match after.find('}') {
                    Some(close) => {
                        out.push_str(self.name(&after[1..close]).unwrap_or(""));
                        rest = &after[close + 1..];
                    }
                    None => {
                        out.push_str(&rest[at..]);
                        rest = "";
                    }
                },
                _ => {
                    out.push('$');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// A match produced by [`MatchTree::find`] or [`MatchTree::find_prefix`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMatch<'a, V> {
    /// The value stored with the matching pattern.
    pub value: &'a V,
    /// The matching pattern.
    pub pattern: &'a str,
    /// Captured runs.
    pub captures: Captures<'a>,
    /// Bytes of input consumed by the match.
    pub consumed: usize,
}

/// A radix tree of capture patterns.
#[derive(Debug, Clone)]
pub struct MatchTree<V> {
    root: MatchNode<V>,
    delimiters: Delimiters,
    len: usize,
}

type CaptureStack<'a> = SmallVec<[(Option<&'a str>, &'a str); 4]>;

struct Search<'a, V> {
    input: &'a str,
    full: bool,
    delimiters: Delimiters,
    stack: CaptureStack<'a>,
    best: Option<(usize, &'a Slot<V>, CaptureStack<'a>)>,
}

impl<V> MatchTree<V> {
    /// Creates an empty tree.
    #[must_use]
    pub fn new(delimiters: Delimiters) -> Self {
        Self {
            root: MatchNode::literal(String::new()),
            delimiters,
            len: 0,
        }
    }

    /// The delimiter set this tree was created with.
    #[must_use]
    pub fn delimiters(&self) -> Delimiters {
        self.delimiters
    }

    /// Inserts `pattern`, replacing any value already stored under it.
    pub fn insert(&mut self, pattern: &str, value: V) -> Result<(), RouterError> {
        let tokens = tokenize(pattern)?;
        let node = self.root.insert(&tokens);
        if node.slot.is_none() {
            self.len += 1;
        }
        node.slot = Some(Slot {
            value,
            pattern: pattern.to_string(),
        });
        Ok(())
    }

    /// Matches the whole of `input`.
    #[must_use]
    pub fn find<'a>(&'a self, input: &'a str) -> Option<TreeMatch<'a, V>> {
        self.search(input, true)
    }

    /// Matches the longest prefix of `input` that ends at a stored pattern.
    #[must_use]
    pub fn find_prefix<'a>(&'a self, input: &'a str) -> Option<TreeMatch<'a, V>> {
        self.search(input, false)
    }

    /// Number of stored patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no patterns are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn search<'a>(&'a self, input: &'a str, full: bool) -> Option<TreeMatch<'a, V>> {
        let mut search = Search {
            input,
            full,
            delimiters: self.delimiters,
            stack: SmallVec::new(),
            best: None,
        };
        search.walk(&self.root, 0);
        search.best.map(|(consumed, slot, items)| TreeMatch {
            value: &slot.value,
            pattern: &slot.pattern,
            captures: Captures {
                whole: &input[..consumed],
                items,
            },
            consumed,
        })
    }
}

impl<'a, V> Search<'a, V> {
    /// Returns `true` once a full match has been recorded.
    fn walk(&mut self, node: &'a MatchNode<V>, pos: usize) -> bool {
        let input = self.input;
        let rest = &input[pos..];

        if let Some(slot) = &node.slot {
            if rest.is_empty() {
                self.best = Some((pos, slot, self.stack.clone()));
                return true;
            }
            if !self.full && self.best.as_ref().map_or(true, |(p, _, _)| pos > *p) {
                self.best = Some((pos, slot, self.stack.clone()));
            }
        }

        if let Some(first) = rest.chars().next() {
            if let Ok(i) = node
                .literals
                .binary_search_by(|c| c.first_char().cmp(&Some(first)))
            {
                let child = &node.literals[i];
                if rest.starts_with(child.path.as_str()) && self.walk(child, pos + child.path.len())
                {
                    return true;
                }
            }
        }

        for child in &node.captures {
            let name = child.capture.as_ref().and_then(Option::as_deref);
            for len in self.candidates(rest, name.is_some(), child) {
                self.stack.push((name, &rest[..len]));
                let done = self.walk(child, pos + len);
                self.stack.pop();
                if done {
                    return true;
                }
            }
        }

        false
    }

    /// Candidate capture lengths, in the order they are tried.
    fn candidates(&self, rest: &str, named: bool, child: &MatchNode<V>) -> Vec<usize> {
        if rest.is_empty() {
            return Vec::new();
        }
        let terminal = child.is_leaf() && child.slot.is_some();

        match self.delimiters {
            Delimiters::Bytes if named => {
                let run = rest
                    .find(|c: char| !(c.is_alphanumeric() || matches!(c, '.' | '_' | '-')))
                    .unwrap_or(rest.len());
                if run == 0 {
                    Vec::new()
                } else {
                    vec![run]
                }
            }
            Delimiters::Bytes => {
                if terminal {
                    vec![rest.len()]
                } else {
                    rest.char_indices()
                        .skip(1)
                        .map(|(i, _)| i)
                        .chain(std::iter::once(rest.len()))
                        .collect()
                }
            }
            delimiters => {
                let run = rest
                    .find(|c: char| delimiters.is_delimiter(c))
                    .unwrap_or(rest.len());
                let mut lens = Vec::with_capacity(2);
                if run > 0 {
                    lens.push(run);
                }
                if terminal && run < rest.len() {
                    lens.push(rest.len());
                }
                lens
            }
        }
    }
}

fn common_prefix(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map_or_else(|| a.len().min(b.len()), |((i, _), _)| i)
}
