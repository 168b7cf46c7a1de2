//! Compressed character trie with typed placeholder edges.
//!
//! Nodes live in one arena and refer to each other by index. Every node has
//! five typed child slots (int, uint, double, string, path) plus literal
//! edges keyed by character runs. Insertion creates one edge per character;
//! [`Trie::optimize`] later merges chains of plain nodes into multi-character
//! edges without changing what matches.

use std::collections::BTreeMap;

use super::RouteError;
use super::params::{ParamType, RoutingParams};

/// Rule index meaning "no rule".
pub const NO_RULE: usize = 0;

/// Rule index meaning "redirect to the same path with a trailing slash".
pub const REDIRECT_SLASH: usize = 1;

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone, Default)]
struct Node {
    rule_index: usize,
    param_children: [Option<NodeId>; 5],
    children: BTreeMap<String, NodeId>,
}

impl Node {
    // No rule and no typed edges; only such nodes may be merged into their parent.
    fn is_simple(&self) -> bool {
        self.rule_index == NO_RULE && self.param_children.iter().all(Option::is_none)
    }
}

/// Route trie for a single HTTP method.
#[derive(Debug, Clone)]
pub struct Trie {
    nodes: Vec<Node>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    /// An empty trie holding only the root node.
    ///
    /// # Examples
    ///
    /// ```
    /// use corvid::router::trie::{Trie, NO_RULE};
    ///
    /// let mut trie = Trie::new();
    /// trie.add("/page/<uint>", 2).unwrap();
    /// trie.optimize();
    ///
    /// let (rule, params) = trie.find("/page/7");
    /// assert_eq!(rule, 2);
    /// assert_eq!(params.uints, vec![7]);
    /// assert_eq!(trie.find("/page/x").0, NO_RULE);
    /// ```
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }

    /// Returns `true` if no route has been added.
    pub fn is_empty(&self) -> bool {
        let root = &self.nodes[ROOT];
        root.children.is_empty() && root.param_children.iter().all(Option::is_none)
    }

    /// Inserts `pattern`, leading to `rule_index`.
    ///
    /// # Errors
    ///
    /// [`RouteError::Duplicate`] if a rule already ends at that node, and the
    /// placeholder errors of [`signature`](super::params::signature) for bad tags.
    pub fn add(&mut self, pattern: &str, rule_index: usize) -> Result<(), RouteError> {
        let idx = self.walk_or_create(pattern)?;
        if self.nodes[idx].rule_index != NO_RULE {
            return Err(RouteError::Duplicate {
                pattern: pattern.to_owned(),
            });
        }
        self.nodes[idx].rule_index = rule_index;
        Ok(())
    }

    /// Points `pattern` at the redirect sentinel unless a rule already ends there.
    ///
    /// A later real rule for the same pattern replaces the sentinel.
    pub fn add_redirect(&mut self, pattern: &str) -> Result<(), RouteError> {
        let idx = self.walk_or_create(pattern)?;
        if self.nodes[idx].rule_index == NO_RULE {
            self.nodes[idx].rule_index = REDIRECT_SLASH;
        }
        Ok(())
    }

    /// Like [`add`](Self::add), but a redirect sentinel at the node is overwritten.
    pub fn add_over_redirect(&mut self, pattern: &str, rule_index: usize) -> Result<(), RouteError> {
        let idx = self.walk_or_create(pattern)?;
        match self.nodes[idx].rule_index {
            NO_RULE | REDIRECT_SLASH => {
                self.nodes[idx].rule_index = rule_index;
                Ok(())
            }
            _ => Err(RouteError::Duplicate {
                pattern: pattern.to_owned(),
            }),
        }
    }

    fn walk_or_create(&mut self, pattern: &str) -> Result<NodeId, RouteError> {
        let mut idx = ROOT;
        let mut pos = 0;
        while pos < pattern.len() {
            let rest = &pattern[pos..];
            if rest.starts_with('<') {
                let (ty, len) = ParamType::match_token(rest).ok_or_else(|| {
                    match rest.find('>') {
                        Some(end) => RouteError::UnknownPlaceholder {
                            pattern: pattern.to_owned(),
                            tag: rest[..=end].to_owned(),
                        },
                        None => RouteError::UnclosedPlaceholder {
                            pattern: pattern.to_owned(),
                        },
                    }
                })?;
                idx = match self.nodes[idx].param_children[ty.slot()] {
                    Some(child) => child,
                    None => {
                        let child = self.new_node();
                        self.nodes[idx].param_children[ty.slot()] = Some(child);
                        child
                    }
                };
                pos += len;
            } else {
                let ch_len = rest.chars().next().map_or(1, char::len_utf8);
                let edge = &rest[..ch_len];
                idx = match self.nodes[idx].children.get(edge) {
                    Some(&child) => child,
                    None => {
                        let child = self.new_node();
                        self.nodes[idx].children.insert(edge.to_owned(), child);
                        child
                    }
                };
                pos += ch_len;
            }
        }
        Ok(idx)
    }

    fn new_node(&mut self) -> NodeId {
        self.nodes.push(Node::default());
        self.nodes.len() - 1
    }

    /// Merges single-character chains of plain nodes into longer edges.
    pub fn optimize(&mut self) {
        self.optimize_node(ROOT);
    }

    fn optimize_node(&mut self, idx: NodeId) {
        for child in self.nodes[idx].param_children.into_iter().flatten() {
            self.optimize_node(child);
        }
        if self.nodes[idx].children.is_empty() {
            return;
        }

        let mergeable = self.nodes[idx]
            .children
            .values()
            .all(|&child| self.nodes[child].is_simple());

        if mergeable {
            let mut merged = BTreeMap::new();
            for (label, &child) in &self.nodes[idx].children {
                for (child_label, &grandchild) in &self.nodes[child].children {
                    merged.insert(format!("{label}{child_label}"), grandchild);
                }
            }
            self.nodes[idx].children = merged;
            self.optimize_node(idx);
        } else {
            let children: Vec<NodeId> = self.nodes[idx].children.values().copied().collect();
            for child in children {
                self.optimize_node(child);
            }
        }
    }

    /// Resolves `path` to a rule index and the parameters captured on the way.
    ///
    /// Returns `(NO_RULE, empty)` when nothing matches. When several branches
    /// match, the smallest rule index wins.
    pub fn find(&self, path: &str) -> (usize, RoutingParams) {
        let mut params = RoutingParams::default();
        self.find_from(path, ROOT, 0, &mut params)
    }

    fn find_from(
        &self,
        path: &str,
        idx: NodeId,
        pos: usize,
        params: &mut RoutingParams,
    ) -> (usize, RoutingParams) {
        let node = &self.nodes[idx];
        if pos == path.len() {
            return (node.rule_index, params.clone());
        }

        let mut found = NO_RULE;
        let mut found_params = RoutingParams::default();
        let mut consider = |ret: (usize, RoutingParams)| {
            if ret.0 != NO_RULE && (found == NO_RULE || ret.0 < found) {
                found = ret.0;
                found_params = ret.1;
            }
        };

        let rest = &path[pos..];
        let first = rest.as_bytes()[0];

        if let Some(child) = node.param_children[ParamType::Int.slot()] {
            if first.is_ascii_digit() || first == b'+' || first == b'-' {
                if let Some((value, len)) = scan_int(rest) {
                    params.ints.push(value);
                    consider(self.find_from(path, child, pos + len, params));
                    params.ints.pop();
                }
            }
        }

        if let Some(child) = node.param_children[ParamType::Uint.slot()] {
            if first.is_ascii_digit() || first == b'+' {
                if let Some((value, len)) = scan_uint(rest) {
                    params.uints.push(value);
                    consider(self.find_from(path, child, pos + len, params));
                    params.uints.pop();
                }
            }
        }

        if let Some(child) = node.param_children[ParamType::Double.slot()] {
            if first.is_ascii_digit() || first == b'+' || first == b'-' || first == b'.' {
                if let Some((value, len)) = scan_double(rest) {
                    params.doubles.push(value);
                    consider(self.find_from(path, child, pos + len, params));
                    params.doubles.pop();
                }
            }
        }

        if let Some(child) = node.param_children[ParamType::String.slot()] {
            let len = rest.find('/').unwrap_or(rest.len());
            if len > 0 {
                params.strings.push(rest[..len].to_owned());
                consider(self.find_from(path, child, pos + len, params));
                params.strings.pop();
            }
        }

        if let Some(child) = node.param_children[ParamType::Path.slot()] {
            params.strings.push(rest.to_owned());
            consider(self.find_from(path, child, path.len(), params));
            params.strings.pop();
        }

        for (label, &child) in &node.children {
            if rest.starts_with(label.as_str()) {
                consider(self.find_from(path, child, pos + label.len(), params));
            }
        }

        (found, found_params)
    }

    /// Number of nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

// Length of the longest prefix made of an optional sign and decimal digits.
fn integer_prefix(s: &str, allow_minus: bool) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    if let Some(&b) = bytes.first() {
        if b == b'+' || (allow_minus && b == b'-') {
            i = 1;
        }
    }
    let digits = bytes[i..].iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 { 0 } else { i + digits }
}

fn scan_int(s: &str) -> Option<(i64, usize)> {
    let len = integer_prefix(s, true);
    if len == 0 {
        return None;
    }
    s[..len].parse().ok().map(|v| (v, len))
}

fn scan_uint(s: &str) -> Option<(u64, usize)> {
    let len = integer_prefix(s, false);
    if len == 0 {
        return None;
    }
    s[..len].parse().ok().map(|v| (v, len))
}

// Accepts `[+-]?digits[.digits][e[+-]digits]`, with digits required on at least one side of the dot.
fn scan_double(s: &str) -> Option<(f64, usize)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        i = 1;
    }
    let int_digits = bytes[i..].iter().take_while(|b| b.is_ascii_digit()).count();
    i += int_digits;
    let mut frac_digits = 0;
    if bytes.get(i) == Some(&b'.') {
        frac_digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
        if int_digits > 0 || frac_digits > 0 {
            i += 1 + frac_digits;
        }
    }
    if int_digits == 0 && frac_digits == 0 {
        return None;
    }
    if matches!(bytes.get(i), Some(b'e' | b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        let exp_digits = bytes[j.min(bytes.len())..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if exp_digits > 0 {
            i = j + exp_digits;
        }
    }
    s[..i].parse().ok().map(|v| (v, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(patterns: &[&str]) -> Trie {
        let mut trie = Trie::new();
        for (i, p) in patterns.iter().enumerate() {
            trie.add(p, i + 2).unwrap();
        }
        trie
    }

    #[test]
    fn literal_and_typed_matching() {
        let trie = build(&["/item/<int>", "/u/<uint>", "/f/<double>", "/s/<string>", "/p/<path>"]);

        let (idx, params) = trie.find("/item/42");
        assert_eq!(idx, 2);
        assert_eq!(params.ints, vec![42]);
        assert_eq!(trie.find("/item/-5").1.ints, vec![-5]);
        assert_eq!(trie.find("/item/abc").0, NO_RULE);

        assert_eq!(trie.find("/u/+7").1.uints, vec![7]);
        assert_eq!(trie.find("/u/-5").0, NO_RULE);

        assert_eq!(trie.find("/f/-.5").1.doubles, vec![-0.5]);
        assert_eq!(trie.find("/f/1e3").1.doubles, vec![1000.0]);

        assert_eq!(trie.find("/s/abc").1.strings, vec!["abc".to_owned()]);
        assert_eq!(trie.find("/s/abc/def").0, NO_RULE);

        let (idx, params) = trie.find("/p/a/b/c");
        assert_eq!(idx, 6);
        assert_eq!(params.strings, vec!["a/b/c".to_owned()]);
    }

    #[test]
    fn empty_placeholder_does_not_match() {
        let trie = build(&["/s/<string>", "/p/<path>"]);
        assert_eq!(trie.find("/s/").0, NO_RULE);
        assert_eq!(trie.find("/p/").0, NO_RULE);
    }

    #[test]
    fn earlier_rule_wins_ties() {
        let trie = build(&["/block/<uint>", "/block/<string>"]);
        let (idx, params) = trie.find("/block/100");
        assert_eq!(idx, 2);
        assert_eq!(params.uints, vec![100]);
        assert!(params.strings.is_empty());

        let (idx, params) = trie.find("/block/abcdef");
        assert_eq!(idx, 3);
        assert_eq!(params.strings, vec!["abcdef".to_owned()]);

        let reversed = build(&["/block/<string>", "/block/<uint>"]);
        assert_eq!(reversed.find("/block/100").0, 2);
    }

    #[test]
    fn literal_beats_later_placeholder() {
        let trie = build(&["/tx/latest", "/tx/<string>"]);
        assert_eq!(trie.find("/tx/latest").0, 2);
        assert_eq!(trie.find("/tx/other").0, 3);
    }

    #[test]
    fn numeric_overflow_falls_through() {
        let trie = build(&["/n/<int>", "/n/<string>"]);
        let (idx, params) = trie.find("/n/99999999999999999999");
        assert_eq!(idx, 3);
        assert_eq!(params.strings.len(), 1);
    }

    #[test]
    fn duplicate_is_rejected() {
        let mut trie = build(&["/a/<int>"]);
        assert!(matches!(trie.add("/a/<int>", 9), Err(RouteError::Duplicate { .. })));
        assert!(trie.add("/a/<uint>", 9).is_ok());
    }

    #[test]
    fn redirect_sentinel_yields_to_real_rules() {
        let mut trie = build(&["/dir/"]);
        trie.add_redirect("/dir").unwrap();
        assert_eq!(trie.find("/dir").0, REDIRECT_SLASH);
        trie.add_over_redirect("/dir", 7).unwrap();
        assert_eq!(trie.find("/dir").0, 7);
        trie.add_redirect("/dir").unwrap();
        assert_eq!(trie.find("/dir").0, 7);
    }

    #[test]
    fn optimization_preserves_matches() {
        let patterns = [
            "/",
            "/robots.txt",
            "/page/<uint>",
            "/block/<uint>",
            "/block/<string>",
            "/tx/<string>",
            "/tx/<string>/<uint>",
            "/search",
            "/static/<path>",
            "/api/v1/users/<int>/posts",
            "/api/v1/users/<int>/comments/<double>",
            "/dir/",
            "/dir/sub",
        ];
        let probes = [
            "/",
            "/robots.txt",
            "/robots",
            "/page/3",
            "/page/x",
            "/block/12",
            "/block/cafe",
            "/tx/ab",
            "/tx/ab/1",
            "/tx/ab/x",
            "/search",
            "/searchx",
            "/static/css/site.css",
            "/api/v1/users/-3/posts",
            "/api/v1/users/3/comments/2.5",
            "/api/v1/users/3",
            "/dir/",
            "/dir/sub",
            "/dir",
            "",
            "/nope",
        ];

        let plain = build(&patterns);
        let mut optimized = plain.clone();
        optimized.optimize();
        assert!(
            optimized
                .nodes
                .iter()
                .any(|n| n.children.keys().any(|k| k.len() > 1))
        );

        for probe in probes {
            assert_eq!(plain.find(probe), optimized.find(probe), "probe {probe:?}");
        }
    }

    #[test]
    fn optimized_root_stays_simple() {
        let mut trie = build(&["/a", "/b/<int>"]);
        trie.optimize();
        assert!(trie.nodes[ROOT].is_simple());
        assert!(!trie.is_empty());
        assert!(Trie::new().is_empty());
    }
}
