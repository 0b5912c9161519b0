//! Mapper algebra: parsing, normalization, and state-point expansion (C1).
//!
//! A mapper is a small recursive expression over leaves (`Node.field`),
//! scalar products (zipped pairing, `(a, b)`), outer products (cartesian,
//! `[a, b]`), and references to another node's mapper (`_OtherNode`).

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{MapGraphError, Result};
use crate::state::StatePoint;

/// A bound input value: either a single scalar or an ordered sequence.
///
/// A node's own inputs are either a bare value or a finite sequence, and
/// sequences are always treated positionally by the mapper algebra.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// A constant, broadcast to every state point that includes this leaf
    /// only by way of being a node's own (unmapped) input.
    Scalar(Value),
    /// An ordered sequence; mapper leaves consume this positionally.
    Sequence(Vec<Value>),
}

impl InputValue {
    /// Number of elements a mapper leaf over this binding would expand to.
    pub fn len(&self) -> usize {
        match self {
            InputValue::Scalar(_) => 1,
            InputValue::Sequence(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Value> for InputValue {
    fn from(v: Value) -> Self {
        InputValue::Scalar(v)
    }
}

impl From<Vec<Value>> for InputValue {
    fn from(v: Vec<Value>) -> Self {
        InputValue::Sequence(v)
    }
}

/// The mapper expression algebra.
///
/// `Leaf` and `Reference` hold raw (possibly unqualified) names until
/// [`Mapper::normalize`] runs; after normalization every `Leaf` is
/// `NodeName.field` and no `Reference` remains.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapper {
    /// A single field reference, e.g. `"a"` or `"NA.a"`.
    Leaf(String),
    /// Zipped pairing of children; all children must expand to equal length.
    Scalar(Vec<Mapper>),
    /// Cartesian product of children (last child varies fastest).
    Outer(Vec<Mapper>),
    /// `_OtherNode`, inlined at normalization time with `OtherNode`'s own
    /// already-normalized mapper, requalified into its namespace.
    Reference(String),
}

impl Mapper {
    /// Construct a leaf mapper.
    pub fn leaf(field: impl Into<String>) -> Self {
        Mapper::Leaf(field.into())
    }

    /// Construct a scalar (zipped) product.
    pub fn scalar(children: impl IntoIterator<Item = Mapper>) -> Self {
        Mapper::Scalar(children.into_iter().collect())
    }

    /// Construct an outer (cartesian) product.
    pub fn outer(children: impl IntoIterator<Item = Mapper>) -> Self {
        Mapper::Outer(children.into_iter().collect())
    }

    /// Construct a reference to another node's mapper.
    pub fn reference(node: impl Into<String>) -> Self {
        Mapper::Reference(node.into())
    }

    /// Parse the textual mapper syntax: bare identifiers as leaves,
    /// `(a, b, ...)` as a scalar product, `[a, b, ...]` as an outer product,
    /// and `_NodeName` tokens as mapper references. Nesting is unrestricted,
    /// e.g. `"[(b, c), _NA]"`.
    ///
    /// ```rust
    /// use mapgraph_core::mapper::Mapper;
    ///
    /// assert_eq!(Mapper::parse("a").unwrap(), Mapper::leaf("a"));
    /// assert_eq!(
    ///     Mapper::parse("(b, c)").unwrap(),
    ///     Mapper::scalar([Mapper::leaf("b"), Mapper::leaf("c")])
    /// );
    /// assert_eq!(
    ///     Mapper::parse("[_NA, _NB]").unwrap(),
    ///     Mapper::outer([Mapper::reference("NA"), Mapper::reference("NB")])
    /// );
    /// ```
    pub fn parse(expr: &str) -> Result<Mapper> {
        let mut parser = MapperParser::new(expr);
        let result = parser.parse_expr()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(MapGraphError::MapperSyntax(
                expr.to_string(),
                format!("unexpected trailing input at byte {}", parser.pos),
            ));
        }
        Ok(result)
    }

    /// Normalize this mapper in the namespace of `owner`, inlining any
    /// `_Other` references found in `siblings` (each already-normalized, or
    /// normalized on demand, see [`normalize_all`]).
    ///
    /// Unqualified leaves (no `.`) are rewritten to `owner.leaf`; leaves that
    /// already contain a `.` are left untouched (they're qualified
    /// references into another node's namespace, e.g. an inherited mapper).
    fn normalize_in(
        &self,
        owner: &str,
        siblings: &BTreeMap<String, Mapper>,
        visiting: &mut BTreeSet<String>,
    ) -> Result<Mapper> {
        match self {
            Mapper::Leaf(field) => {
                if field.contains('.') {
                    Ok(Mapper::Leaf(field.clone()))
                } else {
                    Ok(Mapper::Leaf(format!("{owner}.{field}")))
                }
            }
            Mapper::Scalar(children) => Ok(Mapper::Scalar(
                children
                    .iter()
                    .map(|c| c.normalize_in(owner, siblings, visiting))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Mapper::Outer(children) => Ok(Mapper::Outer(
                children
                    .iter()
                    .map(|c| c.normalize_in(owner, siblings, visiting))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Mapper::Reference(other) => {
                if !visiting.insert(other.clone()) {
                    return Err(MapGraphError::MapperCycle(other.clone()));
                }
                let other_mapper = siblings
                    .get(other)
                    .ok_or_else(|| MapGraphError::UnknownNode(other.clone()))?;
                let normalized = other_mapper.normalize_in(other, siblings, visiting)?;
                visiting.remove(other);
                Ok(normalized)
            }
        }
    }

    /// The set of qualified leaves this (already normalized) mapper touches.
    pub fn leaves(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut BTreeSet<String>) {
        match self {
            Mapper::Leaf(f) => {
                out.insert(f.clone());
            }
            Mapper::Scalar(cs) | Mapper::Outer(cs) => {
                for c in cs {
                    c.collect_leaves(out);
                }
            }
            Mapper::Reference(_) => {
                // Normalized mappers never contain a Reference; a raw one
                // being inspected pre-normalization simply contributes no
                // leaves yet.
            }
        }
    }

    /// Expand this (already normalized) mapper against `inputs` into an
    /// ordered list of state points.
    pub fn expand(&self, owner: &str, inputs: &BTreeMap<String, InputValue>) -> Result<Vec<StatePoint>> {
        match self {
            Mapper::Leaf(field) => {
                let binding = inputs
                    .get(field)
                    .ok_or_else(|| MapGraphError::UnboundLeaf(field.clone()))?;
                match binding {
                    InputValue::Scalar(v) => {
                        let mut point = StatePoint::new();
                        point.insert(field.clone(), v.clone());
                        Ok(vec![point])
                    }
                    InputValue::Sequence(values) => Ok(values
                        .iter()
                        .map(|v| {
                            let mut point = StatePoint::new();
                            point.insert(field.clone(), v.clone());
                            point
                        })
                        .collect()),
                }
            }
            Mapper::Scalar(children) => expand_scalar(owner, children, inputs),
            Mapper::Outer(children) => expand_outer(owner, children, inputs),
            Mapper::Reference(other) => Err(MapGraphError::UnknownNode(format!(
                "mapper reference '_{other}' was not normalized before expansion"
            ))),
        }
    }
}

fn merge_point(base: StatePoint, addition: &StatePoint) -> StatePoint {
    let mut merged = base;
    for (k, v) in addition {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// A product's children must bind disjoint leaf sets, independent of
/// whatever concrete values the children happen to expand to. Checked once,
/// before expansion.
fn check_disjoint_leaves(owner: &str, children: &[Mapper]) -> Result<()> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for child in children {
        for leaf in child.leaves() {
            if !seen.insert(leaf.clone()) {
                return Err(MapGraphError::DuplicateLeaf {
                    node: owner.to_string(),
                    leaf,
                });
            }
        }
    }
    Ok(())
}

fn expand_scalar(owner: &str, children: &[Mapper], inputs: &BTreeMap<String, InputValue>) -> Result<Vec<StatePoint>> {
    if children.is_empty() {
        return Ok(vec![StatePoint::new()]);
    }
    check_disjoint_leaves(owner, children)?;
    let child_points: Vec<Vec<StatePoint>> = children
        .iter()
        .map(|c| c.expand(owner, inputs))
        .collect::<Result<_>>()?;
    let lengths: Vec<usize> = child_points.iter().map(|p| p.len()).collect();
    let expected = lengths[0];
    if lengths.iter().any(|&l| l != expected) {
        return Err(MapGraphError::ScalarShape {
            node: owner.to_string(),
            lengths,
        });
    }
    Ok((0..expected)
        .map(|i| {
            let mut merged = StatePoint::new();
            for points in &child_points {
                merged = merge_point(merged, &points[i]);
            }
            merged
        })
        .collect())
}

fn expand_outer(owner: &str, children: &[Mapper], inputs: &BTreeMap<String, InputValue>) -> Result<Vec<StatePoint>> {
    if children.is_empty() {
        return Ok(vec![StatePoint::new()]);
    }
    check_disjoint_leaves(owner, children)?;
    let child_points: Vec<Vec<StatePoint>> = children
        .iter()
        .map(|c| c.expand(owner, inputs))
        .collect::<Result<_>>()?;

    let mut result = vec![StatePoint::new()];
    for points in &child_points {
        let mut next = Vec::with_capacity(result.len() * points.len());
        for base in &result {
            for addition in points {
                next.push(merge_point(base.clone(), addition));
            }
        }
        result = next;
    }
    Ok(result)
}

/// Normalize every node's raw mapper in one pass, inlining `_Other`
/// references and qualifying bare leaves. `raw` maps node name to its
/// as-authored mapper (if any); the result maps node name to its normalized
/// mapper, for every node that had one.
///
/// This is the entry point [`Workflow`](crate::workflow::Workflow) calls
/// during `prepare_state` for the whole graph at once, since a reference can
/// point to a sibling whose own mapper hasn't been normalized yet.
pub fn normalize_all(raw: &BTreeMap<String, Mapper>) -> Result<BTreeMap<String, Mapper>> {
    let mut out = BTreeMap::new();
    for (name, mapper) in raw {
        let mut visiting = BTreeSet::new();
        visiting.insert(name.clone());
        out.insert(name.clone(), mapper.normalize_in(name, raw, &mut visiting)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Textual surface-syntax parser
// ---------------------------------------------------------------------

struct MapperParser {
    chars: Vec<char>,
    pos: usize,
}

impl MapperParser {
    fn new(s: &str) -> Self {
        Self {
            chars: s.chars().collect(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn parse_expr(&mut self) -> Result<Mapper> {
        self.skip_ws();
        match self.peek() {
            Some('(') => self.parse_group('(', ')', true),
            Some('[') => self.parse_group('[', ']', false),
            Some(_) => self.parse_atom(),
            None => Err(MapGraphError::MapperSyntax(
                self.chars.iter().collect(),
                "empty mapper expression".to_string(),
            )),
        }
    }

    fn parse_group(&mut self, open: char, close: char, scalar: bool) -> Result<Mapper> {
        self.pos += 1; // consume opener
        let mut children = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                break;
            }
            children.push(self.parse_expr()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some(c) if c == close => {
                    self.pos += 1;
                    break;
                }
                other => {
                    return Err(MapGraphError::MapperSyntax(
                        self.chars.iter().collect(),
                        format!("expected ',' or '{close}', found {other:?}"),
                    ));
                }
            }
        }
        let _ = open;
        if scalar {
            Ok(Mapper::Scalar(children))
        } else {
            Ok(Mapper::Outer(children))
        }
    }

    fn parse_atom(&mut self) -> Result<Mapper> {
        self.skip_ws();
        let start = self.pos;
        let is_ref = self.peek() == Some('_');
        if is_ref {
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start || (is_ref && self.pos == start + 1) {
            return Err(MapGraphError::MapperSyntax(
                self.chars.iter().collect(),
                format!("expected identifier at byte {start}"),
            ));
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if let Some(node) = text.strip_prefix('_') {
            Ok(Mapper::Reference(node.to_string()))
        } else {
            Ok(Mapper::Leaf(text))
        }
    }
}
