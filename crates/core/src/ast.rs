//! Expression arena
//!
//! The planner hands filter, sort and scorer expressions to the search layer
//! as trees allocated in an [`ExprArena`]. Nodes are addressed by [`ExprId`];
//! slot `0` is always the [`MATCH_ALL`] surrogate so a plan node without a
//! filter still points at a valid expression.
//!
//! The JSON encoding (`to_json` / `from_json`) is the form expressions take
//! inside a persisted plan.

use crate::error::{Error, Result};
use crate::types::VariableId;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

/// Handle of a node inside an [`ExprArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// The reserved "no condition" node
pub const MATCH_ALL: ExprId = ExprId(0);

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `IN`
    In,
    /// `NOT IN`
    NotIn,
}

impl CompareOp {
    /// Operator token
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "IN",
            CompareOp::NotIn => "NOT IN",
        }
    }

    /// Parse an operator token
    pub fn parse(s: &str) -> Option<CompareOp> {
        Some(match s {
            "==" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            "IN" => CompareOp::In,
            "NOT IN" => CompareOp::NotIn,
            _ => return None,
        })
    }

    /// Operator with swapped operands (`a < b` ⇔ `b > a`)
    pub fn mirrored(self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }
}

/// A node of the expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Unconditional match
    MatchAll,
    /// Literal value
    Value(Value),
    /// Variable reference
    Reference(VariableId),
    /// `base.name`
    Attribute {
        /// Object expression
        base: ExprId,
        /// Attribute name
        name: String,
    },
    /// Binary comparison
    Compare {
        /// Operator
        op: CompareOp,
        /// Left operand
        lhs: ExprId,
        /// Right operand
        rhs: ExprId,
    },
    /// Conjunction
    And(Vec<ExprId>),
    /// Disjunction
    Or(Vec<ExprId>),
    /// Negation
    Not(ExprId),
    /// Function call, name upper-cased
    Call {
        /// Function name
        name: String,
        /// Arguments
        args: Vec<ExprId>,
    },
    /// Array literal
    Array(Vec<ExprId>),
    /// Object literal
    Object(Vec<(String, ExprId)>),
}

/// Arena holding every expression of one execution plan
#[derive(Debug, Clone)]
pub struct ExprArena {
    nodes: Vec<Expr>,
}

impl Default for ExprArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprArena {
    /// Create an arena with the match-all surrogate in slot 0
    pub fn new() -> Self {
        ExprArena {
            nodes: vec![Expr::MatchAll],
        }
    }

    /// Number of allocated nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: slot 0 is reserved
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocate a node
    pub fn add(&mut self, expr: Expr) -> ExprId {
        if matches!(expr, Expr::MatchAll) {
            return MATCH_ALL;
        }
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(expr);
        id
    }

    /// Look up a node. Unknown ids resolve to the match-all node.
    pub fn get(&self, id: ExprId) -> &Expr {
        self.nodes.get(id.0 as usize).unwrap_or(&Expr::MatchAll)
    }

    /// True when `id` is the match-all surrogate
    pub fn is_match_all(&self, id: ExprId) -> bool {
        matches!(self.get(id), Expr::MatchAll)
    }

    // ========================================================================
    // Builders
    // ========================================================================

    /// Literal value
    pub fn value(&mut self, v: Value) -> ExprId {
        self.add(Expr::Value(v))
    }

    /// Variable reference
    pub fn reference(&mut self, var: VariableId) -> ExprId {
        self.add(Expr::Reference(var))
    }

    /// `var.a.b.c` from a dotted path
    pub fn attribute_path(&mut self, var: VariableId, path: &str) -> ExprId {
        let mut cur = self.reference(var);
        for part in path.split('.').filter(|p| !p.is_empty()) {
            cur = self.add(Expr::Attribute {
                base: cur,
                name: part.to_string(),
            });
        }
        cur
    }

    /// Comparison
    pub fn compare(&mut self, op: CompareOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.add(Expr::Compare { op, lhs, rhs })
    }

    /// Conjunction
    pub fn and(&mut self, parts: Vec<ExprId>) -> ExprId {
        self.add(Expr::And(parts))
    }

    /// Disjunction
    pub fn or(&mut self, parts: Vec<ExprId>) -> ExprId {
        self.add(Expr::Or(parts))
    }

    /// Negation
    pub fn not(&mut self, inner: ExprId) -> ExprId {
        self.add(Expr::Not(inner))
    }

    /// Function call
    pub fn call(&mut self, name: &str, args: Vec<ExprId>) -> ExprId {
        self.add(Expr::Call {
            name: name.to_ascii_uppercase(),
            args,
        })
    }

    /// Object literal built from JSON
    pub fn object_from_json(&mut self, value: &Value) -> ExprId {
        match value {
            Value::Object(map) => {
                let members = map
                    .iter()
                    .map(|(k, v)| (k.clone(), self.object_from_json(v)))
                    .collect();
                self.add(Expr::Object(members))
            }
            Value::Array(items) => {
                let elems = items.iter().map(|v| self.object_from_json(v)).collect();
                self.add(Expr::Array(elems))
            }
            other => self.value(other.clone()),
        }
    }

    // ========================================================================
    // Analysis
    // ========================================================================

    /// Resolve `var.a.b` chains into `(var, ["a", "b"])`
    pub fn attribute_access(&self, id: ExprId) -> Option<(VariableId, Vec<String>)> {
        let mut path = Vec::new();
        let mut cur = id;
        loop {
            match self.get(cur) {
                Expr::Attribute { base, name } => {
                    path.push(name.clone());
                    cur = *base;
                }
                Expr::Reference(var) => {
                    path.reverse();
                    return Some((*var, path));
                }
                _ => return None,
            }
        }
    }

    /// Collect every variable referenced below `id`
    pub fn referenced_variables(&self, id: ExprId, out: &mut BTreeSet<VariableId>) {
        match self.get(id) {
            Expr::MatchAll | Expr::Value(_) => {}
            Expr::Reference(var) => {
                out.insert(*var);
            }
            Expr::Attribute { base, .. } => self.referenced_variables(*base, out),
            Expr::Compare { lhs, rhs, .. } => {
                self.referenced_variables(*lhs, out);
                self.referenced_variables(*rhs, out);
            }
            Expr::Not(inner) => self.referenced_variables(*inner, out),
            Expr::And(parts) | Expr::Or(parts) | Expr::Array(parts) => {
                for p in parts {
                    self.referenced_variables(*p, out);
                }
            }
            Expr::Call { args, .. } => {
                for a in args {
                    self.referenced_variables(*a, out);
                }
            }
            Expr::Object(members) => {
                for (_, v) in members {
                    self.referenced_variables(*v, out);
                }
            }
        }
    }

    /// Variables referenced below `id`, as a fresh set
    pub fn variables_of(&self, id: ExprId) -> BTreeSet<VariableId> {
        let mut out = BTreeSet::new();
        self.referenced_variables(id, &mut out);
        out
    }

    /// True when the subtree can be evaluated without any variable binding
    pub fn is_constant(&self, id: ExprId) -> bool {
        match self.get(id) {
            Expr::MatchAll | Expr::Value(_) => true,
            Expr::Reference(_) | Expr::Call { .. } => false,
            Expr::Attribute { base, .. } => self.is_constant(*base),
            Expr::Compare { lhs, rhs, .. } => self.is_constant(*lhs) && self.is_constant(*rhs),
            Expr::Not(inner) => self.is_constant(*inner),
            Expr::And(parts) | Expr::Or(parts) | Expr::Array(parts) => {
                parts.iter().all(|p| self.is_constant(*p))
            }
            Expr::Object(members) => members.iter().all(|(_, v)| self.is_constant(*v)),
        }
    }

    /// Evaluate a value expression, resolving variables through `bindings`.
    ///
    /// Only literals, references, attribute access, arrays and objects are
    /// evaluable; anything else is an error.
    pub fn evaluate(
        &self,
        id: ExprId,
        bindings: &dyn Fn(VariableId) -> Option<Value>,
    ) -> Result<Value> {
        match self.get(id) {
            Expr::Value(v) => Ok(v.clone()),
            Expr::Reference(var) => bindings(*var)
                .ok_or_else(|| Error::internal(format!("variable #{} is not bound", var))),
            Expr::Attribute { base, name } => {
                let base = self.evaluate(*base, bindings)?;
                Ok(base.get(name).cloned().unwrap_or(Value::Null))
            }
            Expr::Array(items) => items
                .iter()
                .map(|i| self.evaluate(*i, bindings))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Object(members) => {
                let mut map = Map::new();
                for (k, v) in members {
                    map.insert(k.clone(), self.evaluate(*v, bindings)?);
                }
                Ok(Value::Object(map))
            }
            _ => Err(Error::internal(format!(
                "cannot evaluate expression '{}'",
                self.render(id)
            ))),
        }
    }

    /// Evaluate an expression that must not reference any variable
    pub fn evaluate_constant(&self, id: ExprId) -> Result<Value> {
        self.evaluate(id, &|_| None)
    }

    /// Copy of the subtree at `id` with variables renamed per `map`.
    ///
    /// Nodes without a renamed variable below them are shared, not copied.
    pub fn replace_variables(&mut self, id: ExprId, map: &HashMap<VariableId, VariableId>) -> ExprId {
        let vars = self.variables_of(id);
        if !vars.iter().any(|v| map.contains_key(v)) {
            return id;
        }
        let replaced = match self.get(id).clone() {
            Expr::Reference(var) => Expr::Reference(*map.get(&var).unwrap_or(&var)),
            Expr::Attribute { base, name } => Expr::Attribute {
                base: self.replace_variables(base, map),
                name,
            },
            Expr::Compare { op, lhs, rhs } => Expr::Compare {
                op,
                lhs: self.replace_variables(lhs, map),
                rhs: self.replace_variables(rhs, map),
            },
            Expr::Not(inner) => Expr::Not(self.replace_variables(inner, map)),
            Expr::And(parts) => Expr::And(self.replace_all(parts, map)),
            Expr::Or(parts) => Expr::Or(self.replace_all(parts, map)),
            Expr::Array(parts) => Expr::Array(self.replace_all(parts, map)),
            Expr::Call { name, args } => Expr::Call {
                name,
                args: self.replace_all(args, map),
            },
            Expr::Object(members) => Expr::Object(
                members
                    .into_iter()
                    .map(|(k, v)| (k, self.replace_variables(v, map)))
                    .collect(),
            ),
            other => other,
        };
        self.add(replaced)
    }

    fn replace_all(&mut self, ids: Vec<ExprId>, map: &HashMap<VariableId, VariableId>) -> Vec<ExprId> {
        ids.into_iter().map(|i| self.replace_variables(i, map)).collect()
    }

    /// Human readable rendering used in error messages
    pub fn render(&self, id: ExprId) -> String {
        let mut out = String::new();
        self.render_into(id, &mut out);
        out
    }

    fn render_into(&self, id: ExprId, out: &mut String) {
        match self.get(id) {
            Expr::MatchAll => out.push_str("true"),
            Expr::Value(v) => {
                let _ = write!(out, "{}", v);
            }
            Expr::Reference(var) => {
                let _ = write!(out, "${}", var);
            }
            Expr::Attribute { base, name } => {
                self.render_into(*base, out);
                out.push('.');
                out.push_str(name);
            }
            Expr::Compare { op, lhs, rhs } => {
                self.render_into(*lhs, out);
                let _ = write!(out, " {} ", op.as_str());
                self.render_into(*rhs, out);
            }
            Expr::And(parts) => self.render_list(parts, " AND ", out),
            Expr::Or(parts) => self.render_list(parts, " OR ", out),
            Expr::Not(inner) => {
                out.push_str("NOT ");
                self.render_into(*inner, out);
            }
            Expr::Call { name, args } => {
                out.push_str(name);
                out.push('(');
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render_into(*a, out);
                }
                out.push(')');
            }
            Expr::Array(items) => {
                out.push('[');
                for (i, a) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render_into(*a, out);
                }
                out.push(']');
            }
            Expr::Object(members) => {
                out.push('{');
                for (i, (k, v)) in members.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{}: ", k);
                    self.render_into(*v, out);
                }
                out.push('}');
            }
        }
    }

    fn render_list(&self, parts: &[ExprId], sep: &str, out: &mut String) {
        out.push('(');
        for (i, p) in parts.iter().enumerate() {
            if i > 0 {
                out.push_str(sep);
            }
            self.render_into(*p, out);
        }
        out.push(')');
    }

    // ========================================================================
    // JSON encoding
    // ========================================================================

    /// Encode the subtree at `id`
    pub fn to_json(&self, id: ExprId) -> Value {
        match self.get(id) {
            Expr::MatchAll => json!({"type": "match all"}),
            Expr::Value(v) => json!({"type": "value", "value": v}),
            Expr::Reference(var) => json!({"type": "reference", "id": var.get()}),
            Expr::Attribute { base, name } => json!({
                "type": "attribute access",
                "name": name,
                "subNodes": [self.to_json(*base)],
            }),
            Expr::Compare { op, lhs, rhs } => json!({
                "type": "compare",
                "op": op.as_str(),
                "subNodes": [self.to_json(*lhs), self.to_json(*rhs)],
            }),
            Expr::And(parts) => json!({"type": "logical and", "subNodes": self.list_json(parts)}),
            Expr::Or(parts) => json!({"type": "logical or", "subNodes": self.list_json(parts)}),
            Expr::Not(inner) => json!({"type": "logical not", "subNodes": [self.to_json(*inner)]}),
            Expr::Call { name, args } => json!({
                "type": "function call",
                "name": name,
                "subNodes": self.list_json(args),
            }),
            Expr::Array(items) => json!({"type": "array", "subNodes": self.list_json(items)}),
            Expr::Object(members) => {
                let elems: Vec<Value> = members
                    .iter()
                    .map(|(k, v)| {
                        json!({"type": "object element", "name": k, "subNodes": [self.to_json(*v)]})
                    })
                    .collect();
                json!({"type": "object", "subNodes": elems})
            }
        }
    }

    fn list_json(&self, ids: &[ExprId]) -> Vec<Value> {
        ids.iter().map(|i| self.to_json(*i)).collect()
    }

    /// Decode an expression produced by [`ExprArena::to_json`]
    pub fn from_json(&mut self, value: &Value) -> Result<ExprId> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::bad_parameter("expression must be an object"))?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_parameter("expression is missing 'type'"))?;
        let sub = |this: &mut Self| -> Result<Vec<ExprId>> {
            match obj.get("subNodes") {
                None => Ok(Vec::new()),
                Some(Value::Array(items)) => items.iter().map(|i| this.from_json(i)).collect(),
                Some(_) => Err(Error::bad_parameter("'subNodes' must be an array")),
            }
        };
        let name = || -> Result<String> {
            obj.get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::bad_parameter(format!("'{}' node requires 'name'", kind)))
        };

        let expr = match kind {
            "match all" => return Ok(MATCH_ALL),
            "value" => Expr::Value(obj.get("value").cloned().unwrap_or(Value::Null)),
            "reference" => {
                let id = obj
                    .get("id")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::bad_parameter("'reference' node requires numeric 'id'"))?;
                Expr::Reference(VariableId(id))
            }
            "attribute access" => {
                let name = name()?;
                let subs = sub(self)?;
                let base = single(&subs, kind)?;
                Expr::Attribute { base, name }
            }
            "compare" => {
                let op = obj
                    .get("op")
                    .and_then(Value::as_str)
                    .and_then(CompareOp::parse)
                    .ok_or_else(|| Error::bad_parameter("'compare' node requires a valid 'op'"))?;
                let subs = sub(self)?;
                if subs.len() != 2 {
                    return Err(Error::bad_parameter("'compare' node requires two operands"));
                }
                Expr::Compare {
                    op,
                    lhs: subs[0],
                    rhs: subs[1],
                }
            }
            "logical and" => Expr::And(sub(self)?),
            "logical or" => Expr::Or(sub(self)?),
            "logical not" => {
                let subs = sub(self)?;
                Expr::Not(single(&subs, kind)?)
            }
            "function call" => {
                let name = name()?;
                Expr::Call {
                    name: name.to_ascii_uppercase(),
                    args: sub(self)?,
                }
            }
            "array" => Expr::Array(sub(self)?),
            "object" => {
                let mut members = Vec::new();
                if let Some(Value::Array(items)) = obj.get("subNodes") {
                    for item in items {
                        let key = item
                            .get("name")
                            .and_then(Value::as_str)
                            .ok_or_else(|| Error::bad_parameter("object element requires 'name'"))?
                            .to_string();
                        let inner = item
                            .get("subNodes")
                            .and_then(Value::as_array)
                            .and_then(|a| a.first())
                            .ok_or_else(|| Error::bad_parameter("object element requires a value"))?;
                        members.push((key, self.from_json(inner)?));
                    }
                }
                Expr::Object(members)
            }
            other => {
                return Err(Error::bad_parameter(format!(
                    "unknown expression type '{}'",
                    other
                )))
            }
        };
        Ok(self.add(expr))
    }
}

fn single(subs: &[ExprId], kind: &str) -> Result<ExprId> {
    match subs {
        [one] => Ok(*one),
        _ => Err(Error::bad_parameter(format!(
            "'{}' node requires exactly one operand",
            kind
        ))),
    }
}
