//! Execution plan model
//!
//! The planner hands the search node a plan made of nodes linked by their
//! first dependency, plus the arena holding every expression of the query.
//! Only what the search node needs to reason about is modelled here: node
//! kinds that iterate, which node sets which variable, and whether a
//! computation is deterministic.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use tessera_core::{Error, ExprArena, ExprId, PlanNodeId, Result, VariableId};

/// Id of the root singleton of a query
pub const ROOT_NODE: PlanNodeId = PlanNodeId(1);

/// Kind of a plan node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Start of a query or of a subquery
    Singleton,
    /// Full scan of a collection
    EnumerateCollection,
    /// Index lookup
    Index,
    /// Iteration over a list value
    EnumerateList,
    /// Graph traversal
    Traversal,
    /// Index join
    Join,
    /// Grouping
    Collect,
    /// Subquery result
    Subquery,
    /// Scalar computation
    Calculation {
        /// Computed expression
        expr: ExprId,
        /// False when the result may differ between invocations
        deterministic: bool,
    },
    /// Search view enumeration
    Search,
}

impl NodeKind {
    /// True for nodes that emit more than one row per input row
    pub fn is_loop(&self) -> bool {
        matches!(
            self,
            NodeKind::EnumerateCollection
                | NodeKind::Index
                | NodeKind::EnumerateList
                | NodeKind::Traversal
                | NodeKind::Join
                | NodeKind::Search
        )
    }

    /// True for nodes whose output changes with every row they produce
    pub fn produces_dependent_values(&self) -> bool {
        self.is_loop() || matches!(self, NodeKind::Collect | NodeKind::Subquery)
    }

    /// True unless the node is a non-deterministic computation
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, NodeKind::Calculation { deterministic: false, .. })
    }
}

/// A query variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// Variable id
    pub id: VariableId,
    /// Name as written in the query
    pub name: String,
}

impl Variable {
    /// Persisted form
    pub fn to_json(&self) -> Value {
        json!({"id": self.id.get(), "name": self.name})
    }

    /// Parse the persisted form
    pub fn from_json(v: &Value) -> Result<Self> {
        let id = v
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::bad_parameter("variable requires a numeric 'id'"))?;
        let name = v
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_parameter("variable requires a string 'name'"))?;
        Ok(Variable {
            id: VariableId(id),
            name: name.to_string(),
        })
    }
}

/// One node of an execution plan
#[derive(Debug, Clone)]
pub struct PlanNode {
    /// Node id
    pub id: PlanNodeId,
    /// Node kind
    pub kind: NodeKind,
    /// First dependency, `None` for singletons
    pub dependency: Option<PlanNodeId>,
    /// Variables produced by the node
    pub sets: Vec<VariableId>,
}

/// An execution plan: nodes, variables and the expression arena
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    arena: ExprArena,
    nodes: BTreeMap<PlanNodeId, PlanNode>,
    variables: BTreeMap<VariableId, Variable>,
    next_node: u64,
    next_variable: u64,
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionPlan {
    /// Empty plan holding only the root singleton
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_NODE,
            PlanNode {
                id: ROOT_NODE,
                kind: NodeKind::Singleton,
                dependency: None,
                sets: Vec::new(),
            },
        );
        ExecutionPlan {
            arena: ExprArena::new(),
            nodes,
            variables: BTreeMap::new(),
            next_node: ROOT_NODE.get() + 1,
            next_variable: 1,
        }
    }

    /// Expression arena
    pub fn arena(&self) -> &ExprArena {
        &self.arena
    }

    /// Mutable expression arena
    pub fn arena_mut(&mut self) -> &mut ExprArena {
        &mut self.arena
    }

    // ------------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------------

    /// Create a fresh variable
    pub fn create_variable(&mut self, name: &str) -> VariableId {
        let id = VariableId(self.next_variable);
        self.next_variable += 1;
        self.variables.insert(
            id,
            Variable {
                id,
                name: name.to_string(),
            },
        );
        id
    }

    /// Register a variable read from a persisted plan, keeping its id
    pub fn register_variable(&mut self, var: Variable) -> VariableId {
        let id = var.id;
        self.next_variable = self.next_variable.max(id.get() + 1);
        self.variables.entry(id).or_insert(var);
        id
    }

    /// Look up a variable
    pub fn variable(&self, id: VariableId) -> Option<&Variable> {
        self.variables.get(&id)
    }

    /// Persisted form of `id`, with an empty name when it is unknown
    pub fn variable_json(&self, id: VariableId) -> Value {
        match self.variables.get(&id) {
            Some(var) => var.to_json(),
            None => json!({"id": id.get(), "name": ""}),
        }
    }

    // ------------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------------

    /// Append a node depending on `dependency`
    pub fn add_node(&mut self, kind: NodeKind, dependency: PlanNodeId, sets: Vec<VariableId>) -> Result<PlanNodeId> {
        if !self.nodes.contains_key(&dependency) {
            return Err(Error::internal(format!("unknown plan node '{}'", dependency)));
        }
        let id = PlanNodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(
            id,
            PlanNode {
                id,
                kind,
                dependency: Some(dependency),
                sets,
            },
        );
        Ok(id)
    }

    /// Start a subquery: a singleton that is not the query root
    pub fn add_subquery_start(&mut self) -> PlanNodeId {
        let id = PlanNodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(
            id,
            PlanNode {
                id,
                kind: NodeKind::Singleton,
                dependency: None,
                sets: Vec::new(),
            },
        );
        id
    }

    /// Look up a node
    pub fn node(&self, id: PlanNodeId) -> Option<&PlanNode> {
        self.nodes.get(&id)
    }

    /// Replace the variables produced by `id`
    pub fn set_variables(&mut self, id: PlanNodeId, sets: Vec<VariableId>) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::internal(format!("unknown plan node '{}'", id)))?;
        node.sets = sets;
        Ok(())
    }

    /// Node producing `var`
    pub fn setter_of(&self, var: VariableId) -> Option<&PlanNode> {
        self.nodes.values().find(|n| n.sets.contains(&var))
    }

    /// Chain of dependencies above `id`, nearest first
    fn ancestors(&self, id: PlanNodeId) -> impl Iterator<Item = &PlanNode> {
        let mut cur = self.nodes.get(&id).and_then(|n| n.dependency);
        std::iter::from_fn(move || {
            let node = self.nodes.get(&cur?)?;
            cur = node.dependency;
            Some(node)
        })
    }

    /// Nearest enclosing loop of `id`
    pub fn loop_of(&self, id: PlanNodeId) -> Option<PlanNodeId> {
        self.ancestors(id).find(|n| n.kind.is_loop()).map(|n| n.id)
    }

    /// True when `id` runs once per row of an outer loop or inside a subquery
    pub fn is_in_inner_loop_or_subquery(&self, id: PlanNodeId) -> bool {
        let mut top = id;
        for node in self.ancestors(id) {
            if node.kind.is_loop() {
                return true;
            }
            top = node.id;
        }
        match self.nodes.get(&top) {
            Some(node) => node.kind == NodeKind::Singleton && node.id != ROOT_NODE,
            None => false,
        }
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the root singleton exists from construction
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
