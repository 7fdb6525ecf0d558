//! Filter and scorer volatility
//!
//! A search inside an outer loop may have to rebuild its filter (or its
//! scorers) for every outer row. That is the case when they reference a
//! variable produced by an iterating node, or by a non-deterministic or
//! looped computation.

use crate::plan::ExecutionPlan;
use tessera_core::{ExprArena, ExprId, PlanNodeId, VariableId, MATCH_ALL};

/// Filter must be re-prepared per outer row
pub const VOLATILE_FILTER: i32 = 1;
/// Scorers must be re-prepared per outer row
pub const VOLATILE_SORT: i32 = 2;
/// Mask not computed yet
pub const VOLATILITY_UNKNOWN: i32 = -1;

/// True when `expr` references a variable other than `own` whose value
/// depends on the current row
pub fn has_dependencies(plan: &ExecutionPlan, arena: &ExprArena, expr: ExprId, own: VariableId) -> bool {
    arena
        .variables_of(expr)
        .into_iter()
        .filter(|var| *var != own)
        .any(|var| {
            let Some(setter) = plan.setter_of(var) else {
                return false;
            };
            setter.kind.produces_dependent_values()
                || !setter.kind.is_deterministic()
                || plan.loop_of(setter.id).is_some()
        })
}

/// Compute the volatility mask of a search node
pub fn evaluate_volatility(
    plan: &ExecutionPlan,
    node: PlanNodeId,
    own: VariableId,
    filter: ExprId,
    scorers: &[ExprId],
) -> i32 {
    if !plan.is_in_inner_loop_or_subquery(node) {
        return 0;
    }
    let arena = plan.arena();
    let mut mask = 0;
    if filter != MATCH_ALL && has_dependencies(plan, arena, filter, own) {
        mask |= VOLATILE_FILTER;
    }
    if scorers.iter().any(|s| has_dependencies(plan, arena, *s, own)) {
        mask |= VOLATILE_SORT;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{NodeKind, ROOT_NODE};
    use serde_json::json;
    use tessera_core::CompareOp;

    #[test]
    fn test_top_level_search_never_volatile() {
        let mut plan = ExecutionPlan::new();
        let x = plan.create_variable("x");
        let d = plan.create_variable("d");
        plan.add_node(NodeKind::EnumerateList, ROOT_NODE, vec![x]).unwrap();
        let search = plan.add_node(NodeKind::Search, ROOT_NODE, vec![d]).unwrap();
        let lhs = plan.arena_mut().attribute_path(d, "a");
        let rhs = plan.arena_mut().reference(x);
        let cond = plan.arena_mut().compare(CompareOp::Eq, lhs, rhs);
        assert_eq!(evaluate_volatility(&plan, search, d, cond, &[]), 0);
    }

    #[test]
    fn test_filter_and_sort_bits() {
        let mut plan = ExecutionPlan::new();
        let x = plan.create_variable("x");
        let d = plan.create_variable("d");
        let outer = plan.add_node(NodeKind::EnumerateList, ROOT_NODE, vec![x]).unwrap();
        let search = plan.add_node(NodeKind::Search, outer, vec![d]).unwrap();

        let arena = plan.arena_mut();
        let lhs = arena.attribute_path(d, "a");
        let rhs = arena.reference(x);
        let dependent = arena.compare(CompareOp::Eq, lhs, rhs);
        let lhs = arena.attribute_path(d, "a");
        let one = arena.value(json!(1));
        let constant = arena.compare(CompareOp::Eq, lhs, one);
        let doc = arena.reference(d);
        let plain_scorer = arena.call("BM25", vec![doc]);
        let doc = arena.reference(d);
        let k = arena.reference(x);
        let dependent_scorer = arena.call("BM25", vec![doc, k]);

        assert_eq!(evaluate_volatility(&plan, search, d, constant, &[plain_scorer]), 0);
        assert_eq!(evaluate_volatility(&plan, search, d, MATCH_ALL, &[]), 0);
        assert_eq!(
            evaluate_volatility(&plan, search, d, dependent, &[plain_scorer]),
            VOLATILE_FILTER
        );
        assert_eq!(
            evaluate_volatility(&plan, search, d, constant, &[dependent_scorer]),
            VOLATILE_SORT
        );
        assert_eq!(
            evaluate_volatility(&plan, search, d, dependent, &[plain_scorer, dependent_scorer]),
            VOLATILE_FILTER | VOLATILE_SORT
        );
    }

    #[test]
    fn test_calculation_setters() {
        let mut plan = ExecutionPlan::new();
        let c = plan.create_variable("c");
        let r = plan.create_variable("r");
        let d = plan.create_variable("d");
        let constant = plan.arena_mut().value(json!(5));
        let calc = plan
            .add_node(
                NodeKind::Calculation {
                    expr: constant,
                    deterministic: true,
                },
                ROOT_NODE,
                vec![c],
            )
            .unwrap();
        plan.add_node(
            NodeKind::Calculation {
                expr: constant,
                deterministic: false,
            },
            calc,
            vec![r],
        )
        .unwrap();
        let start = plan.add_subquery_start();
        let search = plan.add_node(NodeKind::Search, start, vec![d]).unwrap();

        let arena = plan.arena_mut();
        let lhs = arena.attribute_path(d, "a");
        let rhs = arena.reference(c);
        let on_constant = arena.compare(CompareOp::Eq, lhs, rhs);
        let lhs = arena.attribute_path(d, "a");
        let rhs = arena.reference(r);
        let on_random = arena.compare(CompareOp::Eq, lhs, rhs);

        assert_eq!(evaluate_volatility(&plan, search, d, on_constant, &[]), 0);
        assert_eq!(evaluate_volatility(&plan, search, d, on_random, &[]), VOLATILE_FILTER);
    }
}
