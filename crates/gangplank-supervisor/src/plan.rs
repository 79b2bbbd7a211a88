//! Plan formation: partition a JobSpec's stages into execution-order
//! waves, in ascending order, defaulting the implicit order.

use std::collections::BTreeMap;

use gangplank_core::Stage;

/// A default `execution_order` of 0 is promoted to 2, keeping explicit `1`
/// reserved for pre-base stages.
const DEFAULT_EXECUTION_ORDER: i64 = 2;

/// One execution-order group: its stages are eligible to run in parallel.
#[derive(Debug, Clone)]
pub struct Wave {
    pub order: i64,
    pub stages: Vec<Stage>,
}

/// Copy every stage by value (never share a `&Stage`/`Arc<Stage>` across
/// concurrently dispatched tasks, which would let one task's mutation leak
/// into another's), apply the default-order promotion, and partition into
/// ascending waves.
pub fn form_plan(stages: &[Stage]) -> Vec<Wave> {
    let mut by_order: BTreeMap<i64, Vec<Stage>> = BTreeMap::new();
    for stage in stages {
        let mut owned = stage.clone();
        if owned.execution_order == 0 {
            owned.execution_order = DEFAULT_EXECUTION_ORDER;
        }
        by_order.entry(owned.execution_order).or_default().push(owned);
    }

    by_order
        .into_iter()
        .map(|(order, stages)| Wave { order, stages })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangplank_core::StageId;
    use std::collections::HashMap;

    fn stage(id: &str, order: i64) -> Stage {
        Stage {
            id: StageId::new(id),
            execution_order: order,
            concurrent_execution: false,
            build_artifacts: vec![],
            require_artifacts: vec![],
            request_artifacts: vec![],
            require_cache: false,
            request_cache: false,
            require_cache_repo: false,
            request_cache_repo: false,
            return_cache: false,
            return_cache_repo: false,
            return_files: vec![],
            prep_commands: vec![],
            commands: vec![],
            post_commands: vec![],
            post_always: false,
            overrides: vec![],
            env: HashMap::new(),
        }
    }

    #[test]
    fn default_order_is_promoted_to_two() {
        let plan = form_plan(&[stage("a", 0)]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].order, 2);
    }

    #[test]
    fn explicit_order_one_is_kept_distinct_from_default() {
        let plan = form_plan(&[stage("pre", 1), stage("a", 0)]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].order, 1);
        assert_eq!(plan[1].order, 2);
    }

    #[test]
    fn waves_are_ascending_and_group_same_order() {
        let plan = form_plan(&[stage("a", 3), stage("b", 1), stage("c", 3)]);
        let orders: Vec<i64> = plan.iter().map(|w| w.order).collect();
        assert_eq!(orders, vec![1, 3]);
        assert_eq!(plan[1].stages.len(), 2);
    }
}
