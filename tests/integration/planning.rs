//! Planning tests: stage structure, cycle detection, budgets and determinism.

use stagewise::core::{Complexity, DependencyKind, Task, TaskGraph, TaskId};
use stagewise::orchestration::{BatchPlanner, ExecutionMode};
use stagewise::{plan, Error};

use super::fixtures::{low, task};

/// Independent tasks of weight 1, 2 and 4 share one parallel group.
#[test]
fn test_scenario_a_single_parallel_group() {
    let plan = plan(
        vec![
            task("a", Complexity::Low),
            task("b", Complexity::Medium),
            task("c", Complexity::High),
        ],
        8,
    )
    .unwrap();

    assert_eq!(plan.stages().len(), 1);
    let groups = &plan.stages()[0].groups;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].mode, ExecutionMode::Parallel);
    assert_eq!(groups[0].cost, 7);
    assert_eq!(groups[0].len(), 3);
}

/// An explicit dependency yields two single-task sequential stages.
#[test]
fn test_scenario_b_dependency_makes_two_stages() {
    let plan = plan(vec![low("a"), low("b").depends_on("a")], 8).unwrap();

    assert_eq!(plan.stages().len(), 2);
    for (stage, expected) in plan.stages().iter().zip(["a", "b"]) {
        assert_eq!(stage.groups.len(), 1);
        assert_eq!(stage.groups[0].task_ids, vec![TaskId::from(expected)]);
        assert_eq!(stage.groups[0].mode, ExecutionMode::Sequential);
    }
}

/// Shared resources synthesize an edge in input order.
#[test]
fn test_scenario_c_resource_conflict_edge() {
    let plan = plan(
        vec![low("x").touches("auth.go"), low("y").touches("auth.go")],
        8,
    )
    .unwrap();

    let kind = plan
        .graph()
        .dependency_kind(&"x".into(), &"y".into())
        .cloned();
    assert_eq!(
        kind,
        Some(DependencyKind::ResourceConflict {
            resource: "auth.go".to_string()
        })
    );
    assert_eq!(plan.locate(&"x".into()).map(|(s, _)| s), Some(1));
    assert_eq!(plan.locate(&"y".into()).map(|(s, _)| s), Some(2));
}

#[test]
fn test_cycle_through_explicit_edges_is_rejected() {
    let err = plan(
        vec![
            low("a").depends_on("c"),
            low("b").depends_on("a"),
            low("c").depends_on("b"),
        ],
        8,
    )
    .unwrap_err();

    match err {
        Error::Cycle { task, path } => {
            assert!(["a", "b", "c"].contains(&task.as_str()));
            assert!(path.contains(&task));
            assert_eq!(path.first(), path.last());
        }
        other => panic!("expected cycle error, got {other}"),
    }
}

/// `y` explicitly precedes `x`, but `x` comes first in input order and both
/// touch the same file, so the synthesized edge closes a cycle.
#[test]
fn test_cycle_through_resource_edge_is_rejected() {
    let result = plan(
        vec![
            low("x").touches("db.sql").depends_on("y"),
            low("y").touches("db.sql"),
        ],
        8,
    );
    assert!(matches!(result, Err(Error::Cycle { .. })));
}

#[test]
fn test_unknown_dependency_is_rejected() {
    let result = plan(vec![low("a").depends_on("ghost")], 8);
    assert!(matches!(
        result,
        Err(Error::UnknownDependency { dependency, .. }) if dependency.as_str() == "ghost"
    ));
}

#[test]
fn test_duplicate_task_is_rejected() {
    let result = plan(vec![low("a"), low("a")], 8);
    assert!(matches!(result, Err(Error::DuplicateTask(id)) if id.as_str() == "a"));
}

/// Every group respects the budget unless it holds a single oversized task.
#[test]
fn test_budget_respected_across_mixed_workload() {
    let complexities = [Complexity::High, Complexity::Medium, Complexity::Low];
    let mut tasks: Vec<Task> = (0..24)
        .map(|i| task(&format!("t{i}"), complexities[i % 3]))
        .collect();
    // a second layer that depends on every third task of the first one
    for i in 0..8 {
        tasks.push(task(&format!("u{i}"), Complexity::High).depends_on(format!("t{}", i * 3).as_str()));
    }

    for budget in [1, 3, 4, 5, 8, 13] {
        let plan = plan(tasks.clone(), budget).unwrap();
        assert_eq!(plan.task_count(), tasks.len());
        for stage in plan.stages() {
            for group in &stage.groups {
                let weight: u32 = group
                    .task_ids
                    .iter()
                    .map(|id| plan.task(id).unwrap().weight())
                    .sum();
                assert_eq!(weight, group.cost);
                assert!(
                    group.cost <= budget || group.len() == 1,
                    "group {} costs {} over budget {}",
                    group.id,
                    group.cost,
                    budget
                );
            }
        }
    }
}

#[test]
fn test_planning_is_deterministic() {
    let tasks = vec![
        task("schema", Complexity::High).touches("db/schema.sql"),
        task("model", Complexity::Medium).depends_on("schema"),
        task("api", Complexity::Medium).depends_on("model").touches("api.rs"),
        task("docs", Complexity::Low),
        task("lint", Complexity::Low).touches("api.rs"),
        task("seed", Complexity::High).touches("db/schema.sql"),
    ];

    let first = plan(tasks.clone(), 4).unwrap();
    let second = plan(tasks, 4).unwrap();
    assert_eq!(first.stages(), second.stages());
    assert_eq!(first.graph().edges(), second.graph().edges());
}

/// Each stage only holds tasks whose dependencies sit in earlier stages.
#[test]
fn test_stages_respect_dependencies() {
    let plan = plan(
        vec![
            low("a"),
            low("b").depends_on("a"),
            low("c").depends_on("a").touches("f"),
            low("d").depends_on("b").touches("f"),
            low("e"),
        ],
        8,
    )
    .unwrap();

    for id in ["a", "b", "c", "d", "e"] {
        let id = TaskId::from(id);
        let (stage, _) = plan.locate(&id).unwrap();
        for dep in plan.graph().dependencies(&id) {
            let (dep_stage, _) = plan.locate(&dep).unwrap();
            assert!(dep_stage < stage, "{dep} must be planned before {id}");
        }
    }
    assert_eq!(plan.stages().len(), 3);
}

#[test]
fn test_planner_accepts_shared_graph() {
    let graph = TaskGraph::build(vec![low("a"), low("b")]).unwrap();
    let planner = BatchPlanner::default();
    let plan = planner.plan(graph).unwrap();
    assert_eq!(plan.max_batch_cost(), 8);
    assert_eq!(plan.stages()[0].groups[0].cost, 2);
}
