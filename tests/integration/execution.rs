//! Execution tests: retries, rollbacks, cascading skips and group isolation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use stagewise::core::{Complexity, TaskFile, TaskId};
use stagewise::orchestration::{
    ExecutorSettings, GroupStatus, SkipReason, TaskOutcome, TaskPhase,
};
use stagewise::{plan, TaskError};

use super::fixtures::{low, task, Call, Workspace};

fn settings() -> ExecutorSettings {
    ExecutorSettings {
        max_iterations: 3,
        collaborator_timeout: None,
    }
}

/// Two verification failures, then a pass on the third attempt.
#[tokio::test]
async fn test_scenario_d_retry_then_complete() {
    let ws = Arc::new(Workspace::new().fail_verify("d", 2));
    let plan = plan(vec![low("d").touches("lib.rs")], 8).unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    assert!(report.success());
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].attempts, 2);
    assert_eq!(report.completed[0].commit_id, "commit-d");

    let execution = report.execution(&"d".into()).unwrap();
    assert_eq!(execution.transitions_to(TaskPhase::RollingBack), 2);
    assert_eq!(execution.transitions_to(TaskPhase::Analyzing), 3);
    assert_eq!(ws.commits(), vec![TaskId::from("d")]);
    assert_eq!(ws.count(|c| matches!(c, Call::Revert(_))), 2);
}

/// Three verification failures exhaust the budget without a commit.
#[tokio::test]
async fn test_scenario_e_retry_budget_exhausted() {
    let ws = Arc::new(Workspace::new().fail_verify("e", 3));
    let plan = plan(vec![low("e").touches("lib.rs")], 8).unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    assert!(!report.success());
    let failure = report.failure(&"e".into()).unwrap();
    assert_eq!(failure.attempts, 3);
    assert!(matches!(failure.reason, TaskError::Verification(_)));

    let execution = report.execution(&"e".into()).unwrap();
    assert_eq!(execution.rollbacks(), 3);
    assert!(ws.commits().is_empty());
    assert_eq!(ws.count(|c| matches!(c, Call::Commit(_))), 0);
}

#[tokio::test]
async fn test_attempts_never_exceed_max_iterations() {
    for max_iterations in 1..=4 {
        let ws = Arc::new(Workspace::new().fail_verify("t", 10));
        let plan = plan(vec![low("t")], 8).unwrap();
        let report = ws
            .orchestrator(ExecutorSettings {
                max_iterations,
                collaborator_timeout: None,
            })
            .execute(&plan, CancellationToken::new())
            .await;

        let failure = report.failure(&"t".into()).unwrap();
        assert_eq!(failure.attempts, max_iterations);
        assert_eq!(ws.count(|c| matches!(c, Call::Verify(_))), max_iterations as usize);
    }
}

#[tokio::test]
async fn test_attempts_in_task_file_do_not_shorten_retries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    std::fs::write(
        &path,
        r#"{"tasks": [{"id": "a", "title": "A", "complexity": "low", "attempts": 7}]}"#,
    )
    .unwrap();
    let ws = Arc::new(Workspace::new().fail_verify("a", 10));
    let plan = plan(TaskFile::load(&path).unwrap(), 8).unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    let failure = report.failure(&"a".into()).unwrap();
    assert_eq!(failure.attempts, 3);
    let execution = report.execution(&"a".into()).unwrap();
    assert_eq!(execution.rollbacks(), 3);
}

/// Every Analyzing step after a rollback sees the pre-mutation content.
#[tokio::test]
async fn test_rollback_restores_pre_mutation_state() {
    let ws = Arc::new(
        Workspace::new()
            .with_file("auth.go", "v0")
            .fail_verify("fix", 2),
    );
    let plan = plan(vec![low("fix").touches("auth.go").touches("auth_test.go")], 8).unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;
    assert!(report.success());

    let contexts = ws.contexts_for("fix");
    assert_eq!(contexts.len(), 3);
    for context in &contexts {
        assert_eq!(context.resources["auth.go"], Some("v0".to_string()));
        assert_eq!(context.resources["auth_test.go"], None);
    }
    assert_eq!(ws.committed("auth.go").as_deref(), Some("fix#3"));
    assert_eq!(ws.committed("auth_test.go").as_deref(), Some("fix#3"));
}

/// Writers of a shared resource run one after the other.
#[tokio::test]
async fn test_scenario_c_conflicting_tasks_serialize() {
    let ws = Arc::new(Workspace::new().with_file("auth.go", "v0"));
    let plan = plan(
        vec![low("x").touches("auth.go"), low("y").touches("auth.go")],
        8,
    )
    .unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;
    assert!(report.success());

    let x_commit = ws.position(&Call::Commit("x".into())).unwrap();
    let y_start = ws.position(&Call::Analyze("y".into())).unwrap();
    assert!(x_commit < y_start);
    assert_eq!(
        ws.contexts_for("y")[0].resources["auth.go"].as_deref(),
        Some("x#1")
    );
    assert_eq!(ws.committed("auth.go").as_deref(), Some("y#1"));
}

/// No task starts analyzing before all of its dependencies committed.
#[tokio::test]
async fn test_dependencies_commit_before_dependents_start() {
    let tasks = vec![
        task("schema", Complexity::High).touches("schema.sql"),
        task("model", Complexity::Medium).depends_on("schema"),
        task("seed", Complexity::Low).touches("schema.sql"),
        task("api", Complexity::Medium).depends_on("model").touches("api.rs"),
        task("docs", Complexity::Low),
        task("client", Complexity::High).touches("api.rs"),
    ];
    let ws = Arc::new(Workspace::new().fail_verify("model", 1));
    let plan = plan(tasks, 4).unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;
    assert!(report.success());
    assert_eq!(report.completed.len(), 6);

    for t in plan.graph().tasks() {
        let start = ws.position(&Call::Analyze(t.id.clone())).unwrap();
        for dep in plan.graph().dependencies(&t.id) {
            let done = ws.position(&Call::Commit(dep.clone())).unwrap();
            assert!(done < start, "{} started before {} committed", t.id, dep);
        }
    }
}

#[tokio::test]
async fn test_cascading_skip_names_blocking_dependency() {
    let ws = Arc::new(Workspace::new().fail_verify("base", 5));
    let plan = plan(
        vec![
            low("base"),
            low("mid").depends_on("base"),
            low("leaf").depends_on("mid"),
            low("other"),
            low("after-other").depends_on("other"),
        ],
        8,
    )
    .unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    assert_eq!(report.total(), 5);
    assert!(report.is_completed(&"other".into()));
    assert!(report.is_completed(&"after-other".into()));
    assert!(report.failure(&"base".into()).is_some());

    let mid = report.skip(&"mid".into()).unwrap();
    assert_eq!(
        mid.reason,
        SkipReason::DependencyFailed {
            dependency: "base".into()
        }
    );
    assert_eq!(mid.blocked_by, Some(TaskId::from("base")));
    assert_eq!(
        report.skip(&"leaf".into()).unwrap().blocked_by,
        Some(TaskId::from("mid"))
    );

    // skipped tasks are never handed to a collaborator
    assert_eq!(ws.position(&Call::Analyze("mid".into())), None);
    assert_eq!(ws.position(&Call::Analyze("leaf".into())), None);
}

/// Entries are listed in input order regardless of stage.
#[tokio::test]
async fn test_report_lists_tasks_in_input_order() {
    let ws = Arc::new(Workspace::new());
    let plan = plan(
        vec![low("c").depends_on("a"), low("a"), low("b").depends_on("c")],
        8,
    )
    .unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    let ids: Vec<&str> = report.completed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
    assert_eq!(report.stage_timeline.len(), 3);
}

#[tokio::test]
async fn test_mutation_error_consumes_an_attempt() {
    let ws = Arc::new(Workspace::new().with_file("a.txt", "v0").fail_mutate("m", 1));
    let plan = plan(vec![low("m").touches("a.txt")], 8).unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    assert_eq!(report.completed[0].attempts, 1);
    assert_eq!(ws.count(|c| matches!(c, Call::Verify(_))), 1);
    assert_eq!(ws.contexts_for("m")[1].resources["a.txt"].as_deref(), Some("v0"));
}

#[tokio::test]
async fn test_persistent_mutation_error_fails_task() {
    let ws = Arc::new(Workspace::new().fail_mutate("m", 10));
    let plan = plan(vec![low("m")], 8).unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    let failure = report.failure(&"m".into()).unwrap();
    assert!(matches!(failure.reason, TaskError::Mutation(_)));
    assert_eq!(failure.attempts, 3);
    assert_eq!(ws.count(|c| matches!(c, Call::Verify(_))), 0);
}

#[tokio::test]
async fn test_analysis_error_is_not_retried() {
    let ws = Arc::new(Workspace::new().fail_analysis("bad"));
    let plan = plan(vec![low("bad"), low("next").depends_on("bad")], 8).unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    let failure = report.failure(&"bad".into()).unwrap();
    assert!(matches!(failure.reason, TaskError::Analysis(_)));
    assert_eq!(failure.attempts, 0);
    assert_eq!(ws.count(|c| matches!(c, Call::Analyze(_))), 1);
    assert_eq!(ws.count(|c| matches!(c, Call::Revert(_))), 0);
    assert!(report.skip(&"next".into()).is_some());
}

#[tokio::test]
async fn test_commit_error_rolls_back_and_retries() {
    let ws = Arc::new(Workspace::new().with_file("a.txt", "v0").fail_commit("c"));
    let plan = plan(vec![low("c").touches("a.txt")], 8).unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    let failure = report.failure(&"c".into()).unwrap();
    assert!(matches!(failure.reason, TaskError::Commit(_)));
    assert_eq!(failure.attempts, 3);
    assert_eq!(ws.count(|c| matches!(c, Call::Commit(_))), 3);
    assert_eq!(ws.working("a.txt").as_deref(), Some("v0"));
}

/// A failed rollback halts its own group and leaves other groups running.
#[tokio::test]
async fn test_rollback_failure_is_isolated_to_its_group() {
    let ws = Arc::new(
        Workspace::new()
            .fail_verify("a", 1)
            .fail_revert_of("locked.txt"),
    );
    // budget 2 with Medium tasks puts every task in its own group
    let plan = plan(
        vec![
            task("a", Complexity::Medium).touches("locked.txt"),
            task("b", Complexity::Medium),
            task("a2", Complexity::Medium).depends_on("a"),
            task("b2", Complexity::Medium).depends_on("b"),
        ],
        2,
    )
    .unwrap();
    assert_eq!(plan.stages()[0].groups.len(), 2);

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    let failure = report.failure(&"a".into()).unwrap();
    assert!(matches!(failure.reason, TaskError::RollbackFailed(_)));
    assert_eq!(failure.attempts, 1);
    assert!(report.is_completed(&"b".into()));
    assert!(report.is_completed(&"b2".into()));
    assert_eq!(
        report.skip(&"a2".into()).unwrap().blocked_by,
        Some(TaskId::from("a"))
    );

    let first = &report.stage_timeline[0];
    let statuses: Vec<GroupStatus> = first.groups.values().copied().collect();
    assert_eq!(statuses, vec![GroupStatus::Halted, GroupStatus::Completed]);
}

/// In a parallel group, siblings of a failed rollback never commit.
#[tokio::test]
async fn test_rollback_failure_halts_parallel_siblings() {
    let ws = Arc::new(
        Workspace::new()
            .fail_verify("a", 1)
            .fail_revert_of("locked.txt")
            .slow("b", Duration::from_secs(5))
            .slow("c", Duration::from_secs(5)),
    );
    let plan = plan(
        vec![low("a").touches("locked.txt"), low("b"), low("c")],
        8,
    )
    .unwrap();

    let report = ws
        .orchestrator(settings())
        .execute(&plan, CancellationToken::new())
        .await;

    assert!(matches!(
        report.failure(&"a".into()).unwrap().reason,
        TaskError::RollbackFailed(_)
    ));
    for id in ["b", "c"] {
        let id = TaskId::from(id);
        assert!(!report.is_completed(&id));
        let execution = report.execution(&id).unwrap();
        match &execution.outcome {
            TaskOutcome::Failed { error } => {
                assert_eq!(error, &TaskError::Halted { by: "a".into() });
                // interrupted work is still rolled back
                assert_eq!(execution.rollbacks(), 1);
            }
            TaskOutcome::Skipped { reason } => {
                assert_eq!(reason, &SkipReason::GroupHalted { by: "a".into() });
            }
            TaskOutcome::Completed { .. } => panic!("{id} must not complete"),
        }
    }
    assert!(ws.commits().is_empty());
    assert_eq!(
        report.stage_timeline[0].groups.values().next(),
        Some(&GroupStatus::Halted)
    );
}
