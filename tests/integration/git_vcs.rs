//! End-to-end runs with the local collaborators against a real repository.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use stagewise::core::{Complexity, Task, TaskFile};
use stagewise::git::GitVcs;
use stagewise::orchestration::{
    Collaborators, CommandMutator, CommandVerifier, ExecutorSettings, FileAnalyzer, Orchestrator,
};
use stagewise::{plan, TaskError};

use super::fixtures::TestRepo;

fn local_orchestrator(repo: &TestRepo, mutate: &str, verify: &str) -> Orchestrator {
    let collaborators = Collaborators::new(
        Arc::new(FileAnalyzer::new(&repo.path)),
        Arc::new(CommandMutator::new(mutate, &repo.path)),
        Arc::new(CommandVerifier::new(verify, &repo.path)),
        Arc::new(GitVcs::new(&repo.path).unwrap()),
    );
    Orchestrator::new(collaborators, ExecutorSettings::default())
}

#[tokio::test]
async fn test_verify_failure_is_reverted_then_committed() {
    let repo = TestRepo::with_files(&[("greeting.txt", "hello\n")]);
    let orchestrator = local_orchestrator(
        &repo,
        "printf 'hello %s\\n' \"$STAGEWISE_ATTEMPT\" > greeting.txt",
        "grep -q 'hello 2' greeting.txt",
    );
    let plan = plan(vec![Task::new("greet", "Update greeting").touches("greeting.txt")], 8).unwrap();

    let report = orchestrator.execute(&plan, CancellationToken::new()).await;

    assert!(report.success(), "{:?}", report.failed);
    assert_eq!(report.completed[0].attempts, 1);
    assert_eq!(repo.read("greeting.txt").as_deref(), Some("hello 2\n"));
    assert_eq!(repo.head_message(), "greet: Update greeting");
    assert_eq!(repo.commit_count(), 2);
    assert_eq!(
        report.completed[0].commit_id,
        GitVcs::new(&repo.path).unwrap().head_commit().unwrap()
    );
}

#[tokio::test]
async fn test_exhausted_task_leaves_repository_untouched() {
    let repo = TestRepo::with_files(&[("config.ini", "debug=false\n")]);
    let orchestrator = local_orchestrator(
        &repo,
        "echo 'debug=true' > config.ini && echo scratch > notes.txt",
        "echo 'checks failed' && false",
    );
    let plan = plan(
        vec![Task::new("cfg", "Enable debug")
            .touches("config.ini")
            .touches("notes.txt")],
        8,
    )
    .unwrap();

    let report = orchestrator.execute(&plan, CancellationToken::new()).await;

    let failure = report.failure(&"cfg".into()).unwrap();
    assert_eq!(failure.attempts, 3);
    assert_eq!(
        failure.reason,
        TaskError::Verification("checks failed".to_string())
    );
    assert_eq!(repo.read("config.ini").as_deref(), Some("debug=false\n"));
    assert_eq!(repo.read("notes.txt"), None);
    assert_eq!(repo.commit_count(), 1);
    assert!(!GitVcs::new(&repo.path).unwrap().is_dirty().unwrap());
}

#[tokio::test]
async fn test_dependent_tasks_commit_in_order() {
    let repo = TestRepo::with_files(&[("log.txt", "")]);
    let dir = tempfile::tempdir().unwrap();
    let tasks_path = dir.path().join("tasks.toml");
    std::fs::write(
        &tasks_path,
        r#"
[[tasks]]
id = "first"
title = "Append first"
complexity = "low"
resource_touches = ["log.txt"]

[[tasks]]
id = "second"
title = "Append second"
complexity = "low"
resource_touches = ["log.txt"]
"#,
    )
    .unwrap();

    let orchestrator = local_orchestrator(
        &repo,
        "echo \"$STAGEWISE_TASK_ID\" >> log.txt",
        "test -s log.txt",
    );
    let plan = plan(TaskFile::load(&tasks_path).unwrap(), 8).unwrap();
    assert_eq!(plan.stages().len(), 2);

    let report = orchestrator.execute(&plan, CancellationToken::new()).await;

    assert!(report.success());
    assert_eq!(repo.read("log.txt").as_deref(), Some("first\nsecond\n"));
    assert_eq!(repo.commit_count(), 3);
    assert_eq!(repo.head_message(), "second: Append second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_group_commits_every_task() {
    for _ in 0..5 {
        let repo = TestRepo::with_files(&[("README.md", "readme\n")]);
        let orchestrator = local_orchestrator(
            &repo,
            "echo \"$STAGEWISE_TASK_ID\" > \"$STAGEWISE_TASK_ID.txt\"",
            "true",
        );
        let tasks = (0..8)
            .map(|n| {
                Task::new(format!("t{n}"), "Write file")
                    .with_complexity(Complexity::Low)
                    .touches(&format!("t{n}.txt"))
            })
            .collect();
        let plan = plan(tasks, 8).unwrap();
        assert_eq!(plan.stages().len(), 1);
        assert_eq!(plan.stages()[0].groups.len(), 1);

        let report = orchestrator.execute(&plan, CancellationToken::new()).await;

        assert!(report.success(), "{:?}", report.failed);
        assert_eq!(report.completed.len(), 8);
        for n in 0..8 {
            assert!(repo.head_contains(&format!("t{n}.txt")), "t{n}.txt missing from HEAD");
        }
        assert_eq!(repo.commit_count(), 9);
        assert!(!GitVcs::new(&repo.path).unwrap().is_dirty().unwrap());
    }
}
