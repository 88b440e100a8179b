#[cfg(test)]
mod tests {
    use taskvault::context::AppContext;
    use taskvault::libs::config::StorageConfig;
    use taskvault::libs::error::{ErrorKind, StorageError};
    use taskvault::libs::events::TaskEvent;
    use taskvault::libs::task::{CreateTaskInput, TaskStatus, TaskType, TaskUpdate};
    use taskvault::ops::task_operations::TaskOperations;
    use tempfile::TempDir;
    use test_context::{test_context, AsyncTestContext};

    struct HierarchyTestContext {
        app: AppContext,
        _temp_dir: TempDir,
    }

    impl AsyncTestContext for HierarchyTestContext {
        async fn setup() -> Self {
            let temp_dir = tempfile::tempdir().unwrap();
            let app = AppContext::initialize(StorageConfig::in_dir(temp_dir.path())).await.unwrap();
            HierarchyTestContext { app, _temp_dir: temp_dir }
        }

        async fn teardown(self) {
            self.app.shutdown();
        }
    }

    impl HierarchyTestContext {
        fn ops(&self) -> &TaskOperations {
            self.app.operations()
        }

        async fn status(&self, path: &str) -> TaskStatus {
            self.app.storage().require_task(path).await.unwrap().status
        }

        async fn set(&self, path: &str, status: TaskStatus) {
            self.ops().update_task(path, &TaskUpdate::status(status)).await.unwrap();
        }
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_child_in_progress_promotes_parent(ctx: &mut HierarchyTestContext) {
        ctx.ops()
            .create_task(&CreateTaskInput::new("p", "Parent").with_type(TaskType::Group))
            .await
            .unwrap();
        let child = ctx.ops().create_task(&CreateTaskInput::new("p/c", "Child")).await.unwrap();
        assert_eq!(child.parent_path.as_deref(), Some("p"));
        let parent = ctx.app.storage().require_task("p").await.unwrap();
        assert_eq!(parent.subtasks, vec!["p/c".to_string()]);

        let outcome = ctx
            .ops()
            .update_task("p/c", &TaskUpdate::status(TaskStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(outcome.cascaded.len(), 1);
        assert_eq!(ctx.status("p").await, TaskStatus::InProgress);
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_last_completed_child_completes_parent(ctx: &mut HierarchyTestContext) {
        ctx.ops()
            .create_task(&CreateTaskInput::new("p", "Parent").with_type(TaskType::Group))
            .await
            .unwrap();
        for path in ["p/c1", "p/c2"] {
            ctx.ops().create_task(&CreateTaskInput::new(path, path)).await.unwrap();
            ctx.set(path, TaskStatus::InProgress).await;
        }

        ctx.set("p/c1", TaskStatus::Completed).await;
        assert_eq!(ctx.status("p").await, TaskStatus::InProgress);

        ctx.set("p/c2", TaskStatus::Completed).await;
        assert_eq!(ctx.status("p").await, TaskStatus::Completed);
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_failed_dependency_blocks_dependent(ctx: &mut HierarchyTestContext) {
        ctx.ops().create_task(&CreateTaskInput::new("b", "B")).await.unwrap();
        ctx.ops()
            .create_task(&CreateTaskInput::new("a", "A").with_dependencies(&["b"]))
            .await
            .unwrap();

        ctx.set("b", TaskStatus::InProgress).await;
        ctx.set("b", TaskStatus::Failed).await;

        let a = ctx.app.storage().require_task("a").await.unwrap();
        assert_eq!(a.status, TaskStatus::Blocked);
        assert_eq!(a.metadata.blocked_by.as_deref(), Some("b"));
        assert!(a.metadata.block_reason.is_some());

        // Recovering the dependency and completing it unblocks the dependent.
        ctx.set("b", TaskStatus::Pending).await;
        ctx.set("b", TaskStatus::InProgress).await;
        ctx.set("b", TaskStatus::Completed).await;
        let a = ctx.app.storage().require_task("a").await.unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert!(a.metadata.blocked_by.is_none());
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_reverse_dependency_is_rejected(ctx: &mut HierarchyTestContext) {
        ctx.ops().create_task(&CreateTaskInput::new("b", "B")).await.unwrap();
        ctx.ops()
            .create_task(&CreateTaskInput::new("a", "A").with_dependencies(&["b"]))
            .await
            .unwrap();
        let before = ctx.app.storage().require_task("b").await.unwrap();

        let err = ctx
            .ops()
            .update_task("b", &TaskUpdate::dependencies(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CircularDependency { .. }), "got {err:?}");
        assert_eq!(err.kind(), ErrorKind::CircularDependency);
        assert!(err.hint().is_some());

        ctx.app.storage().clear_cache();
        let after = ctx.app.storage().require_task("b").await.unwrap();
        assert_eq!(after, before);
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_invalid_transition_is_rejected(ctx: &mut HierarchyTestContext) {
        ctx.ops().create_task(&CreateTaskInput::new("t", "T")).await.unwrap();
        let err = ctx
            .ops()
            .update_task("t", &TaskUpdate::status(TaskStatus::Completed))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatusTransition);
        let external = err.to_external();
        assert!(external.hint.unwrap().contains("IN_PROGRESS"));
        assert_eq!(ctx.status("t").await, TaskStatus::Pending);
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_every_update_bumps_version_by_one(ctx: &mut HierarchyTestContext) {
        let created = ctx.ops().create_task(&CreateTaskInput::new("v", "V")).await.unwrap();
        assert_eq!(created.metadata.version, 1);

        let mut last = created;
        let updates = [
            TaskUpdate::status(TaskStatus::InProgress),
            TaskUpdate {
                reasoning: Some("picked the simpler design".into()),
                ..Default::default()
            },
            TaskUpdate::status(TaskStatus::Completed),
        ];
        for update in &updates {
            let outcome = ctx.ops().update_task("v", update).await.unwrap();
            assert_eq!(outcome.task.metadata.version, last.metadata.version + 1);
            assert!(outcome.task.metadata.updated >= last.metadata.updated);
            last = outcome.task;
        }
        ctx.app.storage().clear_cache();
        assert_eq!(ctx.app.storage().require_task("v").await.unwrap().metadata.version, 4);
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_events_follow_commit(ctx: &mut HierarchyTestContext) {
        let mut events = ctx.app.storage().subscribe();
        ctx.ops()
            .create_task(&CreateTaskInput::new("p", "Parent").with_type(TaskType::Group))
            .await
            .unwrap();
        ctx.ops().create_task(&CreateTaskInput::new("p/c", "Child")).await.unwrap();

        assert!(matches!(events.try_recv().unwrap(), TaskEvent::Created { ref task } if task.path == "p"));
        assert!(matches!(events.try_recv().unwrap(), TaskEvent::Created { ref task } if task.path == "p/c"));
        assert!(matches!(events.try_recv().unwrap(), TaskEvent::Updated { ref task } if task.path == "p"));
        assert!(events.try_recv().is_err());

        ctx.set("p/c", TaskStatus::InProgress).await;
        let mut changed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::StatusChanged { path, from, to } = event {
                changed.push((path, from, to));
            }
        }
        assert_eq!(
            changed,
            vec![
                ("p/c".to_string(), TaskStatus::Pending, TaskStatus::InProgress),
                ("p".to_string(), TaskStatus::Pending, TaskStatus::InProgress),
            ]
        );

        // A rejected update publishes nothing.
        assert!(ctx
            .ops()
            .update_task("p/c", &TaskUpdate::status(TaskStatus::Pending))
            .await
            .is_err());
        assert!(events.try_recv().is_err());
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_deleting_blocker_releases_dependent(ctx: &mut HierarchyTestContext) {
        for path in ["b", "c"] {
            ctx.ops().create_task(&CreateTaskInput::new(path, path)).await.unwrap();
        }
        ctx.ops()
            .create_task(&CreateTaskInput::new("a", "A").with_dependencies(&["b", "c"]))
            .await
            .unwrap();
        for path in ["b", "c"] {
            ctx.set(path, TaskStatus::InProgress).await;
            ctx.set(path, TaskStatus::Failed).await;
        }
        let a = ctx.app.storage().require_task("a").await.unwrap();
        assert_eq!(a.metadata.blocked_by.as_deref(), Some("c"));

        // Deleting a failed dependency that is not the recorded blocker
        // leaves the block alone.
        ctx.ops().delete_task("b").await.unwrap();
        let a = ctx.app.storage().require_task("a").await.unwrap();
        assert_eq!(a.status, TaskStatus::Blocked);
        assert_eq!(a.metadata.blocked_by.as_deref(), Some("c"));
        assert_eq!(a.dependencies, vec!["c".to_string()]);

        ctx.ops().delete_task("c").await.unwrap();
        ctx.app.storage().clear_cache();
        let a = ctx.app.storage().require_task("a").await.unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert!(a.dependencies.is_empty());
        assert!(a.metadata.blocked_by.is_none());
        assert!(a.metadata.block_reason.is_none());
        assert!(a.metadata.unblocked_at.is_some());
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_deleting_blocker_moves_block_to_remaining_dependency(ctx: &mut HierarchyTestContext) {
        for path in ["b", "c"] {
            ctx.ops().create_task(&CreateTaskInput::new(path, path)).await.unwrap();
        }
        ctx.ops()
            .create_task(&CreateTaskInput::new("a", "A").with_dependencies(&["b", "c"]))
            .await
            .unwrap();
        ctx.set("c", TaskStatus::InProgress).await;
        ctx.set("c", TaskStatus::Blocked).await;
        ctx.set("b", TaskStatus::InProgress).await;
        ctx.set("b", TaskStatus::Failed).await;
        assert_eq!(
            ctx.app.storage().require_task("a").await.unwrap().metadata.blocked_by.as_deref(),
            Some("b")
        );

        ctx.ops().delete_task("b").await.unwrap();
        let a = ctx.app.storage().require_task("a").await.unwrap();
        assert_eq!(a.status, TaskStatus::Blocked);
        assert_eq!(a.metadata.blocked_by.as_deref(), Some("c"));
        assert!(a.metadata.block_reason.is_none());
    }

    #[test_context(HierarchyTestContext)]
    #[tokio::test]
    async fn test_delete_detaches_from_parent(ctx: &mut HierarchyTestContext) {
        ctx.ops()
            .create_task(&CreateTaskInput::new("p", "Parent").with_type(TaskType::Milestone))
            .await
            .unwrap();
        ctx.ops().create_task(&CreateTaskInput::new("p/a", "A")).await.unwrap();
        ctx.ops()
            .create_task(&CreateTaskInput::new("p/b", "B").with_dependencies(&["p/a"]))
            .await
            .unwrap();

        let removed = ctx.ops().delete_task("p/a").await.unwrap();
        assert_eq!(removed.len(), 1);
        let parent = ctx.app.storage().require_task("p").await.unwrap();
        assert_eq!(parent.subtasks, vec!["p/b".to_string()]);
        assert!(ctx.app.storage().require_task("p/b").await.unwrap().dependencies.is_empty());

        assert!(matches!(
            ctx.ops().delete_task("p/a").await,
            Err(StorageError::TaskNotFound(_))
        ));
    }
}
