#[cfg(test)]
mod tests {
    use std::time::Duration;
    use taskvault::context::AppContext;
    use taskvault::libs::config::StorageConfig;
    use taskvault::libs::error::StorageError;
    use taskvault::libs::task::{Task, TaskStatus, TaskType, TaskUpdate};
    use tempfile::TempDir;
    use test_context::{test_context, AsyncTestContext};

    struct StorageTestContext {
        app: AppContext,
        _temp_dir: TempDir,
    }

    impl AsyncTestContext for StorageTestContext {
        async fn setup() -> Self {
            let temp_dir = tempfile::tempdir().unwrap();
            let app = AppContext::initialize(StorageConfig::in_dir(temp_dir.path())).await.unwrap();
            StorageTestContext { app, _temp_dir: temp_dir }
        }

        async fn teardown(self) {
            self.app.shutdown();
        }
    }

    fn task(path: &str, task_type: TaskType) -> Task {
        let mut task = Task::new(path, path, task_type);
        task.parent_path = task.parent_from_path();
        task
    }

    #[test_context(StorageTestContext)]
    #[tokio::test]
    async fn test_task_crud_and_queries(ctx: &mut StorageTestContext) {
        let storage = ctx.app.storage();

        let mut parent = task("proj", TaskType::Group);
        parent.subtasks = vec!["proj/api".into(), "proj/ui".into()];
        let mut ui = task("proj/ui", TaskType::Task);
        ui.dependencies = vec!["proj/api".into()];
        storage.create_task(&parent).await.unwrap();
        storage.create_task(&task("proj/api", TaskType::Task)).await.unwrap();
        storage.create_task(&ui).await.unwrap();
        storage.create_task(&task("other", TaskType::Task)).await.unwrap();

        let fetched = storage.require_task("proj/ui").await.unwrap();
        assert_eq!(fetched.dependencies, vec!["proj/api".to_string()]);
        assert_eq!(fetched.parent_path.as_deref(), Some("proj"));

        assert_eq!(storage.get_tasks_by_pattern("proj/*").await.unwrap().len(), 2);
        assert_eq!(storage.get_subtasks("proj").await.unwrap().len(), 2);
        assert_eq!(storage.get_tasks_by_status(TaskStatus::Pending).await.unwrap().len(), 4);
        assert_eq!(storage.get_tasks(&["other".into(), "proj".into()]).await.unwrap().len(), 2);
        let dependents = storage.get_dependent_tasks("proj/api").await.unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].path, "proj/ui");

        let updated = storage
            .update_task(
                "other",
                &TaskUpdate {
                    description: Some("details".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.metadata.version, 2);
        storage.clear_cache();
        let reread = storage.require_task("other").await.unwrap();
        assert_eq!(reread.description.as_deref(), Some("details"));
        assert_eq!(reread.metadata.version, 2);

        assert!(matches!(
            storage.update_task("missing", &TaskUpdate::default()).await,
            Err(StorageError::TaskNotFound(_))
        ));
        assert!(storage.get_task("missing").await.unwrap().is_none());
    }

    #[test_context(StorageTestContext)]
    #[tokio::test]
    async fn test_delete_removes_subtree_and_detaches_references(ctx: &mut StorageTestContext) {
        let storage = ctx.app.storage();
        let mut root = task("root", TaskType::Group);
        root.subtasks = vec!["root/g".into()];
        let mut group = task("root/g", TaskType::Group);
        group.subtasks = vec!["root/g/leaf".into()];
        let mut outside = task("outside", TaskType::Task);
        outside.dependencies = vec!["root/g/leaf".into()];
        storage
            .save_tasks(&[root, group, task("root/g/leaf", TaskType::Task), outside])
            .await
            .unwrap();

        let removed = storage.delete_task("root/g").await.unwrap();
        let paths: Vec<&str> = removed.iter().map(|t| t.path.as_str()).collect();
        assert_eq!(paths, vec!["root/g", "root/g/leaf"]);

        let root = storage.require_task("root").await.unwrap();
        assert!(root.subtasks.is_empty());
        assert_eq!(root.metadata.version, 2);
        let outside = storage.require_task("outside").await.unwrap();
        assert!(outside.dependencies.is_empty());
        assert!(storage.get_task("root/g/leaf").await.unwrap().is_none());
    }

    #[test_context(StorageTestContext)]
    #[tokio::test]
    async fn test_save_tasks_is_all_or_nothing(ctx: &mut StorageTestContext) {
        let storage = ctx.app.storage();
        let t1 = task("t1", TaskType::Task);
        let mut t2 = task("t2", TaskType::Task);
        t2.name = String::new();

        let err = storage.save_tasks(&[t1, t2]).await.unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)), "got {err:?}");
        assert!(storage.get_all_tasks().await.unwrap().is_empty());
        assert!(storage.get_task("t1").await.unwrap().is_none());
        assert_eq!(storage.transactions().active_count(), 0);
    }

    #[test_context(StorageTestContext)]
    #[tokio::test]
    async fn test_dropped_transaction_rolls_back(ctx: &mut StorageTestContext) {
        let storage = ctx.app.storage();
        let mut events = storage.subscribe();
        {
            let mut tx = storage.begin_transaction().await.unwrap();
            tx.insert_task(&task("draft", TaskType::Task)).unwrap();
            assert_eq!(tx.operations().len(), 1);
            assert!(tx.get_task("draft").unwrap().is_some());
        }
        assert!(storage.get_task("draft").await.unwrap().is_none());
        assert!(events.try_recv().is_err());

        let mut tx = storage.begin_transaction().await.unwrap();
        tx.insert_task(&task("kept", TaskType::Task)).unwrap();
        tx.commit().unwrap();
        assert_eq!(events.try_recv().unwrap().path(), "kept");
        assert!(storage.get_task("kept").await.unwrap().is_some());
    }

    #[test_context(StorageTestContext)]
    #[tokio::test]
    async fn test_repair_relationships(ctx: &mut StorageTestContext) {
        let storage = ctx.app.storage();
        let mut orphan = task("orphan", TaskType::Task);
        orphan.parent_path = Some("ghost".into());
        let mut a = task("a", TaskType::Task);
        a.dependencies = vec!["b".into(), "nowhere".into()];
        let mut b = task("b", TaskType::Task);
        b.dependencies = vec!["a".into()];
        let mut group = task("g", TaskType::Group);
        group.subtasks = vec!["g/gone".into()];
        storage.save_tasks(&[orphan, a, b, group]).await.unwrap();

        let dry = storage.repair_relationships(true).await.unwrap();
        assert!(dry.dry_run);
        assert_eq!(dry.repaired, 0);
        assert_eq!(dry.orphaned_parents, vec![("orphan".to_string(), "ghost".to_string())]);
        assert_eq!(dry.dangling_dependencies, vec![("a".to_string(), "nowhere".to_string())]);
        assert_eq!(dry.dangling_subtasks.len(), 1);
        assert_eq!(dry.broken_cycles.len(), 1);
        assert_eq!(storage.require_task("orphan").await.unwrap().parent_path.as_deref(), Some("ghost"));

        let fixed = storage.repair_relationships(false).await.unwrap();
        assert_eq!(fixed.issue_count(), dry.issue_count());
        assert!(fixed.repaired >= 3);
        assert!(storage.repair_relationships(true).await.unwrap().is_clean());
        assert!(storage.require_task("orphan").await.unwrap().parent_path.is_none());
    }

    #[test_context(StorageTestContext)]
    #[tokio::test]
    async fn test_metrics_and_maintenance(ctx: &mut StorageTestContext) {
        let storage = ctx.app.storage();
        let mut done = task("done", TaskType::Task);
        done.status = TaskStatus::Completed;
        let mut next = task("next", TaskType::Task);
        next.dependencies = vec!["done".into()];
        next.notes.progress.push("started".into());
        storage.save_tasks(&[done, next]).await.unwrap();

        storage.get_task("done").await.unwrap();
        storage.get_task("done").await.unwrap();

        let metrics = storage.get_metrics().await.unwrap();
        assert_eq!(metrics.database.total_tasks, 2);
        assert_eq!(metrics.database.by_status.get("COMPLETED"), Some(&1));
        assert_eq!(metrics.database.dependency_count, 1);
        assert_eq!(metrics.database.note_count, 1);
        assert_eq!(metrics.database.pragmas.journal_mode.to_lowercase(), "wal");
        assert!(metrics.database.integrity.ok);
        assert!(metrics.cache.hits >= 2);
        assert!(metrics.wal.enabled);
        assert!(metrics.pool.size <= 5);

        storage.checkpoint().await.unwrap();
        storage.analyze().await.unwrap();
        storage.vacuum().await.unwrap();
        assert!(storage.verify_integrity().await.unwrap().ok);
        assert!(storage.get_metrics().await.unwrap().wal.checkpoint_count >= 1);

        assert_eq!(storage.clear_all_tasks().await.unwrap(), 2);
        assert!(storage.get_task("done").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_entries_expire_after_ttl() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::in_dir(temp_dir.path());
        config.cache.ttl_ms = 50;
        let app = AppContext::initialize(config).await.unwrap();
        let storage = app.storage();

        storage.save_task(&task("hot", TaskType::Task)).await.unwrap();
        storage.get_task("hot").await.unwrap();
        let before = storage.cache_stats();
        assert_eq!(before.hits, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(storage.get_task("hot").await.unwrap().is_some());
        let after = storage.cache_stats();
        assert_eq!(after.hits, 1);
        assert_eq!(after.misses, before.misses + 1);
        assert_eq!(after.entries, 1);

        app.shutdown();
    }
}
