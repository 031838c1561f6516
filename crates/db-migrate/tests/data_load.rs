mod common;

use common::{shop_objects, shop_schema, shop_source, MemorySource, MemoryTarget};
use db_migrate::state::LoadStatus;
use db_migrate::{
    DependencyGraphBuilder, DeploymentPlan, ExecutorOptions, LoaderOptions, MigrationState,
    PhasedDeploymentExecutor, SqlValue, StreamingDataMigrator, TargetRole,
};
use tokio_util::sync::CancellationToken;

fn plan() -> DeploymentPlan {
    DeploymentPlan::build(&shop_schema(), shop_objects(), &DependencyGraphBuilder::new()).unwrap()
}

async fn deployed(target: &MemoryTarget, plan: &DeploymentPlan, state: &mut MigrationState) {
    let executor = PhasedDeploymentExecutor::new(ExecutorOptions::default());
    executor
        .deploy(plan, target, state, &CancellationToken::new())
        .await;
}

fn state() -> MigrationState {
    MigrationState::new("run-1".into(), "hash".into())
}

#[tokio::test]
async fn test_table_loads_in_bounded_batches() {
    let plan = plan();
    let source = shop_source(2500);
    let target = MemoryTarget::new(TargetRole::Production);
    let mut state = state();
    deployed(&target, &plan, &mut state).await;

    let summary = StreamingDataMigrator::new(LoaderOptions::default())
        .migrate(&plan, &shop_schema(), &source, &target, &mut state, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(target.insert_sizes("orders"), vec![1000, 1000, 500]);
    assert_eq!(target.rows("orders"), 2500);
    assert_eq!(summary.tables_loaded, 5);
    assert_eq!(summary.tables_failed, 0);

    let orders = state.last_load(TargetRole::Production, "orders").unwrap();
    assert_eq!(orders.status, LoadStatus::Loaded);
    assert_eq!(orders.source_rows, Some(2500));
    assert_eq!(orders.rows_loaded, 2500);
    assert_eq!(orders.batches, 3);

    // A short last page ends the table without another read
    let order_reads = source
        .fetches()
        .into_iter()
        .filter(|(t, _)| t == "orders")
        .count();
    assert_eq!(order_reads, 3);
}

#[tokio::test]
async fn test_parents_load_before_children() {
    let plan = plan();
    let source = shop_source(20);
    let target = MemoryTarget::new(TargetRole::Production);
    let mut state = state();
    deployed(&target, &plan, &mut state).await;

    StreamingDataMigrator::new(LoaderOptions::default())
        .migrate(&plan, &shop_schema(), &source, &target, &mut state, &CancellationToken::new())
        .await
        .unwrap();

    let order: Vec<&str> = state.loads().iter().map(|l| l.table.as_str()).collect();
    let pos = |t: &str| order.iter().position(|x| *x == t).unwrap();
    assert!(pos("customers") < pos("orders"));
    assert!(pos("orders") < pos("order_items"));
}

#[tokio::test]
async fn test_integrity_suspended_once_for_whole_load() {
    let plan = plan();
    let source = shop_source(50);
    let target = MemoryTarget::new(TargetRole::Production);
    let mut state = state();
    deployed(&target, &plan, &mut state).await;

    StreamingDataMigrator::new(LoaderOptions::default())
        .migrate(&plan, &shop_schema(), &source, &target, &mut state, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(target.integrity_toggles(), (1, 1));
    // Cyclic tables load without their foreign keys in place
    assert_eq!(target.rows("employees"), 2);
    assert_eq!(target.rows("departments"), 2);
}

#[tokio::test]
async fn test_sequences_restart_after_max_key() {
    let plan = plan();
    let source = shop_source(2500).with_rows("customers", Vec::new());
    let target = MemoryTarget::new(TargetRole::Production);
    let mut state = state();
    deployed(&target, &plan, &mut state).await;

    let summary = StreamingDataMigrator::new(LoaderOptions::default())
        .migrate(&plan, &shop_schema(), &source, &target, &mut state, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(target.next_sequence_value("orders"), Some(2501));
    assert_eq!(target.next_sequence_value("departments"), Some(21));
    // Empty tables restart at 1
    assert_eq!(target.next_sequence_value("customers"), Some(1));
    assert_eq!(summary.sequences_reset, 5);
    assert_eq!(state.sequence_resets().len(), 5);
}

#[tokio::test]
async fn test_sequence_reset_can_be_disabled() {
    let plan = plan();
    let source = shop_source(5);
    let target = MemoryTarget::new(TargetRole::Production);
    let mut state = state();
    deployed(&target, &plan, &mut state).await;

    let options = LoaderOptions {
        reset_sequences: false,
        ..LoaderOptions::default()
    };
    StreamingDataMigrator::new(options)
        .migrate(&plan, &shop_schema(), &source, &target, &mut state, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(target.next_sequence_value("orders"), None);
    assert!(state.sequence_resets().is_empty());
}

#[tokio::test]
async fn test_failed_batch_only_fails_its_table() {
    let plan = plan();
    let source = shop_source(2500);
    let target = MemoryTarget::new(TargetRole::Production).failing_insert("orders", 2);
    let mut state = state();
    deployed(&target, &plan, &mut state).await;

    let summary = StreamingDataMigrator::new(LoaderOptions::default())
        .migrate(&plan, &shop_schema(), &source, &target, &mut state, &CancellationToken::new())
        .await
        .unwrap();

    let orders = state.last_load(TargetRole::Production, "orders").unwrap();
    assert_eq!(orders.status, LoadStatus::Failed);
    assert_eq!(orders.rows_loaded, 1000);
    assert!(orders.error.as_deref().unwrap().contains("value too long"));

    assert_eq!(summary.tables_failed, 1);
    assert_eq!(summary.tables_loaded, 4);
    assert_eq!(target.rows("order_items"), 10);
    assert_eq!(target.integrity_toggles(), (1, 1));
}

#[tokio::test]
async fn test_missing_target_table_is_recorded() {
    let plan = plan();
    let source = shop_source(5);
    let target = MemoryTarget::new(TargetRole::Production);
    let mut state = state();
    // Nothing deployed

    let summary = StreamingDataMigrator::new(LoaderOptions::default())
        .migrate(&plan, &shop_schema(), &source, &target, &mut state, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.tables_failed, 5);
    assert!(state
        .loads()
        .iter()
        .all(|l| l.error.as_deref().unwrap_or_default().contains("does not exist")));
}

#[tokio::test]
async fn test_reload_replaces_previous_rows() {
    let plan = plan();
    let source = shop_source(30);
    let target = MemoryTarget::new(TargetRole::Verification);
    let mut state = state();
    deployed(&target, &plan, &mut state).await;

    let migrator = StreamingDataMigrator::new(LoaderOptions::default());
    for _ in 0..2 {
        migrator
            .migrate(&plan, &shop_schema(), &source, &target, &mut state, &CancellationToken::new())
            .await
            .unwrap();
    }

    assert_eq!(target.rows("orders"), 30);
    assert_eq!(state.loads().len(), 10);
}

#[tokio::test]
async fn test_cancelled_load_skips_tables() {
    let plan = plan();
    let source = shop_source(5);
    let target = MemoryTarget::new(TargetRole::Production);
    let mut state = state();
    deployed(&target, &plan, &mut state).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = StreamingDataMigrator::new(LoaderOptions::default())
        .migrate(&plan, &shop_schema(), &source, &target, &mut state, &cancel)
        .await
        .unwrap();

    assert_eq!(summary.tables_skipped, 5);
    assert_eq!(summary.rows_loaded, 0);
    assert!(state.sequence_resets().is_empty());
    assert_eq!(target.integrity_toggles(), (1, 1));
}

#[tokio::test]
async fn test_tables_without_integer_key_page_by_offset() {
    use db_migrate::{Column, SchemaDescription, SchemaObject, TableMeta};
    use db_migrate::ObjectKind;

    let schema = SchemaDescription {
        database: "shop".into(),
        tables: vec![TableMeta::new("tags")
            .column(Column::new("label", "varchar"))
            .primary_key(&["label"])],
        ..Default::default()
    };
    let objects = vec![SchemaObject::new(
        "tags",
        ObjectKind::Table,
        "CREATE TABLE tags (label varchar(20) PRIMARY KEY);",
    )];
    let plan = DeploymentPlan::build(&schema, objects, &DependencyGraphBuilder::new()).unwrap();
    let source = MemorySource::new().with_rows(
        "tags",
        (0..5).map(|i| vec![SqlValue::Text(format!("tag-{i}"))]).collect(),
    );
    let target = MemoryTarget::new(TargetRole::Production);
    let mut state = state();
    deployed(&target, &plan, &mut state).await;

    let options = LoaderOptions {
        batch_size: 2,
        ..LoaderOptions::default()
    };
    let summary = StreamingDataMigrator::new(options)
        .migrate(&plan, &schema, &source, &target, &mut state, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(target.insert_sizes("tags"), vec![2, 2, 1]);
    assert_eq!(summary.rows_loaded, 5);
    assert_eq!(summary.sequences_reset, 0);
}
