//! Extraction tests against the in-memory backend
//!
//! Run with: cargo test -p seedbed --test extraction_test

mod common;

use std::collections::HashSet;

use common::*;
use seedbed::config::ExecutionMode;
use seedbed::graph::{expand, Dependency};
use seedbed::prelude::*;

fn invoices_model() -> TableExecutionModel {
    serde_json::from_str(
        r#"{"constraints": [
            {"constraint": "invoices_customers_fk"},
            {"constraint": "invoice_details_invoices_fk",
             "constraints": [{"constraint": "invoice_details_products_fk"}]}
        ]}"#,
    )
    .unwrap()
}

fn keys(ids: &[i32]) -> Vec<Vec<Value>> {
    ids.iter().map(|&id| vec![int(id)]).collect()
}

fn constraint_paths(node: &Dependency, path: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    if let Some(constraint) = &node.constraint {
        path.push(constraint.clone());
        out.push(path.clone());
    }
    for child in &node.dependencies {
        constraint_paths(child, path, out);
    }
    if node.constraint.is_some() {
        path.pop();
    }
}

fn select_all(node: &mut Dependency) {
    node.selected = true;
    node.dependencies.iter_mut().for_each(select_all);
}

#[tokio::test]
async fn test_invoices_scenario_save() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let report = Downloader::new(&db)
        .download(
            plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
            &name("invoices"),
            invoices_model(),
            KeyFilter::unfiltered(),
        )
        .await
        .unwrap();

    assert_eq!(report.rows.len(), 4);
    assert_eq!(report.rows_for("invoices"), 4);
    assert_eq!(report.rows_for("customers"), 2);
    assert_eq!(report.rows_for("invoice_details"), 7);
    assert_eq!(report.rows_for("products"), 3);
    assert_eq!(report.total_rows(), 16);
    assert!(report.skipped.is_empty());

    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "customers").unwrap(),
        "id,name\n1,Acme\n2,Globex\n"
    );
    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "invoices").unwrap(),
        "id,customer_id,number,issued_at\n\
         1,1,INV-1,2024-01-05 10:00:00\n\
         2,1,INV-2,2024-01-06 11:30:00\n\
         3,2,INV-3,2024-02-01 09:15:00\n\
         4,2,INV-4,\n"
    );
    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "products").unwrap(),
        "id,name,price\n1,Anvil,12.50\n2,Rocket,99.00\n3,Magnet,3.25\n"
    );
    assert!(read_dataset_file(dir.path(), "smoke", "payments").is_none());
}

#[tokio::test]
async fn test_invoices_scenario_count_with_cap() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let report = Downloader::new(&db)
        .download(
            plan_config(dir.path(), "smoke", ExecutionMode::Count, Some(3)),
            &name("invoices"),
            invoices_model(),
            KeyFilter::unfiltered(),
        )
        .await
        .unwrap();

    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows_for("invoices"), 3);
    assert!(!dir.path().join("smoke").exists());
}

#[tokio::test]
async fn test_unknown_constraint_is_rejected() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let model = TableExecutionModel::root(vec![
        TableExecutionModel::edge("invoices_customers_fk", vec![]),
        TableExecutionModel::edge("invoices_vendors_fk", vec![]),
    ]);
    let err = ExecutionPlan::build(
        &db,
        plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
        &name("invoices"),
        model,
        &[],
    )
    .await
    .unwrap_err();

    match &err {
        Error::UnknownConstraints { table, constraints } => {
            assert!(table.ends_with("invoices"));
            assert_eq!(constraints, &vec!["invoices_vendors_fk".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_schema_mismatch());
    assert!(err.to_string().contains("invoices_vendors_fk"));
}

#[tokio::test]
async fn test_unknown_nested_constraint_names_its_table() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let model = TableExecutionModel::root(vec![TableExecutionModel::edge(
        "invoice_details_invoices_fk",
        vec![TableExecutionModel::edge("invoice_details_vendors_fk", vec![])],
    )]);
    let err = Downloader::new(&db)
        .download(
            plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
            &name("invoices"),
            model,
            KeyFilter::unfiltered(),
        )
        .await
        .unwrap_err();

    match err {
        Error::UnknownConstraints { table, constraints } => {
            assert!(table.ends_with("invoice_details"));
            assert_eq!(constraints, vec!["invoice_details_vendors_fk".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dir.path().join("smoke").exists());
}

#[tokio::test]
async fn test_missing_root_table() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let err = ExecutionPlan::build(
        &db,
        plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
        &name("vendors"),
        TableExecutionModel::default(),
        &[],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::TableNotFound(_)));
}

#[tokio::test]
async fn test_lower_layer_keys_are_skipped_but_still_followed() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();
    write_dataset_file(dir.path(), "static", "customers", "id,name\n1,Acme\n");
    write_dataset_file(
        dir.path(),
        "base",
        "invoices",
        "id,customer_id,number,issued_at\n1,1,INV-1,2024-01-05 10:00:00\n",
    );

    let model = TableExecutionModel::root(vec![TableExecutionModel::edge(
        "invoices_customers_fk",
        vec![],
    )]);
    let report = Downloader::new(&db)
        .download(
            plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
            &name("customers"),
            model,
            KeyFilter::new(vec!["id".into()], keys(&[1, 2])),
        )
        .await
        .unwrap();

    assert_eq!(report.rows_for("customers"), 1);
    assert_eq!(report.skipped.get(&name("customers")), Some(&1));
    // customer 1 lives in static, its invoices are still reached
    assert_eq!(report.rows_for("invoices"), 3);
    assert_eq!(report.skipped.get(&name("invoices")), Some(&1));

    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "customers").unwrap(),
        "id,name\n2,Globex\n"
    );
    let invoices = read_dataset_file(dir.path(), "smoke", "invoices").unwrap();
    assert!(!invoices.contains("INV-1"));
    assert_eq!(invoices.lines().count(), 4);
}

#[tokio::test]
async fn test_repeat_extraction_appends_nothing() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(&db);

    let first = downloader
        .download(
            plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
            &name("invoices"),
            invoices_model(),
            KeyFilter::unfiltered(),
        )
        .await
        .unwrap();
    let before = read_dataset_file(dir.path(), "smoke", "invoice_details").unwrap();

    let second = downloader
        .download(
            plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
            &name("invoices"),
            invoices_model(),
            KeyFilter::unfiltered(),
        )
        .await
        .unwrap();

    assert_eq!(first.total_rows(), 16);
    assert_eq!(second.total_rows(), 0);
    assert_eq!(second.skipped.values().sum::<u64>(), 16);
    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "invoice_details").unwrap(),
        before
    );
}

#[tokio::test]
async fn test_appending_adds_only_new_rows() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(&db);

    for ids in [&[1, 2][..], &[2, 3][..]] {
        downloader
            .download(
                plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
                &name("customers"),
                TableExecutionModel::default(),
                KeyFilter::new(vec!["id".into()], keys(ids)),
            )
            .await
            .unwrap();
    }

    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "customers").unwrap(),
        "id,name\n1,Acme\n2,Globex\n3,Initech\n"
    );
}

#[tokio::test]
async fn test_batch_boundary_matches_single_batch() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();
    let downloader = Downloader::new(&db);
    let ids = [1, 2, 3, 4, 5];

    let mut small = plan_config(dir.path(), "small", ExecutionMode::Save, None);
    small.parameter_budget = 2;
    let before = backend.select_count();
    let batched = downloader
        .download(
            small,
            &name("invoice_details"),
            TableExecutionModel::default(),
            KeyFilter::new(vec!["id".into()], keys(&ids)),
        )
        .await
        .unwrap();
    assert_eq!(backend.select_count() - before, 3);

    let before = backend.select_count();
    let single = downloader
        .download(
            plan_config(dir.path(), "large", ExecutionMode::Save, None),
            &name("invoice_details"),
            TableExecutionModel::default(),
            KeyFilter::new(vec!["id".into()], keys(&ids)),
        )
        .await
        .unwrap();
    assert_eq!(backend.select_count() - before, 1);

    assert_eq!(batched.rows_for("invoice_details"), 5);
    assert_eq!(batched.rows, single.rows);
    assert_eq!(
        read_dataset_file(dir.path(), "small", "invoice_details"),
        read_dataset_file(dir.path(), "large", "invoice_details")
    );
}

#[tokio::test]
async fn test_composite_keys_across_batches() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = plan_config(dir.path(), "smoke", ExecutionMode::Count, None);
    config.parameter_budget = 4;
    let tuples = vec![
        vec![int(1), int(1)],
        vec![int(2), int(3)],
        vec![int(4), int(1)],
        vec![int(3), int(2)],
        vec![int(4), int(3)],
        vec![int(1), int(3)],
    ];
    let before = backend.select_count();
    let report = Downloader::new(&db)
        .download(
            config,
            &name("invoice_details"),
            TableExecutionModel::default(),
            KeyFilter::new(vec!["invoice_id".into(), "product_id".into()], tuples),
        )
        .await
        .unwrap();

    // (1, 3) matches nothing
    assert_eq!(report.rows_for("invoice_details"), 5);
    assert_eq!(backend.select_count() - before, 3);
}

#[tokio::test]
async fn test_second_path_to_planned_table_is_dropped() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    // invoices -> customers -> payments -> invoices again
    let model = TableExecutionModel::root(vec![TableExecutionModel::edge(
        "invoices_customers_fk",
        vec![TableExecutionModel::edge(
            "payments_customers_fk",
            vec![TableExecutionModel::edge("payments_invoices_fk", vec![])],
        )],
    )]);
    let mut plan = ExecutionPlan::build(
        &db,
        plan_config(dir.path(), "smoke", ExecutionMode::Count, None),
        &name("invoices"),
        model,
        &[],
    )
    .await
    .unwrap();

    let tables: Vec<&str> = plan.tables().iter().map(|t| t.table.as_str()).collect();
    assert_eq!(tables, vec!["invoices", "customers", "payments"]);
    assert!(plan.nodes()[2].children().is_empty());

    plan.run(Vec::new()).await.unwrap();
    plan.close().unwrap();
    let report = plan.report(std::time::Duration::ZERO);
    assert_eq!(report.rows_for("invoices"), 4);
    assert_eq!(report.rows_for("customers"), 2);
    assert_eq!(report.rows_for("payments"), 1);
}

#[tokio::test]
async fn test_self_reference_is_not_followed() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let model = TableExecutionModel::root(vec![TableExecutionModel::edge(
        "employees_manager_fk",
        vec![],
    )]);
    let report = Downloader::new(&db)
        .download(
            plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
            &name("employees"),
            model,
            KeyFilter::new(vec!["id".into()], keys(&[2])),
        )
        .await
        .unwrap();

    // the manager of employee 2 is not pulled in
    assert_eq!(report.rows_for("employees"), 1);
}

#[tokio::test]
async fn test_dependency_tree_cuts_repeated_constraints() {
    let backend = shop();
    let db = backend.database().await;

    let tree = expand(&db, &name("invoices"), None).await.unwrap();
    let mut paths = Vec::new();
    constraint_paths(&tree, &mut Vec::new(), &mut paths);

    // every constraint is expanded once, wherever it was reached first
    let leaves: Vec<&String> = paths.iter().filter_map(|p| p.last()).collect();
    let unique: HashSet<&String> = leaves.iter().copied().collect();
    assert_eq!(leaves.len(), unique.len());

    assert_eq!(tree.dependencies.len(), 1);
    assert!(paths.contains(&vec![
        "invoices_customers_fk".to_string(),
        "payments_customers_fk".to_string(),
        "payments_invoices_fk".to_string(),
        "invoice_details_invoices_fk".to_string(),
    ]));
    assert!(!paths.contains(&vec!["invoice_details_invoices_fk".to_string()]));
    assert_eq!(tree.len(), 6);
}

#[tokio::test]
async fn test_dependency_tree_row_counts() {
    let backend = shop();
    let db = backend.database().await;

    let tree = expand(&db, &name("invoices"), Some(3)).await.unwrap();
    assert_eq!(tree.row_count, Some(3));
    assert_eq!(tree.dependencies[0].row_count, Some(3));

    let tree = expand(&db, &name("invoices"), Some(100)).await.unwrap();
    assert_eq!(tree.row_count, Some(4));
    assert_eq!(tree.dependencies[0].row_count, Some(3));
}

#[tokio::test]
async fn test_plans_never_repeat_a_table() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    for root in ["invoices", "customers", "invoice_details", "payments", "employees"] {
        let mut tree = expand(&db, &name(root), None).await.unwrap();
        select_all(&mut tree);

        let plan = ExecutionPlan::build(
            &db,
            plan_config(dir.path(), "smoke", ExecutionMode::Count, None),
            &name(root),
            tree.to_execution_model(),
            &[],
        )
        .await
        .unwrap();

        let tables = plan.tables();
        let unique: HashSet<_> = tables.iter().collect();
        assert_eq!(tables.len(), unique.len(), "duplicate table in plan for {root}");
        assert_eq!(tables[0], &name(root));
    }
}

#[tokio::test]
async fn test_selected_tree_drives_the_plan() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let mut tree = expand(&db, &name("invoice_details"), None).await.unwrap();
    let model = tree.to_execution_model();
    // lookups are selected by default
    let constraints: Vec<_> = model
        .nested
        .iter()
        .filter_map(|m| m.constraint_name.as_deref())
        .collect();
    assert_eq!(
        constraints,
        vec!["invoice_details_invoices_fk", "invoice_details_products_fk"]
    );

    assert!(tree.select("payments_invoices_fk"));
    let report = Downloader::new(&db)
        .download(
            plan_config(dir.path(), "smoke", ExecutionMode::Count, None),
            &name("invoice_details"),
            tree.to_execution_model(),
            KeyFilter::new(vec!["id".into()], keys(&[1])),
        )
        .await
        .unwrap();

    assert_eq!(report.rows_for("invoice_details"), 1);
    assert_eq!(report.rows_for("invoices"), 1);
    assert_eq!(report.rows_for("products"), 1);
    assert_eq!(report.rows_for("payments"), 1);
}

#[tokio::test]
async fn test_empty_marker_files() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = plan_config(dir.path(), "smoke", ExecutionMode::Save, None);
    config.create_empty_files = true;
    let model = TableExecutionModel::root(vec![TableExecutionModel::edge(
        "invoices_customers_fk",
        vec![],
    )]);
    let report = Downloader::new(&db)
        .download(
            config,
            &name("customers"),
            model,
            KeyFilter::new(vec!["id".into()], keys(&[3])),
        )
        .await
        .unwrap();

    assert_eq!(report.rows_for("customers"), 1);
    assert!(!report.rows.contains_key(&name("invoices")));
    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "invoices").unwrap(),
        "id,customer_id,number,issued_at\n"
    );
}

#[tokio::test]
async fn test_capped_save_leaves_partial_output_without_markers() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = plan_config(dir.path(), "smoke", ExecutionMode::Save, Some(3));
    config.create_empty_files = true;
    let report = Downloader::new(&db)
        .download(
            config,
            &name("invoices"),
            invoices_model(),
            KeyFilter::unfiltered(),
        )
        .await
        .unwrap();

    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows_for("invoices"), 3);
    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "invoices").unwrap(),
        "id,customer_id,number,issued_at\n\
         1,1,INV-1,2024-01-05 10:00:00\n\
         2,1,INV-2,2024-01-06 11:30:00\n\
         3,2,INV-3,2024-02-01 09:15:00\n"
    );
    // the cap stopped the plan before these tables were fetched
    for table in ["customers", "invoice_details", "products"] {
        assert_eq!(read_dataset_file(dir.path(), "smoke", table), None, "{table}");
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_close_reaches_every_node_after_a_failure() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    // rows for the root table sit in the writer buffer until close, whose
    // flush then fails on a full device
    let invoices = seedbed::dataset::table_path(dir.path(), "smoke", &name("invoices"));
    std::fs::create_dir_all(invoices.parent().unwrap()).unwrap();
    std::os::unix::fs::symlink("/dev/full", &invoices).unwrap();

    let mut plan = ExecutionPlan::build(
        &db,
        plan_config(dir.path(), "smoke", ExecutionMode::Save, None),
        &name("invoices"),
        invoices_model(),
        &[],
    )
    .await
    .unwrap();
    plan.run(Vec::new()).await.unwrap();
    assert_eq!(plan.tables()[0], &name("invoices"));
    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "customers").unwrap(),
        ""
    );

    let err = plan.close().unwrap_err();
    assert!(matches!(err, Error::Io(_)), "unexpected error: {err}");
    assert_eq!(
        read_dataset_file(dir.path(), "smoke", "customers").unwrap(),
        "id,name\n1,Acme\n2,Globex\n"
    );
    let details = read_dataset_file(dir.path(), "smoke", "invoice_details").unwrap();
    assert_eq!(details.lines().count(), 8);
    let products = read_dataset_file(dir.path(), "smoke", "products").unwrap();
    assert_eq!(products.lines().count(), 4);
}

#[tokio::test]
async fn test_unsafe_predicate_is_rejected() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let mut model = TableExecutionModel::default();
    model.queries.push("1=1; DELETE FROM invoices".into());
    let err = ExecutionPlan::build(
        &db,
        plan_config(dir.path(), "smoke", ExecutionMode::Count, None),
        &name("invoices"),
        model,
        &[],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains(';'));
}

#[tokio::test]
async fn test_request_through_settings() {
    let backend = shop();
    let db = backend.database().await;
    let dir = tempfile::tempdir().unwrap();

    let settings = SeedbedConfig::from_yaml(&format!(
        "connection_url: postgres://seed@localhost/shop\ndatasets_root: {}\n",
        dir.path().display()
    ))
    .unwrap();
    let request: ExtractionRequest = serde_json::from_value(serde_json::json!({
        "table": "public.customers",
        "dataset": "smoke",
        "filter_columns": ["id"],
        "keys": [[2], ["3"]],
        "model": {"constraints": [{"constraint": "invoices_customers_fk"}]}
    }))
    .unwrap();

    let report = Downloader::new(&db).execute(request, &settings).await.unwrap();
    assert_eq!(report.rows_for("customers"), 2);
    assert_eq!(report.rows_for("invoices"), 2);
    assert!(read_dataset_file(dir.path(), "smoke", "invoices").is_some());
}
