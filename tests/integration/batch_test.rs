//! Batch execution tests across several mock instances.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use sqlfleet::batch::{
    execute_sources, invoke_query, resolve_body, BatchExecutor, ConfirmationGate, DatabaseHandle,
    ErrorPolicy, ExecutionTarget, QueryBody, QueryInvocation, QueryOptions, TargetSelector,
};
use sqlfleet::db::{ConnectOptions, Connector, MockConnector, MockServer};
use sqlfleet::error::FleetError;
use sqlfleet::instance::{Credential, InstanceSpec};
use sqlfleet::resolve::{QueryInput, SqlSource};

use super::{mock_binder, resolver, ScriptedDownloader};

fn literal(sql: &str, selector: TargetSelector) -> QueryInvocation {
    QueryInvocation {
        selector,
        body: QueryBody::Literal(sql.to_string()),
        options: QueryOptions::default(),
    }
}

#[tokio::test]
async fn test_one_unreachable_instance_does_not_abort_batch() {
    let servers: Vec<MockServer> = (0..3).map(|_| MockServer::new()).collect();
    let connector = MockConnector::new()
        .with_server("sql01", servers[0].clone())
        .with_server("sql02", MockServer::unreachable())
        .with_server("sql03", servers[1].clone())
        .with_server("sql04", servers[2].clone());
    let binder = mock_binder(connector);
    let dir = TempDir::new().unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), dir.path());

    let instances = ["sql01", "sql02", "sql03", "sql04"]
        .iter()
        .map(|h| InstanceSpec::new(*h))
        .collect();
    let report = invoke_query(
        literal("SELECT @@VERSION", TargetSelector::instances(instances)),
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(report.records.len(), 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, "sql02");
    assert_eq!(report.failures[0].category, "Connection Error");

    let targets: Vec<&str> = report
        .records
        .iter()
        .map(|r| r.target.as_deref().unwrap())
        .collect();
    assert_eq!(targets, vec!["sql01", "sql03", "sql04"]);
    for server in &servers {
        assert_eq!(server.executed_sql(), vec!["SELECT @@VERSION"]);
    }
}

#[tokio::test]
async fn test_execution_error_on_one_target_continues() {
    let bad = MockServer::new().failing_on("sys.dm_hadr");
    let good = MockServer::new();
    let binder = mock_binder(
        MockConnector::new()
            .with_server("bad", bad)
            .with_server("good", good.clone()),
    );
    let dir = TempDir::new().unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), dir.path());

    let report = invoke_query(
        literal(
            "SELECT * FROM sys.dm_hadr_database_replica_states",
            TargetSelector::instances(vec![InstanceSpec::new("bad"), InstanceSpec::new("good")]),
        ),
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].category, "Execution Error");
    assert_eq!(good.executed().len(), 1);
}

#[tokio::test]
async fn test_mixed_targets_rejected_before_connecting() {
    let server = MockServer::new();
    let connector = MockConnector::new().with_server("sql01", server.clone());
    let handle_client = connector
        .connect(&InstanceSpec::new("sql01"), &ConnectOptions::default())
        .await
        .unwrap();
    let connects_before = server.connects();

    let binder = mock_binder(connector);
    let dir = TempDir::new().unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), dir.path());

    let selector = TargetSelector {
        instances: vec![InstanceSpec::new("sql01")],
        databases: vec![DatabaseHandle::new(handle_client, "sales")],
    };
    let err = invoke_query(
        literal("SELECT 1", selector),
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, FleetError::InvalidArgument(_)));
    assert_eq!(server.connects(), connects_before);
    assert!(server.executed().is_empty());
}

#[tokio::test]
async fn test_empty_selector_is_invalid_argument() {
    let binder = mock_binder(MockConnector::new());
    let dir = TempDir::new().unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), dir.path());

    let err = invoke_query(
        literal("SELECT 1", TargetSelector::default()),
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, FleetError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_domain_credential_context_closed_after_each_target() {
    let server = MockServer::new().failing_on("RAISERROR");
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let gate = ConfirmationGate::unattended();
    let options = QueryOptions::default();
    let executor = BatchExecutor::new(&binder, &gate, ErrorPolicy::Warn, &options);

    let spec = InstanceSpec::new("sql01").with_credential(Credential::new(r"CORP\svc_deploy", None));
    let targets = vec![
        ExecutionTarget::Instance(spec.clone().with_database("sales")),
        ExecutionTarget::Instance(spec.with_database("hr")),
    ];
    let sources = [SqlSource::literal("RAISERROR('boom', 16, 1)")];

    let report = executor.run(&targets, &sources).await.unwrap();

    assert_eq!(report.failures.len(), 2);
    assert_eq!(server.pooled_connects(), 0);
    assert_eq!(server.connects(), 2);
    assert_eq!(server.closes(), 2);
}

#[tokio::test]
async fn test_sql_login_context_is_pooled_and_left_open() {
    let server = MockServer::new();
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let gate = ConfirmationGate::unattended();
    let options = QueryOptions::default();
    let executor = BatchExecutor::new(&binder, &gate, ErrorPolicy::Warn, &options);

    let spec = InstanceSpec::new("sql01").with_credential(Credential::new("deploy", None));
    let targets = vec![
        ExecutionTarget::Instance(spec.clone()),
        ExecutionTarget::Instance(spec),
    ];
    executor
        .run(&targets, &[SqlSource::literal("SELECT 1")])
        .await
        .unwrap();

    assert_eq!(server.connects(), 1);
    assert_eq!(server.closes(), 0);
    binder.shutdown().await;
    assert_eq!(server.closes(), 1);
}

#[tokio::test]
async fn test_database_handles_run_in_their_database() {
    let server = MockServer::new().with_inaccessible_database("archive");
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let shared = binder.connect_shared(&InstanceSpec::new("sql01")).await.unwrap();
    let dir = TempDir::new().unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), dir.path());

    let selector = TargetSelector::databases(vec![
        DatabaseHandle::new(Arc::clone(&shared), "sales"),
        DatabaseHandle::new(Arc::clone(&shared), "archive"),
        DatabaseHandle::new(Arc::clone(&shared), "master"),
    ]);
    let report = invoke_query(
        literal("SELECT DB_NAME()", selector),
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    let databases: Vec<Option<String>> =
        server.executed().into_iter().map(|s| s.database).collect();
    assert_eq!(
        databases,
        vec![Some("sales".to_string()), Some("master".to_string())]
    );
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].target, "sql01/archive");
    assert!(!report.has_failures());
    assert_eq!(shared.current_database().as_deref(), Some("master"));
}

#[tokio::test]
async fn test_bad_script_fails_before_handles_connect() {
    let server = MockServer::new();
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("deploy.sql");
    std::fs::write(&script, b"UPDATE t SET name = '\xE9'").unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), &dir.path().join("scratch"));

    let err = resolve_body(QueryBody::Inputs(vec![QueryInput::File(script)]), &resolver)
        .await
        .unwrap_err();
    assert!(err.is_batch_fatal());
    assert_eq!(server.connects(), 0);

    let sources = resolve_body(QueryBody::Literal("SELECT DB_NAME()".into()), &resolver)
        .await
        .unwrap();
    let shared = binder.connect_shared(&InstanceSpec::new("sql01")).await.unwrap();
    let report = execute_sources(
        TargetSelector::databases(vec![DatabaseHandle::new(shared, "sales")]),
        &sources,
        &QueryOptions::default(),
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(report.records.len(), 1);
    assert_eq!(server.executed()[0].database.as_deref(), Some("sales"));
}

#[tokio::test]
async fn test_dry_run_plans_without_connecting() {
    let server = MockServer::new();
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let dir = TempDir::new().unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), dir.path());

    let report = invoke_query(
        literal(
            "DROP TABLE staging.orders",
            TargetSelector::instances(vec![InstanceSpec::new("sql01"), InstanceSpec::new("sql02")]),
        ),
        &resolver,
        &binder,
        &ConfirmationGate::dry_run(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(server.connects(), 0);
    assert!(report.records.is_empty());
    assert_eq!(report.planned.len(), 2);
    assert_eq!(report.planned[1].target, "sql02");
    assert_eq!(report.planned[0].impact, sqlfleet::batch::Impact::High);
}

#[tokio::test]
async fn test_append_instance_tags_single_target() {
    let binder = mock_binder(MockConnector::new().with_server("sql01", MockServer::new()));
    let dir = TempDir::new().unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), dir.path());

    let mut invocation = literal(
        "SELECT 1",
        TargetSelector::instances(vec![InstanceSpec::new("sql01")]),
    );
    invocation.options.append_instance = true;
    let report = invoke_query(
        invocation,
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(report.records[0].target.as_deref(), Some("sql01"));
}
