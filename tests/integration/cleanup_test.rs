//! Temporary artifact cleanup on every exit path.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use url::Url;

use sqlfleet::batch::{
    invoke_query, ConfirmationGate, ErrorPolicy, QueryBody, QueryInvocation, QueryOptions,
    TargetSelector,
};
use sqlfleet::db::{MockConnector, MockServer};
use sqlfleet::error::FleetError;
use sqlfleet::instance::InstanceSpec;
use sqlfleet::resolve::QueryInput;

use super::{entries, mock_binder, resolver, ScriptedDownloader};

const FIRST: &str = "https://scripts.example.com/first.sql";
const SECOND: &str = "https://scripts.example.com/second.sql";

fn url_inputs(urls: &[&str]) -> QueryBody {
    QueryBody::Inputs(
        urls.iter()
            .map(|u| QueryInput::Url(Url::parse(u).unwrap()))
            .collect(),
    )
}

fn invocation(hosts: &[&str], body: QueryBody) -> QueryInvocation {
    QueryInvocation {
        selector: TargetSelector::instances(hosts.iter().map(|h| InstanceSpec::new(*h)).collect()),
        body,
        options: QueryOptions::default(),
    }
}

#[tokio::test]
async fn test_artifacts_removed_after_success() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("scratch");
    let server = MockServer::new();
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let downloader = ScriptedDownloader::new()
        .serve(FIRST, Some("SELECT 1"), None)
        .serve(SECOND, Some("SELECT 2"), None);
    let resolver = resolver(Arc::new(downloader), &scratch);

    let report = invoke_query(
        invocation(&["sql01"], url_inputs(&[FIRST, SECOND])),
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(report.records.len(), 2);
    assert_eq!(server.executed_sql(), vec!["SELECT 1", "SELECT 2"]);
    assert_eq!(entries(&scratch), 0);
    assert!(resolver.temp().artifacts().is_empty());
}

#[tokio::test]
async fn test_artifacts_removed_after_execution_failure() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("scratch");
    let server = MockServer::new().failing_on("broken_proc");
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let downloader = ScriptedDownloader::new()
        .serve(FIRST, Some("EXEC broken_proc"), None)
        .serve(SECOND, Some("SELECT 2"), None);
    let resolver = resolver(Arc::new(downloader), &scratch);

    let report = invoke_query(
        invocation(&["sql01"], url_inputs(&[FIRST, SECOND])),
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].source.as_deref().unwrap().contains("first.sql"));
    assert_eq!(server.executed_sql(), vec!["EXEC broken_proc"]);
    assert_eq!(entries(&scratch), 0);
}

#[tokio::test]
async fn test_artifacts_removed_when_raise_policy_aborts() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("scratch");
    let binder = mock_binder(
        MockConnector::new().with_server("sql01", MockServer::new().failing_on("SELECT")),
    );
    let downloader = ScriptedDownloader::new().serve(FIRST, Some("SELECT 1"), None);
    let resolver = resolver(Arc::new(downloader), &scratch);

    let err = invoke_query(
        invocation(&["sql01"], url_inputs(&[FIRST])),
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Raise,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, FleetError::Execution(_)));
    assert_eq!(entries(&scratch), 0);
}

#[tokio::test]
async fn test_artifacts_removed_after_batch_fatal_download_error() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("scratch");
    let server = MockServer::new();
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let downloader = Arc::new(ScriptedDownloader::new().serve(FIRST, Some("SELECT 1"), None));
    let resolver = resolver(downloader.clone(), &scratch);

    let err = invoke_query(
        invocation(&["sql01"], url_inputs(&[FIRST, SECOND])),
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, FleetError::Download(_)));
    assert!(downloader.attempts().iter().any(|(url, _)| url == SECOND));
    assert!(server.executed().is_empty());
    assert_eq!(entries(&scratch), 0);

    assert_eq!(resolver.temp().finalize(), 0);
}

#[tokio::test]
async fn test_dry_run_still_cleans_up() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("scratch");
    let server = MockServer::new();
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let downloader = ScriptedDownloader::new().serve(FIRST, Some("DELETE FROM audit_log"), None);
    let resolver = resolver(Arc::new(downloader), &scratch);

    let report = invoke_query(
        invocation(&["sql01", "sql02"], url_inputs(&[FIRST])),
        &resolver,
        &binder,
        &ConfirmationGate::dry_run(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(report.planned.len(), 2);
    assert_eq!(server.connects(), 0);
    assert_eq!(entries(&scratch), 0);
}
