//! Input resolution tests.

use std::fs;
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
use sqlfleet::resolve::{FetchAuth, QueryInput, SourceOrigin};

use super::{entries, mock_binder, resolver, ScriptedDownloader};

const URL: &str = "https://scripts.example.com/health.sql";

#[tokio::test]
async fn test_directory_yields_only_script_files_in_order() {
    let dir = TempDir::new().unwrap();
    let scripts = dir.path().join("deploy");
    fs::create_dir(&scripts).unwrap();
    for name in ["03_views.sql", "01_tables.sql", "02_data.SQL"] {
        fs::write(scripts.join(name), format!("-- {name}")).unwrap();
    }
    for name in ["README.md", "notes.txt"] {
        fs::write(scripts.join(name), "not sql").unwrap();
    }
    fs::create_dir(scripts.join("archive.sql")).unwrap();

    let resolver = resolver(Arc::new(ScriptedDownloader::new()), &dir.path().join("scratch"));
    let sources = resolver
        .resolve(&[QueryInput::Directory(scripts.clone())])
        .await
        .unwrap();

    let names: Vec<String> = sources
        .iter()
        .map(|s| s.path().unwrap().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["01_tables.sql", "02_data.SQL", "03_views.sql"]);

    let again = resolver.resolve(&[QueryInput::Directory(scripts)]).await.unwrap();
    assert_eq!(again.len(), 3);
}

#[tokio::test]
async fn test_missing_directory_is_not_found() {
    let dir = TempDir::new().unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), dir.path());
    let err = resolver
        .resolve(&[QueryInput::Directory(dir.path().join("nope"))])
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
}

#[tokio::test]
async fn test_wildcard_path_expands_sorted() {
    let dir = TempDir::new().unwrap();
    for name in ["b_check.sql", "a_check.sql", "c_other.sql"] {
        fs::write(dir.path().join(name), "SELECT 1").unwrap();
    }
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), &dir.path().join("scratch"));

    let pattern = dir.path().join("*_check.sql").to_string_lossy().into_owned();
    let sources = resolver.resolve(&[QueryInput::Path(pattern)]).await.unwrap();
    let labels: Vec<bool> = sources
        .iter()
        .map(|s| matches!(s.origin(), SourceOrigin::File(_)))
        .collect();
    assert_eq!(labels, vec![true, true]);
    assert!(sources[0].label().ends_with("a_check.sql"));
    assert!(sources[1].label().ends_with("b_check.sql"));
}

#[tokio::test]
async fn test_non_local_scheme_is_invalid_reference() {
    let dir = TempDir::new().unwrap();
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), dir.path());
    let err = resolver
        .resolve(&[QueryInput::Path("ftp://files.example.com/a.sql".to_string())])
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidReference(_)));
}

#[tokio::test]
async fn test_download_retry_with_default_credentials() {
    let dir = TempDir::new().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new().serve(URL, None, Some("SELECT 'healthy'")));
    let resolver = resolver(downloader.clone(), &dir.path().join("scratch"));

    let sources = resolver
        .resolve(&[QueryInput::Url(Url::parse(URL).unwrap())])
        .await
        .unwrap();

    assert_eq!(sources.len(), 1);
    assert!(sources[0].is_temporary());
    assert_eq!(sources[0].text().unwrap(), "SELECT 'healthy'");
    assert_eq!(
        downloader.attempts(),
        vec![
            (URL.to_string(), FetchAuth::Anonymous),
            (URL.to_string(), FetchAuth::DefaultCredentials)
        ]
    );
}

#[tokio::test]
async fn test_failed_download_executes_nothing() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("scratch");
    let server = MockServer::new();
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let downloader = Arc::new(ScriptedDownloader::new().serve(URL, None, None));
    let resolver = resolver(downloader.clone(), &scratch);

    let local = dir.path().join("first.sql");
    fs::write(&local, "SELECT 1").unwrap();

    let invocation = QueryInvocation {
        selector: TargetSelector::instances(vec![InstanceSpec::new("sql01")]),
        body: QueryBody::Inputs(vec![
            QueryInput::File(local),
            QueryInput::Url(Url::parse(URL).unwrap()),
        ]),
        options: QueryOptions::default(),
    };
    let err = invoke_query(
        invocation,
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, FleetError::Download(_)));
    assert_eq!(downloader.attempts().len(), 2);
    assert!(server.executed().is_empty());
    assert_eq!(server.connects(), 0);
    assert_eq!(entries(&scratch), 0);
}

#[tokio::test]
async fn test_undecodable_script_executes_nothing_on_any_target() {
    let dir = TempDir::new().unwrap();
    let scripts = dir.path().join("scripts");
    fs::create_dir(&scripts).unwrap();
    fs::write(scripts.join("01.sql"), "UPDATE t SET x = 1").unwrap();
    fs::write(scripts.join("02.sql"), [0xFF, 0xFE, 0x00, 0xD8]).unwrap();

    let first = MockServer::new();
    let second = MockServer::new();
    let binder = mock_binder(
        MockConnector::new()
            .with_server("sql01", first.clone())
            .with_server("sql02", second.clone()),
    );
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), &dir.path().join("scratch"));

    let invocation = QueryInvocation {
        selector: TargetSelector::instances(vec![
            InstanceSpec::new("sql01"),
            InstanceSpec::new("sql02"),
        ]),
        body: QueryBody::Inputs(vec![QueryInput::Directory(scripts)]),
        options: QueryOptions::default(),
    };
    let err = invoke_query(
        invocation,
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, FleetError::InvalidArgument(_)));
    assert!(err.to_string().contains("02.sql"));
    assert!(first.executed().is_empty());
    assert!(second.executed().is_empty());
    assert_eq!(first.connects() + second.connects(), 0);
}

#[tokio::test]
async fn test_utf16_script_executes_decoded_text() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("unicode.sql");
    let mut bytes = vec![0xFF, 0xFE];
    bytes.extend("SELECT N'Zürich'".encode_utf16().flat_map(u16::to_le_bytes));
    fs::write(&script, bytes).unwrap();

    let server = MockServer::new();
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));
    let resolver = resolver(Arc::new(ScriptedDownloader::new()), &dir.path().join("scratch"));

    let invocation = QueryInvocation {
        selector: TargetSelector::instances(vec![InstanceSpec::new("sql01")]),
        body: QueryBody::Inputs(vec![QueryInput::File(script)]),
        options: QueryOptions::default(),
    };
    invoke_query(
        invocation,
        &resolver,
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(server.executed_sql(), vec!["SELECT N'Zürich'"]);
}

#[tokio::test]
async fn test_object_is_scripted_into_temporary_source() {
    use sqlfleet::db::{ConnectOptions, Connector, ScriptableObject};
    use sqlfleet::resolve::ServerScriptGenerator;

    let dir = TempDir::new().unwrap();
    let source_server =
        MockServer::new().with_definition("dbo.ActiveUsers", "CREATE VIEW dbo.ActiveUsers AS SELECT 1");
    let connector = MockConnector::new().with_server("template", source_server);
    let client = connector
        .connect(&InstanceSpec::new("template"), &ConnectOptions::default())
        .await
        .unwrap();

    let resolver = resolver(Arc::new(ScriptedDownloader::new()), &dir.path().join("scratch"))
        .with_script_generator(Arc::new(ServerScriptGenerator::new(client)));
    let object = ScriptableObject::parse("view:dbo.ActiveUsers").unwrap();
    let sources = resolver
        .resolve(&[QueryInput::Object(object.clone())])
        .await
        .unwrap();

    assert_eq!(sources[0].origin(), &SourceOrigin::Generated(object));
    assert!(sources[0].text().unwrap().starts_with("CREATE VIEW"));
    let name = sources[0].path().unwrap().file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("sqlfleet-object-"));
}
