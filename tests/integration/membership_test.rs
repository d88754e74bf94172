//! Server role membership tests.

use pretty_assertions::assert_eq;

use sqlfleet::batch::{ConfirmationGate, ErrorPolicy, FixedPrompter, Impact};
use sqlfleet::db::{MockConnector, MockServer};
use sqlfleet::error::FleetError;
use sqlfleet::instance::InstanceSpec;
use sqlfleet::membership::{apply_membership, list_roles, MembershipAction, MembershipJob};

use super::mock_binder;

fn remove(role: &str, logins: &[&str]) -> MembershipJob {
    MembershipJob {
        action: MembershipAction::Remove,
        server_roles: vec![role.to_string()],
        logins: logins.iter().map(|l| l.to_string()).collect(),
        roles: Vec::new(),
    }
}

#[tokio::test]
async fn test_dry_run_reports_only_pending_removals() {
    let server = MockServer::new().with_role("sysadmin", &["sa", r"CORP\alice", r"CORP\bob", "etl"]);
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));

    let job = remove(
        "sysadmin",
        &[r"CORP\alice", r"CORP\bob", "etl", r"CORP\nobody"],
    );
    let report = apply_membership(
        &job,
        &[InstanceSpec::new("sql01")],
        &binder,
        &ConfirmationGate::dry_run(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert!(server.role_changes().is_empty());
    assert!(report.records.is_empty());
    assert_eq!(report.planned.len(), 3);
    assert!(report.planned.iter().all(|p| p.impact == Impact::High));
    assert_eq!(
        report.planned[0].action,
        r"Remove login 'CORP\alice' from server role 'sysadmin'"
    );
    assert_eq!(server.members_of("sysadmin").len(), 4);
}

#[tokio::test]
async fn test_failure_on_one_instance_does_not_stop_the_next() {
    let broken = MockServer::new()
        .with_role("sysadmin", &["etl"])
        .failing_role_changes();
    let healthy = MockServer::new().with_role("sysadmin", &["etl"]);
    let binder = mock_binder(
        MockConnector::new()
            .with_server("sql01", broken.clone())
            .with_server("sql02", healthy.clone()),
    );

    let report = apply_membership(
        &remove("sysadmin", &["etl"]),
        &[InstanceSpec::new("sql01"), InstanceSpec::new("sql02")],
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, "sql01");
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].instance, "sql02");
    assert_eq!(healthy.role_changes(), vec!["DROP etl FROM sysadmin"]);
    assert_eq!(broken.members_of("sysadmin"), vec!["etl"]);
}

#[tokio::test]
async fn test_raise_policy_stops_at_first_failure() {
    let broken = MockServer::new()
        .with_role("sysadmin", &["etl"])
        .failing_role_changes();
    let healthy = MockServer::new().with_role("sysadmin", &["etl"]);
    let binder = mock_binder(
        MockConnector::new()
            .with_server("sql01", broken)
            .with_server("sql02", healthy.clone()),
    );

    let err = apply_membership(
        &remove("sysadmin", &["etl"]),
        &[InstanceSpec::new("sql01"), InstanceSpec::new("sql02")],
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Raise,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, FleetError::Execution(_)));
    assert!(healthy.role_changes().is_empty());
}

#[tokio::test]
async fn test_missing_role_is_skipped() {
    let server = MockServer::new().with_role("dbcreator", &[]);
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));

    let job = MembershipJob {
        action: MembershipAction::Add,
        server_roles: vec!["auditors".to_string(), "dbcreator".to_string()],
        logins: vec!["deploy".to_string()],
        roles: Vec::new(),
    };
    let report = apply_membership(
        &job,
        &[InstanceSpec::new("sql01")],
        &binder,
        &ConfirmationGate::unattended(),
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert!(!report.has_failures());
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].reason.contains("auditors"));
    assert_eq!(server.role_changes(), vec!["ADD deploy TO dbcreator"]);
}

#[tokio::test]
async fn test_declined_prompt_skips_change() {
    let server = MockServer::new().with_role("sysadmin", &["etl"]);
    let binder = mock_binder(MockConnector::new().with_server("sql01", server.clone()));

    let gate = ConfirmationGate::apply(Some(Impact::High), false).with_prompter(FixedPrompter(false));
    let report = apply_membership(
        &remove("sysadmin", &["etl"]),
        &[InstanceSpec::new("sql01")],
        &binder,
        &gate,
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert!(server.role_changes().is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].reason.starts_with("declined"));
}

#[tokio::test]
async fn test_list_roles_across_instances() {
    let binder = mock_binder(
        MockConnector::new()
            .with_server("sql01", MockServer::new().with_role("sysadmin", &["sa"]))
            .with_server("sql02", MockServer::unreachable()),
    );

    let report = list_roles(
        &[InstanceSpec::new("sql01"), InstanceSpec::new("sql02")],
        &[],
        &binder,
        ErrorPolicy::Warn,
    )
    .await
    .unwrap();

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].0, "sql01");
    assert_eq!(report.records[0].1.name, "sysadmin");
    assert_eq!(report.failures.len(), 1);
}
