//! Server role membership changes.
//!
//! Adds or removes logins and roles to or from server roles on each instance.
//! Only pending changes are turned into actions: removing a principal that is
//! not a member, or adding one that already is, is not an action at all.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::{
    BatchReport, BoundContext, ConfirmationGate, ConnectionBinder, Decision, ErrorPolicy,
    ExecutionTarget, Impact, PlannedAction,
};
use crate::db::ServerRole;
use crate::error::{FleetError, Result};
use crate::instance::InstanceSpec;

/// Direction of a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    Add,
    Remove,
}

impl MembershipAction {
    /// Impact used by the confirmation gate.
    pub fn impact(&self) -> Impact {
        match self {
            Self::Add => Impact::Medium,
            Self::Remove => Impact::High,
        }
    }

    fn describe(&self, kind: MemberKind, member: &str, role: &str) -> String {
        match self {
            Self::Add => format!("Add {kind} '{member}' to server role '{role}'"),
            Self::Remove => format!("Remove {kind} '{member}' from server role '{role}'"),
        }
    }
}

/// Whether a member is a login or a nested role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    Login,
    Role,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login => f.write_str("login"),
            Self::Role => f.write_str("role"),
        }
    }
}

/// A membership change requested for every target instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipJob {
    pub action: MembershipAction,
    /// Server roles to change.
    pub server_roles: Vec<String>,
    pub logins: Vec<String>,
    /// Roles to add to or remove from the server roles.
    pub roles: Vec<String>,
}

impl MembershipJob {
    pub fn validate(&self) -> Result<()> {
        if self.server_roles.is_empty() {
            return Err(FleetError::invalid_argument("At least one server role is required"));
        }
        if self.logins.is_empty() && self.roles.is_empty() {
            return Err(FleetError::invalid_argument(
                "At least one login or role is required",
            ));
        }
        Ok(())
    }

    fn members(&self) -> impl Iterator<Item = (MemberKind, &str)> + '_ {
        self.logins
            .iter()
            .map(|l| (MemberKind::Login, l.as_str()))
            .chain(self.roles.iter().map(|r| (MemberKind::Role, r.as_str())))
    }

    fn is_pending(&self, role: &ServerRole, member: &str) -> bool {
        match self.action {
            MembershipAction::Add => !role.has_member(member),
            MembershipAction::Remove => role.has_member(member),
        }
    }
}

/// A membership change that was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipRecord {
    pub instance: String,
    pub server_role: String,
    pub member: String,
    pub member_kind: MemberKind,
    pub action: MembershipAction,
}

/// Applies `job` to every instance in order.
///
/// Instances are connected even in dry-run mode so that only pending
/// changes are reported.
pub async fn apply_membership(
    job: &MembershipJob,
    instances: &[InstanceSpec],
    binder: &ConnectionBinder,
    gate: &ConfirmationGate,
    policy: ErrorPolicy,
) -> Result<BatchReport<MembershipRecord>> {
    job.validate()?;
    if instances.is_empty() {
        return Err(FleetError::invalid_argument("At least one instance is required"));
    }

    let mut report = BatchReport::default();
    for spec in instances {
        let label = spec.display_name();
        let context = match binder.bind(&ExecutionTarget::Instance(spec.clone())).await {
            Ok(Some(context)) => context,
            Ok(None) => continue,
            Err(e) => {
                report.record_failure(policy, &label, None, e)?;
                continue;
            }
        };

        let outcome = apply_to_instance(job, &context, &label, gate, policy, &mut report).await;
        let released = context.release().await;
        outcome?;
        if let Err(e) = released {
            debug!(instance = %label, error = %e, "Failed to release connection");
        }
    }
    Ok(report)
}

async fn apply_to_instance(
    job: &MembershipJob,
    context: &BoundContext,
    label: &str,
    gate: &ConfirmationGate,
    policy: ErrorPolicy,
    report: &mut BatchReport<MembershipRecord>,
) -> Result<()> {
    let client = context.client();
    let roles = match client.list_server_roles(&job.server_roles).await {
        Ok(roles) => roles,
        Err(e) => return report.record_failure(policy, label, None, e),
    };

    for requested in &job.server_roles {
        let Some(role) = roles.iter().find(|r| r.name.eq_ignore_ascii_case(requested)) else {
            warn!(instance = %label, role = %requested, "Server role not found, skipping");
            report.skip(label, format!("server role '{requested}' not found"));
            continue;
        };

        for (kind, member) in job.members() {
            if !job.is_pending(role, member) {
                debug!(instance = %label, role = %role.name, %member, "No change needed");
                continue;
            }

            let action = PlannedAction::new(
                label,
                job.action.describe(kind, member, &role.name),
                job.action.impact(),
            );
            match gate.check(&action)? {
                Decision::Planned => report.planned.push(action),
                Decision::Skip => report.skip(label, format!("declined: {}", action.action)),
                Decision::Proceed => {
                    let changed = match job.action {
                        MembershipAction::Add => client.add_role_member(&role.name, member).await,
                        MembershipAction::Remove => {
                            client.drop_role_member(&role.name, member).await
                        }
                    };
                    if let Err(e) = changed {
                        return report.record_failure(policy, label, Some(&action.action), e);
                    }
                    info!(instance = %label, "{}", action.action);
                    report.records.push(MembershipRecord {
                        instance: label.to_string(),
                        server_role: role.name.clone(),
                        member: member.to_string(),
                        member_kind: kind,
                        action: job.action,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Lists server roles on each instance, optionally filtered by name.
pub async fn list_roles(
    instances: &[InstanceSpec],
    filter: &[String],
    binder: &ConnectionBinder,
    policy: ErrorPolicy,
) -> Result<BatchReport<(String, ServerRole)>> {
    let mut report = BatchReport::default();
    for spec in instances {
        let label = spec.display_name();
        let context = match binder.bind(&ExecutionTarget::Instance(spec.clone())).await {
            Ok(Some(context)) => context,
            Ok(None) => continue,
            Err(e) => {
                report.record_failure(policy, &label, None, e)?;
                continue;
            }
        };

        let listed = context.client().list_server_roles(filter).await;
        let released = context.release().await;
        match listed {
            Ok(roles) => report
                .records
                .extend(roles.into_iter().map(|role| (label.clone(), role))),
            Err(e) => report.record_failure(policy, &label, None, e)?,
        }
        if let Err(e) = released {
            debug!(instance = %label, error = %e, "Failed to release connection");
        }
    }
    Ok(report)
}
