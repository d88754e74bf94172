//! sqlfleet - run queries, scripts and server role changes across a fleet of
//! database instances.

use std::collections::HashMap;
use std::io::{self, BufRead, Read};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use sqlfleet::batch::{
    ensure_single_target_kind, execute_sources, resolve_body, BatchReport, ConnectionBinder,
    DatabaseHandle, ErrorPolicy, QueryBody, QueryOptions, QueryRecord, TargetFailure,
    TargetSelector,
};
use sqlfleet::cli::{
    Cli, Command, CredentialCommand, LoginArgs, MembershipArgs, QueryArgs, RoleCommand,
    RoleListArgs,
};
use sqlfleet::config::Config;
use sqlfleet::db::{ConnectOptions, NativeConnector, QueryParam, ScriptableObject, ServerClient};
use sqlfleet::error::{FleetError, Result};
use sqlfleet::instance::{Credential, InstanceSpec};
use sqlfleet::logging::{init_file_logging, init_stderr_logging};
use sqlfleet::membership::{apply_membership, list_roles, MembershipAction, MembershipJob};
use sqlfleet::output::{
    render_failures, render_membership_report, render_query_report, render_roles,
};
use sqlfleet::resolve::{
    HttpDownloader, InputResolver, QueryInput, ServerScriptGenerator, TempArtifactManager,
};
use sqlfleet::secrets::CredentialStore;

/// Exit code when every target succeeded.
const EXIT_OK: i32 = 0;
/// Exit code for batch-fatal errors.
const EXIT_FATAL: i32 = 1;
/// Exit code when the batch completed with failed targets.
const EXIT_TARGET_FAILURES: i32 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse_args();

    let config_path = cli.config_path();
    let config = match Config::load_from_file(&config_path) {
        Ok(mut config) => {
            config.apply_env_defaults();
            config
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(EXIT_FATAL);
        }
    };

    match &config.logging.file {
        Some(path) => init_file_logging(path, cli.verbose),
        None => init_stderr_logging(cli.verbose),
    }
    debug!("Loaded config from: {}", config_path.display());

    let code = match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}: {}", e.category(), e);
            eprintln!("Error: {e}");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(command: Command, config: &Config) -> Result<i32> {
    match command {
        Command::Query(args) => run_query(args, config).await,
        Command::Role { command } => match command {
            RoleCommand::Add(args) => run_membership(MembershipAction::Add, args, config).await,
            RoleCommand::Remove(args) => {
                run_membership(MembershipAction::Remove, args, config).await
            }
            RoleCommand::List(args) => run_role_list(args, config).await,
        },
        Command::Credential { command } => run_credential(command, config),
    }
}

fn build_binder(config: &Config) -> ConnectionBinder {
    ConnectionBinder::new(
        Arc::new(NativeConnector),
        ConnectOptions::from(&config.connection),
        config.connection.credential_classifier().shared(),
    )
}

/// Resolves instance arguments and fills in credentials.
///
/// Password precedence: command line or environment, then the named
/// instance, then the OS keyring.
fn resolve_instances(
    names: &[String],
    login: &LoginArgs,
    config: &Config,
) -> Result<Vec<InstanceSpec>> {
    let store = CredentialStore::new();
    names
        .iter()
        .map(|name| {
            let mut spec = config.resolve_instance(name)?;
            let key = spec.display_name();
            if let Some(user) = &login.user {
                let keep = spec.user() == Some(user.as_str());
                let password = spec.credential.take().filter(|_| keep).and_then(|c| c.password);
                spec.credential = Some(Credential::new(user, password));
            }
            if let Some(credential) = spec.credential.as_mut() {
                if login.password.is_some() {
                    credential.password = login.password.clone();
                } else if credential.password.is_none() {
                    credential.password = store.lookup(&key, &credential.user);
                }
            }
            Ok(spec)
        })
        .collect()
}

/// Keyring key for an instance argument.
fn spec_key(name: &str, config: &Config) -> String {
    config
        .resolve_instance(name)
        .map(|spec| spec.display_name())
        .unwrap_or_else(|_| name.to_string())
}

fn finish<R>(report: &BatchReport<R>) -> i32 {
    report_failures(&report.failures)
}

fn report_failures(failures: &[TargetFailure]) -> i32 {
    if failures.is_empty() {
        return EXIT_OK;
    }
    eprint!("{}", render_failures(failures));
    EXIT_TARGET_FAILURES
}

async fn run_query(args: QueryArgs, config: &Config) -> Result<i32> {
    ensure_single_target_kind(!args.instances.is_empty(), args.databases_from.is_some())?;
    let body = query_body(&args)?;
    let options = QueryOptions {
        command_type: args.command_type,
        params: args
            .params
            .iter()
            .map(|p| QueryParam::parse(p))
            .collect::<Result<_>>()?,
        timeout: args
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.query_timeout()),
        capture_messages: args.messages,
        append_instance: args.append_instance,
    };

    let binder = build_binder(config);
    let outcome = run_query_with(&args, body, options, config, &binder).await;
    binder.shutdown().await;

    let (report, early_failures) = outcome?;
    print!(
        "{}",
        render_query_report(&report, args.shape, args.exec.format)?
    );

    let mut failures = early_failures;
    failures.extend(report.failures);
    Ok(report_failures(&failures))
}

async fn run_query_with(
    args: &QueryArgs,
    body: QueryBody,
    options: QueryOptions,
    config: &Config,
    binder: &ConnectionBinder,
) -> Result<(BatchReport<QueryRecord>, Vec<TargetFailure>)> {
    let temp = Arc::new(TempArtifactManager::new(config.scratch.resolve_dir()));
    let downloader = Arc::new(HttpDownloader::new(&config.download)?);
    let mut resolver = InputResolver::new(config.query.script_extensions.clone(), downloader, temp);

    if let (Some(source), false) = (&args.script_from, args.object.is_empty()) {
        let specs = resolve_instances(std::slice::from_ref(source), &args.login, config)?;
        let spec = specs
            .into_iter()
            .next()
            .ok_or_else(|| FleetError::internal("Script source did not resolve"))?;
        let client = binder.connect_shared(&spec).await.map_err(|e| {
            FleetError::generation(format!("Cannot script objects from {spec}: {e}"))
        })?;
        resolver = resolver.with_script_generator(Arc::new(ServerScriptGenerator::new(client)));
    }

    let outcome = run_resolved(args, body, &options, config, binder, &resolver).await;
    let removed = resolver.temp().finalize();
    debug!(removed, "Finalized temporary artifacts");
    outcome
}

/// Resolves the inputs, then connects and runs. Handle connections are only
/// opened once every source is readable.
async fn run_resolved(
    args: &QueryArgs,
    body: QueryBody,
    options: &QueryOptions,
    config: &Config,
    binder: &ConnectionBinder,
    resolver: &InputResolver,
) -> Result<(BatchReport<QueryRecord>, Vec<TargetFailure>)> {
    let policy = args.exec.policy();
    let sources = resolve_body(body, resolver).await?;
    let mut early = BatchReport::<()>::default();

    let selector = match &args.databases_from {
        Some(source) => {
            let handles = read_database_handles(source, args, config, binder, policy, &mut early)
                .await?;
            if handles.is_empty() && !early.has_failures() {
                return Err(FleetError::invalid_argument(format!(
                    "No database handles read from {source}"
                )));
            }
            TargetSelector::databases(handles)
        }
        None => {
            let mut instances = resolve_instances(&args.instances, &args.login, config)?;
            for spec in &mut instances {
                if let Some(database) = &args.database {
                    spec.database = Some(database.clone());
                }
                spec.read_only |= args.read_only;
            }
            TargetSelector::instances(instances)
        }
    };

    if selector.databases.is_empty() && selector.instances.is_empty() {
        // Every handle's instance failed to connect.
        return Ok((BatchReport::default(), early.failures));
    }

    let gate = args
        .exec
        .gate(args.confirm.then_some(config.query.confirm_threshold));
    let report = execute_sources(selector, &sources, options, binder, &gate, policy).await?;
    Ok((report, early.failures))
}

fn query_body(args: &QueryArgs) -> Result<QueryBody> {
    if let Some(sql) = &args.query {
        return Ok(QueryBody::Literal(sql.clone()));
    }

    let mut inputs = args
        .input
        .iter()
        .map(|arg| QueryInput::classify(arg))
        .collect::<Result<Vec<_>>>()?;
    for object in &args.object {
        inputs.push(QueryInput::Object(ScriptableObject::parse(object)?));
    }

    if inputs.is_empty() {
        return Err(FleetError::invalid_argument(
            "Nothing to execute: use --query, --input or --object",
        ));
    }
    Ok(QueryBody::Inputs(inputs))
}

#[derive(Debug, Deserialize)]
struct DatabaseRecord {
    instance: String,
    database: String,
}

/// Reads database handle records and connects once per distinct instance.
async fn read_database_handles(
    source: &str,
    args: &QueryArgs,
    config: &Config,
    binder: &ConnectionBinder,
    policy: ErrorPolicy,
    early: &mut BatchReport<()>,
) -> Result<Vec<DatabaseHandle>> {
    let content = if source == "-" {
        let mut buffer = String::new();
        io::stdin().lock().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(source).map_err(|e| {
            FleetError::not_found(format!("Cannot read database list {source}: {e}"))
        })?
    };

    let mut connected: HashMap<String, Option<Arc<dyn ServerClient>>> = HashMap::new();
    let mut handles = Vec::new();
    for record in serde_json::Deserializer::from_str(&content).into_iter::<DatabaseRecord>() {
        let record = record.map_err(|e| {
            FleetError::invalid_argument(format!("Invalid database record in {source}: {e}"))
        })?;

        if !connected.contains_key(&record.instance) {
            let spec = resolve_instances(
                std::slice::from_ref(&record.instance),
                &args.login,
                config,
            )?
            .into_iter()
            .next()
            .map(|spec| spec.with_read_only(args.read_only));

            let shared = match spec {
                Some(spec) => match binder.connect_shared(&spec).await {
                    Ok(client) => Some(client),
                    Err(e) => {
                        early.record_failure(policy, &record.instance, None, e)?;
                        None
                    }
                },
                None => None,
            };
            connected.insert(record.instance.clone(), shared);
        }

        match connected.get(&record.instance) {
            Some(Some(server)) => {
                handles.push(DatabaseHandle::new(Arc::clone(server), record.database))
            }
            _ => warn!(
                instance = %record.instance,
                database = %record.database,
                "Skipping database on unreachable instance"
            ),
        }
    }
    info!(handles = handles.len(), "Read database handles");
    Ok(handles)
}

async fn run_membership(
    action: MembershipAction,
    args: MembershipArgs,
    config: &Config,
) -> Result<i32> {
    let instances = resolve_instances(&args.instances, &args.login, config)?;
    let job = MembershipJob {
        action,
        server_roles: args.server_roles,
        logins: args.logins,
        roles: args.roles,
    };
    let gate = args.exec.gate(Some(config.query.confirm_threshold));

    let binder = build_binder(config);
    let outcome = apply_membership(&job, &instances, &binder, &gate, args.exec.policy()).await;
    binder.shutdown().await;

    let report = outcome?;
    print!("{}", render_membership_report(&report, args.exec.format)?);
    Ok(finish(&report))
}

async fn run_role_list(args: RoleListArgs, config: &Config) -> Result<i32> {
    let instances = resolve_instances(&args.instances, &args.login, config)?;
    let policy = if args.enable_exception {
        ErrorPolicy::Raise
    } else {
        ErrorPolicy::Warn
    };

    let binder = build_binder(config);
    let outcome = list_roles(&instances, &args.server_roles, &binder, policy).await;
    binder.shutdown().await;

    let report = outcome?;
    print!("{}", render_roles(&report, args.format)?);
    Ok(finish(&report))
}

fn run_credential(command: CredentialCommand, config: &Config) -> Result<i32> {
    let store = CredentialStore::new();
    match command {
        CredentialCommand::Set {
            instance,
            user,
            password,
        } => {
            let password = match password {
                Some(p) => p,
                None => {
                    eprint!("Password for {user} on {instance}: ");
                    let mut line = String::new();
                    io::stdin().lock().read_line(&mut line)?;
                    line.trim_end_matches(['\r', '\n']).to_string()
                }
            };
            if password.is_empty() {
                return Err(FleetError::invalid_argument("Password cannot be empty"));
            }
            let key = spec_key(&instance, config);
            store.store(&key, &user, &password)?;
            println!(
                "Stored password {} for {user} on {key}",
                CredentialStore::mask(&password)
            );
        }
        CredentialCommand::Delete { instance, user } => {
            let key = spec_key(&instance, config);
            store.delete(&key, &user)?;
            println!("Deleted password for {user} on {key}");
        }
    }
    Ok(EXIT_OK)
}
