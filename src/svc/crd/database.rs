//! # Database custom resource
//!
//! This module provide the database custom resource, its definition and the
//! reconciliation state machine which creates and drops the database and its
//! user on the referenced server.

use std::{
    fmt::{self, Display, Formatter},
    future::Future,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use kube::{
    runtime::{watcher, Controller},
    Api, Client, CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::svc::{
    k8s::{
        self, finalizer, recorder, resource,
        secret::{self, SecretStore},
        Context, ControllerBuilder,
    },
    provisioner::{self, Endpoint, Provisioner, Registry},
};

// -----------------------------------------------------------------------------
// Constants

pub const DATABASE_FINALIZER: &str = "jakub-bacic.github.com/delete-db";

/// delay in seconds before a resource in error is retried
pub const RETRY_DELAY: i64 = 10;

// -----------------------------------------------------------------------------
// SecretRef structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct SecretRef {
    #[serde(rename = "secretName")]
    pub name: String,
    #[serde(rename = "secretKey")]
    pub key: String,
}

// -----------------------------------------------------------------------------
// Instance structure

/// the database to provision and the user owning it
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Instance {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "user")]
    pub user: String,
    #[serde(rename = "passwordSecretRef")]
    pub password_secret_ref: SecretRef,
}

// -----------------------------------------------------------------------------
// Server structure

/// the server on which the database is provisioned
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Server {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "host")]
    pub host: String,
    #[serde(rename = "port")]
    pub port: u16,
    #[serde(rename = "rootUser")]
    pub root_user: String,
    #[serde(rename = "rootPasswordSecretRef")]
    pub root_password_secret_ref: SecretRef,
}

impl Server {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.to_owned(),
            port: self.port,
        }
    }
}

// -----------------------------------------------------------------------------
// DropOnDelete enumeration

/// tells if the database and its user are dropped along with the resource,
/// it is resolved once when the resource leaves its initial phase
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum DropOnDelete {
    #[default]
    Unset,
    True,
    False,
}

impl From<Option<bool>> for DropOnDelete {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => Self::Unset,
            Some(true) => Self::True,
            Some(false) => Self::False,
        }
    }
}

impl From<DropOnDelete> for Option<bool> {
    fn from(value: DropOnDelete) -> Self {
        match value {
            DropOnDelete::Unset => None,
            DropOnDelete::True => Some(true),
            DropOnDelete::False => Some(false),
        }
    }
}

impl DropOnDelete {
    pub fn is_unset(&self) -> bool {
        *self == Self::Unset
    }

    /// returns the concrete value, an unset value defaults to true
    pub fn resolve(self) -> Self {
        match self {
            Self::Unset => Self::True,
            other => other,
        }
    }

    pub fn enabled(self) -> bool {
        self.resolve() == Self::True
    }
}

// -----------------------------------------------------------------------------
// Opts structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Opts {
    #[serde(
        rename = "dropOnDelete",
        default,
        skip_serializing_if = "DropOnDelete::is_unset"
    )]
    #[schemars(with = "Option<bool>")]
    pub drop_on_delete: DropOnDelete,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "jakub-bacic.github.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "Database")]
#[kube(singular = "database")]
#[kube(plural = "databases")]
#[kube(shortname = "db")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"database", "type":"string", "description":"Database", "jsonPath":".spec.database.name"}"#
)]
#[kube(
    printcolumn = r#"{"name":"server", "type":"string", "description":"Server type", "jsonPath":".spec.server.type"}"#
)]
#[kube(
    printcolumn = r#"{"name":"phase", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#
)]
pub struct Spec {
    #[serde(rename = "database")]
    pub database: Instance,
    #[serde(rename = "server")]
    pub server: Server,
    #[serde(rename = "options", default)]
    pub options: Opts,
}

// -----------------------------------------------------------------------------
// Phase enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Phase {
    #[default]
    #[serde(rename = "")]
    Initial,
    Creating,
    Created,
    Deleting,
    Error,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "Initial"),
            Self::Creating => write!(f, "Creating"),
            Self::Created => write!(f, "Created"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Error => write!(f, "Error"),
        }
    }
}

// -----------------------------------------------------------------------------
// Reason enumeration

/// kind of the last failure
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum Reason {
    Configuration,
    Credential,
    Provisioning,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "phase", default)]
    pub phase: Phase,
    /// unix timestamp in seconds of the last failure
    #[serde(rename = "lastErrorTimestamp", default)]
    pub last_error_timestamp: Option<i64>,
    #[serde(rename = "lastErrorReason", default)]
    pub last_error_reason: Option<Reason>,
}

// -----------------------------------------------------------------------------
// Database implementation

impl Database {
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// moves to the given phase, error information is cleared when leaving
    /// the error phase
    pub fn set_phase(&mut self, phase: Phase) {
        let status = self.status.get_or_insert_with(Status::default);

        status.phase = phase;
        if phase != Phase::Error {
            status.last_error_timestamp = None;
            status.last_error_reason = None;
        }
    }

    pub fn set_error(&mut self, reason: Reason, now: i64) {
        let status = self.status.get_or_insert_with(Status::default);

        status.phase = Phase::Error;
        status.last_error_timestamp = Some(now);
        status.last_error_reason = Some(reason);
    }

    /// returns the number of seconds elapsed since the last failure
    pub fn seconds_since_last_error(&self, now: i64) -> Option<i64> {
        self.status
            .as_ref()
            .and_then(|s| s.last_error_timestamp)
            .map(|timestamp| now.saturating_sub(timestamp))
    }
}

// -----------------------------------------------------------------------------
// Action enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Action {
    Initialize,
    CreateDatabase,
    ScheduleDeletion,
    DeleteDatabase,
    ReleaseFinalizer,
    Fail,
    Recover,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Initialize => write!(f, "Initialize"),
            Self::CreateDatabase => write!(f, "CreateDatabase"),
            Self::ScheduleDeletion => write!(f, "ScheduleDeletion"),
            Self::DeleteDatabase => write!(f, "DeleteDatabase"),
            Self::ReleaseFinalizer => write!(f, "ReleaseFinalizer"),
            Self::Fail => write!(f, "Fail"),
            Self::Recover => write!(f, "Recover"),
        }
    }
}

// -----------------------------------------------------------------------------
// ProvisionError enum

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("invalid server configuration, {0}")]
    Configuration(provisioner::Error),
    #[error("failed to resolve credentials, {0}")]
    Credential(secret::Error),
    #[error("failed to provision database, {0}")]
    Provisioning(provisioner::Error),
}

impl ProvisionError {
    pub fn reason(&self) -> Reason {
        match self {
            Self::Configuration(_) => Reason::Configuration,
            Self::Credential(_) => Reason::Credential,
            Self::Provisioning(_) => Reason::Provisioning,
        }
    }
}

// -----------------------------------------------------------------------------
// Transition structure

/// the single mutation decided for one snapshot of a resource
#[derive(Clone, Debug)]
pub struct Transition {
    pub action: Action,
    pub message: String,
    pub modified: Database,
}

// -----------------------------------------------------------------------------
// State machine

/// returns the provisioner matching the server type of the resource, the root
/// credentials are resolved on each call
async fn connect(
    secrets: &dyn SecretStore,
    registry: &Registry,
    origin: &Database,
) -> Result<Box<dyn Provisioner>, ProvisionError> {
    let server = &origin.spec.server;
    let (namespace, _) = resource::namespaced_name(origin);

    let driver = registry
        .get(&server.kind)
        .map_err(ProvisionError::Configuration)?;

    let root = secret::resolve(
        secrets,
        &namespace,
        &server.root_user,
        &server.root_password_secret_ref,
    )
    .await
    .map_err(ProvisionError::Credential)?;

    Ok(driver.provisioner(server.endpoint(), root))
}

async fn create(
    secrets: &dyn SecretStore,
    registry: &Registry,
    origin: &Database,
) -> Result<(), ProvisionError> {
    let instance = &origin.spec.database;
    let (namespace, _) = resource::namespaced_name(origin);

    let provisioner = connect(secrets, registry, origin).await?;
    let user = secret::resolve(
        secrets,
        &namespace,
        &instance.user,
        &instance.password_secret_ref,
    )
    .await
    .map_err(ProvisionError::Credential)?;

    provisioner
        .create_database(&instance.name, &user)
        .await
        .map_err(ProvisionError::Provisioning)
}

async fn delete(
    secrets: &dyn SecretStore,
    registry: &Registry,
    origin: &Database,
) -> Result<(), ProvisionError> {
    let instance = &origin.spec.database;

    connect(secrets, registry, origin)
        .await?
        .delete_database(&instance.name, &instance.user)
        .await
        .map_err(ProvisionError::Provisioning)
}

/// returns the mutation to apply on the given snapshot, if any. At most one
/// phase change is decided per call, the next one is decided on the snapshot
/// that results from persisting this one. Failures never escape, they move
/// the resource to the error phase.
pub async fn transition(
    secrets: &dyn SecretStore,
    registry: &Registry,
    origin: &Database,
    deletion: bool,
    now: i64,
) -> Option<Transition> {
    let instance = &origin.spec.database;
    let server = &origin.spec.server;
    let mut modified = origin.to_owned();

    let (action, message) = match (origin.phase(), deletion) {
        (Phase::Initial, true) | (Phase::Created, false) => return None,
        (Phase::Initial, false) => {
            modified.spec.options.drop_on_delete = origin.spec.options.drop_on_delete.resolve();
            modified.set_phase(Phase::Creating);

            (Action::Initialize, "Initialize custom resource".to_string())
        }
        (Phase::Creating, _) => match create(secrets, registry, origin).await {
            Ok(()) => {
                // the api server rejects new finalizers once the deletion is
                // requested, the drop then relies on the other finalizers
                if !deletion {
                    modified = finalizer::add(modified, DATABASE_FINALIZER);
                }
                modified.set_phase(Phase::Created);

                let message = format!(
                    "Create database '{}' and user '{}' on {} server '{}'",
                    instance.name,
                    instance.user,
                    server.kind,
                    server.endpoint()
                );
                (Action::CreateDatabase, message)
            }
            Err(err) => {
                warn!(
                    phase = Phase::Creating.to_string(),
                    reason = format!("{:?}", err.reason()),
                    error = err.to_string(),
                    "Failed to create database",
                );

                modified.set_error(err.reason(), now);
                (Action::Fail, format!("Could not create database, {err}"))
            }
        },
        (Phase::Created, true) => {
            modified.set_phase(Phase::Deleting);

            let message = "Resource has been scheduled for deletion".to_string();
            (Action::ScheduleDeletion, message)
        }
        (Phase::Deleting, _) if !origin.spec.options.drop_on_delete.enabled() => {
            modified = finalizer::remove(modified, DATABASE_FINALIZER);

            let message = format!(
                "Keep database '{}' and user '{}', drop on delete is disabled",
                instance.name, instance.user
            );
            (Action::ReleaseFinalizer, message)
        }
        (Phase::Deleting, _) => match delete(secrets, registry, origin).await {
            Ok(()) => {
                modified = finalizer::remove(modified, DATABASE_FINALIZER);

                let message = format!(
                    "Drop database '{}' and user '{}' on {} server '{}'",
                    instance.name,
                    instance.user,
                    server.kind,
                    server.endpoint()
                );
                (Action::DeleteDatabase, message)
            }
            Err(err) => {
                warn!(
                    phase = Phase::Deleting.to_string(),
                    reason = format!("{:?}", err.reason()),
                    error = err.to_string(),
                    "Failed to delete database",
                );

                modified.set_error(err.reason(), now);
                (Action::Fail, format!("Could not delete database, {err}"))
            }
        },
        (Phase::Error, _) => {
            if let Some(elapsed) = origin.seconds_since_last_error(now) {
                if elapsed < RETRY_DELAY {
                    debug!(
                        elapsed = elapsed,
                        delay = RETRY_DELAY,
                        "Wait before recovering from error",
                    );
                    return None;
                }
            }

            let phase = if deletion {
                Phase::Deleting
            } else {
                Phase::Creating
            };

            modified.set_phase(phase);
            (Action::Recover, format!("Recover from error, retry phase '{phase}'"))
        }
    };

    info!(
        action = action.to_string(),
        from = origin.phase().to_string(),
        to = modified.phase().to_string(),
        finalizer = finalizer::contains(&modified, DATABASE_FINALIZER),
        "Compute transition of custom resource",
    );

    Some(Transition {
        action,
        message,
        modified,
    })
}

// -----------------------------------------------------------------------------
// Persistence

/// kind of request needed to persist a mutation
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Write {
    /// metadata and spec, finalizers included
    Metadata,
    Status,
}

/// returns the requests needed to move from the origin to the modified
/// object, in order. The finalizer is written before the status that relies
/// on it and removed by the last request.
pub fn writes(origin: &Database, modified: &Database) -> Vec<Write> {
    let metadata_changed =
        origin.spec != modified.spec || origin.finalizers() != modified.finalizers();
    let status_changed = origin.status != modified.status;
    let releasing = finalizer::contains(origin, DATABASE_FINALIZER)
        && !finalizer::contains(modified, DATABASE_FINALIZER);

    let mut writes = vec![];
    if releasing {
        if status_changed {
            writes.push(Write::Status);
        }
        writes.push(Write::Metadata);
    } else {
        if metadata_changed {
            writes.push(Write::Metadata);
        }
        if status_changed {
            writes.push(Write::Status);
        }
    }

    writes
}

/// executes the requests in order, each one is made on the object returned by
/// the previous one. The first failure stops the sequence.
pub async fn apply<F, Fut>(
    writes: &[Write],
    origin: &Database,
    mut write: F,
) -> Result<(), kube::Error>
where
    F: FnMut(Write, Database) -> Fut,
    Fut: Future<Output = Result<Database, kube::Error>>,
{
    let mut current = origin.to_owned();
    for kind in writes {
        current = write(*kind, current).await?;
    }

    Ok(())
}

/// writes the mutation back, each request is guarded by the resource version
/// of the object it applies to
pub async fn persist(
    client: Client,
    origin: &Database,
    modified: &Database,
) -> Result<(), kube::Error> {
    let metadata = json!({
        "metadata": { "finalizers": modified.finalizers() },
        "spec": modified.spec,
    });
    let status = json!({ "status": modified.status });

    apply(&writes(origin, modified), origin, |kind, current| {
        let client = client.to_owned();
        let metadata = metadata.to_owned();
        let status = status.to_owned();

        async move {
            match kind {
                Write::Metadata => resource::patch(client, &current, metadata).await,
                Write::Status => resource::patch_status(client, &current, status).await,
            }
        }
    })
    .await
}

/// returns if the mutation has been persisted, a conflict means the object
/// changed since it was read and is not an error
pub fn committed(result: Result<(), kube::Error>, action: &Action) -> Result<bool, kube::Error> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if resource::conflict(&err) => {
            debug!(
                action = action.to_string(),
                error = err.to_string(),
                "Custom resource changed since it was read, wait for the next event",
            );
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<Database> for Reconciler {
    fn build(&self, ctx: Arc<Context>) -> Controller<Database> {
        let client = ctx.kube.to_owned();
        let api = match &ctx.config.operator.namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };

        Controller::new(api, watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<Database> for Reconciler {
    type Error = ReconcilerError;

    async fn converge(
        ctx: Arc<Context>,
        origin: Arc<Database>,
        deletion: bool,
    ) -> Result<(), ReconcilerError> {
        let Context {
            kube,
            registry,
            config: _,
        } = ctx.as_ref();

        let now = Utc::now().timestamp();
        let Some(Transition {
            action,
            message,
            modified,
        }) = transition(kube, registry, &origin, deletion, now).await
        else {
            debug!(
                phase = origin.phase().to_string(),
                deletion = deletion,
                "Nothing to do on custom resource",
            );
            return Ok(());
        };

        if !committed(persist(kube.to_owned(), &origin, &modified).await, &action)? {
            return Ok(());
        }

        let result = match action {
            Action::Fail => recorder::warning(kube.to_owned(), &*origin, &action, &message).await,
            _ => recorder::normal(kube.to_owned(), &*origin, &action, &message).await,
        };

        if let Err(err) = result {
            warn!(
                action = action.to_string(),
                error = err.to_string(),
                "Could not record event for custom resource",
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ErrorResponse;

    use super::*;
    use crate::svc::{
        k8s::secret::tests::MemoryStore,
        provisioner::{
            tests::{Call, Recorder},
            Credentials,
        },
    };

    const NAMESPACE: &str = "default";
    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        store: MemoryStore,
        recorder: Recorder,
        registry: Registry,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryStore::default();
            store.insert(NAMESPACE, "root", "password", b"r00t");
            store.insert(NAMESPACE, "app", "password", b"s3cr3t");

            let recorder = Recorder::default();
            let registry = Registry::empty().register("mysql", recorder.to_owned());

            Self {
                store,
                recorder,
                registry,
            }
        }

        async fn step(&self, obj: &Database, deletion: bool, now: i64) -> Option<Transition> {
            transition(&self.store, &self.registry, obj, deletion, now).await
        }
    }

    fn database(kind: &str) -> Database {
        let mut obj = Database::new(
            "shop",
            Spec {
                database: Instance {
                    name: "shop".into(),
                    user: "app".into(),
                    password_secret_ref: SecretRef {
                        name: "app".into(),
                        key: "password".into(),
                    },
                },
                server: Server {
                    kind: kind.into(),
                    host: "mysql.default.svc".into(),
                    port: 3306,
                    root_user: "root".into(),
                    root_password_secret_ref: SecretRef {
                        name: "root".into(),
                        key: "password".into(),
                    },
                },
                options: Opts::default(),
            },
        );

        obj.metadata.namespace = Some(NAMESPACE.into());
        obj
    }

    fn in_phase(mut obj: Database, phase: Phase) -> Database {
        obj.set_phase(phase);
        obj
    }

    fn deleted(mut obj: Database) -> Database {
        obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
        obj
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "mysql.default.svc".into(),
            port: 3306,
        }
    }

    #[tokio::test]
    async fn fresh_resource_is_created() {
        let fixture = Fixture::new();
        let obj = database("mysql");
        assert_eq!(obj.phase(), Phase::Initial);

        let step = fixture.step(&obj, false, NOW).await.unwrap();
        assert_eq!(step.action, Action::Initialize);
        assert_eq!(step.modified.phase(), Phase::Creating);
        assert_eq!(step.modified.spec.options.drop_on_delete, DropOnDelete::True);
        assert!(!finalizer::contains(&step.modified, DATABASE_FINALIZER));
        assert!(fixture.recorder.calls().is_empty());

        let step = fixture.step(&step.modified, false, NOW).await.unwrap();
        assert_eq!(step.action, Action::CreateDatabase);
        assert_eq!(step.modified.phase(), Phase::Created);
        assert!(finalizer::contains(&step.modified, DATABASE_FINALIZER));
        assert_eq!(
            fixture.recorder.calls(),
            vec![Call::Create {
                endpoint: endpoint(),
                root: Credentials::new("root", "r00t"),
                name: "shop".into(),
                user: Credentials::new("app", "s3cr3t"),
            }]
        );

        assert!(fixture.step(&step.modified, false, NOW).await.is_none());
    }

    #[tokio::test]
    async fn explicit_drop_on_delete_is_kept() {
        let fixture = Fixture::new();
        let mut obj = database("mysql");
        obj.spec.options.drop_on_delete = DropOnDelete::False;

        let step = fixture.step(&obj, false, NOW).await.unwrap();

        assert_eq!(step.modified.spec.options.drop_on_delete, DropOnDelete::False);
    }

    #[tokio::test]
    async fn initial_resource_being_deleted_is_left_alone() {
        let fixture = Fixture::new();

        assert!(fixture.step(&deleted(database("mysql")), true, NOW).await.is_none());
    }

    #[tokio::test]
    async fn missing_secret_moves_to_error_and_retries() {
        let fixture = Fixture::new();
        fixture.store.remove(NAMESPACE, "app");
        let obj = in_phase(database("mysql"), Phase::Creating);

        let step = fixture.step(&obj, false, NOW).await.unwrap();
        assert_eq!(step.action, Action::Fail);
        assert_eq!(step.modified.phase(), Phase::Error);
        let status = step.modified.status.clone().unwrap();
        assert_eq!(status.last_error_timestamp, Some(NOW));
        assert_eq!(status.last_error_reason, Some(Reason::Credential));
        assert!(!finalizer::contains(&step.modified, DATABASE_FINALIZER));

        let later = NOW + 11;
        let step = fixture.step(&step.modified, false, later).await.unwrap();
        assert_eq!(step.action, Action::Recover);
        assert_eq!(step.modified.phase(), Phase::Creating);
        assert_eq!(step.modified.status.clone().unwrap().last_error_timestamp, None);

        let step = fixture.step(&step.modified, false, later).await.unwrap();
        assert_eq!(step.action, Action::Fail);
        assert_eq!(step.modified.phase(), Phase::Error);
        assert_eq!(
            step.modified.status.unwrap().last_error_timestamp,
            Some(later)
        );
    }

    #[tokio::test]
    async fn rotated_secret_is_used_on_retry() {
        let fixture = Fixture::new();
        let obj = in_phase(database("mysql"), Phase::Creating);

        fixture.step(&obj, false, NOW).await.unwrap();
        fixture.store.insert(NAMESPACE, "app", "password", b"rotated");
        fixture.step(&obj, false, NOW).await.unwrap();

        let passwords = fixture
            .recorder
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Create { user, .. } => Some(user.password),
                Call::Delete { .. } => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(passwords, vec!["s3cr3t".to_string(), "rotated".to_string()]);
    }

    #[tokio::test]
    async fn error_retry_waits_for_delay() {
        let fixture = Fixture::new();
        let mut obj = database("mysql");
        obj.set_error(Reason::Provisioning, NOW);

        assert!(fixture.step(&obj, false, NOW).await.is_none());
        assert!(fixture.step(&obj, false, NOW + RETRY_DELAY - 1).await.is_none());

        let step = fixture.step(&obj, false, NOW + RETRY_DELAY).await.unwrap();
        assert_eq!(step.action, Action::Recover);
        assert_eq!(step.modified.phase(), Phase::Creating);
        assert!(fixture.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn error_retry_resumes_deletion_when_requested() {
        let fixture = Fixture::new();
        let mut obj = finalizer::add(deleted(database("mysql")), DATABASE_FINALIZER);
        obj.set_error(Reason::Provisioning, NOW);

        let step = fixture.step(&obj, true, NOW + RETRY_DELAY).await.unwrap();

        assert_eq!(step.modified.phase(), Phase::Deleting);
        assert!(finalizer::contains(&step.modified, DATABASE_FINALIZER));
        let status = step.modified.status.unwrap();
        assert_eq!(status.last_error_timestamp, None);
        assert_eq!(status.last_error_reason, None);
    }

    #[tokio::test]
    async fn deletion_drops_database_then_releases_finalizer() {
        let fixture = Fixture::new();
        let mut obj = database("mysql");
        obj.spec.options.drop_on_delete = DropOnDelete::True;
        let obj = deleted(finalizer::add(
            in_phase(obj, Phase::Created),
            DATABASE_FINALIZER,
        ));

        let step = fixture.step(&obj, true, NOW).await.unwrap();
        assert_eq!(step.action, Action::ScheduleDeletion);
        assert_eq!(step.modified.phase(), Phase::Deleting);
        assert!(finalizer::contains(&step.modified, DATABASE_FINALIZER));
        assert!(fixture.recorder.calls().is_empty());

        let step = fixture.step(&step.modified, true, NOW).await.unwrap();
        assert_eq!(step.action, Action::DeleteDatabase);
        assert!(!finalizer::contains(&step.modified, DATABASE_FINALIZER));
        assert_eq!(
            fixture.recorder.calls(),
            vec![Call::Delete {
                endpoint: endpoint(),
                root: Credentials::new("root", "r00t"),
                name: "shop".into(),
                user: "app".into(),
            }]
        );
    }

    #[tokio::test]
    async fn deletion_without_drop_skips_backend() {
        let fixture = Fixture::new();
        let mut obj = database("mysql");
        obj.spec.options.drop_on_delete = DropOnDelete::False;
        let obj = deleted(finalizer::add(
            in_phase(obj, Phase::Deleting),
            DATABASE_FINALIZER,
        ));

        let step = fixture.step(&obj, true, NOW).await.unwrap();

        assert_eq!(step.action, Action::ReleaseFinalizer);
        assert!(!finalizer::contains(&step.modified, DATABASE_FINALIZER));
        assert!(fixture.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_drop_keeps_finalizer() {
        let fixture = Fixture::new();
        fixture.recorder.fail(true);
        let obj = deleted(finalizer::add(
            in_phase(database("mysql"), Phase::Deleting),
            DATABASE_FINALIZER,
        ));

        let step = fixture.step(&obj, true, NOW).await.unwrap();

        assert_eq!(step.action, Action::Fail);
        assert_eq!(step.modified.phase(), Phase::Error);
        assert_eq!(
            step.modified.status.clone().unwrap().last_error_reason,
            Some(Reason::Provisioning)
        );
        assert!(finalizer::contains(&step.modified, DATABASE_FINALIZER));
    }

    #[tokio::test]
    async fn unsupported_server_type_never_leaves_error() {
        let fixture = Fixture::new();
        let mut obj = in_phase(database("postgres"), Phase::Creating);

        for round in 0..3 {
            let now = NOW + round * (RETRY_DELAY + 1);

            let step = fixture.step(&obj, false, now).await.unwrap();
            assert_eq!(step.action, Action::Fail);
            assert_eq!(step.modified.phase(), Phase::Error);
            assert_eq!(
                step.modified.status.clone().unwrap().last_error_reason,
                Some(Reason::Configuration)
            );

            let step = fixture
                .step(&step.modified, false, now + RETRY_DELAY)
                .await
                .unwrap();
            assert_eq!(step.modified.phase(), Phase::Creating);
            obj = step.modified;
        }

        assert!(fixture.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn created_is_idle_without_deletion() {
        let fixture = Fixture::new();
        let obj = finalizer::add(
            in_phase(database("mysql"), Phase::Created),
            DATABASE_FINALIZER,
        );

        for _ in 0..3 {
            assert!(fixture.step(&obj, false, NOW).await.is_none());
        }
        assert!(fixture.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn repeated_snapshot_yields_same_transition() {
        let fixture = Fixture::new();
        let obj = in_phase(database("mysql"), Phase::Creating);

        let first = fixture.step(&obj, false, NOW).await.unwrap();
        let second = fixture.step(&obj, false, NOW).await.unwrap();

        assert_eq!(first.action, second.action);
        assert_eq!(first.modified, second.modified);
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "error".into(),
            reason: "Conflict".into(),
            code,
        })
    }

    fn versioned(mut obj: Database, version: &str) -> Database {
        obj.metadata.resource_version = Some(version.into());
        obj
    }

    #[tokio::test]
    async fn writes_follow_each_action() {
        let fixture = Fixture::new();
        let fresh = database("mysql");
        let created = finalizer::add(
            in_phase(database("mysql"), Phase::Created),
            DATABASE_FINALIZER,
        );
        let deleting = deleted(in_phase(created.to_owned(), Phase::Deleting));
        let mut failed = database("mysql");
        failed.set_error(Reason::Credential, NOW);

        let cases = vec![
            (
                fresh.to_owned(),
                false,
                NOW,
                Action::Initialize,
                vec![Write::Metadata, Write::Status],
            ),
            (
                in_phase(fresh.to_owned(), Phase::Creating),
                false,
                NOW,
                Action::CreateDatabase,
                vec![Write::Metadata, Write::Status],
            ),
            (deleted(created), true, NOW, Action::ScheduleDeletion, vec![Write::Status]),
            (
                deleting.to_owned(),
                true,
                NOW,
                Action::DeleteDatabase,
                vec![Write::Metadata],
            ),
            (failed, false, NOW + RETRY_DELAY, Action::Recover, vec![Write::Status]),
        ];

        for (obj, deletion, now, action, expected) in cases {
            let step = fixture.step(&obj, deletion, now).await.unwrap();

            assert_eq!(step.action, action);
            assert_eq!(writes(&obj, &step.modified), expected, "{action}");
        }

        fixture.recorder.fail(true);
        let step = fixture.step(&deleting, true, NOW).await.unwrap();
        assert_eq!(step.action, Action::Fail);
        assert_eq!(writes(&deleting, &step.modified), vec![Write::Status]);
    }

    #[test]
    fn finalizer_release_is_the_last_write() {
        let origin = finalizer::add(
            in_phase(database("mysql"), Phase::Deleting),
            DATABASE_FINALIZER,
        );
        let mut modified = finalizer::remove(origin.to_owned(), DATABASE_FINALIZER);
        modified.set_error(Reason::Provisioning, NOW);

        assert_eq!(writes(&origin, &modified), vec![Write::Status, Write::Metadata]);
    }

    #[test]
    fn unchanged_object_needs_no_write() {
        let obj = in_phase(database("mysql"), Phase::Created);

        assert!(writes(&obj, &obj).is_empty());
    }

    #[tokio::test]
    async fn writes_are_chained_on_returned_version() {
        let origin = versioned(database("mysql"), "1");
        let seen = Mutex::new(vec![]);

        apply(&[Write::Metadata, Write::Status], &origin, |kind, current| {
            seen.lock()
                .unwrap()
                .push((kind, current.metadata.resource_version.to_owned()));

            async move { Ok(versioned(current, "2")) }
        })
        .await
        .unwrap();

        assert_eq!(
            seen.into_inner().unwrap(),
            vec![
                (Write::Metadata, Some("1".to_string())),
                (Write::Status, Some("2".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn conflict_stops_remaining_writes() {
        let origin = versioned(database("mysql"), "1");
        let seen = Mutex::new(vec![]);

        let result = apply(&[Write::Status, Write::Metadata], &origin, |kind, _current| {
            seen.lock().unwrap().push(kind);

            async move { Err(api_error(409)) }
        })
        .await;

        assert!(matches!(&result, Err(err) if resource::conflict(err)));
        assert_eq!(seen.into_inner().unwrap(), vec![Write::Status]);
    }

    #[test]
    fn conflict_is_not_committed_nor_failed() {
        assert!(committed(Ok(()), &Action::CreateDatabase).unwrap());
        assert!(!committed(Err(api_error(409)), &Action::CreateDatabase).unwrap());
        assert!(committed(Err(api_error(500)), &Action::CreateDatabase).is_err());
    }

    #[tokio::test]
    async fn creation_during_deletion_adds_no_finalizer() {
        let fixture = Fixture::new();
        let obj = deleted(in_phase(database("mysql"), Phase::Creating));

        let step = fixture.step(&obj, true, NOW).await.unwrap();

        assert_eq!(step.action, Action::CreateDatabase);
        assert_eq!(step.modified.phase(), Phase::Created);
        assert!(!finalizer::contains(&step.modified, DATABASE_FINALIZER));
    }

    #[test]
    fn elapsed_time_since_error_saturates() {
        let mut obj = database("mysql");
        obj.set_error(Reason::Provisioning, i64::MIN);

        assert_eq!(obj.seconds_since_last_error(i64::MAX), Some(i64::MAX));
        assert_eq!(database("mysql").seconds_since_last_error(NOW), None);
    }

    #[test]
    fn status_serializes_cleared_fields_as_null() {
        let mut obj = database("mysql");
        obj.set_error(Reason::Credential, NOW);
        obj.set_phase(Phase::Creating);

        assert_eq!(
            serde_json::to_value(&obj.status).unwrap(),
            json!({"phase": "Creating", "lastErrorTimestamp": null, "lastErrorReason": null})
        );
    }

    #[test]
    fn initial_phase_is_the_empty_string() {
        let status: Status = serde_json::from_value(json!({"phase": ""})).unwrap();
        assert_eq!(status.phase, Phase::Initial);

        let status: Status = serde_json::from_value(json!({})).unwrap();
        assert_eq!(status.phase, Phase::Initial);
    }

    #[test]
    fn drop_on_delete_is_tri_state() {
        let opts: Opts = serde_json::from_value(json!({})).unwrap();
        assert_eq!(opts.drop_on_delete, DropOnDelete::Unset);
        assert!(opts.drop_on_delete.enabled());
        assert_eq!(serde_json::to_value(&opts).unwrap(), json!({}));

        let opts: Opts = serde_json::from_value(json!({"dropOnDelete": false})).unwrap();
        assert_eq!(opts.drop_on_delete, DropOnDelete::False);
        assert!(!opts.drop_on_delete.enabled());
        assert_eq!(
            serde_json::to_value(&opts).unwrap(),
            json!({"dropOnDelete": false})
        );
    }

    #[test]
    fn spec_uses_resource_field_names() {
        let obj = database("mysql");
        let value = serde_json::to_value(&obj.spec).unwrap();

        assert_eq!(value["database"]["passwordSecretRef"]["secretName"], "app");
        assert_eq!(value["server"]["type"], "mysql");
        assert_eq!(value["server"]["rootPasswordSecretRef"]["secretKey"], "password");
    }
}
