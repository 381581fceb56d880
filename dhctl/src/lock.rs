use std::{collections::BTreeMap, fmt::Display, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use derive_builder::Builder;
use dhctl_core::{
    kubernetes::{
        errors::{is_already_exists, is_not_found, is_object_modified},
        KubeApi, KubeClientHolder,
    },
    resources::{annotations::LOCK_USER_INFO_ANNOTATION, labels::get_converge_labels},
    CONVERGE_LOCK_NAME, SYSTEM_NAMESPACE,
};
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::core::ObjectMeta;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::retry::{RetryInterrupted, RetryLoop};

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(300);
pub const DEFAULT_RENEW_EVERY: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(3);

const API_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const UNLOCK_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{}", .0)]
    HeldByOther(Box<LockHolder>),
    #[error("Converge lock '{}' was lost: {}", .name, .reason)]
    Lost { name: String, reason: String },
    #[error("Lease API call failed: {}", .0)]
    KubeApi(kube::Error),
    #[error("Lease API call timed out!")]
    Timeout,
    #[error("Couldn't encode lock user info: {}", .0)]
    UserInfo(serde_json::Error),
    #[error("Lock operation was interrupted!")]
    Interrupted,
}

impl From<RetryInterrupted> for LockError {
    fn from(_: RetryInterrupted) -> Self {
        LockError::Interrupted
    }
}

/// Who is holding the converge lock, shown to the operator trying to take it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockUserInfo {
    pub name: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional: Option<serde_json::Value>,
}

impl LockUserInfo {
    pub fn local(additional: Option<serde_json::Value>) -> Self {
        let name = std::env::var("USER").unwrap_or_else(|_| "unknown".to_owned());
        let host = hostname::get()
            .map(|host| host.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned());

        Self {
            name,
            host,
            additional,
        }
    }
}

/// Incumbent of a contended lease.
#[derive(Debug, Clone)]
pub struct LockHolder {
    pub lease_name: String,
    pub lease_namespace: String,
    pub identity: String,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub user_info: Option<String>,
}

impl LockHolder {
    fn from_lease(lease: &Lease, config: &LeaseLockConfig) -> Self {
        let spec = lease.spec.as_ref();
        let user_info = lease
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(LOCK_USER_INFO_ANNOTATION))
            .map(|raw| {
                serde_json::from_str::<serde_json::Value>(raw)
                    .and_then(|value| serde_json::to_string_pretty(&value))
                    .unwrap_or_else(|_| raw.clone())
            });

        Self {
            lease_name: config.name.clone(),
            lease_namespace: config.namespace.clone(),
            identity: spec
                .and_then(|spec| spec.holder_identity.clone())
                .unwrap_or_default(),
            acquire_time: spec.and_then(|spec| spec.acquire_time.as_ref().map(|time| time.0)),
            renew_time: spec.and_then(|spec| spec.renew_time.as_ref().map(|time| time.0)),
            duration_seconds: spec.and_then(|spec| spec.lease_duration_seconds),
            user_info,
        }
    }
}

impl Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Converge lock is held by '{}'", self.identity)?;
        writeln!(f, "  acquired at: {}", format_time(self.acquire_time))?;
        writeln!(f, "  last renew: {}", format_time(self.renew_time))?;

        match self.duration_seconds {
            Some(duration) => writeln!(f, "  duration: {duration}s")?,
            None => writeln!(f, "  duration: unknown")?,
        }

        if let Some(user_info) = &self.user_info {
            writeln!(f, "  locked by:")?;
            for line in user_info.lines() {
                writeln!(f, "    {line}")?;
            }
        }

        write!(
            f,
            "If you are sure nobody is converging this cluster, release the lock with \
            'dhctl lock release' or 'kubectl -n {} delete lease {}'.",
            self.lease_namespace, self.lease_name
        )
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "unknown".to_owned())
}

#[derive(Debug, Clone, Builder)]
pub struct LeaseLockConfig {
    #[builder(default = "CONVERGE_LOCK_NAME.to_owned()", setter(into))]
    pub name: String,
    #[builder(default = "SYSTEM_NAMESPACE.to_owned()", setter(into))]
    pub namespace: String,
    #[builder(setter(into))]
    pub identity: String,
    #[builder(default = "DEFAULT_LEASE_DURATION")]
    pub lease_duration: Duration,
    #[builder(default = "DEFAULT_RENEW_EVERY")]
    pub renew_every: Duration,
    #[builder(default = "DEFAULT_RETRY_WAIT")]
    pub retry_wait: Duration,
    #[builder(default)]
    pub user_info: LockUserInfo,
}

impl LeaseLockConfig {
    /// Attempts that fit into the part of the lease not covered by renewals.
    pub fn renew_retries(&self) -> u32 {
        let window = self.lease_duration.saturating_sub(self.renew_every);
        let wait = self.retry_wait.as_secs_f64().max(f64::EPSILON);

        ((window.as_secs_f64() / wait).ceil() as u32).max(1)
    }
}

pub type RenewErrorCallback = Arc<dyn Fn(&LockError) + Send + Sync>;

struct Renewer {
    stop: CancellationToken,
    _handle: JoinHandle<()>,
}

#[derive(Default)]
struct LockState {
    acquired: bool,
    renewer: Option<Renewer>,
}

/// Cluster-wide converge lock held as a coordination lease.
pub struct LeaseLock {
    config: LeaseLockConfig,
    kube: Arc<KubeClientHolder>,
    cancellation: CancellationToken,
    on_renew_error: Option<RenewErrorCallback>,
    state: Mutex<LockState>,
}

impl LeaseLock {
    pub fn new(
        config: LeaseLockConfig,
        kube: Arc<KubeClientHolder>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            config,
            kube,
            cancellation,
            on_renew_error: None,
            state: Mutex::new(LockState::default()),
        }
    }

    pub fn on_renew_error(mut self, callback: RenewErrorCallback) -> Self {
        self.on_renew_error = Some(callback);
        self
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().acquired
    }

    pub fn is_auto_renewing(&self) -> bool {
        self.state.lock().renewer.is_some()
    }

    pub async fn lock(&self, force: bool) -> Result<(), LockError> {
        let user_info = self.user_info_annotation()?;

        RetryLoop::new(
            format!("Acquire lease {}", self.config.name),
            self.config.renew_retries(),
            self.config.retry_wait,
        )
        .break_if(|error| {
            matches!(
                error,
                LockError::HeldByOther(_) | LockError::UserInfo(_) | LockError::Interrupted
            )
        })
        .with_cancellation(&self.cancellation)
        .run(|| self.try_lock(force, &user_info))
        .await?;

        self.state.lock().acquired = true;
        info!(
            "Converge lock '{}' acquired by '{}'",
            self.config.name, self.config.identity
        );

        Ok(())
    }

    pub fn start_auto_renew(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.renewer.is_some() {
            return;
        }

        let stop = self.cancellation.child_token();
        let token = stop.clone();
        let lock = Arc::clone(self);
        let handle = tokio::spawn(async move { lock.renew_loop(token).await });

        state.renewer = Some(Renewer {
            stop,
            _handle: handle,
        });
    }

    /// Stops the renewer and keeps the lease in the cluster.
    pub fn stop_auto_renew(&self) {
        if let Some(renewer) = self.state.lock().renewer.take() {
            debug!("Stopping renewal of lease {}", self.config.name);
            renewer.stop.cancel();
        }
    }

    pub async fn unlock(&self) -> Result<(), LockError> {
        self.stop_auto_renew();

        let client = self.kube.client();
        RetryLoop::new(
            format!("Release lease {}", self.config.name),
            UNLOCK_ATTEMPTS,
            self.config.retry_wait,
        )
        .run(|| async {
            match with_timeout(client.delete_lease(&self.config.namespace, &self.config.name))
                .await
            {
                Err(LockError::KubeApi(error)) if is_not_found(&error) => Ok(()),
                result => result,
            }
        })
        .await?;

        self.state.lock().acquired = false;
        info!("Converge lock '{}' released", self.config.name);

        Ok(())
    }

    async fn renew_loop(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.renew_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let error = match self.renew(&stop).await {
                Ok(()) => {
                    debug!("Lease {} renewed", self.config.name);
                    continue;
                }
                Err(error) => error,
            };

            if stop.is_cancelled() {
                debug!("Lease renewal stopped during shutdown: {error}");
                return;
            }

            error!("Couldn't renew lease {}: {error}", self.config.name);
            if let Some(callback) = &self.on_renew_error {
                callback(&error);
            }

            return;
        }
    }

    async fn renew(&self, stop: &CancellationToken) -> Result<(), LockError> {
        let user_info = self.user_info_annotation()?;

        RetryLoop::silent(
            format!("Renew lease {}", self.config.name),
            self.config.renew_retries(),
            self.config.retry_wait,
        )
        .break_if(|error| {
            matches!(
                error,
                LockError::HeldByOther(_) | LockError::Lost { .. } | LockError::Interrupted
            )
        })
        .with_cancellation(stop)
        .run(|| async {
            let client = self.kube.client();

            match self.adopt(client.as_ref(), false, &user_info).await {
                Err(LockError::KubeApi(error)) if is_not_found(&error) => Err(LockError::Lost {
                    name: self.config.name.clone(),
                    reason: "the lease was deleted".to_owned(),
                }),
                Err(LockError::HeldByOther(holder)) => Err(LockError::Lost {
                    name: self.config.name.clone(),
                    reason: format!("the lease is now held by '{}'", holder.identity),
                }),
                result => result,
            }
        })
        .await
    }

    async fn try_lock(&self, force: bool, user_info: &str) -> Result<(), LockError> {
        let client = self.kube.client();

        match with_timeout(client.create_lease(&self.new_lease(user_info))).await {
            Ok(_) => return Ok(()),
            Err(LockError::KubeApi(error)) if is_already_exists(&error) => {
                debug!("Lease {} already exists", self.config.name);
            }
            Err(error) => return Err(error),
        }

        self.adopt(client.as_ref(), force, user_info).await
    }

    async fn adopt(
        &self,
        client: &dyn KubeApi,
        force: bool,
        user_info: &str,
    ) -> Result<(), LockError> {
        let current = with_timeout(client.get_lease(&self.config.namespace, &self.config.name))
            .await?;
        let updated = self.take_over(current, force, user_info)?;

        match with_timeout(client.replace_lease(&updated)).await {
            Ok(_) => Ok(()),
            Err(LockError::KubeApi(error)) if is_object_modified(&error) => {
                debug!("Lease {} was modified concurrently, refetching", self.config.name);

                let current =
                    with_timeout(client.get_lease(&self.config.namespace, &self.config.name))
                        .await?;
                let updated = self.take_over(current, force, user_info)?;

                with_timeout(client.replace_lease(&updated)).await.map(|_| ())
            }
            Err(error) => Err(error),
        }
    }

    fn take_over(&self, mut lease: Lease, force: bool, user_info: &str) -> Result<Lease, LockError> {
        let now = Utc::now();
        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.clone())
            .unwrap_or_default();
        let is_mine = holder == self.config.identity;

        if !is_mine && !holder.is_empty() && !force {
            return Err(LockError::HeldByOther(Box::new(LockHolder::from_lease(
                &lease,
                &self.config,
            ))));
        }

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);

        if is_mine && is_expired(spec, now) {
            warn!(
                "Lease {} expired before it was renewed, renewing it anyway",
                self.config.name
            );
        }

        if !is_mine {
            if !holder.is_empty() {
                warn!(
                    "Forcefully taking lease {} over from '{holder}'",
                    self.config.name
                );
            }

            spec.holder_identity = Some(self.config.identity.clone());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }

        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(self.duration_seconds());

        lease
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(LOCK_USER_INFO_ANNOTATION.to_owned(), user_info.to_owned());

        Ok(lease)
    }

    fn new_lease(&self, user_info: &str) -> Lease {
        let now = Utc::now();

        Lease {
            metadata: ObjectMeta {
                name: Some(self.config.name.clone()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(get_converge_labels()),
                annotations: Some(BTreeMap::from([(
                    LOCK_USER_INFO_ANNOTATION.to_owned(),
                    user_info.to_owned(),
                )])),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration_seconds: Some(self.duration_seconds()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
            }),
        }
    }

    fn duration_seconds(&self) -> i32 {
        self.config.lease_duration.as_secs().try_into().unwrap_or(i32::MAX)
    }

    fn user_info_annotation(&self) -> Result<String, LockError> {
        serde_json::to_string(&self.config.user_info).map_err(LockError::UserInfo)
    }
}

fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(renew_time), Some(duration)) => {
            renew_time.0 + chrono::Duration::seconds(duration.into()) <= now
        }
        _ => true,
    }
}

async fn with_timeout<T>(
    call: impl Future<Output = Result<T, kube::Error>>,
) -> Result<T, LockError> {
    tokio::time::timeout(API_CALL_TIMEOUT, call)
        .await
        .map_err(|_| LockError::Timeout)?
        .map_err(LockError::KubeApi)
}
