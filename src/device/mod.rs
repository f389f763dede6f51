/*
Authenticated client for the UPS appliance's proprietary HTTP API.

The session owns the token/deploy-id pair shared by both pollers. Either
poller may find the token expired and trigger a re-login, so login attempts
are serialized behind an async mutex and stamped with a generation counter:
concurrent triggers collapse into a single login, and late callers observe
that another caller already refreshed the pair.
*/

mod models;

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::util::http::{Client, ClientError, Headers};

pub use models::{
    status_message, Auth, Gauge, MeasurementsBody, Notification, NotificationsBody, Phases,
    Snapshot, StateFlag, STATUS_OK,
};

const LOGIN_PATH: &str = "/sms/mobile/login/";
const MEASUREMENTS_PATH: &str = "/sms/mobile/medidores/";
const NOTIFICATIONS_PATH: &str = "/sms/mobile/beannotificacao/";

/// Fixed device identifiers the vendor API expects on every login.
const ID_DEVICE: &str = "22";
const SO_DEVICE: &str = "android";

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Per-request transport timeout.
    pub request_timeout: Duration,
    /// Absolute deadline for one fetch including quick retries and re-login.
    pub call_deadline: Duration,
    /// Quick-retry attempt cap for transport timeouts within one poll tick.
    pub quick_retries: u32,
    /// Fixed delay between quick retries.
    pub quick_retry_delay: Duration,
    /// Page size requested from the notification log.
    pub notification_page_size: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            call_deadline: Duration::from_secs(30),
            quick_retries: 2,
            quick_retry_delay: Duration::from_secs(2),
            notification_page_size: 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{op} failed after {attempts} attempts: {source}")]
    TimedOut {
        op: &'static str,
        attempts: u32,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Transport(#[from] ClientError),

    #[error("login rejected: {message} [{code}]")]
    Login { code: String, message: &'static str },

    #[error("authentication rejected after re-login: {message} [{code}]")]
    Auth { code: String, message: &'static str },

    #[error("{op} exceeded the {deadline:?} deadline")]
    DeadlineExceeded {
        op: &'static str,
        deadline: Duration,
    },
}

#[derive(Debug, Default)]
struct AuthSlot {
    auth: Option<Auth>,
    /// Bumped on every successful login so a caller holding a stale
    /// generation knows its re-login was already done by someone else.
    generation: u64,
}

pub struct Session {
    client: Client,
    base: String,
    credentials: Credentials,
    opts: SessionOptions,
    auth: Mutex<AuthSlot>,
}

impl Session {
    /// `base` is the appliance endpoint including scheme, e.g.
    /// `https://10.0.0.5`.
    pub fn new(
        base: String,
        credentials: Credentials,
        opts: SessionOptions,
    ) -> Result<Self, ClientError> {
        let client = Client::insecure(Some(opts.request_timeout))?;
        Ok(Self {
            client,
            base,
            credentials,
            opts,
            auth: Mutex::new(AuthSlot::default()),
        })
    }

    /// Authenticate against the appliance, replacing the stored token and
    /// deploy-id wholesale on success.
    pub async fn login(&self) -> Result<(), DeviceError> {
        let mut slot = self.auth.lock().await;
        self.login_locked(&mut slot).await
    }

    async fn login_locked(&self, slot: &mut AuthSlot) -> Result<(), DeviceError> {
        let url = format!("{}{}", self.base, LOGIN_PATH);
        let query = [
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
            ("iddevice", ID_DEVICE),
            ("sodevice", SO_DEVICE),
        ];

        let headers = Headers::new();
        let auth: Auth = self
            .quick_retry("login", || self.client.post_json(&url, &headers, &query))
            .await?;

        if auth.response_status != STATUS_OK {
            return Err(DeviceError::Login {
                message: status_message(&auth.response_status),
                code: auth.response_status,
            });
        }

        info!(deploy = %auth.deploy_name, user = %auth.user, "logged in to device");
        slot.auth = Some(auth);
        slot.generation += 1;
        Ok(())
    }

    /// Re-login on behalf of a caller that observed generation
    /// `seen_generation`. A no-op if another caller refreshed in between.
    async fn refresh_auth(&self, seen_generation: u64) -> Result<(), DeviceError> {
        let mut slot = self.auth.lock().await;
        if slot.generation != seen_generation {
            return Ok(());
        }
        self.login_locked(&mut slot).await
    }

    async fn auth_headers(&self) -> (Headers, u64) {
        let slot = self.auth.lock().await;
        let mut headers = Headers::new();
        if let Some(auth) = &slot.auth {
            headers.insert("token".to_string(), auth.token.clone());
            headers.insert("deployid".to_string(), auth.deploy_id.clone());
        }
        (headers, slot.generation)
    }

    /// Fetch the current gauge/state snapshot, stamped with the
    /// fetch-completion timestamp.
    pub async fn measurements(&self) -> Result<Snapshot, DeviceError> {
        let body: MeasurementsBody = self
            .with_deadline("measurements", self.fetch_with_reauth(
                "measurements",
                MEASUREMENTS_PATH,
                &[],
                |status| status == STATUS_OK,
                |body: &MeasurementsBody| &body.response_status,
            ))
            .await?;

        Ok(Snapshot::from_body(body, Utc::now()))
    }

    /// Fetch the notification log as returned by the device: newest first.
    pub async fn notifications(&self) -> Result<Vec<Notification>, DeviceError> {
        let page_size = self.opts.notification_page_size.to_string();
        let body: NotificationsBody = self
            .with_deadline("notifications", self.fetch_with_reauth(
                "notifications",
                NOTIFICATIONS_PATH,
                &[("qtd", page_size.as_str())],
                // This endpoint leaves the status empty on success.
                |status| status.is_empty() || status == STATUS_OK,
                |body: &NotificationsBody| &body.response_status,
            ))
            .await?;

        Ok(body.notifications)
    }

    async fn with_deadline<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, DeviceError>>,
    ) -> Result<T, DeviceError> {
        tokio::time::timeout(self.opts.call_deadline, fut)
            .await
            .map_err(|_| DeviceError::DeadlineExceeded {
                op,
                deadline: self.opts.call_deadline,
            })?
    }

    /// Authenticated GET with the vendor-status protocol: on a rejected
    /// status, perform exactly one re-login and one refetch; a second
    /// rejection is fatal for this poll cycle.
    async fn fetch_with_reauth<T>(
        &self,
        op: &'static str,
        path: &str,
        query: &[(&str, &str)],
        status_ok: fn(&str) -> bool,
        status_of: fn(&T) -> &str,
    ) -> Result<T, DeviceError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base, path);

        let (headers, generation) = self.auth_headers().await;
        let body: T = self
            .quick_retry(op, || self.client.get_json(&url, &headers, query))
            .await?;

        let code = status_of(&body);
        if status_ok(code) {
            return Ok(body);
        }
        warn!(
            code,
            message = status_message(code),
            "{op} rejected by device, re-authenticating"
        );

        self.refresh_auth(generation).await?;

        let (headers, _) = self.auth_headers().await;
        let body: T = self
            .quick_retry(op, || self.client.get_json(&url, &headers, query))
            .await?;

        let code = status_of(&body).to_string();
        if status_ok(&code) {
            Ok(body)
        } else {
            Err(DeviceError::Auth {
                message: status_message(&code),
                code,
            })
        }
    }

    /// Bounded quick retry on transport timeouts, with a short fixed delay.
    /// Deliberately smaller than the poll interval so one slow tick cannot
    /// pile requests onto the next.
    async fn quick_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, DeviceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let max_attempts = self.opts.quick_retries.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_timeout() => {
                    if attempt >= max_attempts {
                        return Err(DeviceError::TimedOut {
                            op,
                            attempts: attempt,
                            source: err,
                        });
                    }
                    warn!(attempt, max_attempts, "{op} timeout, quick retry");
                    attempt += 1;
                    tokio::time::sleep(self.opts.quick_retry_delay).await;
                }
                Err(err) => return Err(DeviceError::Transport(err)),
            }
        }
    }
}
