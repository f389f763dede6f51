//! Wire types for the UPS appliance API and the domain types derived from
//! them. Field names on the wire are the vendor's (Portuguese) names.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Vendor application-level status code carried in every response body,
/// independent of the HTTP status. `S001` is the designated success code.
pub const STATUS_OK: &str = "S001";

/// Fixed code -> human message table from the vendor protocol. Unknown codes
/// fall through to a generic message rather than an empty string.
pub fn status_message(code: &str) -> &'static str {
    match code {
        "S001" => "success",
        "S002" => "invalid username or password",
        "S003" => "invalid access token",
        "S005" => "invalid command",
        "S016" => "user is not authenticated",
        "S017" => "user has no permission",
        "S018" => "maximum number of users reached",
        "S019" => "user already exists",
        "S020" => "user not found",
        "S021" => "cannot remove every administrator",
        "S032" => "could not store firmware image",
        "S033" => "firmware image is not valid",
        "S034" => "error applying stored firmware image",
        "S035" => "cannot roll back to factory firmware",
        "S036" => "cannot erase flash memory",
        "S048" => "could not decrypt data",
        "S255" => "unknown error",
        _ => "unrecognized status code",
    }
}

/// Login response. Replaced wholesale on every successful login; the
/// token/deploy-id pair is always read together.
#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    #[serde(rename = "responseStatus")]
    pub response_status: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, rename = "deployId")]
    pub deploy_id: String,
    #[serde(default, rename = "deployName")]
    pub deploy_name: String,
    #[serde(default, rename = "usuario")]
    pub user: String,
}

/// The appliance also reports `max`/`min` bounds per phase; only the live
/// value feeds the metric pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Phases {
    #[serde(rename = "valor")]
    pub value: String,
}

/// One gauge reading (voltage, load, temperature, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct Gauge {
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "fases")]
    pub phases: Phases,
}

/// One boolean state flag (on grid, on battery, bypass, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct StateFlag {
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "valor")]
    pub value: bool,
}

/// Measurements response body as returned by `/sms/mobile/medidores/`.
#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementsBody {
    #[serde(default, rename = "responseStatus")]
    pub response_status: String,
    #[serde(default, rename = "tipoUPS")]
    pub ups_type: String,
    #[serde(default, rename = "medidores")]
    pub gauges: Vec<Gauge>,
    #[serde(default, rename = "estados")]
    pub states: Vec<StateFlag>,
    #[serde(default, rename = "deployName")]
    pub deploy_name: String,
}

/// A measurements snapshot stamped with the fetch-completion time. The
/// timestamp is assigned by the session, not the device.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    pub ups_type: String,
    pub deploy_name: String,
    pub gauges: Vec<Gauge>,
    pub states: Vec<StateFlag>,
}

impl Snapshot {
    pub fn from_body(body: MeasurementsBody, captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            ups_type: body.ups_type,
            deploy_name: body.deploy_name,
            gauges: body.gauges,
            states: body.states,
        }
    }
}

/// One entry of the appliance's append-only notification log. IDs increase
/// monotonically per device and are never reused.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    pub id: u64,
    #[serde(rename = "mensagem")]
    pub message: String,
    #[serde(rename = "data")]
    pub date: String,
}

/// Notifications response body, newest-first. This endpoint leaves
/// `responseStatus` empty on success.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsBody {
    #[serde(default, rename = "responseStatus")]
    pub response_status: String,
    #[serde(default, rename = "notificacoes")]
    pub notifications: Vec<Notification>,
}
