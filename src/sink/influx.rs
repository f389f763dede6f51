//! InfluxDB metric sink. Each snapshot renders to line protocol, one point
//! per recognized gauge or state flag, and is posted to `/write`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::device::Snapshot;
use crate::util::http::{Client, ClientError, Method, StatusCode};

use super::{MetricSink, SinkError};

/// Gauges worth storing, by the vendor's display name. Unlisted gauges are
/// dropped.
fn gauge_field(name: &str) -> Option<&'static str> {
    match name {
        "Tensao de Entrada" => Some("input_voltage"),
        "Tensao de Saida" => Some("output_voltage"),
        "Nivel da Bateria" => Some("battery_level"),
        "Potencia de Saida" => Some("ups_load"),
        "Temperatura" => Some("ups_temperature"),
        "Frequencia de Saida" => Some("output_frequency"),
        _ => None,
    }
}

fn state_field(name: &str) -> Option<&'static str> {
    match name {
        "Carga da Bateria" => Some("battery_status"),
        "Nobreak" => Some("nobreak_status"),
        "Rede Eletrica" => Some("power_from"),
        "Teste" => Some("test"),
        "Boost" => Some("boost"),
        "ByPass" => Some("bypass"),
        "Potencia Elevada" => Some("overload"),
        _ => None,
    }
}

/// Per-flag string vocabulary. "Nobreak" is inverted: a true flag from
/// the device means the UPS itself failed.
fn state_value(name: &str, value: bool) -> &'static str {
    match (name, value) {
        ("Carga da Bateria", true) => "ok",
        ("Carga da Bateria", false) => "fail",
        ("Nobreak", true) => "fail",
        ("Nobreak", false) => "ok",
        ("Rede Eletrica", true) => "grid",
        ("Rede Eletrica", false) => "battery",
        ("Potencia Elevada", true) => "true",
        ("Potencia Elevada", false) => "false",
        (_, true) => "on",
        (_, false) => "off",
    }
}

pub struct InfluxSink {
    client: Client,
    write_url: String,
    database: String,
}

impl InfluxSink {
    pub fn new(
        base: &str,
        database: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: Client::new(Some(timeout))?,
            write_url: format!("{base}/write"),
            database: database.to_string(),
        })
    }

    fn render(snapshot: &Snapshot) -> String {
        let mut body = String::new();
        let host = &snapshot.deploy_name;
        let nanos = snapshot.captured_at.timestamp_nanos_opt().unwrap_or_default();

        for gauge in &snapshot.gauges {
            if let Some(field) = gauge_field(&gauge.name) {
                body.push_str(&format!(
                    "{field},host={host} value={} {nanos}\n",
                    gauge.phases.value
                ));
            }
        }

        for state in &snapshot.states {
            if let Some(field) = state_field(&state.name) {
                body.push_str(&format!(
                    "{field},host={host} value=\"{}\" {nanos}\n",
                    state_value(&state.name, state.value)
                ));
            }
        }

        body
    }
}

#[async_trait]
impl MetricSink for InfluxSink {
    async fn write(&self, snapshot: &Snapshot) -> Result<(), SinkError> {
        let body = Self::render(snapshot);

        let response = self
            .client
            .request(Method::POST, &self.write_url, |req| {
                req.query(&[("db", self.database.as_str())]).body(body)
            })
            .await?;

        // Influx acknowledges a successful write with 204 and nothing else.
        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            return Err(SinkError::Rejected {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        debug!(deploy = %snapshot.deploy_name, "snapshot written to influxdb");
        Ok(())
    }
}
