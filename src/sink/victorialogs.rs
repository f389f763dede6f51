//! VictoriaLogs log sink, posting one JSON line per entry to
//! `/insert/jsonline`.
//!
//! This is the only delivery path with full resilience on it: each write
//! runs through exponential-backoff retries inside a circuit breaker, so a
//! dead log store degrades into cheap fast-failing writes instead of a
//! stalled poller. The breaker counts one failure per entry, not per
//! attempt.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::resilience::{retry, BreakerConfig, BreakerError, CircuitBreaker, RetryError,
    RetryPolicy};
use crate::util::http::{Client, ClientError, Method};

use super::{LogEntry, LogSink, SinkError};

#[derive(Debug, Clone, Default)]
pub struct VictoriaLogsAuth {
    pub username: String,
    pub password: String,
}

pub struct VictoriaLogsSink {
    client: Client,
    insert_url: String,
    auth: Option<VictoriaLogsAuth>,
    retry_policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl VictoriaLogsSink {
    pub fn new(
        base: &str,
        auth: Option<VictoriaLogsAuth>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: Client::new(Some(timeout))?,
            insert_url: format!("{base}/insert/jsonline"),
            auth,
            retry_policy: RetryPolicy::default(),
            breaker: CircuitBreaker::new(BreakerConfig::default()),
        })
    }

    fn render(entry: &LogEntry) -> Result<String, serde_json::Error> {
        let mut record = Map::new();
        record.insert(
            "_time".to_string(),
            Value::String(entry.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        // _msg is the field VictoriaLogs indexes as the message proper;
        // message is kept as a plain queryable duplicate.
        record.insert("_msg".to_string(), Value::String(entry.message.clone()));
        record.insert("message".to_string(), Value::String(entry.message.clone()));
        record.insert("level".to_string(), Value::String(entry.level.clone()));
        record.insert("source".to_string(), Value::String(entry.source.clone()));

        for (key, value) in &entry.metadata {
            record.insert(key.clone(), value.clone());
        }

        serde_json::to_string(&Value::Object(record))
    }

    async fn send(&self, line: &str) -> Result<(), SinkError> {
        let response = self
            .client
            .request(Method::POST, &self.insert_url, |req| {
                let req = req
                    .header("Content-Type", "application/json")
                    .body(line.to_string());
                match &self.auth {
                    Some(auth) => req.basic_auth(&auth.username, Some(&auth.password)),
                    None => req,
                }
            })
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(SinkError::Rejected {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }

    /// Transport failures and throttling/server statuses are worth retrying;
    /// a 400 means the entry itself is bad and will never go through.
    fn is_retryable(err: &SinkError) -> bool {
        match err {
            SinkError::Http(ClientError::Timeout) => true,
            SinkError::Http(ClientError::Connect(_)) => true,
            SinkError::Http(ClientError::Request(_)) => true,
            SinkError::Rejected { status, .. } => matches!(
                status.as_u16(),
                429 | 408 | 500 | 502 | 503 | 504
            ),
            _ => false,
        }
    }

}

#[async_trait]
impl LogSink for VictoriaLogsSink {
    async fn write_log(&self, entry: &LogEntry) -> Result<(), SinkError> {
        // Serialization failures never reach the breaker.
        let line = Self::render(entry)?;

        let result = self
            .breaker
            .execute(|| retry(&self.retry_policy, Self::is_retryable, || self.send(&line)))
            .await;

        match result {
            Ok(()) => {
                debug!("log entry written to victorialogs");
                Ok(())
            }
            Err(BreakerError::Open) => Err(SinkError::CircuitOpen),
            Err(BreakerError::Inner(RetryError::NotRetryable(err))) => Err(err),
            Err(BreakerError::Inner(RetryError::Exhausted { attempts, source })) => {
                warn!(attempts, "victorialogs delivery retries exhausted");
                Err(SinkError::Exhausted {
                    attempts,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn close(&self) -> Result<(), SinkError> {
        // Nothing is buffered; connections belong to the pooled client.
        debug!(state = %self.breaker.state(), "closing victorialogs sink");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mockito::Server;

    fn entry() -> LogEntry {
        let mut metadata = Map::new();
        metadata.insert("id".to_string(), Value::from(42));
        metadata.insert(
            "device_address".to_string(),
            Value::String("10.0.0.5".to_string()),
        );
        LogEntry {
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 15, 4, 5).unwrap(),
            level: "info".to_string(),
            message: "Notification 42 on 02/01/2026 15:04:05 with Falha na Rede Eletrica"
                .to_string(),
            source: "ups-agent".to_string(),
            metadata,
        }
    }

    fn sink(base: &str) -> VictoriaLogsSink {
        let mut sink =
            VictoriaLogsSink::new(base, None, Duration::from_secs(5)).unwrap();
        sink.retry_policy = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        sink
    }

    #[test]
    fn render_flattens_metadata_next_to_standard_fields() {
        let line = VictoriaLogsSink::render(&entry()).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["_time"], "2026-01-02T15:04:05.000000000Z");
        assert_eq!(value["_msg"], value["message"]);
        assert_eq!(value["level"], "info");
        assert_eq!(value["source"], "ups-agent");
        assert_eq!(value["id"], 42);
        assert_eq!(value["device_address"], "10.0.0.5");
    }

    #[tokio::test]
    async fn write_log_posts_json_line() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/insert/jsonline")
            .match_header("content-type", "application/json")
            .with_status(200)
            .create_async()
            .await;

        sink(&server.url()).write_log(&entry()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn basic_auth_is_sent_when_configured() {
        let mut server = Server::new_async().await;
        // "logs:secret" base64-encoded.
        let mock = server
            .mock("POST", "/insert/jsonline")
            .match_header("authorization", "Basic bG9nczpzZWNyZXQ=")
            .with_status(200)
            .create_async()
            .await;

        let sink = VictoriaLogsSink::new(
            &server.url(),
            Some(VictoriaLogsAuth {
                username: "logs".to_string(),
                password: "secret".to_string(),
            }),
            Duration::from_secs(5),
        )
        .unwrap();

        sink.write_log(&entry()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_exhaustion() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/insert/jsonline")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let err = sink(&server.url()).write_log(&entry()).await.unwrap_err();
        match err {
            SinkError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(matches!(
                    *source,
                    SinkError::Rejected { status, .. } if status.as_u16() == 503
                ));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/insert/jsonline")
            .with_status(400)
            .with_body("invalid line")
            .expect(1)
            .create_async()
            .await;

        let err = sink(&server.url()).write_log(&entry()).await.unwrap_err();
        assert!(matches!(
            err,
            SinkError::Rejected { status, .. } if status.as_u16() == 400
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn open_circuit_rejects_writes_without_touching_the_server() {
        let mut server = Server::new_async().await;
        // Enough failures to trip the default threshold of 5; every write
        // retries twice, so expect 2 requests per write.
        let mock = server
            .mock("POST", "/insert/jsonline")
            .with_status(503)
            .expect(10)
            .create_async()
            .await;

        let sink = sink(&server.url());
        for _ in 0..5 {
            let _ = sink.write_log(&entry()).await;
        }
        assert!(matches!(
            sink.write_log(&entry()).await,
            Err(SinkError::CircuitOpen)
        ));
        mock.assert_async().await;
    }
}
