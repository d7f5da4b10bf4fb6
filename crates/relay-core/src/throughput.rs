//! Throughput estimator.
//!
//! Rates come from transfer sizes and locally measured wall-clock time:
//! `megabits = bytes * 8 / 1_000_000`, `rate = megabits / seconds`.

use crate::error::RelayError;
use crate::keyed::KeyedState;
use anyhow::{anyhow, Result};
use reqwest::Client;
use std::time::{Duration, Instant};

/// Floor for elapsed time so instant transfers do not divide by zero.
const MIN_ELAPSED: Duration = Duration::from_millis(1);

pub fn megabits(bytes: u64) -> f64 {
    bytes as f64 * 8.0 / 1_000_000.0
}

pub fn rate_mbps(bytes: u64, elapsed: Duration) -> f64 {
    megabits(bytes) / elapsed.max(MIN_ELAPSED).as_secs_f64()
}

pub fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

/// State between the download phase and the user's upload.
#[derive(Debug, Clone)]
pub struct TransferMeasurement {
    pub started_at: Instant,
    pub payload_bytes: u64,
    pub ping_ms: f64,
    pub download_mbps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputReport {
    pub ping_ms: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

impl ThroughputReport {
    pub fn render(&self, heading: &str) -> String {
        format!(
            "📊 {}\n\n\
             Входящая скорость: {:.2} Мбит/с\n\
             Исходящая скорость: {:.2} Мбит/с\n\
             Пинг: {:.2} мс",
            heading, self.download_mbps, self.upload_mbps, self.ping_ms
        )
    }
}

/// In-progress speed tests, one per user.
#[derive(Default)]
pub struct SpeedtestSessions {
    sessions: KeyedState<i64, Option<TransferMeasurement>>,
}

impl SpeedtestSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, user_id: i64, measurement: TransferMeasurement) {
        let slot = self.sessions.slot(&user_id).await;
        *slot.lock().await = Some(measurement);
    }

    pub async fn is_active(&self, user_id: i64) -> bool {
        match self.sessions.existing(&user_id).await {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Completes the cycle with an upload of `uploaded_bytes` that took
    /// `elapsed`, clearing the session.
    pub async fn finish(
        &self,
        user_id: i64,
        uploaded_bytes: u64,
        elapsed: Duration,
    ) -> Result<ThroughputReport, RelayError> {
        let measurement = match self.sessions.existing(&user_id).await {
            Some(slot) => slot.lock().await.take(),
            None => None,
        }
        .ok_or(RelayError::SpeedtestNotStarted)?;

        tracing::debug!(
            user_id,
            download_payload_bytes = measurement.payload_bytes,
            uploaded_bytes,
            cycle_ms = millis(measurement.started_at.elapsed()),
            "Speed test cycle complete"
        );

        Ok(ThroughputReport {
            ping_ms: measurement.ping_ms,
            download_mbps: measurement.download_mbps,
            upload_mbps: rate_mbps(uploaded_bytes, elapsed),
        })
    }
}

/// Measures the host's own link against a speed-test server exposing
/// `HEAD /ping`, `GET /testfile.bin` and `POST /upload`.
pub struct HttpProbe {
    client: Client,
    base_url: String,
}

impl HttpProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("failed to build probe HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn run(&self, upload_bytes: u64) -> Result<ThroughputReport> {
        let started = Instant::now();
        self.client
            .head(format!("{}/ping", self.base_url))
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| anyhow!("probe ping failed: {}", e))?;
        let ping_ms = millis(started.elapsed());

        let started = Instant::now();
        let body = self
            .client
            .get(format!("{}/testfile.bin", self.base_url))
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| anyhow!("probe download failed: {}", e))?
            .bytes()
            .await
            .map_err(|e| anyhow!("probe download read failed: {}", e))?;
        let download_mbps = rate_mbps(body.len() as u64, started.elapsed());

        let payload = vec![0u8; upload_bytes as usize];
        let started = Instant::now();
        self.client
            .post(format!("{}/upload", self.base_url))
            .header("Content-Type", "application/octet-stream")
            .body(payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| anyhow!("probe upload failed: {}", e))?;
        let upload_mbps = rate_mbps(upload_bytes, started.elapsed());

        tracing::info!(
            ping_ms,
            download_mbps,
            upload_mbps,
            "HTTP speed probe finished"
        );

        Ok(ThroughputReport {
            ping_ms,
            download_mbps,
            upload_mbps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn five_megabytes_in_two_seconds_is_twenty_megabits() {
        assert_eq!(megabits(5_000_000), 40.0);
        assert_eq!(rate_mbps(5_000_000, Duration::from_secs(2)), 20.0);
    }

    #[test]
    fn zero_elapsed_is_clamped() {
        assert!(rate_mbps(1_000_000, Duration::ZERO).is_finite());
    }

    #[test]
    fn report_renders_two_decimals() {
        let report = ThroughputReport {
            ping_ms: 12.345,
            download_mbps: 20.0,
            upload_mbps: 7.5,
        };
        let text = report.render("Результаты");
        assert!(text.contains("20.00 Мбит/с"));
        assert!(text.contains("7.50 Мбит/с"));
        assert!(text.contains("12.35 мс") || text.contains("12.34 мс"));
    }

    #[tokio::test]
    async fn upload_without_download_phase_is_rejected() {
        let sessions = SpeedtestSessions::new();
        assert!(matches!(
            sessions.finish(1, 10, Duration::from_secs(1)).await,
            Err(RelayError::SpeedtestNotStarted)
        ));
    }

    #[tokio::test]
    async fn finish_clears_the_session() {
        let sessions = SpeedtestSessions::new();
        sessions
            .start(
                1,
                TransferMeasurement {
                    started_at: Instant::now(),
                    payload_bytes: 5_000_000,
                    ping_ms: 40.0,
                    download_mbps: 20.0,
                },
            )
            .await;
        assert!(sessions.is_active(1).await);

        let report = sessions
            .finish(1, 2_500_000, Duration::from_secs(2))
            .await
            .expect("report");
        assert_eq!(report.upload_mbps, 10.0);
        assert_eq!(report.download_mbps, 20.0);
        assert!(!sessions.is_active(1).await);
        assert!(sessions.finish(1, 1, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn http_probe_hits_all_three_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/testfile.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64 * 1024]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Upload complete"))
            .expect(1)
            .mount(&server)
            .await;

        let probe = HttpProbe::new(&server.uri(), Duration::from_secs(5)).expect("probe");
        let report = probe.run(32 * 1024).await.expect("report");
        assert!(report.download_mbps > 0.0);
        assert!(report.upload_mbps > 0.0);
    }

    #[tokio::test]
    async fn http_probe_reports_failing_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let probe = HttpProbe::new(&server.uri(), Duration::from_secs(5)).expect("probe");
        let err = probe.run(1024).await.expect_err("ping fails");
        assert!(err.to_string().contains("ping"));
    }
}
