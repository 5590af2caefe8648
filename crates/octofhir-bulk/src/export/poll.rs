//! Status polling for running export jobs.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{ExportJob, ExportManifest, Exporter, decode_manifest, unexpected};
use crate::transport::{BulkTransport, HttpReply};
use crate::{Error, Result};

/// Bounds for the status polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Wait between two consecutive status requests.
    pub interval: Duration,
    /// Give up after this many status requests.
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed since the first status request.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: None,
            deadline: None,
        }
    }
}

impl PollPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn is_exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.deadline.is_some_and(|deadline| elapsed >= deadline)
    }

    /// Wait before the next attempt; a non-zero server `Retry-After` hint wins
    /// over the interval but never runs past the deadline.
    fn next_wait(&self, retry_after: Option<u64>, elapsed: Duration) -> Duration {
        let wait = retry_after
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.interval);
        match self.deadline {
            Some(deadline) => wait.min(deadline.saturating_sub(elapsed)),
            None => wait,
        }
    }
}

/// Decoded reply of the status endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    InProgress {
        retry_after: Option<u64>,
    },
    Complete(ExportManifest),
}

impl PollStatus {
    pub fn decode(url: &str, reply: &HttpReply) -> Result<Self> {
        match reply.status {
            202 => Ok(PollStatus::InProgress {
                retry_after: reply.retry_after,
            }),
            200 => decode_manifest(url, reply).map(PollStatus::Complete),
            _ => Err(unexpected(url, reply, "export job status check failed")),
        }
    }
}

impl<T: BulkTransport + ?Sized> Exporter<'_, T> {
    /// Poll the job's status URL until the manifest arrives.
    ///
    /// The first request goes out immediately; consecutive requests are
    /// separated by the policy interval. Completed jobs return without any call.
    pub async fn poll_until_complete(
        &self,
        job: &mut ExportJob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if job.is_completed() {
            return Ok(());
        }
        let Some(status_url) = job.status_url.clone() else {
            return Err(Error::UnexpectedResponse {
                url: String::new(),
                status: 0,
                reason: "export job has neither a status URL nor a manifest".to_string(),
            });
        };

        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempts += 1;

            let reply = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                reply = self.transport.poll(&status_url) => reply?,
            };

            match PollStatus::decode(&status_url, &reply)? {
                PollStatus::Complete(manifest) => {
                    tracing::info!(
                        attempts,
                        files = manifest.output.len(),
                        errors = manifest.error.len(),
                        transaction_time = %manifest.transaction_time,
                        "Bulk export job completed"
                    );
                    job.manifest = Some(manifest);
                    return Ok(());
                }
                PollStatus::InProgress { retry_after } => {
                    let elapsed = started.elapsed();
                    tracing::debug!(attempts, ?elapsed, "Bulk export job still running");
                    if self.policy.is_exhausted(attempts, elapsed) {
                        return Err(Error::PollLimitExceeded { attempts, elapsed });
                    }
                    let wait = self.policy.next_wait(retry_after, elapsed);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::io::AsyncWrite;

    use super::*;

    /// Answers status polls from a fixed script.
    struct ScriptedTransport {
        replies: Mutex<VecDeque<HttpReply>>,
        polls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(statuses: &[u16]) -> Self {
            let replies = statuses
                .iter()
                .map(|&status| match status {
                    200 => HttpReply::new(200, manifest_body()),
                    s => HttpReply::new(s, "{}"),
                })
                .collect();
            Self {
                replies: Mutex::new(replies),
                polls: AtomicUsize::new(0),
            }
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BulkTransport for ScriptedTransport {
        fn fhir_url(&self, path: &str) -> String {
            format!("http://fhir.test/{path}")
        }

        async fn kickoff(&self, _url: &str, _query: &[(String, String)]) -> Result<HttpReply> {
            Ok(HttpReply::new(202, "").with_content_location("http://fhir.test/status/1"))
        }

        async fn poll(&self, _status_url: &str) -> Result<HttpReply> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let next = self.replies.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| HttpReply::new(202, "")))
        }

        async fn post_bundle(&self, _url: &str, _bundle: &Value) -> Result<HttpReply> {
            unreachable!("export tests never post bundles")
        }

        async fn download_to(
            &self,
            _url: &str,
            _authenticated: bool,
            _sink: &mut (dyn AsyncWrite + Unpin + Send),
        ) -> Result<u64> {
            unreachable!("poll tests never download")
        }
    }

    fn manifest_body() -> String {
        json!({
            "transactionTime": "2023-05-18T22:55:31.280Z",
            "request": "http://fhir.test/$export",
            "requiresAccessToken": false,
            "output": [
                { "type": "Patient", "url": "http://files.test/a.ndjson" },
                { "type": "Observation", "url": "http://files.test/b.ndjson" },
                { "type": "Encounter", "url": "http://files.test/c.ndjson" }
            ],
            "error": []
        })
        .to_string()
    }

    fn fast() -> PollPolicy {
        PollPolicy::default().with_interval(Duration::from_millis(1))
    }

    async fn accepted_job(transport: &ScriptedTransport) -> ExportJob {
        Exporter::new(transport, fast())
            .start_export(&Default::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_polls_until_manifest() {
        let transport = ScriptedTransport::new(&[202, 202, 200]);
        let mut job = accepted_job(&transport).await;
        let exporter = Exporter::new(&transport, fast());

        exporter
            .poll_until_complete(&mut job, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.polls(), 3);
        assert!(job.is_completed());
        let types: Vec<_> = job.output().iter().map(|f| f.resource_type.as_str()).collect();
        assert_eq!(types, ["Patient", "Observation", "Encounter"]);
    }

    #[tokio::test]
    async fn test_single_poll_when_immediately_complete() {
        let transport = ScriptedTransport::new(&[200]);
        let mut job = accepted_job(&transport).await;
        Exporter::new(&transport, fast())
            .poll_until_complete(&mut job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.polls(), 1);
        assert_eq!(job.output().len(), 3);
    }

    #[tokio::test]
    async fn test_completed_job_is_not_polled() {
        let transport = ScriptedTransport::new(&[]);
        let mut job = accepted_job(&transport).await;
        job.manifest = Some(serde_json::from_str(&manifest_body()).unwrap());

        Exporter::new(&transport, fast())
            .poll_until_complete(&mut job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.polls(), 0);
    }

    #[tokio::test]
    async fn test_max_attempts_bound() {
        let transport = ScriptedTransport::new(&[202, 202, 202, 200]);
        let mut job = accepted_job(&transport).await;
        let result = Exporter::new(&transport, fast().with_max_attempts(2))
            .poll_until_complete(&mut job, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::PollLimitExceeded { attempts: 2, .. })));
        assert_eq!(transport.polls(), 2);
        assert!(!job.is_completed());
    }

    #[tokio::test]
    async fn test_deadline_bound() {
        let transport = ScriptedTransport::new(&[202, 202]);
        let mut job = accepted_job(&transport).await;
        let result = Exporter::new(&transport, fast().with_deadline(Duration::ZERO))
            .poll_until_complete(&mut job, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::PollLimitExceeded { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_unexpected_status_aborts() {
        let transport = ScriptedTransport::new(&[202, 500]);
        let mut job = accepted_job(&transport).await;
        let result = Exporter::new(&transport, fast())
            .poll_until_complete(&mut job, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::UnexpectedResponse { status: 500, .. })));
        assert_eq!(transport.polls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_poll() {
        let transport = ScriptedTransport::new(&[200]);
        let mut job = accepted_job(&transport).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = Exporter::new(&transport, fast())
            .poll_until_complete(&mut job, &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(transport.polls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting() {
        let transport = ScriptedTransport::new(&[]);
        let mut job = accepted_job(&transport).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let policy = PollPolicy::default().with_interval(Duration::from_secs(3600));
        let result = Exporter::new(&transport, policy)
            .poll_until_complete(&mut job, &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(transport.polls(), 1);
    }

    #[test]
    fn test_retry_after_is_capped_by_deadline() {
        let policy = PollPolicy::default().with_deadline(Duration::from_secs(10));
        assert_eq!(
            policy.next_wait(Some(60), Duration::from_secs(4)),
            Duration::from_secs(6)
        );
        assert_eq!(policy.next_wait(None, Duration::ZERO), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_retry_after_falls_back_to_interval() {
        let policy = PollPolicy::default().with_interval(Duration::from_millis(250));
        assert_eq!(
            policy.next_wait(Some(0), Duration::ZERO),
            Duration::from_millis(250)
        );
        assert_eq!(policy.next_wait(Some(2), Duration::ZERO), Duration::from_secs(2));
    }
}
