//! Classification pipeline.
//!
//! The [`ClassificationService`] puts three things in front of the oracle:
//!
//! - a fingerprint-keyed LRU cache, so identical content is classified once
//! - per-fingerprint in-flight locks, so concurrent duplicates wait for the
//!   first caller instead of issuing their own oracle call
//! - a process-wide semaphore bounding concurrent oracle calls
//!
//! Classification never notifies anyone. It only attaches a
//! [`NotificationRequest`] to the result when the category is high-value.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use super::oracle::{CategoryOracle, OracleError};
use crate::config::ClassifierSettings;
use crate::domain::{Category, ClassificationResult, Fingerprint, NormalizedMessage, NotificationRequest};

/// Errors returned by [`ClassificationService::classify`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifyError {
    /// A single oracle attempt failed in a way worth retrying.
    #[error("transient oracle failure: {0}")]
    Transient(OracleError),

    /// The oracle could not produce an answer within the retry ceiling.
    #[error("oracle unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },
}

impl ClassifyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClassifyError::Transient(_))
    }
}

/// Counters describing classifier activity since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierStats {
    pub cache_hits: u64,
    pub oracle_calls: u64,
    pub fallbacks: u64,
}

#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    category: Category,
    confidence: Option<f32>,
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    oracle_calls: AtomicU64,
    fallbacks: AtomicU64,
}

/// Cached, deduplicated and rate-limited front end to a [`CategoryOracle`].
pub struct ClassificationService {
    oracle: Arc<dyn CategoryOracle>,
    cache: Mutex<LruCache<Fingerprint, CachedVerdict>>,
    in_flight: Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>,
    gate: Semaphore,
    max_attempts: u32,
    retry_base: Duration,
    call_timeout: Duration,
    counters: Counters,
}

impl ClassificationService {
    pub fn new(oracle: Arc<dyn CategoryOracle>, settings: &ClassifierSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.cache_capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            oracle,
            cache: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
            gate: Semaphore::new(settings.max_concurrent.max(1)),
            max_attempts: settings.max_attempts.max(1),
            retry_base: settings.retry_base(),
            call_timeout: settings.call_timeout(),
            counters: Counters::default(),
        }
    }

    /// Classifies a message.
    ///
    /// Returns a cached verdict when the same subject and body have been
    /// classified before. Transient oracle failures are retried with
    /// exponential backoff up to the configured attempt ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError::Unavailable`] when no answer could be obtained.
    pub async fn classify(
        &self,
        message: &NormalizedMessage,
    ) -> Result<ClassificationResult, ClassifyError> {
        let fingerprint = Fingerprint::of(&message.subject, message.body_text());

        if let Some(verdict) = self.cached(&fingerprint) {
            return Ok(self.build_result(message, verdict, true));
        }

        let lock = self.in_flight_lock(&fingerprint);
        let outcome = {
            let _guard = lock.lock().await;

            // Whoever held the lock before us may have filled the cache.
            match self.cached(&fingerprint) {
                Some(verdict) => Ok((verdict, true)),
                None => self
                    .ask_oracle(message)
                    .await
                    .map(|verdict| {
                        self.store(&fingerprint, verdict);
                        (verdict, false)
                    }),
            }
        };
        self.release_in_flight(&fingerprint, lock);

        let (verdict, cached) = outcome?;
        Ok(self.build_result(message, verdict, cached))
    }

    /// Classifies a message, degrading to [`Category::Unclassified`] when the
    /// oracle is unavailable. The fallback is not cached and never notifies.
    pub async fn classify_or_fallback(&self, message: &NormalizedMessage) -> ClassificationResult {
        match self.classify(message).await {
            Ok(result) => result,
            Err(e) => {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    message_key = %message.key(),
                    error = %e,
                    "Classification unavailable, delivering as unclassified"
                );
                ClassificationResult::unclassified(message.key())
            }
        }
    }

    pub fn stats(&self) -> ClassifierStats {
        ClassifierStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            oracle_calls: self.counters.oracle_calls.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Number of fingerprints currently cached.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cached(&self, fingerprint: &Fingerprint) -> Option<CachedVerdict> {
        let verdict = self.cache.lock().ok()?.get(fingerprint).copied();
        if verdict.is_some() {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        verdict
    }

    fn store(&self, fingerprint: &Fingerprint, verdict: CachedVerdict) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(fingerprint.clone(), verdict);
        }
    }

    fn in_flight_lock(&self, fingerprint: &Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        match self.in_flight.lock() {
            Ok(mut map) => map.entry(fingerprint.clone()).or_default().clone(),
            Err(_) => Arc::default(),
        }
    }

    fn release_in_flight(&self, fingerprint: &Fingerprint, lock: Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut map) = self.in_flight.lock() {
            // The map and `lock` are the only owners once nobody else waits.
            if Arc::strong_count(&lock) <= 2 {
                map.remove(fingerprint);
            }
        }
    }

    async fn ask_oracle(&self, message: &NormalizedMessage) -> Result<CachedVerdict, ClassifyError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(message).await {
                Ok(verdict) => return Ok(verdict),
                Err(ClassifyError::Transient(e)) if attempt < self.max_attempts => {
                    let delay = self.backoff(attempt, &e);
                    tracing::debug!(
                        message_key = %message.key(),
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Oracle call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ClassifyError::Transient(e)) => {
                    return Err(ClassifyError::Unavailable {
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
                Err(ClassifyError::Unavailable { reason, .. }) => {
                    return Err(ClassifyError::Unavailable {
                        attempts: attempt,
                        reason,
                    })
                }
            }
        }
    }

    async fn attempt(&self, message: &NormalizedMessage) -> Result<CachedVerdict, ClassifyError> {
        let _permit = self.gate.acquire().await.map_err(|_| ClassifyError::Unavailable {
            attempts: 0,
            reason: "classifier shut down".to_string(),
        })?;

        self.counters.oracle_calls.fetch_add(1, Ordering::Relaxed);
        let call = self.oracle.classify_text(&message.subject, message.body_text());

        let answer = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) if e.is_transient() => return Err(ClassifyError::Transient(e)),
            Ok(Err(e)) => {
                return Err(ClassifyError::Unavailable {
                    attempts: 0,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(ClassifyError::Transient(OracleError::Timeout)),
        };

        let category = Category::from_oracle_label(&answer.label);
        if category == Category::Unclassified {
            tracing::debug!(
                message_key = %message.key(),
                label = %answer.label,
                "Oracle answered outside the category set"
            );
        }

        Ok(CachedVerdict {
            category,
            confidence: answer.confidence.map(|c| c.clamp(0.0, 1.0)),
        })
    }

    fn backoff(&self, attempt: u32, error: &OracleError) -> Duration {
        let exponential = self.retry_base.saturating_mul(1 << (attempt - 1).min(16));
        match error {
            OracleError::RateLimited {
                retry_after_secs: Some(secs),
            } => exponential.max(Duration::from_secs(*secs)),
            _ => exponential,
        }
    }

    fn build_result(
        &self,
        message: &NormalizedMessage,
        verdict: CachedVerdict,
        cached: bool,
    ) -> ClassificationResult {
        let notification = verdict
            .category
            .is_high_value()
            .then(|| NotificationRequest::for_message(message, verdict.category));

        ClassificationResult {
            message_key: message.key(),
            category: verdict.category,
            confidence: verdict.confidence,
            produced_at: Utc::now(),
            cached,
            notification,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, Address};
    use crate::services::oracle::OracleAnswer;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Oracle that answers from a script, one entry per call, repeating the
    /// last entry once the script runs out.
    struct ScriptedOracle {
        script: Vec<Result<OracleAnswer, OracleError>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn new(script: Vec<Result<OracleAnswer, OracleError>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(label: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: vec![Ok(OracleAnswer::label(label))],
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CategoryOracle for ScriptedOracle {
        async fn classify_text(&self, _subject: &str, _body: &str) -> Result<OracleAnswer, OracleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let index = n.min(self.script.len() - 1);
            self.script[index].clone()
        }
    }

    fn settings() -> ClassifierSettings {
        ClassifierSettings {
            max_attempts: 3,
            retry_base_ms: 1,
            call_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn message(uid: u32, subject: &str, body: &str) -> NormalizedMessage {
        NormalizedMessage {
            account_id: AccountId::from("a@example.com"),
            folder: "INBOX".to_string(),
            server_uid: uid,
            message_id: None,
            subject: subject.to_string(),
            sender: Address::new("lead@corp.com"),
            recipients: vec![],
            sent_at: Utc::now(),
            plain_body: Some(body.to_string()),
            html_body: None,
            attachment_refs: vec![],
        }
    }

    #[tokio::test]
    async fn second_identical_message_hits_cache() {
        let oracle = ScriptedOracle::new(vec![Ok(OracleAnswer::label("Interested"))]);
        let service = ClassificationService::new(oracle.clone(), &settings());

        let first = service.classify(&message(1, "Pricing", "Tell me more")).await.unwrap();
        let second = service.classify(&message(2, "Pricing", "Tell me more")).await.unwrap();

        assert_eq!(oracle.calls(), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.category, Category::Interested);
        assert_eq!(second.message_key.uid, 2);
        assert_eq!(service.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn high_value_result_carries_notification() {
        let oracle = ScriptedOracle::new(vec![Ok(OracleAnswer::label("interested"))]);
        let service = ClassificationService::new(oracle, &settings());

        let result = service.classify(&message(1, "Yes", "Let's go")).await.unwrap();
        let notification = result.notification.expect("notification");
        assert_eq!(notification.message_key, result.message_key);
        assert_eq!(notification.category, Category::Interested);
    }

    #[tokio::test]
    async fn other_categories_do_not_notify() {
        let oracle = ScriptedOracle::new(vec![Ok(OracleAnswer::label("Out of Office"))]);
        let service = ClassificationService::new(oracle, &settings());

        let result = service.classify(&message(1, "Away", "Back Monday")).await.unwrap();
        assert_eq!(result.category, Category::OutOfOffice);
        assert!(result.notification.is_none());
    }

    #[tokio::test]
    async fn unknown_label_is_unclassified_and_cached() {
        let oracle = ScriptedOracle::new(vec![Ok(OracleAnswer::label("Recruiting"))]);
        let service = ClassificationService::new(oracle.clone(), &settings());

        let result = service.classify(&message(1, "Job", "Hiring")).await.unwrap();
        assert_eq!(result.category, Category::Unclassified);

        service.classify(&message(2, "Job", "Hiring")).await.unwrap();
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let oracle = ScriptedOracle::new(vec![
            Err(OracleError::RateLimited {
                retry_after_secs: None,
            }),
            Ok(OracleAnswer::label("Spam")),
        ]);
        let service = ClassificationService::new(oracle.clone(), &settings());

        let result = service.classify(&message(1, "Win", "Prize")).await.unwrap();
        assert_eq!(result.category, Category::Spam);
        assert_eq!(oracle.calls(), 2);
    }

    #[tokio::test]
    async fn persistent_timeouts_degrade_to_unclassified() {
        let oracle = ScriptedOracle::new(vec![Err(OracleError::Timeout)]);
        let service = ClassificationService::new(oracle.clone(), &settings());
        let msg = message(1, "Hello", "World");

        let err = service.classify(&msg).await.unwrap_err();
        assert!(matches!(err, ClassifyError::Unavailable { attempts: 3, .. }));
        assert_eq!(oracle.calls(), 3);

        let result = service.classify_or_fallback(&msg).await;
        assert_eq!(result.category, Category::Unclassified);
        assert!(result.notification.is_none());
        assert_eq!(service.cached_len(), 0);
        assert_eq!(service.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn rejected_request_is_not_retried() {
        let oracle = ScriptedOracle::new(vec![Err(OracleError::Rejected("bad key".to_string()))]);
        let service = ClassificationService::new(oracle.clone(), &settings());

        let err = service.classify(&message(1, "a", "b")).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_oracle_times_out() {
        let oracle = ScriptedOracle::slow("Interested", Duration::from_secs(60));
        let service = ClassificationService::new(
            oracle.clone(),
            &ClassifierSettings {
                max_attempts: 2,
                call_timeout_secs: 1,
                retry_base_ms: 1,
                ..Default::default()
            },
        );

        let err = service.classify(&message(1, "a", "b")).await.unwrap_err();
        assert!(matches!(err, ClassifyError::Unavailable { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn concurrent_duplicates_share_one_oracle_call() {
        let oracle = ScriptedOracle::slow("Social", Duration::from_millis(50));
        let service = Arc::new(ClassificationService::new(oracle.clone(), &settings()));

        let handles: Vec<_> = (1..=5)
            .map(|uid| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service
                        .classify(&message(uid, "Party", "Friday at 8"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().category, Category::Social);
        }
        assert_eq!(oracle.calls(), 1);
    }

    #[test]
    fn backoff_grows_and_honors_retry_after() {
        let oracle = ScriptedOracle::new(vec![Ok(OracleAnswer::label("Spam"))]);
        let service = ClassificationService::new(
            oracle,
            &ClassifierSettings {
                retry_base_ms: 100,
                ..Default::default()
            },
        );

        assert_eq!(service.backoff(1, &OracleError::Timeout), Duration::from_millis(100));
        assert_eq!(service.backoff(3, &OracleError::Timeout), Duration::from_millis(400));
        assert_eq!(
            service.backoff(
                1,
                &OracleError::RateLimited {
                    retry_after_secs: Some(2)
                }
            ),
            Duration::from_secs(2)
        );
    }
}
