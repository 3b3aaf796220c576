//! Pull Client
//!
//! Fetches missing transactions from the primary and applies them to the
//! local store in order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::{AppliedRange, Backoff, HaSettings};
use crate::error::{Error, Result};
use crate::transport::{Endpoint, NackReason, Request, Response, Transport};
use crate::txlog::{TxId, TxStore};

/// Pull counters
#[derive(Debug, Default)]
pub struct PullStats {
    pulls: AtomicU64,
    requests: AtomicU64,
    records_applied: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl PullStats {
    /// Pulls started
    pub fn pulls(&self) -> u64 {
        self.pulls.load(Ordering::Relaxed)
    }

    /// `PullSince` requests sent, including retries and continuations
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn records_applied(&self) -> u64 {
        self.records_applied.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Pulls that ended in an error
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Replica-side gateway for fetching and applying the primary's log
pub struct PullClient {
    node_id: String,
    store: Arc<dyn TxStore>,
    transport: Arc<dyn Transport>,
    settings: HaSettings,
    stats: PullStats,
}

impl PullClient {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn TxStore>,
        transport: Arc<dyn Transport>,
        settings: HaSettings,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            transport,
            settings,
            stats: PullStats::default(),
        }
    }

    pub fn stats(&self) -> &PullStats {
        &self.stats
    }

    /// Local committed tail
    pub fn local_tail(&self) -> TxId {
        self.store.last_committed_tx_id()
    }

    /// Pull everything the primary had committed when it served the first
    /// response, applying records as they arrive.
    ///
    /// One request normally covers the whole backlog. A response cut short
    /// by `pull_max_records` or the frame size is continued from the local
    /// tail, bounded by the tail the first response reported.
    ///
    /// Applied records stay applied when a later record fails. Transport
    /// failures are retried from the current local tail; apply failures are
    /// not retried.
    pub async fn pull_from(&self, primary: &Endpoint) -> Result<AppliedRange> {
        self.stats.pulls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let start_tail = self.local_tail();
        tracing::debug!("Pulling from {} since tx {}", primary, start_tail);

        let result = self.pull_inner(primary).await;
        match &result {
            Ok(range) if range.is_empty() => {
                tracing::debug!("Pull from {} found nothing after tx {}", primary, start_tail);
            }
            Ok(range) => {
                tracing::info!(
                    "Pulled tx {}..={} ({} records) from {} in {:?}",
                    range.first_applied,
                    range.last_applied,
                    range.count,
                    primary,
                    started.elapsed()
                );
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Pull from {} failed after {:?} at local tx {}: {}",
                    primary,
                    started.elapsed(),
                    self.local_tail(),
                    e
                );
            }
        }
        result
    }

    async fn pull_inner(&self, primary: &Endpoint) -> Result<AppliedRange> {
        let mut backoff = Backoff::from_settings(&self.settings);
        let mut up_to: Option<TxId> = None;
        let mut first_applied: Option<TxId> = None;
        let mut count = 0u64;

        loop {
            let since = self.local_tail();
            if matches!(up_to, Some(limit) if since >= limit) {
                break;
            }

            let request = Request::PullSince {
                requester: self.node_id.clone(),
                since,
                up_to,
                max: self.settings.pull_max_records,
            };
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            let response = match self.transport.call(primary, request).await {
                Ok(response) => response,
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            "Pull request to {} failed ({}), retry {}/{} in {:?}",
                            primary,
                            e,
                            backoff.retries(),
                            self.settings.pull_retry_max,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => {
                        return Err(Error::ReplicationTransportFailed {
                            endpoint: primary.to_string(),
                            reason: format!("{} (gave up after {} retries)", e, backoff.retries()),
                        });
                    }
                },
                Err(e) => return Err(e),
            };

            match response {
                Response::TxStream {
                    records,
                    primary_tail,
                } => {
                    backoff.reset();
                    up_to.get_or_insert(primary_tail);
                    if records.is_empty() {
                        break;
                    }

                    for record in records {
                        let tx_id = record.tx_id;
                        if let Err(e) = self.store.append(record).await {
                            tracing::error!(
                                "Failed to apply tx {} pulled from {}: {}",
                                tx_id,
                                primary,
                                e
                            );
                            return Err(Error::ReplicationApplyFailed {
                                tx_id,
                                cause: e.to_string(),
                            });
                        }
                        first_applied.get_or_insert(tx_id);
                        count += 1;
                        self.stats.records_applied.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Response::Nack {
                    reason: NackReason::Truncated { oldest },
                } => {
                    return Err(Error::LogTruncated {
                        requested: since,
                        oldest,
                    });
                }
                Response::Nack {
                    reason: NackReason::NotPrimary { primary: current },
                } => {
                    return Err(Error::NotPrimary(
                        current.unwrap_or_else(|| "unknown".to_string()),
                    ));
                }
                Response::Nack { reason } => {
                    return Err(Error::Nack {
                        endpoint: primary.to_string(),
                        reason: reason.to_string(),
                    });
                }
                other => {
                    return Err(Error::Network(format!(
                        "Unexpected {} response to PullSince",
                        other.type_name()
                    )));
                }
            }
        }

        let tail = self.local_tail();
        Ok(match first_applied {
            Some(first) => AppliedRange {
                first_applied: first,
                last_applied: tail,
                count,
            },
            None => AppliedRange::empty(tail),
        })
    }
}
