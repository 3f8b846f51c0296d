//! Integration tests for the recovery pipeline.
//!
//! Tests: Detector → Coordinator (lease, reset, dispatch, monitor) → Store
//!
//! Verifies:
//! - The three reference scenarios (recovered, timed out, retry ceiling)
//! - Leases keep concurrent runs on one document mutually exclusive, on
//!   one thread and across worker threads
//! - Back-to-back batches dispatch each document at most once
//! - The scheduler drives a queue-backed worker end to end

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use proptest::prelude::*;
    use tokio::time::Instant;

    use docflow_core::TenantId;
    use docflow_documents::{Document, DocumentStatus, RecoveryOutcome};

    use crate::clock::{Clock, ManualClock};
    use crate::config::{CoordinatorConfig, RecoveryConfig, SchedulerConfig, StoreRetryConfig};
    use crate::detector::{StaleThresholds, StuckItemDetector};
    use crate::gateway::QueueGateway;
    use crate::recovery::{RecoveryCoordinator, RecoveryError};
    use crate::scheduler::BatchTriggerScheduler;
    use crate::store::{CasCondition, DocumentStore, InMemoryDocumentStore, RetryingStore, TenantScope};
    use crate::test_support::{Script, SimulatedGateway, seed};

    fn coordinator(
        store: &Arc<InMemoryDocumentStore>,
        script: Script,
    ) -> (
        RecoveryCoordinator<InMemoryDocumentStore, SimulatedGateway>,
        Arc<SimulatedGateway>,
    ) {
        let gateway = Arc::new(SimulatedGateway::new(store.clone(), script));
        let coordinator =
            RecoveryCoordinator::new(store.clone(), gateway.clone(), CoordinatorConfig::default());
        (coordinator, gateway)
    }

    #[tokio::test(start_paused = true)]
    async fn errored_document_is_recovered_within_forty_seconds() {
        docflow_observability::init();
        let store = Arc::new(InMemoryDocumentStore::new());
        let doc = seed(&store, TenantId::new(), DocumentStatus::Error, 3, 0).await;
        let (coordinator, gateway) = coordinator(&store, Script::Finish(Duration::from_secs(30)));

        let started = Instant::now();
        let result = coordinator.recover(doc.id).await;

        assert!(started.elapsed() <= Duration::from_secs(40));
        assert_eq!(result.outcome, RecoveryOutcome::Success);
        assert_eq!(result.final_status, Some(DocumentStatus::Finished));
        assert_eq!(gateway.calls(), 1);

        let stored = store.raw(doc.id).unwrap();
        assert_eq!(stored.status, DocumentStatus::Finished);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_processing_document_is_reset_and_times_out() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let doc = seed(&store, TenantId::new(), DocumentStatus::Processing, 45, 0).await;

        let detector = StuckItemDetector::new(store.clone(), StaleThresholds::default());
        let hits = detector.find_candidates(TenantScope::Any, None).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![doc.id]);

        let (coordinator, _) = coordinator(&store, Script::Silent);
        let started = Instant::now();
        let result = coordinator.recover(doc.id).await;

        assert_eq!(result.outcome, RecoveryOutcome::TimedOut);
        assert!(result.error.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(120));

        let stored = store.raw(doc.id).unwrap();
        assert_eq!(stored.status, DocumentStatus::Restarted);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.lease.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_document_becomes_permanently_failed() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let doc = seed(&store, TenantId::new(), DocumentStatus::Error, 3, 5).await;
        let before = store.raw(doc.id).unwrap();
        let (coordinator, gateway) = coordinator(&store, Script::Finish(Duration::from_secs(1)));

        let result = coordinator.recover(doc.id).await;

        assert!(matches!(
            result.error,
            Some(RecoveryError::RetryCeilingExceeded { .. })
        ));
        assert_eq!(result.final_status, Some(DocumentStatus::PermanentlyFailed));
        assert_eq!(gateway.calls(), 0);

        let after = store.raw(doc.id).unwrap();
        assert_eq!(after.status, DocumentStatus::PermanentlyFailed);
        assert_eq!(after.retry_count, before.retry_count);
        assert_eq!(after.filename, before.filename);
        assert_eq!(after.trace, before.trace);

        // Terminal: a second attempt is refused outright.
        let again = coordinator.recover(doc.id).await;
        assert_eq!(again.error.as_ref().map(|e| e.kind()), Some("invalid_transition"));
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_recoveries_of_one_document_dispatch_once() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let doc = seed(&store, TenantId::new(), DocumentStatus::Error, 3, 0).await;
        let (coordinator, gateway) = coordinator(&store, Script::Finish(Duration::from_secs(15)));

        let (a, b) = tokio::join!(coordinator.recover(doc.id), coordinator.recover(doc.id));

        let winners = [&a, &b].iter().filter(|r| r.dispatched()).count();
        assert_eq!(winners, 1);
        assert_eq!(gateway.calls(), 1);
        // Depending on interleaving the loser sees the lease, a lost CAS, or
        // the already restarted document.
        let loser = if a.dispatched() { &b } else { &a };
        assert!(matches!(
            loser.error,
            Some(
                RecoveryError::LeaseConflict { .. }
                    | RecoveryError::StatusChanged { .. }
                    | RecoveryError::InvalidTransition { .. }
            )
        ));
        assert_eq!(store.raw(doc.id).unwrap().retry_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_recoveries_of_one_document_dispatch_once() {
        const RACERS: usize = 32;

        let store = Arc::new(InMemoryDocumentStore::new());
        let doc = seed(&store, TenantId::new(), DocumentStatus::Error, 3, 0).await;
        let gateway = Arc::new(SimulatedGateway::new(
            store.clone(),
            Script::Finish(Duration::from_millis(50)),
        ));
        let config = CoordinatorConfig {
            poll_interval_secs: 1,
            monitor_timeout_secs: 5,
            lease_ttl_secs: 30,
            ..CoordinatorConfig::default()
        };
        let coordinator = RecoveryCoordinator::new(store.clone(), gateway.clone(), config);

        let id = doc.id;
        let start = Arc::new(tokio::sync::Barrier::new(RACERS));
        let mut handles = Vec::with_capacity(RACERS);
        for _ in 0..RACERS {
            let coordinator = coordinator.clone();
            let start = start.clone();
            handles.push(tokio::spawn(async move {
                start.wait().await;
                coordinator.recover(id).await
            }));
        }
        let mut results = Vec::with_capacity(RACERS);
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.dispatched()).count(), 1);
        assert_eq!(gateway.calls(), 1);
        for loser in results.iter().filter(|r| !r.dispatched()) {
            assert!(
                matches!(
                    loser.error,
                    Some(
                        RecoveryError::LeaseConflict { .. }
                            | RecoveryError::StatusChanged { .. }
                            | RecoveryError::InvalidTransition { .. }
                    )
                ),
                "unexpected loser: {loser:?}"
            );
        }
        let stored = store.raw(doc.id).unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, DocumentStatus::Finished);
        assert!(stored.lease.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_batches_dispatch_each_document_once() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let tenant = TenantId::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(seed(&store, tenant, DocumentStatus::Error, 3, 0).await.id);
        }
        let (coordinator, gateway) = coordinator(&store, Script::Finish(Duration::from_secs(5)));

        let (first, second) = tokio::join!(
            coordinator.recover_batch(&ids, 4),
            coordinator.recover_batch(&ids, 4)
        );
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        assert_eq!(gateway.calls(), 4);

        let third = coordinator.recover_batch(&ids, 4).await;
        assert!(third.iter().all(|r| !r.dispatched()));
        assert_eq!(gateway.calls(), 4);
        for id in &ids {
            assert_eq!(store.raw(*id).unwrap().retry_count, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_feeds_a_queue_backed_worker() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let tenant = TenantId::new();
        let stuck = seed(&store, tenant, DocumentStatus::Running, 40, 0).await;
        let errored = seed(&store, tenant, DocumentStatus::Error, 40, 2).await;
        let fresh = seed(&store, tenant, DocumentStatus::Running, 2, 0).await;

        let (gateway, mut requests) = QueueGateway::new(16);
        let worker_store = store.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let Ok(Some(doc)) = worker_store.get(request.document_id).await else {
                    continue;
                };
                let update = doc.transition(docflow_documents::LifecycleEvent::Start).unwrap();
                worker_store
                    .cas_update(doc.id, CasCondition::status(doc.status), &update)
                    .await
                    .unwrap();
            }
        });

        let config = RecoveryConfig::default();
        let store_policy = StoreRetryConfig::default().policy();
        let retrying = Arc::new(RetryingStore::new(store.clone(), store_policy));
        let coordinator = RecoveryCoordinator::new(retrying, Arc::new(gateway), config.coordinator.clone());
        let scheduler = BatchTriggerScheduler::new(
            coordinator,
            StaleThresholds::from_config(&config.detector),
            SchedulerConfig {
                tenant: Some(tenant),
                ..config.scheduler.clone()
            },
        );

        // The worker only starts the document, so the run reaches the monitor timeout.
        let report = scheduler.tick(&tokio_util::sync::CancellationToken::new()).await;

        assert_eq!(report.candidates_found, 1);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.timed_out, 1);
        assert_eq!(store.raw(stuck.id).unwrap().status, DocumentStatus::Running);
        assert_eq!(store.raw(stuck.id).unwrap().retry_count, 1);
        assert_eq!(store.raw(errored.id).unwrap().status, DocumentStatus::Error);
        assert_eq!(store.raw(fresh.id).unwrap().status, DocumentStatus::Running);
    }

    proptest! {
        #[test]
        fn detector_never_returns_documents_inside_the_window(
            threshold_minutes in 1i64..120,
            ages in proptest::collection::vec(0i64..240, 1..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let clock = Arc::new(ManualClock::new(Utc::now()));
                let store = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
                let tenant = TenantId::new();
                let now = clock.now();
                for age in &ages {
                    let doc = Document::new(tenant, "p.pdf", now - chrono::Duration::days(1))
                        .with_status(DocumentStatus::Processing, now - chrono::Duration::minutes(*age));
                    store.insert(doc).await.unwrap();
                }

                let threshold = chrono::Duration::minutes(threshold_minutes);
                let detector = StuckItemDetector::new(store, StaleThresholds::uniform(threshold));
                let hits = detector.find_candidates(TenantScope::Any, None).await.unwrap();

                let expected = ages.iter().filter(|a| **a > threshold_minutes).count();
                prop_assert_eq!(hits.len(), expected);
                for hit in &hits {
                    prop_assert!(now - hit.last_modified_at > threshold);
                }
                Ok(())
            })?;
        }
    }
}
