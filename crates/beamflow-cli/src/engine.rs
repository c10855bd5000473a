//! Boots one in-process kernel instance: Store, Idempotency Ledger,
//! Circuit Breaker Registry, Retry Policy Book, Saga Compensator, Dead
//! Letter Queue and Event Bus, wired into a `Supervisor` over the bundled
//! workflow registry.
//!
//! Each CLI invocation is a fresh process, so anything not durably
//! persisted to the Store (circuit breaker state, in-flight cancellation
//! handles) starts over every time -- acceptable for an operator tool
//! driving a single store, not acceptable for a long-lived service.

use std::sync::Arc;

use beamflow_core::bus::EventBus;
use beamflow_core::circuit_breaker::CircuitBreakerRegistry;
use beamflow_core::clock::Clock;
use beamflow_core::config::{EngineConfig, StorageMode};
use beamflow_core::dlq::DeadLetterQueue;
use beamflow_core::idempotency::IdempotencyLedger;
use beamflow_core::saga::SagaCompensator;
use beamflow_core::store::memory::MemoryStore;
use beamflow_core::store::sqlite::SqliteStore;
use beamflow_core::store::{Store, StoreError};
use beamflow_core::supervisor::Supervisor;
use beamflow_core::ActorDeps;

use crate::workflows;

pub async fn boot(config: &EngineConfig) -> Result<Supervisor, StoreError> {
    let store: Arc<dyn Store> = match config.storage.mode {
        StorageMode::Memory => Arc::new(MemoryStore::new()),
        StorageMode::Disk => {
            let dir = config
                .storage
                .dir
                .clone()
                .unwrap_or_else(|| "./beamflow-data".to_string());
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let path = format!("{dir}/beamflow.db");
            Arc::new(SqliteStore::open(&path).await?)
        }
    };

    let clock = Clock::system();
    let bus = Arc::new(EventBus::new(256));
    let ledger = Arc::new(IdempotencyLedger::new(store.clone(), clock.clone()).with_stale_after(config.idempotency_stale_after()));

    let mut breaker = CircuitBreakerRegistry::new(clock.clone()).with_bus(bus.clone());
    for (name, cfg) in &config.circuit_breakers {
        breaker.configure(name.clone(), cfg.clone());
    }
    let breaker = Arc::new(breaker);

    let dlq = Arc::new(
        DeadLetterQueue::new(store.clone(), clock.clone())
            .with_bus(bus.clone())
            .with_max_retries(config.dlq_max_retries()),
    );

    let retry_policies = config.retry_policy_book();
    let saga = Arc::new(
        SagaCompensator::new(ledger.clone(), breaker.clone(), dlq.clone())
            .with_bus(bus.clone())
            .with_retry_policies(retry_policies.clone()),
    );

    let deps = Arc::new(ActorDeps {
        store,
        ledger,
        breaker,
        retry_policies,
        saga,
        dlq,
        bus: Some(bus),
        clock,
    });

    Ok(Supervisor::new(workflows::registry(), deps))
}
