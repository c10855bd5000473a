//! The bundled demo workflow. Workflow graphs are compiled Rust types, not
//! data loaded at runtime, so a usable CLI needs at least one concrete
//! `WorkflowDefinition` wired into the registry it boots with.
//!
//! `order_fulfillment` walks three side-effectful steps -- reserve
//! inventory, charge payment, ship the order -- each of which can be told
//! to fail via a `fail_step` field in the start params, so `workflow start`
//! can exercise the saga compensation and DLQ paths without a real
//! downstream system behind it.

use std::sync::Arc;

use async_trait::async_trait;
use beamflow_core::contract::{DefinitionError, Step, WorkflowDefinition, WorkflowRegistry};
use beamflow_core::error::Failure;
use beamflow_core::graph::{Graph, GraphBuilder, GraphError, State, StepSpec};
use serde_json::Value;

fn wants_failure(state: &State, step: &str) -> bool {
    state.get("fail_step").and_then(|v| v.as_str()) == Some(step)
}

struct ReserveInventory;

#[async_trait]
impl Step for ReserveInventory {
    async fn execute(&self, state: &State) -> Result<State, Failure> {
        if wants_failure(state, "reserve_inventory") {
            return Err(Failure::permanent("item out of stock").with_code("out_of_stock"));
        }
        let mut next = state.clone();
        next.insert("inventory_reserved".into(), serde_json::json!(true));
        Ok(next)
    }

    fn is_side_effectful(&self) -> bool {
        true
    }

    async fn compensate(&self, _state: &State) -> Result<(), Failure> {
        Ok(())
    }
}

struct ChargePayment;

#[async_trait]
impl Step for ChargePayment {
    async fn execute(&self, state: &State) -> Result<State, Failure> {
        if wants_failure(state, "charge_payment") {
            return Err(Failure::permanent("card declined").with_code("card_declined"));
        }
        let mut next = state.clone();
        next.insert("payment_charged".into(), serde_json::json!(true));
        Ok(next)
    }

    fn is_side_effectful(&self) -> bool {
        true
    }

    async fn compensate(&self, _state: &State) -> Result<(), Failure> {
        Ok(())
    }
}

struct ShipOrder;

#[async_trait]
impl Step for ShipOrder {
    async fn execute(&self, state: &State) -> Result<State, Failure> {
        if wants_failure(state, "ship_order") {
            return Err(Failure::permanent("no carrier available").with_code("no_carrier"));
        }
        let mut next = state.clone();
        next.insert("shipped".into(), serde_json::json!(true));
        Ok(next)
    }

    fn is_side_effectful(&self) -> bool {
        true
    }

    async fn compensate(&self, _state: &State) -> Result<(), Failure> {
        Ok(())
    }
}

pub struct OrderFulfillment;

impl WorkflowDefinition for OrderFulfillment {
    fn kind(&self) -> &str {
        "order_fulfillment"
    }

    fn graph(&self) -> Result<Graph, GraphError> {
        GraphBuilder::new().linear(vec![
            StepSpec::new("reserve_inventory", "reserve_inventory").side_effectful(),
            StepSpec::new("charge_payment", "charge_payment").side_effectful(),
            StepSpec::new("ship_order", "ship_order").side_effectful(),
        ])
    }

    fn initial_state(&self, params: Value) -> Result<State, DefinitionError> {
        match params {
            Value::Object(map) => Ok(map.into_iter().collect()),
            Value::Null => Ok(State::new()),
            _ => Err(DefinitionError::InvalidParams("expected a JSON object".into())),
        }
    }

    fn step(&self, module: &str) -> Option<Arc<dyn Step>> {
        match module {
            "reserve_inventory" => Some(Arc::new(ReserveInventory)),
            "charge_payment" => Some(Arc::new(ChargePayment)),
            "ship_order" => Some(Arc::new(ShipOrder)),
            _ => None,
        }
    }
}

pub fn registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register(Arc::new(OrderFulfillment));
    registry
}
