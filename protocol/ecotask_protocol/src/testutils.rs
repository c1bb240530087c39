#![allow(dead_code)]

//! Shared fixtures for the in-crate tests.

use std::sync::Arc;

use crate::types::{Address, NewTask, TaskId, Timestamp};
use crate::{EcoTaskProtocol, ManualClock, ProtocolConfig, Role};

pub const START: Timestamp = 1_700_000_000;
pub const DAY: u64 = 86_400;

pub fn addr(name: &str) -> Address {
    Address::from(name)
}

pub fn setup() -> (ManualClock, EcoTaskProtocol) {
    setup_with_config(ProtocolConfig::default())
}

pub fn setup_with_config(config: ProtocolConfig) -> (ManualClock, EcoTaskProtocol) {
    let clock = ManualClock::new(START);
    let protocol = EcoTaskProtocol::new(config, Arc::new(clock.clone())).unwrap();
    (clock, protocol)
}

/// Initialised protocol with three validators `v1..v3` on the roster.
pub fn setup_with_init() -> (ManualClock, EcoTaskProtocol, Address) {
    let (clock, mut protocol) = setup();
    let super_admin = addr("super_admin");
    protocol.init(&super_admin).unwrap();
    add_validators(&mut protocol, &super_admin, 3);
    (clock, protocol, super_admin)
}

pub fn add_validators(protocol: &mut EcoTaskProtocol, admin: &Address, count: usize) {
    let existing = protocol.validators().len();
    for i in existing..existing + count {
        let validator = addr(&format!("v{}", i + 1));
        protocol.grant_role(admin, &validator, Role::Validator).unwrap();
    }
}

pub fn task_params(cost: i128, deadline: Timestamp) -> NewTask {
    NewTask {
        description: "Mangrove restoration, 2 ha".to_string(),
        estimated_cost: cost,
        expected_co2: 100,
        location: "Mombasa, KE".to_string(),
        deadline,
        proof_requirements: "geotagged photos and survey".to_string(),
        external_doc_ref: "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi".to_string(),
    }
}

/// Task with cost 100 and a 30 day deadline, proposed by `proposer`.
pub fn create_task(protocol: &mut EcoTaskProtocol) -> TaskId {
    let deadline = protocol.now() + 30 * DAY;
    protocol
        .create_task(&addr("proposer"), task_params(100, deadline))
        .unwrap()
        .id
}

/// Task funded 50/50 by `alice` and `bob`.
pub fn funded_task(protocol: &mut EcoTaskProtocol) -> TaskId {
    let id = create_task(protocol);
    protocol.fund_task(&addr("alice"), id, 50).unwrap();
    protocol.fund_task(&addr("bob"), id, 50).unwrap();
    id
}

/// Funded task taken by `operator`, registered with a stake of 20.
pub fn in_progress_task(protocol: &mut EcoTaskProtocol) -> TaskId {
    let id = funded_task(protocol);
    let operator = addr("operator");
    if protocol.operator(&operator).is_err() {
        protocol.register_operator(&operator, 20).unwrap();
    }
    protocol.stake_for_task(&operator, id).unwrap();
    id
}

/// In-progress task whose operator submitted a proof of 120.
pub fn under_review_task(protocol: &mut EcoTaskProtocol) -> TaskId {
    let id = in_progress_task(protocol);
    protocol
        .submit_proof(&addr("operator"), id, "ipfs://proof-bundle", 120)
        .unwrap();
    id
}

/// Under-review task with an open verification round.
pub fn verifying_task(protocol: &mut EcoTaskProtocol) -> TaskId {
    let id = under_review_task(protocol);
    protocol.initiate_verification(id).unwrap();
    id
}
