use crate::invariants::assert_all_invariants;
use crate::testutils::{
    addr, create_task, funded_task, in_progress_task, setup_with_init, task_params,
    under_review_task, verifying_task, DAY, START,
};
use crate::{Capability, Error, ErrorKind, Role, StakeLockStatus, TaskStatus};

#[test]
fn test_create_task_assigns_sequential_ids() {
    let (_clock, mut protocol, _) = setup_with_init();
    let first = create_task(&mut protocol);
    let second = create_task(&mut protocol);

    assert_eq!(first, 0);
    assert_eq!(second, 1);
    assert_eq!(protocol.task_count(), 2);

    let task = protocol.task(first).unwrap();
    assert_eq!(task.status, TaskStatus::Proposed);
    assert_eq!(task.proposer, addr("proposer"));
    assert_eq!(task.created_at, START);
    assert!(task.assigned_operator.is_none());
    assert_eq!(protocol.pool(first).unwrap().target, 100);
}

#[test]
fn test_create_task_rejects_invalid_input() {
    let (_clock, mut protocol, _) = setup_with_init();
    protocol.drain_events();
    let proposer = addr("proposer");
    let deadline = START + DAY;

    let mut empty = task_params(100, deadline);
    empty.description = "   ".to_string();
    let mut no_outcome = task_params(100, deadline);
    no_outcome.expected_co2 = 0;

    for params in [
        empty,
        task_params(0, deadline),
        task_params(-5, deadline),
        no_outcome,
        task_params(100, START),
        task_params(100, START - 1),
    ] {
        let err = protocol.create_task(&proposer, params).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert_eq!(protocol.task_count(), 0);
    assert!(protocol.pending_events().is_empty());
}

#[test]
fn test_task_queries() {
    let (_clock, mut protocol, _) = setup_with_init();
    let proposed = create_task(&mut protocol);
    let running = in_progress_task(&mut protocol);

    assert!(protocol.task_exists(running));
    assert!(!protocol.task_exists(99));
    assert_eq!(protocol.task(99).unwrap_err(), Error::NotFound("task 99".to_string()));

    let batch = protocol.tasks(&[running, 99, proposed]);
    assert_eq!(batch.iter().map(|t| t.id).collect::<Vec<_>>(), vec![running, proposed]);

    assert_eq!(protocol.tasks_by_proposer(&addr("proposer")).len(), 2);
    assert!(protocol.tasks_by_proposer(&addr("nobody")).is_empty());

    let by_operator = protocol.tasks_by_operator(&addr("operator"));
    assert_eq!(by_operator.len(), 1);
    assert_eq!(by_operator[0].id, running);

    assert_eq!(protocol.tasks_by_status(TaskStatus::Proposed).len(), 1);
    assert_eq!(protocol.tasks_by_status(TaskStatus::InProgress).len(), 1);
    assert!(protocol.tasks_by_status(TaskStatus::Verified).is_empty());
}

#[test]
fn test_reserved_transitions_require_capability() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = funded_task(&mut protocol);
    let now = protocol.now();

    let registry = &mut protocol.store.registry;
    let err = registry.mark_funded(Capability::CollateralManager, id, now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = registry
        .assign_operator(Capability::FundingPool, id, &addr("intruder"), now)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = registry.mark_verified(Capability::FundingPool, id, now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    // Right capability, wrong status: the compare-and-set refuses.
    let err = registry.mark_funded(Capability::FundingPool, id, now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    let err = registry.mark_rejected(Capability::VerificationManager, id, now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Funded);
}

#[test]
fn test_submit_proof_moves_task_under_review() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = in_progress_task(&mut protocol);
    clock.advance(DAY);

    let task = protocol
        .submit_proof(&addr("operator"), id, "ipfs://proof-bundle", 120)
        .unwrap();
    assert_eq!(task.status, TaskStatus::UnderReview);
    assert_eq!(task.actual_outcome, Some(120));
    assert_eq!(task.proof_ref.as_deref(), Some("ipfs://proof-bundle"));
    assert_eq!(task.updated_at, START + DAY);
    assert_all_invariants(&protocol);
}

#[test]
fn test_submit_proof_checks() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = in_progress_task(&mut protocol);
    let operator = addr("operator");

    let err = protocol.submit_proof(&addr("mallory"), id, "ipfs://x", 120).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    let err = protocol.submit_proof(&operator, id, "", 120).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = protocol.submit_proof(&operator, id, "ipfs://x", 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    protocol.submit_proof(&operator, id, "ipfs://x", 120).unwrap();
    let err = protocol.submit_proof(&operator, id, "ipfs://y", 130).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(protocol.task(id).unwrap().actual_outcome, Some(120));
}

#[test]
fn test_submit_proof_accepted_within_grace_period() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = in_progress_task(&mut protocol);
    let deadline = protocol.task(id).unwrap().deadline;

    clock.set(deadline + 3 * DAY);
    protocol
        .submit_proof(&addr("operator"), id, "ipfs://late-but-ok", 90)
        .unwrap();
}

#[test]
fn test_submit_proof_after_grace_period_fails() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = in_progress_task(&mut protocol);
    let deadline = protocol.task(id).unwrap().deadline;

    clock.set(deadline + 3 * DAY + 1);
    let err = protocol
        .submit_proof(&addr("operator"), id, "ipfs://too-late", 90)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deadline);
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::InProgress);
}

#[test]
fn test_check_deadline_before_cutoff_fails() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = create_task(&mut protocol);
    let deadline = protocol.task(id).unwrap().deadline;

    clock.set(deadline + 3 * DAY);
    let err = protocol.check_deadline(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deadline);
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Proposed);
}

#[test]
fn test_check_deadline_rejects_underfunded_task_and_enables_refunds() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = create_task(&mut protocol);
    let alice = addr("alice");
    protocol.fund_task(&alice, id, 30).unwrap();

    clock.advance(34 * DAY);
    assert_eq!(protocol.overdue_tasks(), vec![id]);
    let previous = protocol.check_deadline(id).unwrap();

    assert_eq!(previous, TaskStatus::Proposed);
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Rejected);
    assert!(protocol.pool(id).unwrap().refunds_enabled);
    assert!(protocol.overdue_tasks().is_empty());

    assert_eq!(protocol.claim_refund(&alice, id).unwrap(), 30);
    assert_eq!(protocol.credited(&alice), 30);
    assert_eq!(protocol.treasury_balance(), 0);
    assert_all_invariants(&protocol);
}

#[test]
fn test_check_deadline_slashes_and_bans_absent_operator() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = in_progress_task(&mut protocol);
    let operator = addr("operator");

    clock.advance(34 * DAY);
    let previous = protocol.check_deadline(id).unwrap();
    assert_eq!(previous, TaskStatus::InProgress);

    let lock = protocol.stake_lock(id).unwrap();
    assert_eq!(lock.status, StakeLockStatus::Slashed);
    assert_eq!(lock.slashed_amount, 10);

    let snapshot = protocol.operator(&operator).unwrap();
    assert!(snapshot.banned);
    assert!(!snapshot.approved);
    assert_eq!(snapshot.available, 10);
    assert_eq!(snapshot.locked, 0);
    assert_eq!(protocol.treasury_balance(), 10);

    assert!(protocol.pool(id).unwrap().refunds_enabled);
    assert_eq!(protocol.claim_refund(&addr("alice"), id).unwrap(), 50);
    assert_eq!(protocol.claim_refund(&addr("bob"), id).unwrap(), 50);
    assert_all_invariants(&protocol);
}

#[test]
fn test_check_deadline_releases_stake_of_unreviewed_proof() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = under_review_task(&mut protocol);

    clock.advance(34 * DAY);
    assert_eq!(protocol.check_deadline(id).unwrap(), TaskStatus::UnderReview);

    assert_eq!(protocol.stake_lock(id).unwrap().status, StakeLockStatus::Released);
    let snapshot = protocol.operator(&addr("operator")).unwrap();
    assert!(snapshot.approved);
    assert_eq!(snapshot.available, 20);
    assert_eq!(protocol.treasury_balance(), 0);
    assert!(protocol.pool(id).unwrap().refunds_enabled);
    assert_all_invariants(&protocol);
}

#[test]
fn test_check_deadline_defers_to_open_round() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = verifying_task(&mut protocol);

    clock.advance(34 * DAY);
    assert!(protocol.overdue_tasks().is_empty());
    let err = protocol.check_deadline(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(protocol.expired_rounds(), vec![id]);
}

#[test]
fn test_check_deadline_on_terminal_task_fails() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = create_task(&mut protocol);
    clock.advance(34 * DAY);
    protocol.check_deadline(id).unwrap();

    let err = protocol.check_deadline(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}

#[test]
fn test_pause_blocks_lifecycle_but_not_reads() {
    let (_clock, mut protocol, super_admin) = setup_with_init();
    let id = create_task(&mut protocol);

    protocol.pause(&super_admin).unwrap();
    assert!(protocol.is_paused());
    assert_eq!(protocol.fund_task(&addr("alice"), id, 10).unwrap_err(), Error::Paused);
    assert_eq!(
        protocol.create_task(&addr("proposer"), task_params(100, START + DAY)).unwrap_err(),
        Error::Paused
    );
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Proposed);

    // Role administration keeps working while paused.
    protocol.grant_role(&super_admin, &addr("v9"), Role::Validator).unwrap();

    let err = protocol.pause(&super_admin).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDone);
    protocol.unpause(&super_admin).unwrap();
    protocol.fund_task(&addr("alice"), id, 10).unwrap();
}

#[test]
fn test_pause_requires_admin() {
    let (_clock, mut protocol, super_admin) = setup_with_init();
    let admin = addr("admin");

    let err = protocol.pause(&addr("v1")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    protocol.grant_role(&super_admin, &admin, Role::Admin).unwrap();
    protocol.pause(&admin).unwrap();
    let err = protocol.unpause(&addr("v1")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    protocol.unpause(&admin).unwrap();
}

#[test]
fn test_role_administration() {
    let (_clock, mut protocol, super_admin) = setup_with_init();
    let admin = addr("admin");

    let err = protocol.init(&addr("other")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDone);

    let err = protocol.grant_role(&addr("v1"), &admin, Role::Admin).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    protocol.grant_role(&super_admin, &admin, Role::Admin).unwrap();
    assert!(protocol.has_role(&admin, Role::Admin));

    let err = protocol.grant_role(&admin, &addr("x"), Role::SuperAdmin).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    let err = protocol.revoke_role(&admin, &super_admin).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    let err = protocol.revoke_role(&admin, &addr("nobody")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    protocol.revoke_role(&admin, &addr("v2")).unwrap();
    assert_eq!(protocol.role_of(&addr("v2")), None);
    assert_eq!(protocol.active_validators(), vec![addr("v1"), addr("v3")]);
    assert_eq!(protocol.validators().len(), 3);

    protocol.transfer_super_admin(&super_admin, &admin).unwrap();
    assert_eq!(protocol.role_of(&admin), Some(Role::SuperAdmin));
    assert_eq!(protocol.role_of(&super_admin), None);
}

#[test]
fn test_store_snapshot_restores_state() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = under_review_task(&mut protocol);
    let next_seq = protocol.drain_events().len() as u64;

    let json = serde_json::to_string(protocol.store()).unwrap();
    let store = serde_json::from_str(&json).unwrap();
    let mut restored = crate::EcoTaskProtocol::from_store(
        protocol.config().clone(),
        std::sync::Arc::new(clock.clone()),
        store,
        next_seq,
    )
    .unwrap();

    assert_eq!(restored.task(id).unwrap(), protocol.task(id).unwrap());
    assert_eq!(restored.pool(id).unwrap(), protocol.pool(id).unwrap());
    restored.initiate_verification(id).unwrap();
    assert_eq!(restored.pending_events()[0].seq, next_seq);
    assert_all_invariants(&restored);
}

#[test]
fn test_rollback_restores_checkpoint() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = funded_task(&mut protocol);
    protocol.drain_events();
    let checkpoint = protocol.checkpoint();
    let next_seq = protocol.next_event_seq();

    protocol.register_operator(&addr("operator"), 20).unwrap();
    protocol.stake_for_task(&addr("operator"), id).unwrap();
    assert_eq!(protocol.pending_events().len(), 3);

    protocol.rollback(checkpoint);
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Funded);
    assert!(protocol.operator(&addr("operator")).is_err());
    assert!(protocol.pending_events().is_empty());

    protocol.register_operator(&addr("operator"), 20).unwrap();
    assert_eq!(protocol.pending_events()[0].seq, next_seq);
    assert_all_invariants(&protocol);
}
