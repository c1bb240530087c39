use crate::invariants::assert_all_invariants;
use crate::testutils::{
    add_validators, addr, setup_with_config, setup_with_init, under_review_task,
    verifying_task, DAY, START,
};
use crate::{
    ErrorKind, FinalizeReason, Outcome, ProtocolConfig, Role, StakeLockStatus, TaskStatus,
    VotingProgress,
};

#[test]
fn test_initiate_verification_assigns_round() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = under_review_task(&mut protocol);

    let round = protocol.initiate_verification(id).unwrap();
    let validators: Vec<_> = round.validators().cloned().collect();
    assert_eq!(validators, vec![addr("v1"), addr("v2"), addr("v3")]);
    assert_eq!(round.round_deadline, START + 7 * DAY);
    assert!(!round.is_finalized);
    assert_eq!(
        protocol.voting_progress(id).unwrap(),
        VotingProgress {
            received: 0,
            required: 3,
            percentage_bps: 0,
        }
    );

    let err = protocol.initiate_verification(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDone);
}

#[test]
fn test_initiate_verification_requires_review_and_roster() {
    let (_clock, mut protocol, super_admin) = setup_with_init();
    let id = under_review_task(&mut protocol);
    let err = protocol.initiate_verification(id + 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    protocol.revoke_role(&super_admin, &addr("v3")).unwrap();
    let err = protocol.initiate_verification(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(protocol.round(id).is_err());

    add_validators(&mut protocol, &super_admin, 1);
    protocol.initiate_verification(id).unwrap();
}

#[test]
fn test_selection_skips_operator_and_proposer() {
    let (_clock, mut protocol) = setup_with_config(ProtocolConfig::default());
    let super_admin = addr("super_admin");
    protocol.init(&super_admin).unwrap();
    protocol
        .grant_role(&super_admin, &addr("operator"), Role::Validator)
        .unwrap();
    protocol
        .grant_role(&super_admin, &addr("proposer"), Role::Validator)
        .unwrap();
    add_validators(&mut protocol, &super_admin, 3);
    let id = under_review_task(&mut protocol);

    let round = protocol.initiate_verification(id).unwrap();
    let validators: Vec<_> = round.validators().cloned().collect();
    assert_eq!(validators, vec![addr("v3"), addr("v4"), addr("v5")]);
}

#[test]
fn test_selection_rotates_across_rounds() {
    let (_clock, mut protocol, super_admin) = setup_with_init();
    add_validators(&mut protocol, &super_admin, 1);
    let first = under_review_task(&mut protocol);
    let second = under_review_task(&mut protocol);

    protocol.initiate_verification(first).unwrap();
    let round = protocol.initiate_verification(second).unwrap();
    let validators: Vec<_> = round.validators().cloned().collect();
    assert_eq!(validators, vec![addr("v4"), addr("v1"), addr("v2")]);
}

#[test]
fn test_two_approvals_finalize_eagerly() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = verifying_task(&mut protocol);
    let operator = addr("operator");

    let receipt = protocol.submit_vote(&addr("v1"), id, true, 85, "canopy visible").unwrap();
    assert_eq!(receipt.finalized, None);
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::UnderReview);

    let receipt = protocol.submit_vote(&addr("v2"), id, true, 90, "survey matches").unwrap();
    assert_eq!(receipt.approve_count, 2);
    assert_eq!(receipt.finalized, Some(Outcome::Approved));

    let err = protocol
        .submit_vote(&addr("v3"), id, false, 80, "too late to matter")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    let round = protocol.round(id).unwrap();
    assert!(round.is_finalized);
    assert_eq!(round.outcome, Some(Outcome::Approved));
    assert_eq!(round.reject_count, 0);

    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Verified);
    assert_eq!(protocol.stake_lock(id).unwrap().status, StakeLockStatus::Released);
    let snapshot = protocol.operator(&operator).unwrap();
    assert_eq!(snapshot.available, 20);
    assert_eq!(snapshot.locked, 0);
    assert_eq!(protocol.credited(&operator), 98);
    assert_eq!(protocol.treasury_balance(), 2);

    assert_eq!(protocol.validator_reputation(&addr("v1")), 1);
    assert_eq!(protocol.validator_reputation(&addr("v2")), 1);
    assert_eq!(protocol.validator_reputation(&addr("v3")), 0);
    assert_all_invariants(&protocol);
}

#[test]
fn test_rejection_slashes_bans_and_refunds() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = verifying_task(&mut protocol);
    let operator = addr("operator");

    protocol.submit_vote(&addr("v1"), id, false, 80, "no planting").unwrap();
    let receipt = protocol.submit_vote(&addr("v2"), id, false, 85, "photos reused").unwrap();
    assert_eq!(receipt.finalized, Some(Outcome::Rejected));
    let err = protocol.submit_vote(&addr("v3"), id, false, 90, "agree").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Rejected);
    let lock = protocol.stake_lock(id).unwrap();
    assert_eq!(lock.status, StakeLockStatus::Slashed);
    assert_eq!(lock.slashed_amount, 10);

    let snapshot = protocol.operator(&operator).unwrap();
    assert!(!snapshot.approved);
    assert!(snapshot.banned);
    assert_eq!(snapshot.available, 10);
    assert_eq!(protocol.treasury_balance(), 10);

    assert!(protocol.pool(id).unwrap().refunds_enabled);
    assert_eq!(protocol.claim_refund(&addr("alice"), id).unwrap(), 50);
    assert_eq!(protocol.claim_refund(&addr("bob"), id).unwrap(), 50);
    assert_eq!(protocol.treasury_balance(), 10);
    assert_eq!(protocol.credited(&operator), 0);
    assert_all_invariants(&protocol);
}

#[test]
fn test_finalize_after_deadline_counts_votes_cast() {
    let config = ProtocolConfig {
        required_validators: 5,
        ..ProtocolConfig::default()
    };
    let (clock, mut protocol) = setup_with_config(config);
    let super_admin = addr("super_admin");
    protocol.init(&super_admin).unwrap();
    add_validators(&mut protocol, &super_admin, 5);
    let id = verifying_task(&mut protocol);

    protocol.submit_vote(&addr("v1"), id, true, 85, "ok").unwrap();
    let receipt = protocol.submit_vote(&addr("v2"), id, true, 90, "ok").unwrap();
    assert_eq!(receipt.finalized, None);

    let err = protocol.finalize_verification(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deadline);
    assert_eq!(protocol.can_finalize(id).reason, FinalizeReason::DeadlineNotReached);

    clock.advance(7 * DAY + 1);
    let err = protocol.submit_vote(&addr("v3"), id, true, 70, "late").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deadline);
    assert!(protocol.can_finalize(id).ready);
    assert_eq!(protocol.expired_rounds(), vec![id]);

    assert_eq!(protocol.finalize_verification(id).unwrap(), Outcome::Approved);
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Verified);
    assert_eq!(protocol.credited(&addr("operator")), 98);
    assert!(protocol.expired_rounds().is_empty());

    let err = protocol.finalize_verification(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDone);
    assert_eq!(protocol.can_finalize(id).reason, FinalizeReason::AlreadyFinalized);
    assert_all_invariants(&protocol);
}

#[test]
fn test_finalize_after_eager_consensus_is_already_done() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = verifying_task(&mut protocol);
    protocol.submit_vote(&addr("v1"), id, true, 85, "ok").unwrap();
    protocol.submit_vote(&addr("v2"), id, true, 90, "ok").unwrap();

    clock.advance(7 * DAY + 1);
    let err = protocol.finalize_verification(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDone);
    assert_eq!(protocol.round(id).unwrap().outcome, Some(Outcome::Approved));
}

#[test]
fn test_split_vote_rejects_at_deadline() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = verifying_task(&mut protocol);
    protocol.submit_vote(&addr("v1"), id, true, 60, "maybe").unwrap();
    let receipt = protocol.submit_vote(&addr("v2"), id, false, 60, "maybe not").unwrap();
    assert_eq!(receipt.finalized, None);

    clock.advance(7 * DAY + 1);
    assert_eq!(protocol.finalize_verification(id).unwrap(), Outcome::Rejected);
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Rejected);
    assert_eq!(protocol.validator_reputation(&addr("v1")), 0);
    assert_eq!(protocol.validator_reputation(&addr("v2")), 1);
    assert_all_invariants(&protocol);
}

#[test]
fn test_silent_round_rejects_at_deadline() {
    let (clock, mut protocol, _) = setup_with_init();
    let id = verifying_task(&mut protocol);

    clock.advance(7 * DAY + 1);
    assert_eq!(protocol.finalize_verification(id).unwrap(), Outcome::Rejected);
    assert!(protocol.operator(&addr("operator")).unwrap().banned);
}

#[test]
fn test_submit_vote_checks() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = verifying_task(&mut protocol);
    let v1 = addr("v1");

    let err = protocol.submit_vote(&v1, id + 1, true, 50, "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = protocol.submit_vote(&addr("mallory"), id, true, 50, "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    let err = protocol.submit_vote(&v1, id, true, 101, "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    protocol.submit_vote(&v1, id, true, 100, "solid").unwrap();
    let err = protocol.submit_vote(&v1, id, false, 100, "changed my mind").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDone);

    let round = protocol.round(id).unwrap();
    assert_eq!(round.approve_count, 1);
    assert_eq!(round.reject_count, 0);
    let vote = protocol.vote(id, &v1).unwrap();
    assert!(vote.has_voted && vote.approve);
    assert_eq!(vote.confidence_score, 100);
    assert_eq!(vote.justification, "solid");
    assert_eq!(protocol.voting_progress(id).unwrap().percentage_bps, 3_333);

    let err = protocol.vote(id, &addr("mallory")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_revoked_validator_keeps_assigned_seat() {
    let (_clock, mut protocol, super_admin) = setup_with_init();
    let id = verifying_task(&mut protocol);
    protocol.revoke_role(&super_admin, &addr("v1")).unwrap();

    protocol.submit_vote(&addr("v1"), id, true, 80, "still counts").unwrap();
    assert_eq!(protocol.round(id).unwrap().approve_count, 1);
    assert!(!protocol.active_validators().contains(&addr("v1")));
}

#[test]
fn test_can_finalize_without_round() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = under_review_task(&mut protocol);
    let check = protocol.can_finalize(id);
    assert!(!check.ready);
    assert_eq!(check.reason, FinalizeReason::NoRound);
    let err = protocol.finalize_verification(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
