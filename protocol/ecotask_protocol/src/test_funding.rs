use crate::invariants::{assert_all_invariants, assert_shares_sum_to_total};
use crate::testutils::{
    addr, create_task, funded_task, setup_with_init, task_params, under_review_task, DAY,
};
use crate::{ErrorKind, FundingProgress, TaskStatus, TransferReason, MAX_AMOUNT};

#[test]
fn test_two_funders_fill_the_pool() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = create_task(&mut protocol);

    let first = protocol.fund_task(&addr("alice"), id, 50).unwrap();
    assert_eq!(first.total_funded, 50);
    assert!(!first.target_reached);
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Proposed);

    let second = protocol.fund_task(&addr("bob"), id, 50).unwrap();
    assert_eq!(second.total_funded, 100);
    assert!(second.target_reached);
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Funded);

    let pool = protocol.pool(id).unwrap();
    assert_eq!(pool.total_funded, 100);
    assert_eq!(pool.funders_count, 2);
    assert_eq!(
        protocol.funding_progress(id).unwrap(),
        FundingProgress {
            funded: 100,
            target: 100,
            percentage_bps: 10_000,
        }
    );
    assert_all_invariants(&protocol);
}

#[test]
fn test_repeat_contributions_accumulate() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = create_task(&mut protocol);
    let alice = addr("alice");

    protocol.fund_task(&alice, id, 10).unwrap();
    protocol.fund_task(&alice, id, 20).unwrap();
    protocol.fund_task(&addr("bob"), id, 45).unwrap();

    assert_eq!(protocol.share_of(id, &alice).unwrap(), 30);
    assert_eq!(protocol.pool(id).unwrap().funders_count, 2);
    assert_eq!(protocol.share_percentage_bps(id, &alice).unwrap(), 4_000);
    assert_eq!(protocol.funding_progress(id).unwrap().percentage_bps, 7_500);
    assert_eq!(
        protocol.funders(id).unwrap(),
        vec![(alice, 30), (addr("bob"), 45)]
    );
    assert_shares_sum_to_total(protocol.pool(id).unwrap());
}

#[test]
fn test_fund_task_rejections() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = create_task(&mut protocol);
    let alice = addr("alice");

    let err = protocol.fund_task(&alice, id, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = protocol.fund_task(&alice, id, -10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = protocol.fund_task(&alice, 42, 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    protocol.fund_task(&alice, id, 60).unwrap();
    let err = protocol.fund_task(&addr("bob"), id, 41).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(protocol.pool(id).unwrap().total_funded, 60);
    assert_eq!(protocol.share_of(id, &addr("bob")).unwrap(), 0);

    protocol.fund_task(&addr("bob"), id, 40).unwrap();
    let err = protocol.fund_task(&addr("carol"), id, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_all_invariants(&protocol);
}

#[test]
fn test_withdraw_funding_applies_penalty() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = create_task(&mut protocol);
    let alice = addr("alice");
    protocol.fund_task(&alice, id, 40).unwrap();

    let receipt = protocol.withdraw_funding(&alice, id).unwrap();
    assert_eq!(receipt.share, 40);
    assert_eq!(receipt.penalty, 2);
    assert_eq!(receipt.refunded, 38);

    let pool = protocol.pool(id).unwrap();
    assert_eq!(pool.total_funded, 0);
    assert_eq!(pool.funders_count, 0);
    assert_eq!(protocol.treasury_balance(), 2);
    assert_eq!(protocol.credited(&alice), 38);

    let reasons: Vec<_> = protocol
        .pending_events()
        .iter()
        .flat_map(|e| e.transfers())
        .filter(|t| t.task_id == Some(id))
        .map(|t| (t.reason, t.amount))
        .collect();
    assert_eq!(
        reasons,
        vec![
            (TransferReason::WithdrawalPenalty, 2),
            (TransferReason::WithdrawalRefund, 38),
        ]
    );

    let err = protocol.withdraw_funding(&alice, id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_all_invariants(&protocol);
}

#[test]
fn test_withdraw_after_funding_fails() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = funded_task(&mut protocol);

    let err = protocol.withdraw_funding(&addr("alice"), id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(protocol.share_of(id, &addr("alice")).unwrap(), 50);
}

#[test]
fn test_claim_refund_requires_refunds_enabled() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = funded_task(&mut protocol);

    let err = protocol.claim_refund(&addr("alice"), id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    let err = protocol.enable_refunds(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
}

#[test]
fn test_refunds_pay_back_everything_once() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = under_review_task(&mut protocol);
    protocol.initiate_verification(id).unwrap();
    protocol.submit_vote(&addr("v1"), id, false, 70, "no canopy").unwrap();
    protocol.submit_vote(&addr("v2"), id, false, 75, "wrong site").unwrap();
    assert_eq!(protocol.task(id).unwrap().status, TaskStatus::Rejected);

    let alice = addr("alice");
    assert_eq!(protocol.claim_refund(&alice, id).unwrap(), 50);
    let err = protocol.claim_refund(&alice, id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDone);
    let err = protocol.claim_refund(&addr("carol"), id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(protocol.claim_refund(&addr("bob"), id).unwrap(), 50);

    let pool = protocol.pool(id).unwrap();
    assert_eq!(pool.total_refunded, 100);
    assert_eq!(pool.total_funded, 0);
    assert_eq!(protocol.credited(&alice), 50);
    assert_eq!(protocol.credited(&addr("bob")), 50);

    let err = protocol.enable_refunds(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDone);
    assert_all_invariants(&protocol);
}

#[test]
fn test_release_payment_only_once() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = create_task(&mut protocol);
    let err = protocol.release_payment(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    let id = under_review_task(&mut protocol);
    protocol.initiate_verification(id).unwrap();
    protocol.submit_vote(&addr("v1"), id, true, 90, "ok").unwrap();
    protocol.submit_vote(&addr("v2"), id, true, 90, "ok").unwrap();
    assert!(protocol.pool(id).unwrap().payment_released);

    let err = protocol.release_payment(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyDone);
    assert_eq!(protocol.credited(&addr("operator")), 98);
}

#[test]
fn test_credit_allocation_splits_outcome_by_share() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = under_review_task(&mut protocol);

    let err = protocol.credit_allocation(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    protocol.initiate_verification(id).unwrap();
    protocol.submit_vote(&addr("v1"), id, true, 90, "ok").unwrap();
    protocol.submit_vote(&addr("v2"), id, true, 90, "ok").unwrap();

    let credits: Vec<_> = protocol
        .credit_allocation(id)
        .unwrap()
        .into_iter()
        .map(|a| (a.funder, a.credits))
        .collect();
    assert_eq!(credits, vec![(addr("alice"), 60), (addr("bob"), 60)]);
}

#[test]
fn test_credit_allocation_remainder_goes_to_largest_share() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = create_task(&mut protocol);
    protocol.fund_task(&addr("alice"), id, 33).unwrap();
    protocol.fund_task(&addr("bob"), id, 67).unwrap();

    let allocation = protocol.store.funding.credit_allocation(id, 10).unwrap();
    let credits: Vec<_> = allocation.iter().map(|a| a.credits).collect();
    assert_eq!(credits, vec![3, 7]);
    assert_eq!(credits.iter().sum::<i128>(), 10);
}

#[test]
fn test_large_pools_report_progress_without_overflow() {
    let (_clock, mut protocol, _) = setup_with_init();
    let proposer = addr("proposer");
    let deadline = protocol.now() + 30 * DAY;

    let err = protocol
        .create_task(&proposer, task_params(MAX_AMOUNT + 1, deadline))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(protocol.task_count(), 0);

    let id = protocol
        .create_task(&proposer, task_params(MAX_AMOUNT, deadline))
        .unwrap()
        .id;
    protocol.fund_task(&addr("alice"), id, MAX_AMOUNT / 2).unwrap();
    assert_eq!(protocol.funding_progress(id).unwrap().percentage_bps, 5_000);
    assert_eq!(
        protocol.share_percentage_bps(id, &addr("alice")).unwrap(),
        10_000
    );

    protocol
        .fund_task(&addr("bob"), id, MAX_AMOUNT - MAX_AMOUNT / 2)
        .unwrap();
    assert_eq!(protocol.funding_progress(id).unwrap().percentage_bps, 10_000);
    assert_eq!(protocol.required_stake(id).unwrap(), MAX_AMOUNT / 10);
    assert_all_invariants(&protocol);
}

#[test]
fn test_credit_allocation_handles_huge_outcomes() {
    let (_clock, mut protocol, _) = setup_with_init();
    let id = funded_task(&mut protocol);
    let operator = addr("operator");
    protocol.register_operator(&operator, 20).unwrap();
    protocol.stake_for_task(&operator, id).unwrap();
    protocol
        .submit_proof(&operator, id, "ipfs://proof-bundle", i128::MAX)
        .unwrap();
    protocol.initiate_verification(id).unwrap();
    protocol.submit_vote(&addr("v1"), id, true, 90, "ok").unwrap();
    protocol.submit_vote(&addr("v2"), id, true, 90, "ok").unwrap();

    let credits: Vec<_> = protocol
        .credit_allocation(id)
        .unwrap()
        .into_iter()
        .map(|a| a.credits)
        .collect();
    assert_eq!(credits[0], credits[1] + 1);
    assert_eq!(credits[0].checked_add(credits[1]), Some(i128::MAX));
}
