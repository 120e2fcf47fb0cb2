#[path = "../common/mod.rs"]
mod common;

use agent_market::core::config::TreasuryConfig;
use agent_market::core::error::MarketError;
use agent_market::core::events::{EventFilter, EventPayload};
use agent_market::core::model::ProposalStatus;
use common::{AGENT, Market, OWNER, TREASURER, TREASURER_2, backends};
use std::thread;

fn two_of_n() -> TreasuryConfig {
    TreasuryConfig {
        max_single_transfer: 10_000,
        required_approvals: 2,
    }
}

#[test]
fn single_approval_transfer_debits_balance() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("TRS");

        let state = market.treasury.deposit(&foundup.id, 1_000, "seed-round").unwrap();
        assert_eq!(state.balance, 1_000, "backend {name}");
        assert_eq!(state.total_inflows, 1_000);

        let proposal = market
            .treasury
            .propose_transfer(&foundup.id, 300, "  bounty pool  ", OWNER)
            .unwrap();
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert_eq!(proposal.reason, "bounty pool");
        assert_eq!(market.treasury.get_state(&foundup.id).unwrap().pending_outflows, 300);

        let approved = market.treasury.approve_transfer(&proposal.id, TREASURER).unwrap();
        assert_eq!(approved.status, ProposalStatus::Approved);
        assert_eq!(approved.approvals, vec![TREASURER.to_string()]);

        let (executed, state) = market.treasury.execute_transfer(&proposal.id, TREASURER).unwrap();
        assert_eq!(executed.status, ProposalStatus::Executed);
        assert!(executed.execution_ref.as_deref().unwrap().starts_with("exec_"));
        assert!(executed.executed_at.is_some());
        assert_eq!(state.balance, 700);
        assert_eq!(state.pending_outflows, 0);
        assert_eq!(state.total_outflows, 300);

        let again = market.treasury.execute_transfer(&proposal.id, TREASURER).unwrap_err();
        assert!(matches!(again, MarketError::InvalidStateTransition(_)));

        let types: Vec<String> = store
            .list_events(&EventFilter::for_foundup(&foundup.id))
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .filter(|t| t.starts_with("treasury."))
            .collect();
        assert_eq!(
            types,
            vec![
                "treasury.deposit",
                "treasury.proposal.created",
                "treasury.proposal.approved",
                "treasury.transfer.executed",
            ]
        );
    }
}

#[test]
fn insufficient_balance_leaves_state_untouched() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("POOR");
        market.treasury.deposit(&foundup.id, 100, "grant").unwrap();
        let proposal = market
            .treasury
            .propose_transfer(&foundup.id, 500, "too much", OWNER)
            .unwrap();
        market.treasury.approve_transfer(&proposal.id, TREASURER).unwrap();
        let before = market.treasury.get_state(&foundup.id).unwrap();
        let events_before = store.list_events(&EventFilter::default()).unwrap().len();

        let err = market.treasury.execute_transfer(&proposal.id, TREASURER).unwrap_err();
        assert!(matches!(err, MarketError::ValidationError(_)), "backend {name}: {err}");

        let after = market.treasury.get_state(&foundup.id).unwrap();
        assert_eq!(after.balance, before.balance);
        assert_eq!(after.pending_outflows, before.pending_outflows);
        assert_eq!(
            market.treasury.get_proposal(&proposal.id).unwrap().status,
            ProposalStatus::Approved
        );
        assert_eq!(
            store.list_events(&EventFilter::default()).unwrap().len(),
            events_before
        );
    }
}

#[test]
fn multi_approval_needs_distinct_non_proposer_approvers() {
    for (name, store) in backends() {
        let market = Market::with_treasury(store, two_of_n());
        let foundup = market.foundup("MULTI");
        market.treasury.deposit(&foundup.id, 5_000, "treasury").unwrap();
        let proposal = market
            .treasury
            .propose_transfer(&foundup.id, 1_000, "marketing", OWNER)
            .unwrap();
        assert_eq!(proposal.required_approvals, 2);

        let own = market.treasury.approve_transfer(&proposal.id, OWNER).unwrap_err();
        assert!(matches!(own, MarketError::PermissionDenied(_)), "backend {name}");

        let first = market.treasury.approve_transfer(&proposal.id, TREASURER).unwrap();
        assert_eq!(first.status, ProposalStatus::Pending);

        let duplicate = market.treasury.approve_transfer(&proposal.id, TREASURER).unwrap_err();
        assert!(matches!(duplicate, MarketError::ValidationError(_)));

        let early = market.treasury.execute_transfer(&proposal.id, TREASURER).unwrap_err();
        assert!(matches!(early, MarketError::InvalidStateTransition(_)));

        let second = market.treasury.approve_transfer(&proposal.id, TREASURER_2).unwrap();
        assert_eq!(second.status, ProposalStatus::Approved);
        assert_eq!(second.approvals.len(), 2);

        let late = market.treasury.approve_transfer(&proposal.id, OWNER).unwrap_err();
        assert!(matches!(late, MarketError::InvalidStateTransition(_)));
    }
}

#[test]
fn proposals_are_validated_up_front() {
    for (name, store) in backends() {
        let market = Market::with_treasury(store, two_of_n());
        let foundup = market.foundup("LIMIT");

        for (amount, reason) in [(0, "zero"), (10_001, "over the limit"), (10, "   ")] {
            let err = market
                .treasury
                .propose_transfer(&foundup.id, amount, reason, OWNER)
                .unwrap_err();
            assert!(matches!(err, MarketError::ValidationError(_)), "backend {name}");
        }
        assert!(market.treasury.list_proposals(&foundup.id).unwrap().is_empty());

        let missing = market
            .treasury
            .propose_transfer("fup_missing", 10, "ghost", OWNER)
            .unwrap_err();
        assert!(matches!(missing, MarketError::NotFound(_)));

        let zero = market.treasury.deposit(&foundup.id, 0, "nothing").unwrap_err();
        assert!(matches!(zero, MarketError::ValidationError(_)));
    }
}

#[test]
fn approvals_and_execution_need_the_treasury_role() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("GATE");
        market.treasury.deposit(&foundup.id, 100, "seed").unwrap();
        let proposal = market
            .treasury
            .propose_transfer(&foundup.id, 50, "ops", OWNER)
            .unwrap();

        let err = market.treasury.approve_transfer(&proposal.id, AGENT).unwrap_err();
        assert!(matches!(err, MarketError::PermissionDenied(_)), "backend {name}");
        market.treasury.approve_transfer(&proposal.id, TREASURER).unwrap();
        let err = market.treasury.execute_transfer(&proposal.id, AGENT).unwrap_err();
        assert!(matches!(err, MarketError::PermissionDenied(_)));
        assert_eq!(market.treasury.get_state(&foundup.id).unwrap().balance, 100);
    }
}

#[test]
fn concurrent_deposits_record_their_running_balance() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("RUN");

        thread::scope(|scope| {
            for i in 0..16 {
                let treasury = &market.treasury;
                let foundup_id = foundup.id.as_str();
                scope.spawn(move || {
                    for _ in 0..10 {
                        treasury
                            .deposit(foundup_id, 1, &format!("donor{i}"))
                            .expect("deposit");
                    }
                });
            }
        });
        let state = market.treasury.get_state(&foundup.id).unwrap();
        assert_eq!(state.balance, 160, "backend {name}");

        let deposits = store
            .list_events(&EventFilter::for_foundup(&foundup.id).of_type("treasury.deposit"))
            .unwrap();
        let balances: Vec<u64> = deposits
            .iter()
            .map(|e| match &e.payload {
                EventPayload::TreasuryDeposit { balance, .. } => *balance,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        let running: Vec<u64> = (1..=160).collect();
        assert_eq!(balances, running, "backend {name}");
    }
}

#[test]
fn executed_transfer_records_the_debited_balance() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("DEB");
        market.treasury.deposit(&foundup.id, 500, "grant").unwrap();
        let proposal = market
            .treasury
            .propose_transfer(&foundup.id, 120, "hosting", OWNER)
            .unwrap();
        market.treasury.approve_transfer(&proposal.id, TREASURER).unwrap();
        // lands between approval and execution
        market.treasury.deposit(&foundup.id, 30, "late gift").unwrap();
        let (_, state) = market.treasury.execute_transfer(&proposal.id, TREASURER).unwrap();
        assert_eq!(state.balance, 410, "backend {name}");

        let executed = store
            .list_events(
                &EventFilter::for_foundup(&foundup.id).of_type("treasury.transfer.executed"),
            )
            .unwrap();
        assert_eq!(executed.len(), 1);
        match &executed[0].payload {
            EventPayload::TransferExecuted { amount, balance, .. } => {
                assert_eq!((*amount, *balance), (120, 410), "backend {name}");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
