#[path = "../common/mod.rs"]
mod common;

use agent_market::core::error::MarketError;
use agent_market::core::events::{EventFilter, EventPayload};
use agent_market::core::model::{PayoutStatus, Task, TaskStatus, Verification};
use common::{AGENT, Market, OWNER, TREASURER, VERIFIER, backends};

#[test]
fn created_tasks_start_open_with_assigned_ids() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("NEW");
        let draft = Task::draft(&foundup.id, "  Design the logo  ", 40, OWNER)
            .unwrap()
            .with_description("Vector artwork")
            .with_acceptance_criteria("SVG and PNG exports");
        let task = market.pipeline.create_task(draft).unwrap();

        assert!(task.id.starts_with("task_"), "backend {name}: {}", task.id);
        assert_eq!(task.title, "Design the logo");
        assert_eq!(task.status, TaskStatus::Open);
        assert!(task.assignee_id.is_none());
        assert_eq!(market.pipeline.get_task(&task.id).unwrap(), task);

        let created = store
            .list_events(&EventFilter::for_task(&task.id))
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].actor_id, OWNER);
        assert_eq!(
            created[0].payload,
            EventPayload::TaskCreated {
                title: "Design the logo".into(),
                reward_amount: 40,
            }
        );
    }
}

#[test]
fn task_drafts_are_validated() {
    assert!(matches!(
        Task::draft("fup_1", "   ", 10, OWNER),
        Err(MarketError::ValidationError(_))
    ));
    assert!(matches!(
        Task::draft("fup_1", "Write docs", 0, OWNER),
        Err(MarketError::ValidationError(_))
    ));

    let market = Market::memory();
    let foundup = market.foundup("DRAFT");
    let mut claimed = Task::draft(&foundup.id, "Sneaky", 10, OWNER).unwrap();
    claimed.status = TaskStatus::Claimed;
    assert!(matches!(
        market.pipeline.create_task(claimed),
        Err(MarketError::ValidationError(_))
    ));
}

#[test]
fn claim_needs_an_agent() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("WHO");
        let task = market.task(&foundup.id, 10);
        let err = market.pipeline.claim_task(&task.id, "  ").unwrap_err();
        assert!(matches!(err, MarketError::ValidationError(_)), "backend {name}");
        assert_eq!(
            market.pipeline.get_task(&task.id).unwrap().status,
            TaskStatus::Open
        );
    }
}

#[test]
fn submitted_proof_is_stored_with_notes() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("NOTES");
        let task = market.task(&foundup.id, 10);
        market.pipeline.claim_task(&task.id, AGENT).unwrap();

        let proof = market.proof(&task.id, AGENT).with_notes("see README");
        let submitted = market.pipeline.submit_proof(proof).unwrap();
        assert_eq!(submitted.status, TaskStatus::Submitted, "backend {name}");

        let stored = market.pipeline.get_trace(&task.id).unwrap().proof.unwrap();
        assert_eq!(Some(stored.id.clone()), submitted.proof_id);
        assert_eq!(stored.notes.as_deref(), Some("see README"));
        assert!(stored.artifact_hash.starts_with("sha256:"));
    }
}

#[test]
fn verification_must_target_the_same_task() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("MIX");
        let task = market.task(&foundup.id, 10);
        let other = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Submitted);

        let err = market
            .pipeline
            .verify_proof(&task.id, Verification::draft(&other.id, VERIFIER, true, ""))
            .unwrap_err();
        assert!(matches!(err, MarketError::ValidationError(_)), "backend {name}");
        assert_eq!(
            market.pipeline.get_task(&task.id).unwrap().status,
            TaskStatus::Submitted
        );
    }
}

#[test]
fn rejected_proof_can_still_be_approved_later() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("RETRY");
        let task = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Submitted);

        market
            .pipeline
            .verify_proof(&task.id, Verification::draft(&task.id, VERIFIER, false, "blurry"))
            .unwrap();
        let approved = market
            .pipeline
            .verify_proof(&task.id, Verification::draft(&task.id, VERIFIER, true, "fixed"))
            .unwrap();
        assert_eq!(approved.status, TaskStatus::Verified, "backend {name}");

        let verification = market
            .pipeline
            .get_trace(&task.id)
            .unwrap()
            .verification
            .unwrap();
        assert!(verification.approved);
        assert_eq!(verification.reason, "fixed");
    }
}

#[test]
fn payout_pays_the_assignee_the_reward() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("PAY");
        let task = market.task(&foundup.id, 999);
        market.advance(&task.id, TaskStatus::Verified);

        let paid = market.pipeline.trigger_payout(&task.id, TREASURER).unwrap();
        assert_eq!(paid.status, TaskStatus::Paid, "backend {name}");

        let payout = market.pipeline.get_trace(&task.id).unwrap().payout.unwrap();
        assert_eq!(Some(payout.id.clone()), paid.payout_id);
        assert_eq!(payout.amount, 999);
        assert_eq!(payout.recipient_id, AGENT);
        assert_eq!(payout.status, PayoutStatus::Completed);
        assert!(payout.reference.starts_with("settle_"));
    }
}

#[test]
fn trace_of_unknown_task_is_not_found() {
    for (name, store) in backends() {
        let market = Market::new(store);
        assert!(
            matches!(
                market.pipeline.get_trace("task_nope"),
                Err(MarketError::NotFound(_))
            ),
            "backend {name}"
        );
    }
}
