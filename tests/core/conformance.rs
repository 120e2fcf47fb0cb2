//! Behavior every `MarketStore` backend must share.

#[path = "../common/mod.rs"]
mod common;

use agent_market::core::error::MarketError;
use agent_market::core::events::EventFilter;
use agent_market::core::model::{Foundup, MetadataPatch, TaskStatus, Verification};
use agent_market::core::sqlite::SqliteStore;
use agent_market::core::store::{MarketStore, TaskFilter};
use agent_market::plugins::adapters::{ChannelReceipt, DistributionChannelAdapter};
use agent_market::plugins::distribution::DistributionGate;
use agent_market::plugins::pipeline::TaskPipeline;
use common::{AGENT, Market, OWNER, PUBLISHER, TREASURER, VERIFIER, backends, policy};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

/// Channel that takes a while to answer and can be told to fail.
#[derive(Default)]
struct SlowChannel {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl DistributionChannelAdapter for SlowChannel {
    fn publish_milestone(
        &self,
        _foundup_id: &str,
        task_id: &str,
        milestone: &JsonValue,
        _actor_id: &str,
    ) -> Result<ChannelReceipt, MarketError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        if self.failing.load(Ordering::SeqCst) {
            return Err(MarketError::StorageError("channel unavailable".into()));
        }
        Ok(ChannelReceipt {
            post_id: format!("ext_{task_id}_{n}"),
            channel: milestone["channel"].as_str().unwrap_or_default().to_string(),
            timestamp: "0Z".into(),
            status: "posted".into(),
        })
    }
}

fn event_types(store: &Arc<dyn MarketStore>, filter: &EventFilter) -> Vec<String> {
    store
        .list_events(filter)
        .expect("list events")
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[test]
fn full_scenario_links_every_record_and_orders_events() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("FUP");
        let task = market.task(&foundup.id, 250);

        market.pipeline.claim_task(&task.id, AGENT).unwrap();
        market
            .pipeline
            .submit_proof(market.proof(&task.id, AGENT))
            .unwrap();
        market
            .pipeline
            .verify_proof(&task.id, Verification::draft(&task.id, VERIFIER, true, "ok"))
            .unwrap();
        let post = market
            .gate
            .publish_verified_milestone(&task.id, PUBLISHER, "discord", 0.0)
            .unwrap();
        assert_eq!(post.dedupe_key, format!("{}:discord:verified", task.id));

        let paid = market.pipeline.trigger_payout(&task.id, TREASURER).unwrap();
        assert_eq!(paid.status, TaskStatus::Paid, "backend {name}");

        let trace = market.pipeline.get_trace(&task.id).unwrap();
        let proof = trace.proof.expect("proof linked");
        let verification = trace.verification.expect("verification linked");
        let payout = trace.payout.expect("payout linked");
        assert_eq!(proof.submitter_id, AGENT);
        assert!(verification.approved);
        assert_eq!(payout.amount, 250);
        assert_eq!(payout.recipient_id, AGENT);
        assert_eq!(trace.distributions, vec![post]);
        assert!(trace.events.len() >= 5, "backend {name}");

        let types: Vec<&str> = trace.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "task.created",
                "task.claimed",
                "proof.submitted",
                "proof.verified",
                "milestone.verified_published",
                "payout.completed",
            ],
            "backend {name}"
        );
        assert!(trace.events.iter().all(|e| e.foundup_id.as_deref() == Some(foundup.id.as_str())));
    }
}

#[test]
fn token_symbols_are_unique_ignoring_case() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        market.foundup("ALPHA");
        let clash = Foundup::draft("Other", OWNER, "alpha").unwrap();
        let err = market.registry.create_foundup(clash).unwrap_err();
        assert!(matches!(err, MarketError::ValidationError(_)), "backend {name}: {err}");
        assert_eq!(store.list_foundups().unwrap().len(), 1);
        assert_eq!(
            event_types(&store, &EventFilter::default()),
            vec!["foundup.created"]
        );
    }
}

#[test]
fn lifecycle_refuses_skips_and_repeats() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("SKIP");
        let task = market.task(&foundup.id, 10);

        let early_payout = market.pipeline.trigger_payout(&task.id, TREASURER);
        assert!(
            matches!(early_payout, Err(MarketError::InvalidStateTransition(_))),
            "backend {name}"
        );
        let early_verify = market.pipeline.verify_proof(
            &task.id,
            Verification::draft(&task.id, VERIFIER, true, ""),
        );
        assert!(matches!(
            early_verify,
            Err(MarketError::InvalidStateTransition(_))
        ));

        market.pipeline.claim_task(&task.id, AGENT).unwrap();
        let again = market.pipeline.claim_task(&task.id, "agent2");
        assert!(matches!(again, Err(MarketError::InvalidStateTransition(_))));
        assert_eq!(
            market.pipeline.get_task(&task.id).unwrap().assignee_id.as_deref(),
            Some(AGENT)
        );
    }
}

#[test]
fn unknown_ids_are_not_found() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        assert!(
            matches!(
                market.pipeline.claim_task("task_missing", AGENT),
                Err(MarketError::NotFound(_))
            ),
            "backend {name}"
        );
        assert!(matches!(
            store.get_foundup("fup_missing"),
            Err(MarketError::NotFound(_))
        ));
        let orphan = agent_market::core::model::Task::draft("fup_missing", "x", 5, OWNER).unwrap();
        assert!(matches!(
            market.pipeline.create_task(orphan),
            Err(MarketError::NotFound(_))
        ));
    }
}

#[test]
fn only_the_assignee_submits_proof() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("PROOF");
        let task = market.task(&foundup.id, 10);
        market.pipeline.claim_task(&task.id, AGENT).unwrap();

        let err = market
            .pipeline
            .submit_proof(market.proof(&task.id, "intruder"))
            .unwrap_err();
        assert!(matches!(err, MarketError::PermissionDenied(_)), "backend {name}");

        let after = market.pipeline.get_task(&task.id).unwrap();
        assert_eq!(after.status, TaskStatus::Claimed);
        assert!(after.proof_id.is_none());
        assert!(
            !event_types(&store, &EventFilter::for_task(&task.id))
                .contains(&"proof.submitted".to_string())
        );
    }
}

#[test]
fn roles_gate_verification_and_payout() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("ROLE");
        let task = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Submitted);

        for actor in [AGENT, TREASURER, "nobody"] {
            let err = market
                .pipeline
                .verify_proof(&task.id, Verification::draft(&task.id, actor, true, ""))
                .unwrap_err();
            assert!(matches!(err, MarketError::PermissionDenied(_)), "backend {name}");
        }
        market.advance(&task.id, TaskStatus::Verified);
        for actor in [AGENT, VERIFIER, "nobody"] {
            let err = market.pipeline.trigger_payout(&task.id, actor).unwrap_err();
            assert!(matches!(err, MarketError::PermissionDenied(_)));
        }
        assert_eq!(
            market.pipeline.get_task(&task.id).unwrap().status,
            TaskStatus::Verified
        );
    }
}

#[test]
fn payout_happens_at_most_once() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("ONCE");
        let task = market.task(&foundup.id, 42);
        market.advance(&task.id, TaskStatus::Paid);

        let err = market.pipeline.trigger_payout(&task.id, TREASURER).unwrap_err();
        assert!(matches!(err, MarketError::InvalidStateTransition(_)), "backend {name}");
        let payouts = store
            .list_events(&EventFilter::for_task(&task.id).of_type("payout.completed"))
            .unwrap();
        assert_eq!(payouts.len(), 1);
    }
}

#[test]
fn rejection_is_audited_and_keeps_task_submitted() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("REJ");
        let task = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Submitted);

        let after = market
            .pipeline
            .verify_proof(
                &task.id,
                Verification::draft(&task.id, VERIFIER, false, "missing tests"),
            )
            .unwrap();
        assert_eq!(after.status, TaskStatus::Submitted, "backend {name}");
        assert!(after.verification_id.is_none());

        let rejected = store
            .list_events(&EventFilter::for_task(&task.id).of_type("proof.rejected"))
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].actor_id, VERIFIER);
        assert_eq!(rejected[0].proof_id, after.proof_id);
    }
}

#[test]
fn immutable_metadata_is_write_once() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let draft = Foundup::draft("Meta", OWNER, "META")
            .unwrap()
            .with_immutable("charter", json!("v1"))
            .with_mutable("tagline", json!("first"));
        let foundup = market.registry.create_foundup(draft).unwrap();

        let updated = market
            .registry
            .update_metadata(
                &foundup.id,
                &MetadataPatch::mutable("tagline", json!("second")),
                OWNER,
            )
            .unwrap();
        assert_eq!(updated.mutable_metadata["tagline"], json!("second"));

        let err = market
            .registry
            .update_metadata(
                &foundup.id,
                &MetadataPatch::mutable("charter", json!("v2")),
                OWNER,
            )
            .unwrap_err();
        assert!(matches!(err, MarketError::ImmutableField(_)), "backend {name}");

        let stored = store.get_foundup(&foundup.id).unwrap();
        assert_eq!(stored.immutable_metadata["charter"], json!("v1"));
        assert_eq!(stored.mutable_metadata["tagline"], json!("second"));
        assert_eq!(
            event_types(&store, &EventFilter::for_foundup(&foundup.id)),
            vec!["foundup.created", "foundup.metadata_updated"]
        );
    }
}

#[test]
fn task_listing_filters_conjunctively() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let a = market.foundup("LSTA");
        let b = market.foundup("LSTB");
        let t1 = market.task(&a.id, 5);
        market.task(&a.id, 6);
        market.task(&b.id, 7);
        market.pipeline.claim_task(&t1.id, AGENT).unwrap();

        let in_a = market
            .pipeline
            .list_tasks(&TaskFilter {
                foundup_id: Some(a.id.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(in_a.len(), 2, "backend {name}");

        let claimed = market
            .pipeline
            .list_tasks(&TaskFilter {
                foundup_id: Some(a.id.clone()),
                status: Some(TaskStatus::Claimed),
                assignee_id: Some(AGENT.into()),
            })
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, t1.id);
    }
}

#[test]
fn event_queries_filter_and_limit_in_append_order() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("EVT");
        let first = market.task(&foundup.id, 1);
        market.task(&foundup.id, 2);
        market.pipeline.claim_task(&first.id, AGENT).unwrap();

        let created = store
            .list_events(&EventFilter::for_foundup(&foundup.id).of_type("task.created"))
            .unwrap();
        assert_eq!(created.len(), 2, "backend {name}");
        assert_eq!(created[0].task_id.as_deref(), Some(first.id.as_str()));

        let limited = store
            .list_events(&EventFilter {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            limited.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
            vec!["foundup.created", "task.created"]
        );
    }
}

#[test]
fn concurrent_claims_have_one_winner() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("RACE");
        let task = market.task(&foundup.id, 10);
        let pipeline = market.pipeline.clone();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pipeline = pipeline.clone();
                let task_id = task.id.clone();
                thread::spawn(move || pipeline.claim_task(&task_id, &format!("agent{i}")))
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("claim thread"))
            .collect();

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "backend {name}");
        assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
            r,
            Err(MarketError::InvalidStateTransition(_))
        )));
        let claims = store
            .list_events(&EventFilter::for_task(&task.id).of_type("task.claimed"))
            .unwrap();
        assert_eq!(claims.len(), 1);
    }
}

#[test]
fn claims_through_separate_connections_have_one_winner() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("race.db");
    let seed = Market::new(Arc::new(SqliteStore::open(&path).expect("open seed store")));
    let foundup = seed.foundup("CONN");
    let task = seed.task(&foundup.id, 10);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let path = path.clone();
            let task_id = task.id.clone();
            thread::spawn(move || {
                let store: Arc<dyn MarketStore> =
                    Arc::new(SqliteStore::open(&path).expect("open racing store"));
                TaskPipeline::new(store, policy()).claim_task(&task_id, &format!("agent{i}"))
            })
        })
        .collect();
    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("claim thread"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for r in results.iter().filter(|r| r.is_err()) {
        assert!(
            matches!(r, Err(MarketError::InvalidStateTransition(_))),
            "unexpected error: {r:?}"
        );
    }
    let reopened = SqliteStore::open(&path).expect("reopen");
    assert_eq!(reopened.get_task(&task.id).unwrap().status, TaskStatus::Claimed);
}

#[test]
fn failed_operations_leave_no_events() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("ATOM");
        let task = market.task(&foundup.id, 10);
        let before = store.list_events(&EventFilter::default()).unwrap().len();

        let _ = market.pipeline.trigger_payout(&task.id, TREASURER);
        let _ = market.pipeline.claim_task("task_missing", AGENT);
        let _ = market
            .pipeline
            .verify_proof(&task.id, Verification::draft(&task.id, "nobody", true, ""));

        let after = store.list_events(&EventFilter::default()).unwrap().len();
        assert_eq!(before, after, "backend {name}");
    }
}

#[test]
fn concurrent_publishes_reach_the_channel_once() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("PUB");
        let task = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Verified);

        let channel = Arc::new(SlowChannel::default());
        let gate = Arc::new(
            DistributionGate::new(store.clone(), policy()).with_channel(channel.clone()),
        );
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let gate = gate.clone();
                let task_id = task.id.clone();
                thread::spawn(move || gate.publish_verified_milestone(&task_id, PUBLISHER, "x", 0.0))
            })
            .collect();
        let posts: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("publish thread").expect("publish"))
            .collect();

        assert_eq!(channel.calls.load(Ordering::SeqCst), 1, "backend {name}");
        assert_eq!(posts[0].id, posts[1].id, "backend {name}");
        let published = event_types(
            &store,
            &EventFilter::for_task(&task.id).of_type("milestone.verified_published"),
        );
        assert_eq!(published.len(), 1, "backend {name}");
        let stored = store.find_distribution(&task.id, "x").unwrap().unwrap();
        assert!(stored.external_post_id.is_some(), "backend {name}");
    }
}

#[test]
fn failed_channel_publish_releases_the_slot() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("RETRY");
        let task = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Verified);

        let channel = Arc::new(SlowChannel::default());
        channel.failing.store(true, Ordering::SeqCst);
        let gate = DistributionGate::new(store.clone(), policy()).with_channel(channel.clone());
        let err = gate
            .publish_verified_milestone(&task.id, PUBLISHER, "x", 0.0)
            .unwrap_err();
        assert!(matches!(err, MarketError::StorageError(_)), "backend {name}");
        assert!(store.find_distribution(&task.id, "x").unwrap().is_none());
        let published =
            EventFilter::for_task(&task.id).of_type("milestone.verified_published");
        assert!(event_types(&store, &published).is_empty());

        channel.failing.store(false, Ordering::SeqCst);
        let post = gate
            .publish_verified_milestone(&task.id, PUBLISHER, "x", 0.0)
            .unwrap();
        let expected = format!("ext_{}_1", task.id);
        assert_eq!(post.external_post_id.as_deref(), Some(expected.as_str()));
        assert_eq!(channel.calls.load(Ordering::SeqCst), 2, "backend {name}");
    }
}
