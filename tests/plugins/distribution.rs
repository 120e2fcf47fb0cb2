#[path = "../common/mod.rs"]
mod common;

use agent_market::core::error::MarketError;
use agent_market::core::events::EventFilter;
use agent_market::core::model::TaskStatus;
use agent_market::plugins::adapters::RecordingChannel;
use agent_market::plugins::distribution::{CABR_ACTOR, DistributionGate};
use common::{AGENT, Market, PUBLISHER, backends, policy};
use serde_json::json;
use std::sync::Arc;

#[test]
fn cabr_gate_blocks_missing_and_low_scores() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("CABR");
        let task = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Verified);

        let missing = market
            .gate
            .publish_verified_milestone(&task.id, PUBLISHER, "x", 0.5)
            .unwrap_err();
        assert!(matches!(missing, MarketError::CabrGate(_)), "backend {name}");

        market
            .gate
            .record_cabr_output(&foundup.id, json!({"score": 0.3}))
            .unwrap();
        let low = market
            .gate
            .publish_verified_milestone(&task.id, PUBLISHER, "x", 0.5)
            .unwrap_err();
        match low {
            MarketError::CabrGate(msg) => {
                assert!(msg.contains("0.30"), "{msg}");
                assert!(msg.contains("0.50"), "{msg}");
            }
            other => panic!("backend {name}: unexpected {other}"),
        }
        assert!(market.pipeline.get_trace(&task.id).unwrap().distributions.is_empty());

        market
            .gate
            .record_cabr_output(&foundup.id, json!({"score": 0.75, "model": "v2"}))
            .unwrap();
        let post = market
            .gate
            .publish_verified_milestone(&task.id, PUBLISHER, "x", 0.5)
            .unwrap();
        assert_eq!(post.channel, "x");
        assert_eq!(post.foundup_id, foundup.id);
    }
}

#[test]
fn non_positive_threshold_disables_the_gate() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("OPEN");
        market
            .gate
            .record_cabr_output(&foundup.id, json!({"score": 0.01}))
            .unwrap();
        for (channel, threshold) in [("x", 0.0), ("discord", -0.1)] {
            let task = market.task(&foundup.id, 10);
            market.advance(&task.id, TaskStatus::Verified);
            let post = market
                .gate
                .publish_verified_milestone(&task.id, PUBLISHER, channel, threshold)
                .unwrap();
            assert_eq!(post.channel, channel, "backend {name}");
        }

        // no score recorded at all is fine too
        let bare = market.foundup("BARE");
        let task = market.task(&bare.id, 10);
        market.advance(&task.id, TaskStatus::Verified);
        assert!(
            market
                .gate
                .publish_verified_milestone(&task.id, PUBLISHER, "x", -1.0)
                .is_ok(),
            "backend {name}"
        );
    }
}

#[test]
fn latest_cabr_score_wins() {
    for (name, store) in backends() {
        let market = Market::new(store.clone());
        let foundup = market.foundup("SCORE");
        assert_eq!(market.gate.get_latest_cabr_score(&foundup.id).unwrap(), None);

        for score in [0.9, 0.2, 0.6] {
            market
                .gate
                .record_cabr_output(&foundup.id, json!({ "score": score }))
                .unwrap();
        }
        assert_eq!(
            market.gate.get_latest_cabr_score(&foundup.id).unwrap(),
            Some(0.6),
            "backend {name}"
        );

        let recorded = store
            .list_events(&EventFilter::for_foundup(&foundup.id).of_type("cabr.recorded"))
            .unwrap();
        assert_eq!(recorded.len(), 3);
        assert!(recorded.iter().all(|e| e.actor_id == CABR_ACTOR));
    }
}

#[test]
fn cabr_payload_needs_a_numeric_score() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("BAD");
        for payload in [json!({}), json!({"score": "high"}), json!({"value": 1.0})] {
            let err = market.gate.record_cabr_output(&foundup.id, payload).unwrap_err();
            assert!(matches!(err, MarketError::ValidationError(_)), "backend {name}");
        }
        assert_eq!(market.gate.get_latest_cabr_score(&foundup.id).unwrap(), None);
    }
}

#[test]
fn publishing_is_idempotent_per_channel() {
    for (name, store) in backends() {
        let channel = Arc::new(RecordingChannel::new());
        let market = Market::new(store.clone());
        let gate = DistributionGate::new(store.clone(), policy()).with_channel(channel.clone());
        let foundup = market.foundup("IDEM");
        let task = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Verified);

        let first = gate
            .publish_verified_milestone(&task.id, PUBLISHER, "discord", 0.0)
            .unwrap();
        let second = gate
            .publish_verified_milestone(&task.id, PUBLISHER, "discord", 0.0)
            .unwrap();
        assert_eq!(first, second, "backend {name}");
        assert!(first.external_post_id.is_some());
        assert_eq!(channel.calls(), 1);

        let other = gate
            .publish_verified_milestone(&task.id, PUBLISHER, "x", 0.0)
            .unwrap();
        assert_ne!(other.id, first.id);
        assert_eq!(channel.calls(), 2);

        let published = store
            .list_events(
                &EventFilter::for_task(&task.id).of_type("milestone.verified_published"),
            )
            .unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(market.pipeline.get_trace(&task.id).unwrap().distributions.len(), 2);
    }
}

#[test]
fn paid_tasks_can_still_publish() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("PAID");
        let task = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Paid);
        let post = market
            .gate
            .publish_verified_milestone(&task.id, PUBLISHER, "x", 0.0)
            .unwrap();
        assert_eq!(post.task_id, task.id, "backend {name}");
    }
}

#[test]
fn unverified_tasks_and_bad_input_are_refused() {
    for (name, store) in backends() {
        let market = Market::new(store);
        let foundup = market.foundup("EARLY");
        let task = market.task(&foundup.id, 10);
        market.advance(&task.id, TaskStatus::Submitted);

        let early = market
            .gate
            .publish_verified_milestone(&task.id, PUBLISHER, "x", 0.0)
            .unwrap_err();
        assert!(
            matches!(early, MarketError::InvalidStateTransition(_)),
            "backend {name}"
        );

        let denied = market
            .gate
            .publish_verified_milestone(&task.id, AGENT, "x", 0.0)
            .unwrap_err();
        assert!(matches!(denied, MarketError::PermissionDenied(_)));

        for (channel, threshold) in [("  ", 0.0), ("x", f64::NAN), ("x", f64::INFINITY)] {
            let err = market
                .gate
                .publish_verified_milestone(&task.id, PUBLISHER, channel, threshold)
                .unwrap_err();
            assert!(matches!(err, MarketError::ValidationError(_)));
        }

        let missing = market
            .gate
            .publish_verified_milestone("task_missing", PUBLISHER, "x", 0.0)
            .unwrap_err();
        assert!(matches!(missing, MarketError::NotFound(_)));
    }
}
