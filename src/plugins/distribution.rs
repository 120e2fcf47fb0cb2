//! Publication of verified milestones, gated on the foundup's CABR score.
//!
//! A milestone is published at most once per `(task_id, channel)`. The slot
//! is claimed in the store before the channel adapter runs, so only the
//! claiming call reaches the adapter; repeat and concurrent calls return the
//! stored post without touching the adapter or the event log. A post seen
//! mid-publication has no `external_post_id` yet.

use crate::core::error::MarketError;
use crate::core::events::{EventPayload, EventRecord};
use crate::core::model::{CabrScore, DistributionPost, IdKind, TaskStatus};
use crate::core::store::{DistributionClaim, MarketStore};
use crate::core::time;
use crate::plugins::adapters::DistributionChannelAdapter;
use crate::plugins::policy::{AuthorizationPolicy, Role};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

/// Actor id recorded on `cabr.recorded` events.
pub const CABR_ACTOR: &str = "cabr";

pub struct DistributionGate {
    store: Arc<dyn MarketStore>,
    policy: AuthorizationPolicy,
    channel: Option<Arc<dyn DistributionChannelAdapter>>,
}

impl DistributionGate {
    pub fn new(store: Arc<dyn MarketStore>, policy: AuthorizationPolicy) -> Self {
        DistributionGate {
            store,
            policy,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn DistributionChannelAdapter>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Returns the score that passed the gate, `None` when the gate is off.
    fn check_cabr(&self, foundup_id: &str, threshold: f64) -> Result<Option<f64>, MarketError> {
        if threshold <= 0.0 {
            return Ok(None);
        }
        let score = self
            .store
            .latest_cabr_score(foundup_id)?
            .map(|s| s.score)
            .ok_or_else(|| {
                MarketError::CabrGate(format!("CABR score missing for foundup {}", foundup_id))
            })?;
        if score < threshold {
            return Err(MarketError::CabrGate(format!(
                "CABR score {:.2} below threshold {:.2} for foundup {}",
                score, threshold, foundup_id
            )));
        }
        Ok(Some(score))
    }

    pub fn publish_verified_milestone(
        &self,
        task_id: &str,
        actor_id: &str,
        channel: &str,
        cabr_threshold: f64,
    ) -> Result<DistributionPost, MarketError> {
        self.policy.require(actor_id, Role::Distribution)?;
        if channel.trim().is_empty() {
            return Err(MarketError::ValidationError("channel must not be empty".into()));
        }
        if !cabr_threshold.is_finite() {
            return Err(MarketError::ValidationError(format!(
                "CABR threshold {} must be a finite number",
                cabr_threshold
            )));
        }

        let task = self.store.get_task(task_id)?;
        if !matches!(task.status, TaskStatus::Verified | TaskStatus::Paid) {
            return Err(MarketError::InvalidStateTransition(format!(
                "task {} is {}, milestones need a verified task",
                task.id, task.status
            )));
        }

        let cabr_score = self.check_cabr(&task.foundup_id, cabr_threshold).inspect_err(|e| {
            tracing::warn!(task_id, channel, error = %e, "milestone blocked by CABR gate");
        })?;

        if let Some(existing) = self.store.find_distribution(task_id, channel)? {
            tracing::debug!(task_id, channel, post_id = %existing.id, "milestone already published");
            return Ok(existing);
        }

        let foundup = self.store.get_foundup(&task.foundup_id)?;
        let milestone = json!({
            "channel": channel,
            "task_id": task.id,
            "title": task.title,
            "reward_amount": task.reward_amount,
            "status": task.status,
            "foundup": {
                "id": foundup.id,
                "name": foundup.name,
                "token_symbol": foundup.token_symbol,
            },
        });
        let ts = time::now_epoch_z();
        let dedupe_key = DistributionPost::dedupe_key_for(task_id, channel);
        let post = DistributionPost {
            id: self.store.next_id(IdKind::Distribution),
            foundup_id: foundup.id.clone(),
            task_id: task_id.to_string(),
            channel: channel.to_string(),
            content: milestone.to_string(),
            actor_id: actor_id.to_string(),
            dedupe_key: dedupe_key.clone(),
            external_post_id: None,
            created_at: ts.clone(),
        };
        let claimed = match self.store.claim_distribution(&post)? {
            DistributionClaim::Claimed(post) => post,
            DistributionClaim::Existing(existing) => {
                tracing::debug!(task_id, channel, post_id = %existing.id, "lost publish race, returning winner");
                return Ok(existing);
            }
        };

        let external_post_id = match &self.channel {
            Some(adapter) => {
                match adapter.publish_milestone(&foundup.id, task_id, &milestone, actor_id) {
                    Ok(receipt) => Some(receipt.post_id),
                    Err(e) => {
                        tracing::warn!(task_id, channel, error = %e, "channel publish failed, releasing claim");
                        self.store.release_distribution(&claimed.id)?;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let event = EventRecord::new(
            self.store.next_id(IdKind::Event),
            actor_id,
            EventPayload::MilestonePublished {
                channel: channel.to_string(),
                dedupe_key,
                cabr_threshold,
                cabr_score,
                external_post_id: external_post_id.clone(),
            },
            &ts,
        )
        .for_foundup(&foundup.id)
        .for_task(task_id);

        let stored =
            self.store
                .complete_distribution(&claimed.id, external_post_id.as_deref(), &event)?;
        tracing::info!(task_id, channel, post_id = %stored.id, "milestone published");
        Ok(stored)
    }

    /// Stores a CABR evaluation. `payload.score` must be a finite number.
    pub fn record_cabr_output(
        &self,
        foundup_id: &str,
        payload: JsonValue,
    ) -> Result<CabrScore, MarketError> {
        let score = payload
            .get("score")
            .and_then(JsonValue::as_f64)
            .filter(|s| s.is_finite())
            .ok_or_else(|| {
                MarketError::ValidationError("CABR payload needs a numeric 'score'".into())
            })?;
        let ts = time::now_epoch_z();
        let record = CabrScore {
            id: self.store.next_id(IdKind::CabrScore),
            foundup_id: foundup_id.to_string(),
            score,
            payload,
            recorded_at: ts.clone(),
        };
        let event = EventRecord::new(
            self.store.next_id(IdKind::Event),
            CABR_ACTOR,
            EventPayload::CabrRecorded { score },
            &ts,
        )
        .for_foundup(foundup_id);
        let stored = self.store.record_cabr_score(&record, &event)?;
        tracing::info!(foundup_id, score, "CABR score recorded");
        Ok(stored)
    }

    pub fn get_latest_cabr_score(&self, foundup_id: &str) -> Result<Option<f64>, MarketError> {
        Ok(self.store.latest_cabr_score(foundup_id)?.map(|s| s.score))
    }
}
