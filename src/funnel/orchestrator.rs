//! Coordinates step evaluation, delay scheduling, delivery, and record
//! commits for each inbound event.
//!
//! Every inbound event runs in its own task. All mutation of one user's
//! record goes through the send guard plus conditional single-statement
//! commits, so concurrent events for the same user cannot double-dispatch
//! a step. After every commit the record is re-read, keeping later step
//! evaluations on the stored state.

use crate::InboundEvent;
use crate::config::FunnelConfig;
use crate::error::{DeliveryError, Result};
use crate::funnel::evaluator::{self, FunnelStep, StepAction, StepRule};
use crate::funnel::policy::{ContentPolicy, TriggerDetector};
use crate::funnel::schedule;
use crate::funnel::store::{FunnelUser, UserStore};
use crate::gateway::DeliveryGateway;
use anyhow::Context as _;
use chrono::Utc;

/// Drives the funnel for inbound events.
pub struct Orchestrator<G> {
    store: UserStore,
    gateway: G,
    config: FunnelConfig,
    policy: ContentPolicy,
    detector: TriggerDetector,
    rules: Vec<StepRule>,
    greeting: String,
}

impl<G: DeliveryGateway> Orchestrator<G> {
    pub fn new(store: UserStore, gateway: G, config: FunnelConfig, greeting: String) -> Self {
        let policy = ContentPolicy::new(&config.disqualifying_keywords);
        let detector = TriggerDetector::new(&config.trigger_phrase);

        Self {
            store,
            gateway,
            policy,
            detector,
            rules: evaluator::default_rules(),
            config,
            greeting,
        }
    }

    /// Replace the step eligibility table.
    pub fn with_rules(mut self, rules: Vec<StepRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Per-event error boundary. A failure rolls back the rest of this
    /// event's step evaluations and is logged, never silently dropped.
    pub async fn process_event(&self, event: InboundEvent) {
        if let Err(error) = self.handle_event(&event).await {
            tracing::error!(user_id = %event.user_id, %error, "inbound event handling rolled back");
        }
    }

    async fn handle_event(&self, event: &InboundEvent) -> Result<()> {
        if event.is_command_start {
            self.handle_start(event).await
        } else {
            self.handle_private_message(event).await
        }
    }

    /// `/start` creates the record if needed and replies with the greeting.
    /// Funnel evaluation only runs for regular private messages.
    async fn handle_start(&self, event: &InboundEvent) -> Result<()> {
        if self.store.get(&event.user_id).await?.is_none() {
            self.store.create_if_absent(&event.user_id).await?;
            tracing::info!(user_id = %event.user_id, "funnel record created");
        }

        self.gateway.send(&event.user_id, &self.greeting).await?;
        Ok(())
    }

    async fn handle_private_message(&self, event: &InboundEvent) -> Result<()> {
        let mut user = match self.store.get(&event.user_id).await? {
            Some(user) => user,
            None => {
                // A private message can arrive before /start was ever seen
                // (e.g. the record store post-dates the chat). Create the
                // record rather than faulting.
                tracing::warn!(user_id = %event.user_id, "no record for private message, creating");
                self.store.create_if_absent(&event.user_id).await?
            }
        };

        // Walk the step table in order. One event carries the user through
        // every step whose wait has elapsed by the time it is evaluated.
        for rule in &self.rules {
            match rule.step {
                FunnelStep::First => {
                    // The step-1 delay anchor is the user's first inbound
                    // message; stamp it when the user first becomes
                    // eligible for step 1.
                    if user.first_message_at.is_none() && (rule.eligible)(&user) {
                        self.store.stamp_first_message(&user.id, Utc::now()).await?;
                        user = self.must_refresh(&user.id).await?;
                    }
                }
                FunnelStep::Second => {
                    user = self.detect_trigger(user).await?;
                }
                FunnelStep::Third => {}
            }

            let step_text = self.config.step_text(rule.step);
            let Some(action) = evaluator::plan(rule, &user, &self.policy, step_text) else {
                continue;
            };

            match action {
                StepAction::Finish => {
                    if self.store.mark_finished(&user.id, Utc::now()).await? {
                        tracing::info!(
                            user_id = %user.id,
                            step = %rule.step,
                            "funnel finished by content policy"
                        );
                    }
                    user = self.must_refresh(&user.id).await?;
                }
                StepAction::Dispatch => {
                    user = self.dispatch_step(user, rule.step).await?;
                }
            }
        }

        Ok(())
    }

    /// The stop phrase is screened against the reply content that would go
    /// out next (the step-2 text), not against the inbound message, and
    /// detection runs between the step-1 and step-2 evaluations. The flag
    /// transitions once; re-detection never re-stamps.
    async fn detect_trigger(&self, user: FunnelUser) -> Result<FunnelUser> {
        if !self.detector.fires(self.config.step_text(FunnelStep::Second)) {
            return Ok(user);
        }

        if self.store.fire_trigger(&user.id, Utc::now()).await? {
            tracing::info!(user_id = %user.id, "stop trigger fired");
        }

        self.must_refresh(&user.id).await
    }

    async fn dispatch_step(&self, user: FunnelUser, step: FunnelStep) -> Result<FunnelUser> {
        // Claim the per-user send guard; losing the race means another
        // event's task is already mid-send for this user.
        if !self.store.try_begin_send(&user.id).await? {
            tracing::debug!(user_id = %user.id, step = %step, "send already in progress, skipping");
            return self.must_refresh(&user.id).await;
        }

        match self.run_claimed_send(&user, step).await {
            Ok(()) => self.must_refresh(&user.id).await,
            Err(error) => {
                // The guard was committed by try_begin_send; an aborted
                // attempt must not leave it stuck.
                if let Err(release_error) = self.store.release_send_guard(&user.id).await {
                    tracing::error!(
                        user_id = %user.id,
                        error = %release_error,
                        "failed to release send guard after aborted send"
                    );
                }
                Err(error)
            }
        }
    }

    async fn run_claimed_send(&self, user: &FunnelUser, step: FunnelStep) -> Result<()> {
        let wait = match schedule::step_anchor(user, step) {
            Some(anchor) => {
                schedule::remaining_wait(Utc::now(), anchor, self.config.step_interval(step))
            }
            None => {
                tracing::warn!(user_id = %user.id, step = %step, "missing delay anchor, sending immediately");
                std::time::Duration::ZERO
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        match self.gateway.send(&user.id, self.config.step_text(step)).await {
            Ok(()) => {
                if self
                    .store
                    .record_step_sent(&user.id, step.number(), Utc::now())
                    .await?
                {
                    tracing::info!(user_id = %user.id, step = %step, "step message sent");
                } else {
                    // The record left `alive` while the send was in flight;
                    // the counter stays put but the guard must not.
                    self.store.release_send_guard(&user.id).await?;
                    tracing::warn!(
                        user_id = %user.id,
                        step = %step,
                        "step sent but user is no longer alive"
                    );
                }
            }
            Err(DeliveryError::Permanent { reason }) => {
                if !self.store.mark_dead(&user.id, Utc::now()).await? {
                    self.store.release_send_guard(&user.id).await?;
                }
                tracing::info!(user_id = %user.id, %reason, "recipient unreachable, user marked dead");
            }
            Err(error) => return Err(error.into()),
        }

        Ok(())
    }

    /// Records are never deleted, so a row that vanishes mid-event is a
    /// fault worth surfacing.
    async fn must_refresh(&self, user_id: &str) -> Result<FunnelUser> {
        self.store
            .get(user_id)
            .await?
            .context("user record vanished mid-event")
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::store::UserStatus;
    use chrono::TimeZone as _;
    use parking_lot::Mutex;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct MockGateway {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        failures: Arc<Mutex<VecDeque<DeliveryError>>>,
    }

    impl MockGateway {
        fn sent_texts(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(_, text)| text.clone()).collect()
        }

        fn push_failure(&self, error: DeliveryError) {
            self.failures.lock().push_back(error);
        }
    }

    impl DeliveryGateway for MockGateway {
        async fn send(&self, user_id: &str, text: &str) -> std::result::Result<(), DeliveryError> {
            self.sent.lock().push((user_id.to_string(), text.to_string()));
            match self.failures.lock().pop_front() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    fn test_config() -> FunnelConfig {
        FunnelConfig {
            step_texts: [
                "first outreach".to_string(),
                "second outreach".to_string(),
                "third outreach".to_string(),
            ],
            step_intervals_secs: [1, 1, 1],
            trigger_phrase: "unsubscribe".to_string(),
            disqualifying_keywords: ["resolved".to_string(), "closed".to_string()],
            stale_send_timeout_secs: 3600,
        }
    }

    async fn setup_with(
        config: FunnelConfig,
    ) -> (Orchestrator<MockGateway>, MockGateway, UserStore) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");
        crate::db::ensure_schema(&pool)
            .await
            .expect("users schema should be created");

        let store = UserStore::new(pool);
        let gateway = MockGateway::default();
        let orchestrator = Orchestrator::new(
            store.clone(),
            gateway.clone(),
            config,
            "hello!".to_string(),
        );

        (orchestrator, gateway, store)
    }

    async fn setup() -> (Orchestrator<MockGateway>, MockGateway, UserStore) {
        setup_with(test_config()).await
    }

    fn start_event(user_id: &str) -> InboundEvent {
        InboundEvent {
            user_id: user_id.to_string(),
            text: "/start".to_string(),
            is_command_start: true,
        }
    }

    fn message_event(user_id: &str, text: &str) -> InboundEvent {
        InboundEvent {
            user_id: user_id.to_string(),
            text: text.to_string(),
            is_command_start: false,
        }
    }

    async fn must_get(store: &UserStore, user_id: &str) -> FunnelUser {
        store
            .get(user_id)
            .await
            .expect("get should succeed")
            .expect("record should exist")
    }

    #[tokio::test]
    async fn start_creates_alive_record_and_greets() {
        let (orchestrator, gateway, store) = setup().await;

        orchestrator.process_event(start_event("u1")).await;

        let user = must_get(&store, "u1").await;
        assert_eq!(user.status, UserStatus::Alive);
        assert_eq!(user.last_step_sent, 0);
        assert_eq!(gateway.sent_texts(), vec!["hello!"]);
    }

    #[tokio::test]
    async fn first_message_cascades_through_all_steps() {
        let (orchestrator, gateway, store) = setup().await;

        orchestrator.process_event(message_event("u1", "hi")).await;

        let user = must_get(&store, "u1").await;
        assert_eq!(user.last_step_sent, 3);
        assert!(!user.send_in_progress);
        assert!(user.first_message_at.is_some());
        assert!(user.last_send_attempt_at.is_some());
        assert_eq!(
            gateway.sent_texts(),
            vec!["first outreach", "second outreach", "third outreach"]
        );
    }

    #[tokio::test]
    async fn disqualified_step_content_finishes_without_sending() {
        let mut config = test_config();
        config.step_texts[0] = "already resolved, thanks".to_string();
        let (orchestrator, gateway, store) = setup_with(config).await;

        orchestrator.process_event(message_event("u1", "hi")).await;

        let user = must_get(&store, "u1").await;
        assert_eq!(user.status, UserStatus::Finished);
        assert_eq!(user.last_step_sent, 0);
        assert!(!user.send_in_progress);
        assert!(gateway.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_marks_dead_and_stops_the_funnel() {
        let (orchestrator, gateway, store) = setup().await;
        gateway.push_failure(DeliveryError::Permanent {
            reason: "blocked by recipient".to_string(),
        });

        orchestrator.process_event(message_event("u1", "hi")).await;

        let user = must_get(&store, "u1").await;
        assert_eq!(user.status, UserStatus::Dead);
        assert_eq!(user.last_step_sent, 0);
        assert!(!user.send_in_progress);
        // One attempt only; steps 2 and 3 never evaluate for a dead user.
        assert_eq!(gateway.sent_texts(), vec!["first outreach"]);
    }

    #[tokio::test]
    async fn trigger_in_step_two_content_suppresses_step_two() {
        let mut config = test_config();
        config.step_texts[1] = "second outreach (reply unsubscribe to opt out)".to_string();
        let (orchestrator, gateway, store) = setup_with(config).await;

        orchestrator.process_event(message_event("u1", "hi")).await;

        let user = must_get(&store, "u1").await;
        assert!(user.trigger_fired);
        assert!(user.trigger_fired_at.is_some());
        // Step 2 is skipped; step 3 still fires, anchored on the trigger.
        assert_eq!(user.last_step_sent, 3);
        assert_eq!(gateway.sent_texts(), vec!["first outreach", "third outreach"]);
    }

    #[tokio::test]
    async fn trigger_never_restamps_once_fired() {
        let mut config = test_config();
        config.step_texts[1] = "reply unsubscribe to opt out".to_string();
        let (orchestrator, _gateway, store) = setup_with(config).await;

        let fired_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        store
            .create_if_absent("u1")
            .await
            .expect("record should be created");
        store
            .fire_trigger("u1", fired_at)
            .await
            .expect("fire should succeed");

        orchestrator.process_event(message_event("u1", "hi")).await;

        let user = must_get(&store, "u1").await;
        assert_eq!(user.trigger_fired_at, Some(fired_at));
    }

    #[tokio::test]
    async fn pre_fired_trigger_blocks_the_whole_funnel_from_step_zero() {
        let (orchestrator, gateway, store) = setup().await;

        store
            .create_if_absent("u1")
            .await
            .expect("record should be created");
        store
            .fire_trigger("u1", Utc::now())
            .await
            .expect("fire should succeed");

        orchestrator.process_event(message_event("u1", "hi")).await;

        let user = must_get(&store, "u1").await;
        assert_eq!(user.last_step_sent, 0);
        assert!(gateway.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn dead_user_receives_nothing() {
        let (orchestrator, gateway, store) = setup().await;

        store
            .create_if_absent("u1")
            .await
            .expect("record should be created");
        store
            .mark_dead("u1", Utc::now())
            .await
            .expect("mark dead should succeed");

        orchestrator.process_event(message_event("u1", "hi")).await;

        assert!(gateway.sent_texts().is_empty());
        let user = must_get(&store, "u1").await;
        assert_eq!(user.last_step_sent, 0);
    }

    #[tokio::test]
    async fn transient_failure_rolls_back_and_releases_the_guard() {
        let (orchestrator, gateway, store) = setup().await;
        gateway.push_failure(DeliveryError::Transient(anyhow::anyhow!("socket closed")));

        orchestrator.process_event(message_event("u1", "hi")).await;

        let user = must_get(&store, "u1").await;
        assert_eq!(user.status, UserStatus::Alive);
        assert_eq!(user.last_step_sent, 0);
        assert!(!user.send_in_progress, "rollback must release the guard");
        assert_eq!(gateway.sent_texts(), vec!["first outreach"]);
    }

    #[tokio::test]
    async fn retry_after_transient_failure_resends_step_one() {
        let (orchestrator, gateway, store) = setup().await;
        gateway.push_failure(DeliveryError::Transient(anyhow::anyhow!("socket closed")));

        orchestrator.process_event(message_event("u1", "hi")).await;
        orchestrator.process_event(message_event("u1", "hello?")).await;

        let user = must_get(&store, "u1").await;
        assert_eq!(user.last_step_sent, 3);
        assert_eq!(
            gateway.sent_texts(),
            vec![
                "first outreach",
                "first outreach",
                "second outreach",
                "third outreach"
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_events_never_duplicate_a_step() {
        let (orchestrator, gateway, store) = setup().await;

        tokio::join!(
            orchestrator.process_event(message_event("u1", "hi")),
            orchestrator.process_event(message_event("u1", "hi again")),
        );

        let texts = gateway.sent_texts();
        for step_text in ["first outreach", "second outreach", "third outreach"] {
            assert!(
                texts.iter().filter(|text| *text == step_text).count() <= 1,
                "step {step_text:?} dispatched more than once: {texts:?}"
            );
        }
        assert_eq!(texts.len(), 3);

        let user = must_get(&store, "u1").await;
        assert_eq!(user.last_step_sent, 3);
        assert!(!user.send_in_progress);
    }

    #[tokio::test]
    async fn message_without_prior_start_auto_creates_the_record() {
        let (orchestrator, _gateway, store) = setup().await;

        orchestrator.process_event(message_event("u9", "hi")).await;

        let user = must_get(&store, "u9").await;
        assert_eq!(user.status, UserStatus::Alive);
        assert!(user.first_message_at.is_some());
    }
}
