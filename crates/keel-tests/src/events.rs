//! In-memory event bus and timeline assertions.

use async_trait::async_trait;
use keel_core::Result;
use keel_core::events::{Event, StageTransitionedPayload};
use keel_core::ports::EventBus;
use keel_core::run::StageState;
use parking_lot::Mutex;

/// Records every published event in publish order.
#[derive(Debug, Default)]
pub struct MemoryEventBus {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.events.lock().iter().map(Event::subject).collect()
    }

    pub fn timeline(&self) -> Timeline {
        Timeline(
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    Event::StageTransitioned(p) => Some(p.clone()),
                    _ => None,
                })
                .collect(),
        )
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Stage transitions in the order they were published.
#[derive(Debug, Clone)]
pub struct Timeline(Vec<StageTransitionedPayload>);

impl Timeline {
    pub fn transitions(&self) -> &[StageTransitionedPayload] {
        &self.0
    }

    /// States `stage` went through, starting from `Pending`.
    pub fn states_of(&self, stage: &str) -> Vec<StageState> {
        let mut states = vec![StageState::Pending];
        states.extend(
            self.0
                .iter()
                .filter(|t| t.stage.as_str() == stage)
                .map(|t| t.to),
        );
        states
    }

    /// Index of the transition moving `stage` into `state`.
    pub fn position(&self, stage: &str, state: StageState) -> Option<usize> {
        self.0
            .iter()
            .position(|t| t.stage.as_str() == stage && t.to == state)
    }

    /// Index of the transition moving `stage` into a terminal state.
    pub fn terminal_position(&self, stage: &str) -> Option<usize> {
        self.0
            .iter()
            .position(|t| t.stage.as_str() == stage && t.to.is_terminal())
    }

    /// No stage of `later` started running before every stage of `earlier`
    /// was terminal.
    pub fn assert_barrier(&self, earlier: &[&str], later: &[&str]) {
        let cleared = earlier
            .iter()
            .map(|s| {
                self.terminal_position(s)
                    .unwrap_or_else(|| panic!("stage `{s}` never reached a terminal state"))
            })
            .max()
            .unwrap_or(0);

        for stage in later {
            if let Some(started) = self.position(stage, StageState::Running) {
                assert!(
                    started > cleared,
                    "stage `{stage}` started running before the barrier cleared: {:#?}",
                    self.0
                );
            }
        }
    }

    /// Every recorded transition is one the state machine allows.
    pub fn assert_valid_transitions(&self) {
        for t in &self.0 {
            assert!(
                t.from.can_transition_to(t.to),
                "invalid transition {} -> {} for `{}`",
                t.from,
                t.to,
                t.stage
            );
        }
    }
}
