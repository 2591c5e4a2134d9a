//! Preset-weighted, multi-phase progress aggregation.
//!
//! Phases start and complete explicitly and only move forward. Intra-phase
//! updates are coalesced to one emission per tick (50 ms) — the latest
//! update wins — while boundary events always go out. The overall percent
//! is clamped non-decreasing and reaches exactly 100 only when every
//! weighted phase has completed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::events::{EventPayload, Signal};
use crate::job::{Phase, Preset};

/// Coalescing tick for intra-phase updates.
const COALESCE_TICK: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct PhaseState {
    phase: Phase,
    weight: u32,
    total_items: usize,
    completed_items: usize,
    is_active: bool,
    is_done: bool,
    message: String,
}

pub struct ProgressTracker {
    job_id: String,
    bus: Arc<EventBus>,
    phases: Vec<PhaseState>,
    total_weight: u32,
    last_percent: f64,
    last_update_emit: Option<Instant>,
}

impl ProgressTracker {
    /// Track the phases the preset weights. Zero-weight phases are excluded
    /// from both tracking and the percent denominator.
    pub fn new(job_id: String, preset: Preset, bus: Arc<EventBus>) -> Self {
        let phases: Vec<PhaseState> = Phase::ALL
            .iter()
            .filter(|p| preset.weight(**p) > 0)
            .map(|p| PhaseState {
                phase: *p,
                weight: preset.weight(*p),
                total_items: 0,
                completed_items: 0,
                is_active: false,
                is_done: false,
                message: String::new(),
            })
            .collect();
        let total_weight = phases.iter().map(|p| p.weight).sum();
        Self {
            job_id,
            bus,
            phases,
            total_weight,
            last_percent: 0.0,
            last_update_emit: None,
        }
    }

    /// Current overall percent (monotonic).
    pub fn percent(&self) -> f64 {
        self.last_percent
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.phases
            .iter()
            .find(|p| p.is_active && !p.is_done)
            .map(|p| p.phase)
    }

    pub fn start_phase(&mut self, phase: Phase, total_items: usize, message: &str) {
        let Some(state) = self.phases.iter_mut().find(|p| p.phase == phase) else {
            return;
        };
        if state.is_done {
            warn!(phase = phase.as_str(), "phase already completed — ignoring restart");
            return;
        }
        state.is_active = true;
        state.total_items = total_items;
        state.completed_items = 0;
        state.message = message.to_string();

        self.bus.publish(
            &self.job_id,
            EventPayload::Signal {
                signal: Signal::PhaseStart,
                message: Some(phase.as_str().to_string()),
            },
        );
        self.emit_phase(phase);
        self.emit_overall(phase, true);
    }

    /// Record intra-phase progress. Emission is coalesced; state always
    /// advances so the next boundary emission carries the latest counts.
    pub fn update(&mut self, phase: Phase, items_done: usize, message: &str) {
        let Some(state) = self.phases.iter_mut().find(|p| p.phase == phase) else {
            return;
        };
        if !state.is_active || state.is_done {
            return;
        }
        state.completed_items = if state.total_items > 0 {
            items_done.min(state.total_items)
        } else {
            items_done
        };
        state.message = message.to_string();

        let due = self
            .last_update_emit
            .map(|t| t.elapsed() >= COALESCE_TICK)
            .unwrap_or(true);
        if due {
            self.last_update_emit = Some(Instant::now());
            self.emit_phase(phase);
            self.emit_overall(phase, false);
        } else {
            debug!(phase = phase.as_str(), items_done, "progress update coalesced");
        }
    }

    pub fn complete_phase(&mut self, phase: Phase) {
        let Some(state) = self.phases.iter_mut().find(|p| p.phase == phase) else {
            return;
        };
        if state.is_done {
            return;
        }
        state.is_done = true;
        state.is_active = false;
        state.completed_items = state.total_items;

        self.emit_phase(phase);
        self.emit_overall(phase, true);
        self.bus.publish(
            &self.job_id,
            EventPayload::Signal {
                signal: Signal::PhaseComplete,
                message: Some(phase.as_str().to_string()),
            },
        );
    }

    fn raw_percent(&self) -> f64 {
        if self.total_weight == 0 {
            return 0.0;
        }
        let mut acc = 0.0f64;
        for p in &self.phases {
            if p.is_done {
                acc += p.weight as f64;
            } else if p.is_active && p.total_items > 0 {
                acc += p.weight as f64 * p.completed_items as f64 / p.total_items as f64;
            }
        }
        acc / self.total_weight as f64 * 100.0
    }

    fn emit_phase(&self, phase: Phase) {
        let Some(state) = self.phases.iter().find(|p| p.phase == phase) else {
            return;
        };
        self.bus.publish(
            &self.job_id,
            EventPayload::ProgressPhase {
                phase,
                items_done: state.completed_items,
                items_total: state.total_items,
                message: state.message.clone(),
            },
        );
    }

    fn emit_overall(&mut self, phase: Phase, forced: bool) {
        let raw = self.raw_percent();
        // Monotonic: a recomputation may never move the needle backwards.
        if raw > self.last_percent {
            self.last_percent = raw;
        } else if !forced {
            return;
        }
        let message = self
            .phases
            .iter()
            .find(|p| p.phase == phase)
            .map(|p| p.message.clone())
            .unwrap_or_default();
        self.bus.publish(
            &self.job_id,
            EventPayload::ProgressOverall {
                phase,
                percent: self.last_percent,
                message,
            },
        );
    }
}
