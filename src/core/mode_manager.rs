// Regime-adaptive HOLD / GRID / CASH state machine with hysteresis
//
// Evaluated on the mode-evaluation schedule, never per tick. The manager
// only decides; the instance performs the side effects of a transition.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::constraints::AllocationConstraints;
use crate::config::ModeConfig;
use crate::types::{Regime, RegimeSignal, TradingMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeState {
    pub current_mode: TradingMode,
    pub entered_at: DateTime<Utc>,
    pub last_transition_at: Option<DateTime<Utc>>,
    /// Timestamps of recent transitions, pruned to the lock window
    #[serde(default)]
    pub transitions: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub lock_active: bool,
    #[serde(default)]
    pub lock_activated_at: Option<DateTime<Utc>>,
}

impl ModeState {
    pub fn new(mode: TradingMode, now: DateTime<Utc>) -> Self {
        Self {
            current_mode: mode,
            entered_at: now,
            last_transition_at: None,
            transitions: Vec::new(),
            lock_active: false,
            lock_activated_at: None,
        }
    }

    /// Transitions within the trailing `window` ending at `now`
    pub fn transition_count_window(&self, now: DateTime<Utc>, window: Duration) -> usize {
        self.transitions.iter().filter(|t| now - **t <= window).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModeTransition {
    pub from: TradingMode,
    pub to: TradingMode,
    pub reason: String,
    /// BEAR override that skipped the cooldown and duration checks
    pub emergency: bool,
    /// This transition activated the safety lock and forced GRID
    pub safety_lock: bool,
}

impl ModeTransition {
    /// A lock fallback from GRID lands on GRID again
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModeDecision {
    Stay { reason: String },
    Switch(ModeTransition),
}

pub struct ModeManager {
    config: ModeConfig,
    state: ModeState,
}

impl ModeManager {
    pub fn new(config: &ModeConfig, now: DateTime<Utc>) -> Self {
        Self {
            config: config.clone(),
            state: ModeState::new(config.initial_mode, now),
        }
    }

    pub fn from_state(config: &ModeConfig, state: ModeState) -> Self {
        Self { config: config.clone(), state }
    }

    pub fn config(&self) -> &ModeConfig {
        &self.config
    }

    pub fn state(&self) -> &ModeState {
        &self.state
    }

    pub fn current_mode(&self) -> TradingMode {
        self.state.current_mode
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock_active
    }

    /// Allocation profile for the active mode
    pub fn constraints(&self) -> AllocationConstraints {
        AllocationConstraints::for_mode(self.state.current_mode, self.config.constraint_preset)
    }

    fn window(&self) -> Duration {
        Duration::hours(self.config.transition_window_hours)
    }

    fn lock_expiry(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock_activated_at
            .map(|at| at + Duration::days(self.config.lock_duration_days))
    }

    pub fn evaluate(&mut self, signal: Option<RegimeSignal>, now: DateTime<Utc>) -> ModeDecision {
        if self.state.lock_active {
            match self.lock_expiry() {
                Some(expiry) if now >= expiry => {
                    info!("🔓 Mode safety lock expired (activated {})", self.state.lock_activated_at.map(|t| t.to_rfc3339()).unwrap_or_default());
                    self.state.lock_active = false;
                    self.state.lock_activated_at = None;
                }
                expiry => {
                    return stay(format!(
                        "safety lock active until {}",
                        expiry.map(|e| e.to_rfc3339()).unwrap_or_else(|| "unknown".to_string())
                    ));
                }
            }
        }

        if !self.config.enable_mode_switching {
            return stay("mode switching disabled".to_string());
        }

        let Some(signal) = signal else {
            return stay("no regime signal".to_string());
        };

        let Some(target) = signal.regime.target_mode() else {
            return stay("regime in TRANSITION".to_string());
        };

        let current = self.state.current_mode;
        if target == current {
            return stay(format!("already in {}", current));
        }

        if signal.regime == Regime::Bear && signal.probability >= self.config.emergency_bear_probability {
            warn!(
                "🚨 Emergency BEAR override: probability {:.2} >= {:.2}, moving {} -> CASH",
                signal.probability, self.config.emergency_bear_probability, current
            );
            return self.record_transition(
                target,
                format!("emergency BEAR (p={:.2})", signal.probability),
                true,
                now,
            );
        }

        if signal.probability < self.config.min_regime_probability {
            return stay(format!(
                "probability {:.2} below {:.2}",
                signal.probability, self.config.min_regime_probability
            ));
        }

        if signal.duration_days < self.config.min_regime_duration_days {
            return stay(format!(
                "regime duration {:.1}d below {:.1}d",
                signal.duration_days, self.config.min_regime_duration_days
            ));
        }

        if let Some(last) = self.state.last_transition_at {
            let cooldown = Duration::hours(self.config.cooldown_hours);
            let since = now - last;
            if since < cooldown {
                return stay(format!(
                    "cooldown: {}h since last transition, {}h required",
                    since.num_hours(),
                    self.config.cooldown_hours
                ));
            }
        }

        self.record_transition(
            target,
            format!("{:?} p={:.2} for {:.1}d", signal.regime, signal.probability, signal.duration_days),
            false,
            now,
        )
    }

    fn record_transition(&mut self, to: TradingMode, reason: String, emergency: bool, now: DateTime<Utc>) -> ModeDecision {
        let from = self.state.current_mode;
        let window = self.window();

        self.state.transitions.push(now);
        self.state.transitions.retain(|t| now - *t <= window);
        self.state.current_mode = to;
        self.state.entered_at = now;
        self.state.last_transition_at = Some(now);

        let recent = self.state.transition_count_window(now, window);
        if recent > self.config.max_transitions_in_window {
            // The forced fallback is not itself counted as a transition
            self.state.lock_active = true;
            self.state.lock_activated_at = Some(now);
            self.state.current_mode = TradingMode::Grid;
            warn!(
                "🔒 Mode safety lock: {} transitions in {}h, forcing GRID for {} days",
                recent, self.config.transition_window_hours, self.config.lock_duration_days
            );
            return ModeDecision::Switch(ModeTransition {
                from,
                to: TradingMode::Grid,
                reason: format!("safety lock after {} transitions ({})", recent, reason),
                emergency,
                safety_lock: true,
            });
        }

        info!("🔀 Mode {} -> {} ({})", from, to, reason);
        ModeDecision::Switch(ModeTransition {
            from,
            to,
            reason,
            emergency,
            safety_lock: false,
        })
    }
}

fn stay(reason: String) -> ModeDecision {
    debug!("Mode unchanged: {}", reason);
    ModeDecision::Stay { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(now: DateTime<Utc>) -> ModeManager {
        ModeManager::new(&ModeConfig::default(), now)
    }

    fn switched(decision: &ModeDecision) -> Option<&ModeTransition> {
        match decision {
            ModeDecision::Switch(t) => Some(t),
            ModeDecision::Stay { .. } => None,
        }
    }

    #[test]
    fn test_emergency_bear_bypasses_duration() {
        let now = Utc::now();
        let mut m = manager(now);
        let decision = m.evaluate(Some(RegimeSignal::new(Regime::Bear, 0.90, 0.0)), now);
        let t = switched(&decision).expect("emergency transition");
        assert_eq!(t.to, TradingMode::Cash);
        assert!(t.emergency);
        assert_eq!(m.current_mode(), TradingMode::Cash);
    }

    #[test]
    fn test_cooldown_blocks_transition() {
        let start = Utc::now();
        let mut m = manager(start);
        // GRID -> CASH by emergency, then GRID via SIDEWAYS a day later
        m.evaluate(Some(RegimeSignal::new(Regime::Bear, 0.9, 0.0)), start);
        let later = start + Duration::hours(25);
        assert!(switched(&m.evaluate(Some(RegimeSignal::new(Regime::Sideways, 0.8, 3.0)), later)).is_some());

        // BULL 10h after the last transition is blocked
        let blocked = m.evaluate(Some(RegimeSignal::new(Regime::Bull, 0.80, 3.0)), later + Duration::hours(10));
        assert!(matches!(blocked, ModeDecision::Stay { ref reason } if reason.contains("cooldown")));
        assert_eq!(m.current_mode(), TradingMode::Grid);
    }

    #[test]
    fn test_weak_or_short_signals_ignored() {
        let now = Utc::now();
        let mut m = manager(now);
        assert!(switched(&m.evaluate(Some(RegimeSignal::new(Regime::Bull, 0.70, 5.0)), now)).is_none());
        assert!(switched(&m.evaluate(Some(RegimeSignal::new(Regime::Bull, 0.90, 1.0)), now)).is_none());
        assert!(switched(&m.evaluate(Some(RegimeSignal::new(Regime::Transition, 0.99, 9.0)), now)).is_none());
        assert!(switched(&m.evaluate(None, now)).is_none());
        assert_eq!(m.current_mode(), TradingMode::Grid);
    }

    #[test]
    fn test_constraints_follow_mode() {
        let now = Utc::now();
        let mut m = manager(now);
        assert_eq!(m.constraints().name, "SMALL");
        m.evaluate(Some(RegimeSignal::new(Regime::Bull, 0.8, 3.0)), now);
        assert_eq!(m.constraints().name, "AGGRESSIVE");
    }
}
