//! The touchpad policy as a pure state machine.
//!
//! Time is passed in by the caller, the machine never reads a clock. Every
//! handler returns the switch command to hand to the device, if any; the
//! device side re-reads the touchpad before writing, so a command whose
//! state already holds costs no write.

use crate::config::ManagementConfig;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadState {
    Enabled,
    /// Off because a mouse is plugged in.
    Disabled,
    /// Off because of recent typing, waiting for the idle timer.
    DisabledPendingIdle,
}

impl PadState {
    pub fn is_off(&self) -> bool {
        *self != PadState::Enabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    KeyActivity(Instant),
    MousePresence(bool),
    IdleExpired { generation: u64 },
    SwitchFailed { off: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchCommand {
    pub off: bool,
}

/// Single-shot timer state. Every arm or cancel bumps the generation, so an
/// expiry carrying an older generation is recognised as superseded.
#[derive(Debug, Default)]
struct IdleTimer {
    generation: u64,
    deadline: Option<Instant>,
}

impl IdleTimer {
    fn arm(&mut self, from: Instant, idle: Duration) {
        self.generation += 1;
        // A window past the end of the clock never closes.
        self.deadline = from.checked_add(idle);
    }

    fn cancel(&mut self) {
        if self.deadline.take().is_some() {
            self.generation += 1;
        }
    }

    fn fire(&mut self, generation: u64) -> bool {
        if self.deadline.is_some() && generation == self.generation {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

pub struct TouchpadManager {
    config: ManagementConfig,
    state: PadState,
    mouse_present: bool,
    /// Most recent typing, recorded even while a mouse holds the pad off.
    last_key: Option<Instant>,
    timer: IdleTimer,
    /// The last switch to the current state failed; reissue it on the next
    /// event that may change state.
    retry: bool,
    suspended: bool,
}

impl TouchpadManager {
    pub fn new(config: ManagementConfig) -> Self {
        Self {
            config,
            state: PadState::Enabled,
            mouse_present: false,
            last_key: None,
            timer: IdleTimer::default(),
            retry: false,
            suspended: false,
        }
    }

    pub fn state(&self) -> PadState {
        self.state
    }

    pub fn config(&self) -> &ManagementConfig {
        &self.config
    }

    /// Generation and deadline of the armed idle timer.
    pub fn pending_timer(&self) -> Option<(u64, Instant)> {
        self.timer.deadline.map(|d| (self.timer.generation, d))
    }

    /// Applies the initial-state rule: off if a mouse is present, on
    /// otherwise. Always asserts the state on the device.
    pub fn start(&mut self, mouse_present: bool) -> SwitchCommand {
        self.suspended = false;
        self.last_key = None;
        self.timer.cancel();
        self.mouse_present = mouse_present && self.config.monitor_mouse;
        self.state = if self.mouse_present {
            PadState::Disabled
        } else {
            PadState::Enabled
        };
        self.retry = false;
        debug!("starting in state {:?}", self.state);
        SwitchCommand {
            off: self.state.is_off(),
        }
    }

    /// Freezes the policy until [`resume`](Self::resume).
    pub fn suspend(&mut self) {
        self.suspended = true;
        self.timer.cancel();
    }

    /// Device identities may have changed while asleep, so the machine
    /// starts over from the freshly enumerated mouse presence.
    pub fn resume(&mut self, mouse_present: bool) -> SwitchCommand {
        self.start(mouse_present)
    }

    /// The touchpad is left on when management stops.
    pub fn shutdown(&mut self) -> SwitchCommand {
        self.timer.cancel();
        self.state = PadState::Enabled;
        SwitchCommand { off: false }
    }

    pub fn handle(&mut self, signal: Signal, now: Instant) -> Option<SwitchCommand> {
        trace!("{:?} in state {:?}", signal, self.state);
        match signal {
            Signal::KeyActivity(at) => self.on_key_activity(at),
            Signal::MousePresence(present) => self.on_mouse_presence(present, now),
            Signal::IdleExpired { generation } => self.on_idle_expired(generation),
            Signal::SwitchFailed { off } => {
                if off == self.state.is_off() {
                    self.retry = true;
                }
                None
            }
        }
    }

    /// Replaces the whole configuration. A running idle window is restarted
    /// under the new settings rather than left to fire with the old ones.
    pub fn reconfigure(&mut self, config: ManagementConfig, now: Instant) -> Option<SwitchCommand> {
        self.config = config;
        if !self.config.monitor_keyboard {
            self.last_key = None;
        }
        if !self.config.monitor_mouse {
            self.mouse_present = false;
        }
        if self.suspended {
            return None;
        }

        let next = match self.state {
            PadState::Enabled => {
                if self.mouse_present {
                    PadState::Disabled
                } else {
                    PadState::Enabled
                }
            }
            PadState::Disabled | PadState::DisabledPendingIdle => self.settle(now),
        };
        self.enter(next)
    }

    fn on_key_activity(&mut self, at: Instant) -> Option<SwitchCommand> {
        if self.suspended || !self.config.monitor_keyboard {
            return None;
        }
        self.last_key = Some(at);
        if self.mouse_present {
            // Only re-issues a failed write; the state is already Disabled.
            return self.enter(PadState::Disabled);
        }
        self.timer.arm(at, self.config.idle_time);
        self.enter(PadState::DisabledPendingIdle)
    }

    fn on_mouse_presence(&mut self, present: bool, now: Instant) -> Option<SwitchCommand> {
        if self.suspended || !self.config.monitor_mouse {
            return None;
        }
        self.mouse_present = present;
        if present {
            self.timer.cancel();
            return self.enter(PadState::Disabled);
        }
        match self.state {
            PadState::Disabled => {
                let next = self.settle(now);
                self.enter(next)
            }
            other => self.enter(other),
        }
    }

    fn on_idle_expired(&mut self, generation: u64) -> Option<SwitchCommand> {
        if !self.timer.fire(generation) {
            debug!("discarding superseded idle timer {}", generation);
            return None;
        }
        if self.mouse_present || self.state != PadState::DisabledPendingIdle {
            return None;
        }
        self.enter(PadState::Enabled)
    }

    /// Where the machine belongs once nothing but typing can hold the pad
    /// off. Typing younger than the idle time opens a fresh window from
    /// `now`.
    fn settle(&mut self, now: Instant) -> PadState {
        if self.mouse_present {
            self.timer.cancel();
            return PadState::Disabled;
        }
        let typing = self.config.monitor_keyboard
            && self
                .last_key
                .map_or(false, |at| now.saturating_duration_since(at) < self.config.idle_time);
        if typing {
            self.timer.arm(now, self.config.idle_time);
            PadState::DisabledPendingIdle
        } else {
            self.timer.cancel();
            PadState::Enabled
        }
    }

    fn enter(&mut self, next: PadState) -> Option<SwitchCommand> {
        if next == self.state && !self.retry {
            return None;
        }
        if next != self.state {
            debug!("{:?} -> {:?}", self.state, next);
        }
        self.state = next;
        self.retry = false;
        Some(SwitchCommand {
            off: next.is_off(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyIgnorePolicy;

    const IDLE: Duration = Duration::from_secs(2);

    fn config() -> ManagementConfig {
        ManagementConfig {
            idle_time: IDLE,
            ..Default::default()
        }
    }

    fn ms(t0: Instant, millis: u64) -> Instant {
        t0 + Duration::from_millis(millis)
    }

    const OFF: Option<SwitchCommand> = Some(SwitchCommand { off: true });
    const ON: Option<SwitchCommand> = Some(SwitchCommand { off: false });

    /// Fires the armed timer if its deadline is not after `now`.
    fn tick(m: &mut TouchpadManager, now: Instant) -> Option<SwitchCommand> {
        match m.pending_timer() {
            Some((generation, deadline)) if deadline <= now => {
                m.handle(Signal::IdleExpired { generation }, now)
            }
            _ => None,
        }
    }

    #[test]
    fn starts_disabled_when_mouse_present() {
        let mut m = TouchpadManager::new(config());
        assert_eq!(m.start(true), SwitchCommand { off: true });
        assert_eq!(m.state(), PadState::Disabled);

        let mut m = TouchpadManager::new(config());
        assert_eq!(m.start(false), SwitchCommand { off: false });
        assert_eq!(m.state(), PadState::Enabled);
    }

    #[test]
    fn mouse_presence_ignored_when_not_monitored_at_start() {
        let mut m = TouchpadManager::new(ManagementConfig {
            monitor_mouse: false,
            ..config()
        });
        assert_eq!(m.start(true), SwitchCommand { off: false });
    }

    #[test]
    fn typing_disables_until_idle() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);

        assert_eq!(m.handle(Signal::KeyActivity(t0), t0), OFF);
        assert_eq!(m.state(), PadState::DisabledPendingIdle);
        assert_eq!(tick(&mut m, ms(t0, 1999)), None);
        assert_eq!(tick(&mut m, ms(t0, 2000)), ON);
        assert_eq!(m.state(), PadState::Enabled);
        // Exactly once.
        assert_eq!(tick(&mut m, ms(t0, 5000)), None);
    }

    #[test]
    fn sustained_typing_keeps_pad_off() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);

        assert_eq!(m.handle(Signal::KeyActivity(t0), t0), OFF);
        for i in 1..50 {
            let at = ms(t0, i * 1500);
            assert_eq!(tick(&mut m, at), None);
            assert_eq!(m.handle(Signal::KeyActivity(at), at), None);
            assert_eq!(m.state(), PadState::DisabledPendingIdle);
        }
    }

    #[test]
    fn superseded_timer_is_discarded() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);

        m.handle(Signal::KeyActivity(t0), t0);
        let (stale, _) = m.pending_timer().unwrap();
        m.handle(Signal::KeyActivity(ms(t0, 1000)), ms(t0, 1000));

        assert_eq!(
            m.handle(Signal::IdleExpired { generation: stale }, ms(t0, 2000)),
            None
        );
        assert_eq!(m.state(), PadState::DisabledPendingIdle);
        assert_eq!(tick(&mut m, ms(t0, 3000)), ON);
    }

    #[test]
    fn mouse_plug_always_disables() {
        let t0 = Instant::now();
        for start_state in [false, true] {
            let mut m = TouchpadManager::new(config());
            m.start(false);
            if start_state {
                m.handle(Signal::KeyActivity(t0), t0);
            }
            assert_eq!(m.handle(Signal::MousePresence(true), t0), OFF);
            assert_eq!(m.state(), PadState::Disabled);
            assert!(m.pending_timer().is_none());
        }
    }

    #[test]
    fn mouse_unplug_without_typing_enables() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(true);
        assert_eq!(m.handle(Signal::MousePresence(false), t0), ON);
        assert_eq!(m.state(), PadState::Enabled);
    }

    #[test]
    fn typing_under_a_mouse_writes_nothing() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(true);
        for i in 0..10 {
            let at = ms(t0, i * 100);
            assert_eq!(m.handle(Signal::KeyActivity(at), at), None);
        }
        assert_eq!(m.state(), PadState::Disabled);
        assert!(m.pending_timer().is_none());
    }

    #[test]
    fn mouse_visit_during_typing_rearms_idle_window() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);

        assert_eq!(m.handle(Signal::KeyActivity(t0), t0), OFF);
        // Still off; the device side sees no change.
        assert_eq!(m.handle(Signal::MousePresence(true), ms(t0, 500)), OFF);
        assert!(m.pending_timer().is_none());

        assert_eq!(m.handle(Signal::MousePresence(false), ms(t0, 1000)), OFF);
        assert_eq!(m.state(), PadState::DisabledPendingIdle);
        assert_eq!(m.pending_timer().map(|(_, d)| d), Some(ms(t0, 3000)));

        assert_eq!(tick(&mut m, ms(t0, 2999)), None);
        assert_eq!(tick(&mut m, ms(t0, 3000)), ON);
    }

    #[test]
    fn mouse_departure_after_stale_typing_enables() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);
        m.handle(Signal::KeyActivity(t0), t0);
        m.handle(Signal::MousePresence(true), ms(t0, 500));
        assert_eq!(m.handle(Signal::MousePresence(false), ms(t0, 5000)), ON);
    }

    #[test]
    fn disabling_keyboard_monitoring_cancels_pending_idle() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);
        m.handle(Signal::KeyActivity(t0), t0);

        let off = ManagementConfig {
            monitor_keyboard: false,
            ..config()
        };
        assert_eq!(m.reconfigure(off, ms(t0, 100)), ON);
        assert_eq!(m.state(), PadState::Enabled);
        assert!(m.pending_timer().is_none());
        assert_eq!(m.handle(Signal::KeyActivity(ms(t0, 200)), ms(t0, 200)), None);
    }

    #[test]
    fn disabling_keyboard_monitoring_under_a_mouse_stays_disabled() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(true);
        m.handle(Signal::KeyActivity(t0), t0);
        let off = ManagementConfig {
            monitor_keyboard: false,
            ..config()
        };
        assert_eq!(m.reconfigure(off, ms(t0, 100)), None);
        assert_eq!(m.state(), PadState::Disabled);
    }

    #[test]
    fn disabling_mouse_monitoring_releases_pad() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(true);
        let off = ManagementConfig {
            monitor_mouse: false,
            ..config()
        };
        assert_eq!(m.reconfigure(off, t0), ON);
        assert_eq!(m.handle(Signal::MousePresence(true), t0), None);
        assert_eq!(m.state(), PadState::Enabled);
    }

    #[test]
    fn new_idle_time_restarts_running_window() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);
        m.handle(Signal::KeyActivity(t0), t0);
        let (old_generation, _) = m.pending_timer().unwrap();

        let longer = ManagementConfig {
            idle_time: Duration::from_secs(5),
            key_ignore_policy: KeyIgnorePolicy::NoKeysIgnored,
            ..config()
        };
        assert_eq!(m.reconfigure(longer, ms(t0, 1000)), None);
        let (generation, deadline) = m.pending_timer().unwrap();
        assert_ne!(generation, old_generation);
        assert_eq!(deadline, ms(t0, 6000));
        assert_eq!(
            m.handle(
                Signal::IdleExpired {
                    generation: old_generation
                },
                ms(t0, 2000)
            ),
            None
        );
    }

    #[test]
    fn failed_switch_is_retried_on_next_event() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);
        assert_eq!(m.handle(Signal::KeyActivity(t0), t0), OFF);
        assert_eq!(m.handle(Signal::SwitchFailed { off: true }, t0), None);
        // Not a state change, but the failed write is reissued.
        assert_eq!(m.handle(Signal::KeyActivity(ms(t0, 100)), ms(t0, 100)), OFF);
        assert_eq!(m.handle(Signal::KeyActivity(ms(t0, 200)), ms(t0, 200)), None);
    }

    #[test]
    fn failed_switch_under_a_mouse_is_retried_on_typing() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        assert_eq!(m.start(true), SwitchCommand { off: true });
        assert_eq!(m.handle(Signal::SwitchFailed { off: true }, t0), None);
        assert_eq!(m.handle(Signal::KeyActivity(t0), t0), OFF);
        assert_eq!(m.state(), PadState::Disabled);
        assert!(m.pending_timer().is_none());
        assert_eq!(m.handle(Signal::KeyActivity(ms(t0, 100)), ms(t0, 100)), None);
    }

    #[test]
    fn unbounded_idle_time_never_expires() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(ManagementConfig {
            idle_time: Duration::MAX,
            ..config()
        });
        m.start(false);
        assert_eq!(m.handle(Signal::KeyActivity(t0), t0), OFF);
        assert_eq!(m.state(), PadState::DisabledPendingIdle);
        assert!(m.pending_timer().is_none());
        assert_eq!(m.handle(Signal::MousePresence(true), t0), None);
        assert_eq!(m.handle(Signal::MousePresence(false), ms(t0, 10)), None);
        assert_eq!(m.state(), PadState::DisabledPendingIdle);
    }

    #[test]
    fn stale_failure_for_other_state_is_ignored() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);
        assert_eq!(m.handle(Signal::SwitchFailed { off: true }, t0), None);
        assert_eq!(m.handle(Signal::MousePresence(false), t0), None);
    }

    #[test]
    fn suspend_freezes_and_resume_restarts() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(config());
        m.start(false);
        m.handle(Signal::KeyActivity(t0), t0);

        m.suspend();
        assert!(m.pending_timer().is_none());
        assert_eq!(m.handle(Signal::MousePresence(true), t0), None);

        assert_eq!(m.resume(true), SwitchCommand { off: true });
        assert_eq!(m.state(), PadState::Disabled);
        assert_eq!(m.handle(Signal::MousePresence(false), ms(t0, 100)), ON);
    }

    #[test]
    fn zero_idle_time_reenables_at_once() {
        let t0 = Instant::now();
        let mut m = TouchpadManager::new(ManagementConfig {
            idle_time: Duration::ZERO,
            ..config()
        });
        m.start(false);
        assert_eq!(m.handle(Signal::KeyActivity(t0), t0), OFF);
        assert_eq!(tick(&mut m, t0), ON);
    }

    #[test]
    fn shutdown_turns_pad_on() {
        let mut m = TouchpadManager::new(config());
        m.start(true);
        assert_eq!(m.shutdown(), SwitchCommand { off: false });
        assert!(m.pending_timer().is_none());
    }
}
