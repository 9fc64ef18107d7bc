//! Key classification for typing detection.
//!
//! Key codes are the Linux input event codes (`KEY_*`), shared by evdev and
//! libinput, so both keyboard backends feed the same filter.

use serde::Deserialize;

const KEY_LEFTCTRL: u16 = 29;
const KEY_LEFTSHIFT: u16 = 42;
const KEY_RIGHTSHIFT: u16 = 54;
const KEY_LEFTALT: u16 = 56;
const KEY_CAPSLOCK: u16 = 58;
const KEY_RIGHTCTRL: u16 = 97;
const KEY_RIGHTALT: u16 = 100;
const KEY_LEFTMETA: u16 = 125;
const KEY_RIGHTMETA: u16 = 126;

/// Which keystrokes do not count as typing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyIgnorePolicy {
    /// Every key press is typing.
    #[serde(alias = "none")]
    NoKeysIgnored,
    /// Pressing a modifier on its own is not typing.
    #[default]
    #[serde(alias = "modifiers")]
    ModifiersIgnored,
    /// Modifiers and anything pressed while a modifier is held are not typing.
    #[serde(alias = "modifier-combinations")]
    ModifierCombinationsIgnored,
}

impl std::str::FromStr for KeyIgnorePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::NoKeysIgnored),
            "modifiers" => Ok(Self::ModifiersIgnored),
            "modifier-combinations" | "combinations" => Ok(Self::ModifierCombinationsIgnored),
            other => Err(format!(
                "unknown key ignore policy '{}' (expected none, modifiers or modifier-combinations)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Shift,
    Control,
    Alt,
    AltGr,
    Meta,
    CapsLock,
}

impl Modifier {
    pub fn from_key(code: u16) -> Option<Self> {
        match code {
            KEY_LEFTSHIFT | KEY_RIGHTSHIFT => Some(Modifier::Shift),
            KEY_LEFTCTRL | KEY_RIGHTCTRL => Some(Modifier::Control),
            KEY_LEFTALT => Some(Modifier::Alt),
            KEY_RIGHTALT => Some(Modifier::AltGr),
            KEY_LEFTMETA | KEY_RIGHTMETA => Some(Modifier::Meta),
            KEY_CAPSLOCK => Some(Modifier::CapsLock),
            _ => None,
        }
    }
}

/// Held modifier keys, one bit per physical key so that releasing the left
/// Shift while the right one is still down keeps Shift active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifierState {
    held: u16,
}

impl ModifierState {
    pub fn new() -> Self {
        Self::default()
    }

    fn bit(code: u16) -> Option<u16> {
        let index = match code {
            KEY_LEFTSHIFT => 0,
            KEY_RIGHTSHIFT => 1,
            KEY_LEFTCTRL => 2,
            KEY_RIGHTCTRL => 3,
            KEY_LEFTALT => 4,
            KEY_RIGHTALT => 5,
            KEY_LEFTMETA => 6,
            KEY_RIGHTMETA => 7,
            KEY_CAPSLOCK => 8,
            _ => return None,
        };
        Some(1 << index)
    }

    pub fn press(&mut self, code: u16) {
        if let Some(bit) = Self::bit(code) {
            self.held |= bit;
        }
    }

    pub fn release(&mut self, code: u16) {
        if let Some(bit) = Self::bit(code) {
            self.held &= !bit;
        }
    }

    pub fn any_held(&self) -> bool {
        self.held != 0
    }

    pub fn clear(&mut self) {
        self.held = 0;
    }
}

/// Whether pressing `code` while `modifiers` are held counts as typing.
pub fn is_significant(policy: KeyIgnorePolicy, code: u16, modifiers: ModifierState) -> bool {
    let is_modifier = Modifier::from_key(code).is_some();
    match policy {
        KeyIgnorePolicy::NoKeysIgnored => true,
        KeyIgnorePolicy::ModifiersIgnored => !is_modifier,
        KeyIgnorePolicy::ModifierCombinationsIgnored => !is_modifier && !modifiers.any_held(),
    }
}

/// Per-source keyboard state: tracks modifiers across key-down/key-up and
/// classifies each key-down. Readers feed it presses and releases only,
/// never autorepeat.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    policy: KeyIgnorePolicy,
    modifiers: ModifierState,
}

impl KeyFilter {
    pub fn new(policy: KeyIgnorePolicy) -> Self {
        Self {
            policy,
            modifiers: ModifierState::new(),
        }
    }

    /// Feeds one key event, returning true if it is typing activity.
    pub fn key(&mut self, code: u16, pressed: bool) -> bool {
        if !pressed {
            self.modifiers.release(code);
            return false;
        }
        // Classify against the modifiers held before this key went down.
        let significant = is_significant(self.policy, code, self.modifiers);
        self.modifiers.press(code);
        significant
    }

    pub fn reset(&mut self) {
        self.modifiers.clear();
    }
}
