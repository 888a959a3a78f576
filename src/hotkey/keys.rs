//! Key combination definitions and held-key tracking
//!
//! Key codes are X keycodes as reported by XI2 raw events (37 is
//! Control_L, 50 is Shift_L).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// X keycode
pub type KeyCode = u16;

/// Raw key transition decoded from the input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKeyEvent {
    Press(KeyCode),
    Release(KeyCode),
}

/// Unordered set of keys that must be held together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyCombo(BTreeSet<KeyCode>);

impl KeyCombo {
    pub fn new(codes: impl IntoIterator<Item = KeyCode>) -> Self {
        Self(codes.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True only for exact set equality; extra held keys do not match
    pub fn matches(&self, held: &BTreeSet<KeyCode>) -> bool {
        !self.0.is_empty() && self.0 == *held
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", codes.join("+"))
    }
}

/// Edge-triggered recognizer for one key combination
#[derive(Debug, Clone)]
pub struct ComboDetector {
    combo: KeyCombo,
    held: BTreeSet<KeyCode>,
    engaged: bool,
}

impl ComboDetector {
    pub fn new(combo: KeyCombo) -> Self {
        Self {
            combo,
            held: BTreeSet::new(),
            engaged: false,
        }
    }

    /// Feed one event; returns true exactly when the combo becomes held
    pub fn handle(&mut self, event: RawKeyEvent) -> bool {
        match event {
            RawKeyEvent::Press(code) => {
                self.held.insert(code);
            }
            RawKeyEvent::Release(code) => {
                self.held.remove(&code);
            }
        }

        let matched = self.combo.matches(&self.held);
        let fired = matched && !self.engaged;
        self.engaged = matched;
        fired
    }

    #[cfg(test)]
    pub fn held(&self) -> &BTreeSet<KeyCode> {
        &self.held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RawKeyEvent::{Press, Release};

    fn detector() -> ComboDetector {
        ComboDetector::new(KeyCombo::new([37, 50]))
    }

    fn fire_count(detector: &mut ComboDetector, events: &[RawKeyEvent]) -> usize {
        events.iter().filter(|e| detector.handle(**e)).count()
    }

    #[test]
    fn test_combo_fires_once_in_any_order() {
        assert_eq!(fire_count(&mut detector(), &[Press(37), Press(50)]), 1);
        assert_eq!(fire_count(&mut detector(), &[Press(50), Press(37)]), 1);
    }

    #[test]
    fn test_auto_repeat_does_not_refire() {
        let mut d = detector();
        assert_eq!(
            fire_count(&mut d, &[Press(37), Press(50), Press(50), Press(50)]),
            1
        );
    }

    #[test]
    fn test_superset_does_not_match() {
        let mut d = detector();
        assert_eq!(fire_count(&mut d, &[Press(64), Press(37), Press(50)]), 0);
    }

    #[test]
    fn test_release_allows_retrigger() {
        let mut d = detector();
        let events = [Press(37), Press(50), Release(50), Press(50)];
        assert_eq!(fire_count(&mut d, &events), 2);
        assert_eq!(d.held(), &BTreeSet::from([37, 50]));
    }

    #[test]
    fn test_unknown_release_is_ignored() {
        let mut d = detector();
        assert!(!d.handle(Release(99)));
        assert!(d.held().is_empty());
    }

    #[test]
    fn test_empty_combo_never_matches() {
        let mut d = ComboDetector::new(KeyCombo::default());
        assert!(!d.handle(Press(37)));
        assert!(!d.handle(Release(37)));
    }

    #[test]
    fn test_combo_display() {
        assert_eq!(KeyCombo::new([50, 37]).to_string(), "37+50");
    }
}
