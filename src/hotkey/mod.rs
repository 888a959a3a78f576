//! Hotkey module for global keyboard event listening
//!
//! Uses XI2 raw key events from `xinput` to detect the unlock combination.

mod keys;
mod listener;

pub use keys::{ComboDetector, KeyCode, KeyCombo, RawKeyEvent};
pub use listener::HotkeyListener;
