//! Foreground/background signal for focus-driven refetching.
//!
//! Stands in for the host environment's visibility events (window focus,
//! tab foregrounding). The application flips the flag from its event loop;
//! query controllers subscribe to gate interval refetches and trigger
//! refetch-on-focus.

use tokio::sync::watch;

/// A shared foreground flag. Starts focused.
#[derive(Debug)]
pub struct FocusSignal {
  tx: watch::Sender<bool>,
}

impl FocusSignal {
  /// Create a signal in the focused state.
  pub fn new() -> Self {
    let (tx, _) = watch::channel(true);
    Self { tx }
  }

  /// Update the foreground state.
  pub fn set_focused(&self, focused: bool) {
    // send_replace never fails even with no receivers.
    self.tx.send_replace(focused);
  }

  /// Whether the application is currently foregrounded.
  pub fn is_focused(&self) -> bool {
    *self.tx.borrow()
  }

  /// Subscribe to focus changes.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for FocusSignal {
  fn default() -> Self {
    Self::new()
  }
}
