use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

/// Set from the signal handler. Only ever goes from false to true.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Session-wide cancellation flag shared by every in-flight execution.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
  flag: Arc<AtomicBool>,
  observe_signals: bool,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// A token that is also cancelled by SIGINT or SIGTERM.
  pub fn from_signals() -> Self {
    install_signal_handlers();
    Self {
      flag: Arc::default(),
      observe_signals: true,
    }
  }

  pub fn cancel(&self) {
    self.flag.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::SeqCst) || (self.observe_signals && INTERRUPTED.load(Ordering::SeqCst))
  }
}

fn install_signal_handlers() {
  unsafe {
    for &sig in &[libc::SIGINT, libc::SIGTERM] {
      libc::signal(sig, on_signal as *const () as libc::sighandler_t);
    }
  }
}

extern "C" fn on_signal(sig: libc::c_int) {
  INTERRUPTED.store(true, Ordering::SeqCst);

  // A second signal terminates immediately.
  unsafe {
    libc::signal(sig, libc::SIG_DFL);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_clones_share_state() {
    let token = CancellationToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());

    token.cancel();
    assert!(clone.is_cancelled());
  }

  #[test]
  fn test_plain_token_ignores_signal_flag() {
    let token = CancellationToken::new();
    INTERRUPTED.store(true, Ordering::SeqCst);
    let cancelled = token.is_cancelled();
    INTERRUPTED.store(false, Ordering::SeqCst);

    assert!(!cancelled);
  }
}
