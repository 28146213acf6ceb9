//! Cooperative cancellation.
//!
//! A [`CancellationSignal`] is handed to an execute call. While the call is
//! inside the engine the connection registers itself as the signal's listener,
//! so `cancel()` from any thread raises the connection's [`InterruptFlag`]. The
//! flag is polled by the engine's progress handler; setting it never blocks.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Receives the cancel notification of a [`CancellationSignal`].
pub trait CancelListener: Send + Sync {
   fn on_cancel(&self);
}

#[derive(Default)]
struct SignalState {
   canceled: bool,
   listener: Option<Arc<dyn CancelListener>>,
}

/// Cancellation token shared between the caller and an in-flight operation.
#[derive(Clone, Default)]
pub struct CancellationSignal {
   state: Arc<Mutex<SignalState>>,
}

impl CancellationSignal {
   pub fn new() -> Self {
      Self::default()
   }

   /// Cancels the operation. Idempotent; the listener runs at most once.
   pub fn cancel(&self) {
      let listener = {
         let mut state = self.state.lock();
         if state.canceled {
            return;
         }
         state.canceled = true;
         state.listener.clone()
      };
      // Outside the lock: the listener may call back into this signal.
      if let Some(listener) = listener {
         listener.on_cancel();
      }
   }

   pub fn is_canceled(&self) -> bool {
      self.state.lock().canceled
   }

   /// Fails with [`Error::Canceled`] if `cancel()` has already been called.
   pub fn throw_if_canceled(&self) -> Result<()> {
      if self.is_canceled() {
         return Err(Error::Canceled);
      }
      Ok(())
   }

   /// Sets or clears the listener. A listener set after cancellation is notified immediately.
   pub fn set_on_cancel_listener(&self, listener: Option<Arc<dyn CancelListener>>) {
      let notify = {
         let mut state = self.state.lock();
         state.listener = listener.clone();
         if state.canceled { listener } else { None }
      };
      if let Some(listener) = notify {
         listener.on_cancel();
      }
   }
}

impl fmt::Debug for CancellationSignal {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let state = self.state.lock();
      f.debug_struct("CancellationSignal")
         .field("canceled", &state.canceled)
         .field("has_listener", &state.listener.is_some())
         .finish()
   }
}

/// Flag polled by the engine's progress handler while cancellation is armed.
#[derive(Debug, Default)]
pub struct InterruptFlag {
   interrupted: AtomicBool,
}

impl InterruptFlag {
   pub(crate) fn reset(&self) {
      self.interrupted.store(false, Ordering::SeqCst);
   }

   pub(crate) fn is_set(&self) -> bool {
      self.interrupted.load(Ordering::SeqCst)
   }
}

impl CancelListener for InterruptFlag {
   fn on_cancel(&self) {
      self.interrupted.store(true, Ordering::SeqCst);
   }
}
