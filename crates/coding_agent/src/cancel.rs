//! Ctrl+C wiring for the run-wide [`CancelSignal`].
//!
//! The first SIGINT sets the flag; every suspension point polls it. A second
//! SIGINT while the flag is still set exits with status 130.

use std::io;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use agent_provider::CancelSignal;
use signal_hook::iterator::{Handle, Signals};

const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Keeps the listener thread alive; dropping it stops listening.
pub struct InterruptGuard {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn install_interrupt_handler(cancel: CancelSignal) -> io::Result<InterruptGuard> {
    let mut signals = Signals::new([libc::SIGINT])?;
    let handle = signals.handle();

    let thread = thread::Builder::new()
        .name("sigint-listener".to_string())
        .spawn(move || {
            for _ in signals.forever() {
                if cancel.swap(true, Ordering::SeqCst) {
                    eprintln!("\ninterrupted");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
                tracing::info!("interrupt received; cancelling");
            }
        })?;

    Ok(InterruptGuard {
        handle,
        thread: Some(thread),
    })
}

/// Clears the flag once the cancelled operation has unwound.
pub fn reset(cancel: &CancelSignal) {
    cancel.store(false, Ordering::SeqCst);
}
