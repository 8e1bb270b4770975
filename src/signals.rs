//! # Signal bridge.
//!
//! Captures process signals into a bounded queue the control loop drains,
//! with a disposition policy applied once at setup:
//!
//! - **Ignored** (never delivered): `SIGTTIN`, `SIGTTOU` — handling these
//!   would cost the controlling terminal when foreground jobs run.
//! - **Reset to default**: the fault signals (`SIGFPE`, `SIGILL`,
//!   `SIGSEGV`, `SIGBUS`, `SIGABRT`, `SIGTRAP`, `SIGSYS`). These indicate
//!   bugs in the supervisor itself and must kill it, not be proxied.
//! - **Everything else** is buffered and delivered through
//!   [`SignalSource`]. The queue is bounded; when full, signals are
//!   dropped rather than queued without limit.

use std::io;

use nix::sys::signal::{signal as set_disposition, SigHandler, Signal};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Depth of the signal queue. Excess signals are dropped.
pub const SIGNAL_QUEUE_DEPTH: usize = 32;

/// Ignored so foreground children keep the controlling terminal.
const IGNORED: [Signal; 2] = [Signal::SIGTTIN, Signal::SIGTTOU];

/// Faults in the supervisor itself; the kernel default must apply.
const RESET_TO_DEFAULT: [Signal; 7] = [
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGABRT,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

/// Every other catchable signal is captured and forwarded.
const FORWARDED: [Signal; 18] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGPIPE,
    Signal::SIGALRM,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCHLD,
    Signal::SIGCONT,
    Signal::SIGTSTP,
    Signal::SIGURG,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
    Signal::SIGWINCH,
    Signal::SIGIO,
];

/// Receiving end of the signal queue.
pub struct SignalSource {
    rx: mpsc::Receiver<Signal>,
}

impl SignalSource {
    /// Next captured signal, in arrival order. `None` only if the bridge
    /// tasks have gone away.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

/// Applies the disposition policy and starts the capture tasks.
///
/// Must be called from within the runtime, before any child is spawned,
/// so no signal window exists where the policy is not in force.
pub fn setup() -> io::Result<SignalSource> {
    for sig in IGNORED {
        // SAFETY: installing SIG_IGN replaces no Rust handler state.
        unsafe { set_disposition(sig, SigHandler::SigIgn) }.map_err(io::Error::from)?;
    }
    for sig in RESET_TO_DEFAULT {
        // SAFETY: restoring SIG_DFL replaces no Rust handler state.
        unsafe { set_disposition(sig, SigHandler::SigDfl) }.map_err(io::Error::from)?;
    }

    let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
    for sig in FORWARDED {
        let mut stream = signal(SignalKind::from_raw(sig as i32))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                // Full queue drops the signal.
                let _ = tx.try_send(sig);
            }
        });
    }

    Ok(SignalSource { rx })
}
