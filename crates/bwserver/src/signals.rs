//! Termination signals turned into Nub interrupts.
//!
//! The process decides what an interrupt means: the manager starts a
//! controlled shutdown on the first one and stops on the second.

use mercury::InterruptHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The termination signals of this platform, installed once.
#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::select! {
            received = self.interrupt.recv() => received.map(|()| "SIGINT"),
            received = self.terminate.recv() => received.map(|()| "SIGTERM"),
        }
    }
}

#[cfg(windows)]
struct Signals;

#[cfg(windows)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok().map(|()| "Ctrl+C")
    }
}

/// Interrupts the Nub once per received signal.
///
/// Returns how many interrupts were delivered, once the signal source closes
/// or the Nub has been dropped.
async fn forward(handle: InterruptHandle, mut received: mpsc::UnboundedReceiver<&'static str>) -> u32 {
    let mut delivered = 0;
    while let Some(name) = received.recv().await {
        info!("📡 Received {}", name);
        if !handle.interrupt() {
            debug!("Nub is gone, no longer forwarding signals");
            break;
        }
        delivered += 1;
    }
    delivered
}

/// Forwards every termination signal to the Nub as an interrupt.
///
/// The returned task ends when the Nub is gone or signals cannot be
/// installed.
pub fn forward_signals(handle: InterruptHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signals = match Signals::install() {
            Ok(signals) => signals,
            Err(e) => {
                warn!("Signal handling unavailable: {}", e);
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarding = forward(handle, rx);
        tokio::pin!(forwarding);
        loop {
            tokio::select! {
                _ = &mut forwarding => return,
                received = signals.next() => match received {
                    Some(name) if tx.send(name).is_ok() => {}
                    _ => return,
                },
            }
        }
    })
}
