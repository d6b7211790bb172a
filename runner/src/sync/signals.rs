use super::CancellationToken;
use nix::sys::signal::{SigSet, Signal};
use std::{io, process, thread};
use tracing::{error, warn};

/// Cancel `token` on the first SIGINT/SIGTERM and exit on the second one
///
/// Must run before any other thread is spawned, the signal mask is inherited by new threads.
pub fn cancel_on_signal(token: CancellationToken) -> io::Result<()> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().map_err(io::Error::from)?;

    thread::Builder::new()
        .name("signals".to_owned())
        .spawn(move || loop {
            match signals.wait() {
                Ok(signal) if token.is_cancelled() => {
                    error!("Received {signal} again, exiting without waiting");
                    process::exit(130);
                }
                Ok(signal) => {
                    warn!("Received {signal}, stopping after the current poll. Submitted jobs keep running");
                    token.cancel();
                }
                Err(error) => {
                    error!("Failed to wait for signals: {error}");
                    return;
                }
            }
        })?;

    Ok(())
}
