use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::watch;

/// Tell systemd we are up.
pub fn notify_ready() {
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
}

/// What should we do when the user stops this program?
///
/// The first SIGINT/SIGTERM flips `shutdown`: no new passes start and the
/// running ones finish. A second signal exits immediately.
pub fn handle_shutdown(shutdown: watch::Sender<bool>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        for signal in signals.forever() {
            if *shutdown.borrow() {
                log::warn!("Received signal {signal} again, exiting now");
                std::process::exit(1);
            }
            log::info!("Received signal {signal}, waiting for running passes to finish");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}
