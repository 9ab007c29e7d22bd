// Cooperative stop and pause signals shared between the runner and its worker.
// Both are watch channels so a waiting worker is woken directly by the controller.

use std::time::Duration;
use tokio::sync::watch;

/// Read side of the one-shot stop flag. Handed to collaborators so long
/// phases can bail out early.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested. A dropped controller counts as a stop.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Read side of the pause gate. `true` in the channel means paused.
#[derive(Debug, Clone)]
pub struct PauseGate {
    rx: watch::Receiver<bool>,
}

impl PauseGate {
    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    async fn opened(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

/// Everything a worker observes at its check points.
#[derive(Debug, Clone)]
pub struct WorkerSignals {
    pub stop: StopSignal,
    pub pause: PauseGate,
}

impl WorkerSignals {
    /// Block while the gate is closed. Returns `true` if the worker should exit.
    pub async fn checkpoint(&self) -> bool {
        if self.stop.is_stopped() {
            return true;
        }
        if self.pause.is_paused() {
            tokio::select! {
                _ = self.pause.opened() => {}
                _ = self.stop.stopped() => {}
            }
        }
        self.stop.is_stopped()
    }

    /// Sleep for `period` unless stop arrives first. Returns `true` on stop.
    pub async fn sleep(&self, period: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(period) => self.stop.is_stopped(),
            _ = self.stop.stopped() => true,
        }
    }
}

/// Write side, held by the runner for the active worker.
#[derive(Debug)]
pub struct SignalControls {
    stop_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
}

impl SignalControls {
    /// Stop also opens the gate so a paused worker can observe it and exit.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
        self.pause_tx.send_replace(false);
    }

    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }
}

/// Fresh signals for a new worker: not stopped, gate open.
pub fn signal_pair() -> (SignalControls, WorkerSignals) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (pause_tx, pause_rx) = watch::channel(false);
    (
        SignalControls { stop_tx, pause_tx },
        WorkerSignals {
            stop: StopSignal { rx: stop_rx },
            pause: PauseGate { rx: pause_rx },
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkpoint_passes_when_open() {
        let (_controls, signals) = signal_pair();
        assert!(!signals.checkpoint().await);
    }

    #[tokio::test]
    async fn test_paused_worker_wakes_on_resume() {
        let (controls, signals) = signal_pair();
        controls.pause();

        let waiter = tokio::spawn(async move { signals.checkpoint().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        controls.resume();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_releases_paused_worker() {
        let (controls, signals) = signal_pair();
        controls.pause();

        let waiter = tokio::spawn(async move { signals.checkpoint().await });
        controls.request_stop();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_stop() {
        let (controls, signals) = signal_pair();
        let sleeper = tokio::spawn(async move { signals.sleep(Duration::from_secs(60)).await });
        controls.request_stop();
        assert!(sleeper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_to_completion() {
        let (_controls, signals) = signal_pair();
        assert!(!signals.sleep(Duration::from_secs(60)).await);
    }
}
