//! Background acquisition with a bounded wait.
//!
//! The worker thread owns the blocking device/network calls. The tick thread
//! polls the task; once the deadline passes the task reports `TimedOut` and
//! drops its receiver, so a result that arrives later cannot be delivered and
//! the worker releases it itself.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};

use super::{Acquisition, SourceAcquirer, SourceError, SourceHandle};

pub struct TaskOutcome {
    pub acquisition: Acquisition,
    pub result: Result<SourceHandle, SourceError>,
}

pub struct AcquisitionTask {
    acquisition: Acquisition,
    receiver: Option<Receiver<Result<SourceHandle, SourceError>>>,
    deadline: Instant,
    timeout: Duration,
}

impl AcquisitionTask {
    pub fn spawn(
        acquirer: SourceAcquirer,
        acquisition: Acquisition,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let (sender, receiver) = mpsc::channel();
        let kind = acquisition.kind().clone();
        let cancel = acquisition.cancel_token().clone();
        std::thread::Builder::new()
            .name(format!("acquire-{}", acquisition.generation()))
            .spawn(move || {
                let result = acquirer.acquire(&kind, &cancel);
                if let Err(mpsc::SendError(unsent)) = sender.send(result) {
                    if let Ok(mut handle) = unsent {
                        let report = handle.release(None);
                        log::warn!(
                            "acquisition of {} finished after its deadline; released {} track(s)",
                            kind,
                            report.tracks_stopped
                        );
                    }
                }
            })
            .map_err(|err| SourceError::Io(format!("spawn acquisition worker: {}", err)))?;
        Ok(Self {
            acquisition,
            receiver: Some(receiver),
            deadline: Instant::now() + timeout,
            timeout,
        })
    }

    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    /// `None` while the worker is still running and the deadline has not
    /// passed. Yields exactly one outcome.
    pub fn poll(&mut self) -> Option<TaskOutcome> {
        let receiver = self.receiver.as_ref()?;
        let result = match receiver.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Disconnected) => Err(SourceError::Aborted),
            Err(TryRecvError::Empty) => {
                if Instant::now() < self.deadline {
                    return None;
                }
                self.acquisition.cancel_token().cancel();
                Err(SourceError::TimedOut(self.timeout.as_millis() as u64))
            }
        };
        self.receiver = None;
        Some(TaskOutcome {
            acquisition: self.acquisition.clone(),
            result,
        })
    }

    /// Block until the task settles; used by tools without a tick loop.
    pub fn wait(mut self) -> TaskOutcome {
        loop {
            if let Some(outcome) = self.poll() {
                return outcome;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
