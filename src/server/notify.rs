use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, Builder, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};
use crate::error::{Result, ServerError};
use super::pool::SessionStore;
use super::Shared;

pub const QUEUE_CAPACITY: usize = 3;
const STOP_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Single-byte event codes carried by the send queue.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Notify = 1,
    StopThread = 2
}

/// Producer side of the send queue.
#[derive(Clone, Debug)]
pub struct Notifier {
    sender: SyncSender<Event>
}

pub fn channel() -> (Notifier, Receiver<Event>) {
    let (sender, receiver) = sync_channel(QUEUE_CAPACITY);
    (Notifier { sender }, receiver)
}

impl Notifier {
    /// Posts `Notify`. A full queue already holds a pending notify, which
    /// services every outstanding counter, so the event is dropped.
    pub fn notify(&self) {
        match self.sender.try_send(Event::Notify) {
            Ok(()) | Err(TrySendError::Full(_)) => {},
            Err(TrySendError::Disconnected(_)) => warn!("send queue closed, push notification lost")
        }
    }

    fn try_stop_thread(&self) -> std::result::Result<(), TrySendError<Event>> {
        self.sender.try_send(Event::StopThread)
    }
}

/// The background task delivering pending pushes.
pub(crate) struct SendNotifier {
    notifier: Notifier,
    handle: Option<JoinHandle<Receiver<Event>>>
}

impl SendNotifier {
    pub fn start(events: Receiver<Event>, shared: Arc<Shared>, store: Arc<SessionStore>) -> Result<SendNotifier> {
        let notifier = shared.notifier.clone();
        let handle = Builder::new()
            .name("httpd-send".to_string())
            .spawn(move || {
                debug!("send channel started");
                loop {
                    match events.recv() {
                        Ok(Event::Notify) => match store.with_lock(|pool| pool.service_pending_sends()) {
                            Ok(0) => {},
                            Ok(failed) => {
                                debug!(failed, "push failed, waking serve loop to prune");
                                if let Err(e) = shared.waker.wake() {
                                    warn!("error waking serve loop:{}", e);
                                }
                            },
                            Err(e) => {
                                error!("send channel exiting:{}", e);
                                break
                            }
                        },
                        Ok(Event::StopThread) => {
                            debug!("send channel stopping");
                            break
                        },
                        Err(e) => {
                            warn!("error receiving send event:{}", e);
                            break
                        }
                    }
                }
                events
            })
            .map_err(|e| ServerError::Spawn("send", e))?;
        Ok(SendNotifier { notifier, handle: Some(handle) })
    }

    /// Stops and joins the task, handing back the queue for the next run.
    pub fn stop(mut self) -> Option<Receiver<Event>> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<Receiver<Event>> {
        let handle = self.handle.take()?;
        loop {
            match self.notifier.try_stop_thread() {
                Ok(()) => break,
                // a running task drains the queue; an exited one never will
                Err(TrySendError::Full(_)) if !handle.is_finished() => thread::sleep(STOP_RETRY_INTERVAL),
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Disconnected(_)) => {
                    warn!("send queue closed before stop");
                    break
                }
            }
        }
        match handle.join() {
            Ok(events) => Some(events),
            Err(_) => {
                error!("send channel panicked");
                None
            }
        }
    }
}

impl Drop for SendNotifier {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
