//! Tokio re-arm loop for native hosts.
//!
//! One task owns the timer: it calls [`AudioEngine::tick`], sleeps for the
//! returned duration and wakes early whenever an intent goes through
//! [`EngineDriver::with`], so a tempo change or a new recording is picked up
//! without waiting out the old deadline.
//!
//! Observers registered through [`EngineDriver::subscribe`] are called after
//! the engine lock is released, so they may issue intents of their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::backend::AudioBackend;
use crate::engine::AudioEngine;
use crate::events::{EngineEvent, EventBus, Observer, SubscriptionId};

pub struct EngineDriver<B: AudioBackend> {
    engine: Arc<Mutex<AudioEngine<B>>>,
    /// Events raised under the engine lock, waiting for dispatch.
    pending: Arc<Mutex<Vec<EngineEvent>>>,
    observers: Arc<Mutex<EventBus>>,
    wake: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl<B: AudioBackend> Clone for EngineDriver<B> {
    fn clone(&self) -> Self {
        EngineDriver {
            engine: Arc::clone(&self.engine),
            pending: Arc::clone(&self.pending),
            observers: Arc::clone(&self.observers),
            wake: Arc::clone(&self.wake),
            stopped: Arc::clone(&self.stopped),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking observer must not take the timer down with it
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<B: AudioBackend> EngineDriver<B> {
    pub fn new(mut engine: AudioEngine<B>) -> Self {
        let pending = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::clone(&pending);
        engine.subscribe(Box::new(move |e: &EngineEvent| lock(&queue).push(e.clone())));
        EngineDriver {
            engine: Arc::new(Mutex::new(engine)),
            pending,
            observers: Arc::new(Mutex::new(EventBus::new())),
            wake: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run an intent against the engine, re-arm the timer and deliver the
    /// events it raised. Observers subscribed on the engine directly run
    /// under the lock and must not call back into the driver.
    pub fn with<R>(&self, f: impl FnOnce(&mut AudioEngine<B>) -> R) -> R {
        let out = {
            let mut engine = lock(&self.engine);
            f(&mut *engine)
        };
        self.wake.notify_one();
        self.dispatch();
        out
    }

    pub fn subscribe(&self, observer: Observer) -> SubscriptionId {
        lock(&self.observers).subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.observers).unsubscribe(id)
    }

    /// Hand queued events to driver observers. A dispatch already in
    /// progress picks up events raised by its own observers.
    fn dispatch(&self) {
        let mut observers = match self.observers.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        loop {
            let batch = std::mem::take(&mut *lock(&self.pending));
            if batch.is_empty() {
                break;
            }
            for event in batch {
                observers.emit(event);
            }
        }
    }

    /// Ask the loop to exit and release the engine's devices.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn spawn(&self) -> JoinHandle<()>
    where
        B: Send + 'static,
    {
        let driver = self.clone();
        tokio::spawn(async move { driver.run().await })
    }

    async fn run(self) {
        log::debug!("engine driver running");
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                lock(&self.engine).shutdown();
                self.dispatch();
                break;
            }
            let wait = lock(&self.engine).tick();
            self.dispatch();
            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
        log::debug!("engine driver stopped");
    }
}
