use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::buffers::MetricBuffer;
use crate::config::Config;
use crate::errors::{ExitError, InitError};
use crate::listener;
use crate::sink::Sink;

/// Owns all state for the relay's main select! loop.
///
/// Producers reach the buffer through the records channel (the HTTP listener
/// and anything holding [`Relay::records_sender`]). Flushes run in the
/// background, at most one at a time; a timer tick that finds one still in
/// flight is skipped and its records wait for the next tick.
pub struct Relay<S: Sink> {
    sink: Arc<S>,
    buffer: MetricBuffer,
    flush_interval: Interval,
    records_tx: mpsc::Sender<Vec<String>>,
    records_rx: mpsc::Receiver<Vec<String>>,
    shutdown: CancellationToken,
    listener_task: JoinHandle<()>,
    listener_finished: bool,
}

impl<S: Sink> Relay<S> {
    /// Bind the records listener and spawn its server task.
    pub async fn new(sink: S, config: &Config) -> Result<Self, InitError> {
        let shutdown = CancellationToken::new();
        let (records_tx, records_rx) = mpsc::channel::<Vec<String>>(1024);

        let listener = TcpListener::bind(("127.0.0.1", config.listener_port)).await?;
        let listener_task = tokio::spawn(listener::serve(
            listener,
            records_tx.clone(),
            shutdown.clone(),
        ));

        let mut flush_interval = tokio::time::interval(config.flush_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            sink: Arc::new(sink),
            buffer: MetricBuffer::new(config.buffer_capacity),
            flush_interval,
            records_tx,
            records_rx,
            shutdown,
            listener_task,
            listener_finished: false,
        })
    }

    /// Cancel this token to stop the relay. The loop drains and flushes before returning.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Channel for in-process producers such as an inventory gatherer.
    pub fn records_sender(&self) -> mpsc::Sender<Vec<String>> {
        self.records_tx.clone()
    }

    pub fn buffer(&self) -> &MetricBuffer {
        &self.buffer
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Returns `Err(ExitError)` if the listener task died unexpectedly. The
    /// buffer is still drained and flushed first.
    pub async fn run(&mut self) -> Result<(), ExitError> {
        loop {
            if let ControlFlow::Break(result) = self.tick().await {
                return result;
            }
        }
    }

    fn admit(&self, records: Vec<String>) {
        for record in records {
            self.buffer.add(record);
        }
    }

    /// Run one tick of the relay loop.
    async fn tick(&mut self) -> ControlFlow<Result<(), ExitError>> {
        tokio::select! {
            Some(records) = self.records_rx.recv() => {
                self.admit(records);
            }
            _ = self.flush_interval.tick() => {
                if self.buffer.spawn_flush(&self.sink) {
                    debug!("flush started");
                }
            }
            result = &mut self.listener_task, if !self.listener_finished => {
                self.listener_finished = true;
                if !self.shutdown.is_cancelled() {
                    let reason = match result {
                        Ok(()) => "records listener exited unexpectedly".to_owned(),
                        Err(e) => format!("records listener failed: {e}"),
                    };
                    error!(reason, "records listener died, flushing before exit");
                    self.shutdown.cancel();
                    self.drain_and_flush().await;
                    return ControlFlow::Break(Err(ExitError::RuntimeFailure(reason)));
                }
            }
            _ = self.shutdown.cancelled() => {
                self.drain_and_flush().await;
                return ControlFlow::Break(Ok(()));
            }
        }
        ControlFlow::Continue(())
    }

    /// Final flush on shutdown. Delivery failure here is logged, not fatal.
    async fn drain_and_flush(&mut self) {
        info!("shutting down, flushing buffered records");

        // The listener returns once its open connections have closed.
        if !self.listener_finished {
            let _ = (&mut self.listener_task).await;
            self.listener_finished = true;
        }

        // Producers that send after this point get a closed channel.
        self.records_rx.close();
        while let Ok(records) = self.records_rx.try_recv() {
            self.admit(records);
        }

        self.buffer.join_flush_task().await;

        match self.buffer.flush(&*self.sink).await {
            Ok(bytes) => debug!(bytes, "final flush complete"),
            Err(e) => error!(error = %e, "final flush failed, buffered records dropped"),
        }

        info!(
            records_sent = self.buffer.records_sent(),
            records_dropped = self.buffer.records_dropped(),
            "relay stopped"
        );
    }
}
