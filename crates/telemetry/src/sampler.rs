use std::fmt;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::provider::{sample_chain, BoxedProvider};
use crate::sample::MetricSample;
use crate::store::{load_series, write_json_atomic, PersistError};
use crate::summary::MetricsSummary;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    /// Stop was requested but the worker has not confirmed yet.
    Stopping,
    Stopped,
}

impl fmt::Display for SamplerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SamplerState::Idle => "idle",
            SamplerState::Running => "running",
            SamplerState::Stopping => "stopping",
            SamplerState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("cannot {action} a sampler that is {state}")]
    InvalidState {
        action: &'static str,
        state: SamplerState,
    },
    #[error("failed to spawn telemetry thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Background metrics sampler. A dedicated thread owns the providers and the
/// series; the caller only talks to it through the stop and hand-off channels
/// and the persisted series file.
pub struct TelemetrySampler {
    state: SamplerState,
    series_path: PathBuf,
    providers: Option<Vec<BoxedProvider>>,
    stop_tx: Option<Sender<()>>,
    done_rx: Option<Receiver<Vec<MetricSample>>>,
    handle: Option<JoinHandle<()>>,
    series: Option<Vec<MetricSample>>,
}

impl TelemetrySampler {
    pub fn new(providers: Vec<BoxedProvider>, series_path: impl Into<PathBuf>) -> Self {
        Self {
            state: SamplerState::Idle,
            series_path: series_path.into(),
            providers: Some(providers),
            stop_tx: None,
            done_rx: None,
            handle: None,
            series: None,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn series_path(&self) -> &Path {
        &self.series_path
    }

    pub fn start(&mut self, interval: Duration) -> Result<(), SamplerError> {
        if self.state != SamplerState::Idle {
            return Err(self.invalid("start"));
        }
        let providers = self.providers.take().unwrap_or_default();
        let interval = interval.max(MIN_INTERVAL);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded(1);
        let worker = Worker {
            providers,
            series_path: self.series_path.clone(),
            interval,
            stop_rx,
            done_tx,
        };

        let handle = thread::Builder::new()
            .name("telemetry-sampler".into())
            .spawn(move || worker.run())
            .map_err(SamplerError::Spawn)?;

        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            path = %self.series_path.display(),
            "telemetry sampler started"
        );
        self.stop_tx = Some(stop_tx);
        self.done_rx = Some(done_rx);
        self.handle = Some(handle);
        self.state = SamplerState::Running;
        Ok(())
    }

    /// Signals the worker and waits up to `timeout` for its final series.
    /// Returns `Stopping` if the worker did not confirm in time; it still
    /// exits on its own after the tick in flight.
    pub fn stop(&mut self, timeout: Duration) -> Result<SamplerState, SamplerError> {
        if self.state != SamplerState::Running {
            return Err(self.invalid("stop"));
        }
        drop(self.stop_tx.take());
        self.state = SamplerState::Stopping;

        let Some(done_rx) = self.done_rx.as_ref() else {
            return Ok(self.state);
        };
        match done_rx.recv_timeout(timeout) {
            Ok(series) => self.finish(series),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "telemetry sampler did not confirm stop in time"
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("telemetry sampler exited without handing back its series");
            }
        }
        Ok(self.state)
    }

    /// Summarizes the series. Uses the in-memory series when the worker
    /// confirmed, otherwise the last persisted copy.
    pub fn summarize(&mut self) -> Result<MetricsSummary, SamplerError> {
        match self.state {
            SamplerState::Idle | SamplerState::Running => Err(self.invalid("summarize")),
            SamplerState::Stopping => {
                if let Some(series) = self.done_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
                    self.finish(series);
                    return self.summarize();
                }
                let series = load_series(&self.series_path)?;
                Ok(MetricsSummary::from_samples(&series))
            }
            SamplerState::Stopped => Ok(MetricsSummary::from_samples(
                self.series.as_deref().unwrap_or_default(),
            )),
        }
    }

    /// Samples handed back by the worker, once stopped.
    pub fn series(&self) -> Option<&[MetricSample]> {
        self.series.as_deref()
    }

    fn finish(&mut self, series: Vec<MetricSample>) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("telemetry thread panicked after handing back its series");
            }
        }
        tracing::info!(samples = series.len(), "telemetry sampler stopped");
        self.done_rx = None;
        self.series = Some(series);
        self.state = SamplerState::Stopped;
    }

    fn invalid(&self, action: &'static str) -> SamplerError {
        SamplerError::InvalidState {
            action,
            state: self.state,
        }
    }
}

impl fmt::Debug for TelemetrySampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetrySampler")
            .field("state", &self.state)
            .field("series_path", &self.series_path)
            .finish_non_exhaustive()
    }
}

struct Worker {
    providers: Vec<BoxedProvider>,
    series_path: PathBuf,
    interval: Duration,
    stop_rx: Receiver<()>,
    done_tx: Sender<Vec<MetricSample>>,
}

impl Worker {
    fn run(mut self) {
        let mut series: Vec<MetricSample> = Vec::new();
        let mut next_tick = Instant::now();

        loop {
            let sample = sample_chain(&mut self.providers, MetricSample::now_timestamp());
            if let Some(error) = &sample.error {
                tracing::debug!(%error, "telemetry tick recorded an error marker");
            }
            series.push(sample);
            if let Err(err) = write_json_atomic(&self.series_path, &series) {
                tracing::warn!(error = %err, "failed to persist telemetry series");
            }

            next_tick += self.interval;
            let now = Instant::now();
            if next_tick < now {
                next_tick = now;
            }
            match self.stop_rx.recv_deadline(next_tick) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::debug!(samples = series.len(), "telemetry worker exiting");
        let _ = self.done_tx.send(series);
    }
}
