//! Brings a saved rack back: many plugin loads in flight at once, one collector
//! that installs them and counts every outcome.

use std::{collections::HashMap, error, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    bus::{EngineEvent, EventBus},
    channel::{self, ChannelId, EffectSlot, InstrumentSlot, MAX_EFFECTS},
    config::{ChannelConfig, PluginConfig},
    engine::Engine,
    host::{self, PluginHandle, SharedHost},
    stage::SharedStage,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreProgress {
    pub restoring: bool,
    /// Loads that reported back, failed ones included.
    pub loaded: usize,
    pub total: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub enum RestoreError {
    AlreadyRestoring,
    Channel(channel::Error),
}

impl error::Error for RestoreError {}

impl fmt::Display for RestoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RestoreError::AlreadyRestoring => write!(f, "A restore is already running."),
            RestoreError::Channel(e) => write!(f, "Failed to prepare channels: {e}"),
        }
    }
}

impl From<channel::Error> for RestoreError {
    fn from(e: channel::Error) -> Self {
        RestoreError::Channel(e)
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Instrument,
    /// Position of the effect in the saved chain.
    Effect(usize),
}

struct Job {
    channel: ChannelId,
    target: Target,
    plugin: PluginConfig,
}

struct Report {
    job: Job,
    result: Result<PluginHandle, channel::Error>,
}

pub struct Restorer {
    progress: Arc<watch::Sender<RestoreProgress>>,
}

impl Restorer {
    pub fn new() -> Self {
        let (progress, _) = watch::channel(Default::default());
        Self {
            progress: Arc::new(progress),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RestoreProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> RestoreProgress {
        self.progress.borrow().clone()
    }

    /// Prepares the channels, then starts every plugin load at once.
    ///
    /// `on_complete` runs exactly once, after every load reported back. With
    /// nothing to load it runs before this returns and no collector is spawned.
    pub async fn restore<F>(
        &self,
        stage: &SharedStage,
        channels: Vec<ChannelConfig>,
        on_complete: F,
    ) -> Result<Option<JoinHandle<()>>, RestoreError>
    where
        F: FnOnce(RestoreSummary) + Send + 'static,
    {
        let mut guard = stage.lock().await;
        if self.progress.borrow().restoring {
            return Err(RestoreError::AlreadyRestoring);
        }
        let ids = prepare_channels(&mut guard.engine, &channels)?;
        let host = guard.engine.host();
        let bus = guard.engine.bus().clone();

        let total: usize = channels.iter().map(ChannelConfig::plugin_count).sum();
        if total == 0 {
            drop(guard);
            info!("Nothing to restore");
            bus.publish(EngineEvent::RestoreFinished {
                succeeded: 0,
                failed: 0,
            });
            on_complete(RestoreSummary::default());
            return Ok(None);
        }

        let started = RestoreProgress {
            restoring: true,
            loaded: 0,
            total,
            message: format!("Loading plugins 0/{total}"),
        };
        self.progress.send_replace(started.clone());
        bus.publish(EngineEvent::RestoreProgress(started));
        info!("Restoring {total} plugins on {} channels", ids.len());

        let (tx, rx) = mpsc::unbounded_channel();
        for (channel, config) in ids.into_iter().zip(channels) {
            if let Some(plugin) = config.instrument {
                spawn_load(&host, &tx, Job {
                    channel,
                    target: Target::Instrument,
                    plugin,
                });
            }
            for (rank, plugin) in config.effects.into_iter().enumerate() {
                let job = Job {
                    channel,
                    target: Target::Effect(rank),
                    plugin,
                };
                if rank < MAX_EFFECTS {
                    spawn_load(&host, &tx, job);
                } else {
                    // Never loaded, but still counted against the total.
                    _ = tx.send(Report {
                        job,
                        result: Err(channel::Error::CapacityExceeded),
                    });
                }
            }
        }
        drop(tx);
        drop(guard);

        let collector = Collector {
            stage: Arc::clone(stage),
            progress: Arc::clone(&self.progress),
            bus,
            total,
            loaded: 0,
            failed: 0,
            landed: HashMap::new(),
        };
        Ok(Some(tokio::spawn(collector.run(rx, on_complete))))
    }
}

impl Default for Restorer {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates missing channels, clears the ones being restored and applies their settings.
fn prepare_channels(
    engine: &mut Engine,
    channels: &[ChannelConfig],
) -> Result<Vec<ChannelId>, channel::Error> {
    engine.ensure_channels(channels.len())?;
    let mut ids = Vec::with_capacity(channels.len());
    for (index, config) in channels.iter().enumerate() {
        let Some(id) = engine.id_at(index) else {
            break;
        };
        engine.clear_plugins(id)?;
        engine.apply_channel_config(id, config)?;
        ids.push(id);
    }
    Ok(ids)
}

fn spawn_load(host: &SharedHost, tx: &mpsc::UnboundedSender<Report>, job: Job) {
    let host = Arc::clone(host);
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = load(host, &job.plugin).await.map_err(channel::Error::from);
        _ = tx.send(Report { job, result });
    });
}

async fn load(host: SharedHost, plugin: &PluginConfig) -> Result<PluginHandle, host::Error> {
    let handle = host.instantiate(&plugin.descriptor).await?;
    host::restore_state(Arc::clone(&handle), plugin.state.clone()).await?;
    Ok(handle)
}

/// The only writer of the restore counters.
struct Collector {
    stage: SharedStage,
    progress: Arc<watch::Sender<RestoreProgress>>,
    bus: EventBus,
    total: usize,
    loaded: usize,
    failed: usize,
    /// Saved positions of the effects installed so far, per channel.
    landed: HashMap<ChannelId, Vec<usize>>,
}

impl Collector {
    async fn run<F>(mut self, mut rx: mpsc::UnboundedReceiver<Report>, on_complete: F)
    where
        F: FnOnce(RestoreSummary),
    {
        while self.loaded < self.total {
            let Some(report) = rx.recv().await else {
                warn!(
                    "Restore queue closed with {} loads outstanding",
                    self.total - self.loaded
                );
                break;
            };
            self.settle(report).await;
        }

        let summary = RestoreSummary {
            succeeded: self.loaded - self.failed,
            failed: self.failed,
        };
        self.progress.send_modify(|progress| progress.restoring = false);
        info!(
            "Restore finished: {} loaded, {} failed",
            summary.succeeded, summary.failed
        );
        self.bus.publish(EngineEvent::RestoreFinished {
            succeeded: summary.succeeded,
            failed: summary.failed,
        });
        on_complete(summary);
    }

    async fn settle(&mut self, report: Report) {
        let Report { job, result } = report;
        let name = job.plugin.descriptor.to_string();
        let outcome = match result {
            Ok(handle) => {
                let shared = Arc::clone(&self.stage);
                let mut stage = shared.lock().await;
                self.install(&mut stage.engine, &job, handle)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            self.failed += 1;
            warn!("Failed to restore {name} on {}: {e}", job.channel);
            self.bus.publish(EngineEvent::PluginFailed {
                channel: job.channel,
                plugin: name.clone(),
                reason: e.to_string(),
            });
        }

        self.loaded += 1;
        let progress = RestoreProgress {
            restoring: self.loaded < self.total,
            loaded: self.loaded,
            total: self.total,
            message: format!("Loaded {}/{}: {name}", self.loaded, self.total),
        };
        debug!("{}", progress.message);
        self.progress.send_replace(progress.clone());
        self.bus.publish(EngineEvent::RestoreProgress(progress));
    }

    fn install(
        &mut self,
        engine: &mut Engine,
        job: &Job,
        handle: PluginHandle,
    ) -> Result<(), channel::Error> {
        match job.target {
            Target::Instrument => {
                let slot = InstrumentSlot::new(handle, &job.plugin.name);
                engine.install_instrument(job.channel, slot)
            }
            Target::Effect(rank) => {
                let landed = self.landed.entry(job.channel).or_default();
                let position = landed.iter().filter(|other| **other < rank).count();
                let slot = EffectSlot::new(handle, &job.plugin.name, job.plugin.bypassed);
                engine.insert_effect(job.channel, position, slot)?;
                landed.push(rank);
                Ok(())
            }
        }
    }
}
