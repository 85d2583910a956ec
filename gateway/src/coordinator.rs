//! Ingestion Coordinator
//!
//! Classified packets arrive on one queue. The dispatcher routes each
//! fragment to the actor owning its channel, so fragments of one channel
//! are applied strictly one at a time and in arrival order while channels
//! progress independently. Actors hand their events to the bus and the
//! sinks without waiting on either.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use image_reconstruction::{
    ChannelSnapshot, ChannelState, EngineEvent, ReconstructedImage, ReconstructionPolicy,
    RetransmissionRequest, SweepTrigger,
};
use waps_packet::{AecId, ChannelKey, Rejection, StreamOrigin, WapsFragment};

use crate::events::{EventBus, IesEvent};
use crate::sinks::{PersistRecord, SinkHandle};
use crate::stats::SessionStats;

pub const DEFAULT_INGEST_CAPACITY: usize = 10_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Output of the classification stage, plus the ordering controls that
/// travel the same queue
#[derive(Debug)]
pub enum Ingest {
    Fragment {
        fragment: WapsFragment,
        /// `false` when the fragment is replayed from the store itself. Such
        /// fragments are applied as of their recorded arrival.
        persist: bool,
    },
    Rejected {
        rejection: Rejection,
        origin: StreamOrigin,
        at: DateTime<Utc>,
    },
    /// Answered once everything queued before it has been applied
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
pub enum ChannelCommand {
    Apply { fragment: WapsFragment, persist: bool },
    Sweep { as_of: DateTime<Utc>, trigger: SweepTrigger },
    Snapshot {
        as_of: DateTime<Utc>,
        reply: oneshot::Sender<ChannelSnapshot>,
    },
    Flush(oneshot::Sender<()>),
}

/// Where engine events go
#[derive(Clone)]
pub struct Outputs {
    pub bus: EventBus,
    pub stats: Arc<SessionStats>,
    pub images: Option<SinkHandle<ReconstructedImage>>,
    pub commands: Option<SinkHandle<RetransmissionRequest>>,
    pub store: Option<SinkHandle<PersistRecord>>,
}

impl Outputs {
    pub fn new(bus: EventBus, stats: Arc<SessionStats>) -> Self {
        Self {
            bus,
            stats,
            images: None,
            commands: None,
            store: None,
        }
    }

    pub fn engine_events(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.stats.record_engine_event(&event);
            if let (Some(images), Some(image)) = (&self.images, event.image()) {
                images.submit(image.clone());
            }
            if let (Some(commands), EngineEvent::RetransmissionRequested(request)) =
                (&self.commands, &event)
            {
                commands.submit(request.clone());
            }
            self.bus.engine(event);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub policy: ReconstructionPolicy,
    pub sweep_interval: Duration,
    pub ingest_capacity: usize,
    pub channel_capacity: usize,
}

impl CoordinatorConfig {
    pub fn new(policy: ReconstructionPolicy, sweep_interval: Duration) -> Self {
        Self {
            policy,
            sweep_interval,
            ingest_capacity: DEFAULT_INGEST_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Live channel actors by key
#[derive(Clone, Default)]
pub struct ChannelDirectory {
    inner: Arc<RwLock<BTreeMap<ChannelKey, mpsc::Sender<ChannelCommand>>>>,
}

impl ChannelDirectory {
    async fn senders(&self, aec: Option<AecId>) -> Vec<mpsc::Sender<ChannelCommand>> {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(key, _)| aec.map_or(true, |aec| key.aec == aec))
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    pub async fn keys(&self) -> Vec<ChannelKey> {
        self.inner.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn snapshot(&self, key: ChannelKey, as_of: DateTime<Utc>) -> Option<ChannelSnapshot> {
        let tx = self.inner.read().await.get(&key).cloned()?;
        let (reply, rx) = oneshot::channel();
        tx.send(ChannelCommand::Snapshot { as_of, reply }).await.ok()?;
        rx.await.ok()
    }

    /// Snapshots of every channel in key order
    pub async fn snapshots(&self, as_of: DateTime<Utc>) -> Vec<ChannelSnapshot> {
        let mut snapshots = Vec::new();
        for key in self.keys().await {
            if let Some(snapshot) = self.snapshot(key, as_of).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    /// Queue a sweep on every channel, or on those of one AEC
    pub async fn sweep(&self, as_of: DateTime<Utc>, trigger: SweepTrigger, aec: Option<AecId>) {
        for tx in self.senders(aec).await {
            if tx.send(ChannelCommand::Sweep { as_of, trigger }).await.is_err() {
                debug!("sweep skipped, channel closed");
            }
        }
    }
}

pub struct Coordinator {
    ingest: mpsc::Sender<Ingest>,
    directory: ChannelDirectory,
    dispatcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl Coordinator {
    pub fn start(config: CoordinatorConfig, outputs: Outputs) -> Self {
        let (ingest, rx) = mpsc::channel(config.ingest_capacity);
        let directory = ChannelDirectory::default();

        let sweeper = tokio::spawn(run_sweeper(directory.clone(), config.sweep_interval));
        let dispatcher = tokio::spawn(
            Dispatcher {
                directory: directory.clone(),
                policy: config.policy,
                channel_capacity: config.channel_capacity,
                outputs,
                actors: Vec::new(),
                transmitting: HashSet::new(),
            }
            .run(rx),
        );

        info!(
            "🛰️  Ingestion coordinator started (gap sweep every {:?})",
            config.sweep_interval
        );
        Self {
            ingest,
            directory,
            dispatcher,
            sweeper,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<Ingest> {
        self.ingest.clone()
    }

    pub fn directory(&self) -> ChannelDirectory {
        self.directory.clone()
    }

    /// Wait until every item queued so far has been applied by its
    /// channel. `false` once the coordinator is stopping.
    pub async fn flush(&self) -> bool {
        flush(&self.ingest).await
    }

    /// Drain and stop. Returns once every sender handed out by
    /// [`sender`](Self::sender) is gone and every queued fragment applied.
    pub async fn shutdown(self) {
        let Coordinator {
            ingest,
            dispatcher,
            sweeper,
            ..
        } = self;
        drop(ingest);
        sweeper.abort();
        let _ = sweeper.await;
        if let Err(e) = dispatcher.await {
            error!("Dispatcher failed: {}", e);
        }
        info!("Ingestion coordinator stopped");
    }
}

/// [`Coordinator::flush`] through a sender handed out by the coordinator
pub async fn flush(tx: &mpsc::Sender<Ingest>) -> bool {
    let (reply, done) = oneshot::channel();
    if tx.send(Ingest::Flush(reply)).await.is_err() {
        return false;
    }
    done.await.is_ok()
}

struct Dispatcher {
    directory: ChannelDirectory,
    policy: ReconstructionPolicy,
    channel_capacity: usize,
    outputs: Outputs,
    actors: Vec<JoinHandle<()>>,
    /// AECs whose last BIOLAB packet was WAPS image data
    transmitting: HashSet<AecId>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Ingest>) {
        while let Some(item) = rx.recv().await {
            match item {
                Ingest::Fragment { fragment, persist } => {
                    self.transmitting.insert(fragment.key.aec);
                    let tx = self.channel(fragment.key).await;
                    if tx
                        .send(ChannelCommand::Apply { fragment, persist })
                        .await
                        .is_err()
                    {
                        self.outputs.stats.record_unexpected_error();
                        error!("Channel actor gone, fragment dropped");
                    }
                }
                Ingest::Rejected {
                    rejection,
                    origin,
                    at,
                } => {
                    let finished = match &rejection {
                        Rejection::NotWapsImageData { aec: Some(aec), .. } => {
                            self.transmitting.remove(aec).then_some(*aec)
                        }
                        _ => None,
                    };
                    self.outputs.bus.publish(IesEvent::rejected(rejection, origin));
                    if let Some(aec) = finished {
                        debug!("AEC{} image transmission ended", aec.get());
                        self.directory
                            .sweep(at, SweepTrigger::EndOfTransmission, Some(aec))
                            .await;
                    }
                }
                Ingest::Flush(reply) => {
                    self.flush_channels().await;
                    if reply.send(()).is_err() {
                        debug!("flush requester went away");
                    }
                }
            }
        }

        // the stream is over for every AEC, whether or not its last
        // housekeeping packet made it
        self.directory
            .sweep(Utc::now(), SweepTrigger::EndOfTransmission, None)
            .await;
        self.directory.inner.write().await.clear();
        for actor in self.actors {
            if let Err(e) = actor.await {
                error!("Channel actor failed: {}", e);
            }
        }
    }

    async fn flush_channels(&self) {
        let mut pending = Vec::new();
        for tx in self.directory.senders(None).await {
            let (reply, done) = oneshot::channel();
            if tx.send(ChannelCommand::Flush(reply)).await.is_ok() {
                pending.push(done);
            }
        }
        for done in pending {
            if done.await.is_err() {
                debug!("channel stopped before flushing");
            }
        }
    }

    async fn channel(&mut self, key: ChannelKey) -> mpsc::Sender<ChannelCommand> {
        if let Some(tx) = self.directory.inner.read().await.get(&key) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let state = ChannelState::new(key, self.policy.clone());
        self.actors
            .push(tokio::spawn(run_channel(state, rx, self.outputs.clone())));
        self.directory.inner.write().await.insert(key, tx.clone());
        debug!("Channel {} actor started", key);
        tx
    }
}

async fn run_channel(
    mut state: ChannelState,
    mut rx: mpsc::Receiver<ChannelCommand>,
    outputs: Outputs,
) {
    while let Some(command) = rx.recv().await {
        match command {
            ChannelCommand::Apply { fragment, persist } => {
                let applied = if persist {
                    state.apply(&fragment)
                } else {
                    state.replay(&fragment)
                };
                match applied {
                    Ok(events) => {
                        if let (true, Some(store), Some(generation)) =
                            (persist, &outputs.store, state.current_generation())
                        {
                            store.submit(PersistRecord {
                                generation,
                                fragment,
                            });
                        }
                        outputs.engine_events(events);
                    }
                    Err(e) => {
                        outputs.stats.record_unexpected_error();
                        error!("{}: {}", state.key(), e);
                    }
                }
            }
            ChannelCommand::Sweep { as_of, trigger } => {
                outputs.engine_events(state.sweep(as_of, trigger));
            }
            ChannelCommand::Snapshot { as_of, reply } => {
                if reply.send(state.snapshot(as_of)).is_err() {
                    warn!("{} snapshot requester went away", state.key());
                }
            }
            ChannelCommand::Flush(reply) => {
                if reply.send(()).is_err() {
                    debug!("{} flush requester went away", state.key());
                }
            }
        }
    }
    debug!("Channel {} actor stopped", state.key());
}

async fn run_sweeper(directory: ChannelDirectory, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // the first tick fires at once
    ticker.tick().await;
    loop {
        ticker.tick().await;
        directory
            .sweep(Utc::now(), SweepTrigger::Scheduled, None)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_stack::CommandStackSink;
    use crate::image_files::ImageFileSink;
    use crate::sinks::{spawn_sink, RetryPolicy, SinkContext, StoreSink};
    use crate::shutdown::Shutdown;
    use crate::source::{replay_capture, resume_from_store, PacketIntake};
    use image_reconstruction::{GenerationId, GenerationState};
    use replay_store::{FragmentStore, JsonlStore, StoredFragment};
    use std::path::Path;
    use tokio::sync::broadcast;
    use waps_packet::{AecMap, Classifier, EcEntry, ImageType, Integrity, PacketBuilder};

    fn key(aec: u8, slot: u8) -> ChannelKey {
        ChannelKey::from_ids(aec, slot).unwrap()
    }

    fn fragment(k: ChannelKey, index: u16, start: Option<u16>) -> WapsFragment {
        let at = Utc::now();
        WapsFragment {
            key: k,
            ec_address: 170 + k.aec.get(),
            image_type: ImageType::Color,
            start_marker: start.is_some(),
            index,
            total_hint: start,
            payload: if start.is_some() {
                Vec::new()
            } else {
                vec![index as u8; 8]
            },
            integrity: Integrity::Verified,
            time_tag: 5,
            onboard_time: at,
            received_at: at,
            origin: StreamOrigin::Live,
        }
    }

    fn start() -> (Coordinator, broadcast::Receiver<IesEvent>, Outputs) {
        let outputs = Outputs::new(EventBus::new(256), Arc::new(SessionStats::new()));
        let events = outputs.bus.subscribe();
        let config = CoordinatorConfig::new(ReconstructionPolicy::default(), Duration::from_secs(3600));
        (Coordinator::start(config, outputs.clone()), events, outputs)
    }

    async fn next_engine(events: &mut broadcast::Receiver<IesEvent>) -> EngineEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let IesEvent::Engine(engine) = event {
                return engine;
            }
        }
    }

    #[tokio::test]
    async fn test_image_completes_through_actor() {
        let (coordinator, mut events, outputs) = start();
        let tx = coordinator.sender();
        let k = key(1, 2);

        tx.send(Ingest::Fragment { fragment: fragment(k, 0, Some(2)), persist: true })
            .await
            .unwrap();
        for i in [1, 0] {
            tx.send(Ingest::Fragment { fragment: fragment(k, i, None), persist: true })
                .await
                .unwrap();
        }

        assert!(matches!(next_engine(&mut events).await, EngineEvent::GenerationOpened { .. }));
        match next_engine(&mut events).await {
            EngineEvent::ImageCompleted(image) => {
                assert_eq!(image.key, k);
                assert_eq!(image.bytes, [vec![0u8; 8], vec![1u8; 8]].concat());
            }
            other => panic!("unexpected {other:?}"),
        }

        let snapshot = coordinator.directory().snapshot(k, Utc::now()).await.unwrap();
        assert_eq!(snapshot.current.unwrap().state, GenerationState::Complete);
        assert!(coordinator.directory().snapshot(key(4, 4), Utc::now()).await.is_none());

        drop(tx);
        coordinator.shutdown().await;
        assert_eq!(outputs.stats.snapshot().images_completed, 1);
    }

    #[tokio::test]
    async fn test_end_of_transmission_sweeps_the_aec() {
        let (coordinator, mut events, _outputs) = start();
        let tx = coordinator.sender();
        let k = key(2, 1);

        tx.send(Ingest::Fragment { fragment: fragment(k, 0, Some(4)), persist: false })
            .await
            .unwrap();
        tx.send(Ingest::Fragment { fragment: fragment(k, 0, None), persist: false })
            .await
            .unwrap();
        tx.send(Ingest::Rejected {
            rejection: Rejection::NotWapsImageData {
                aec: Some(k.aec),
                ec_address: 172,
                generic_tm_id: 0x0100,
            },
            origin: StreamOrigin::Live,
            at: Utc::now() + chrono::Duration::seconds(1),
        })
        .await
        .unwrap();

        let request = loop {
            if let EngineEvent::RetransmissionRequested(request) = next_engine(&mut events).await {
                break request;
            }
        };
        assert_eq!(request.key, k);
        assert_eq!(request.generation, GenerationId(1));
        assert_eq!(request.missing_count(), 3);

        drop(tx);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_persists_with_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragments.jsonl");
        let bus = EventBus::new(64);
        let stats = Arc::new(SessionStats::new());
        let ctx = SinkContext {
            bus: bus.clone(),
            stats: Arc::clone(&stats),
            shutdown: Shutdown::new(),
        };
        let store = StoreSink::new(Box::new(JsonlStore::open(&path).unwrap()));
        let (handle, worker) = spawn_sink(store, RetryPolicy::default(), ctx).unwrap();

        let mut outputs = Outputs::new(bus, stats);
        outputs.store = Some(handle);
        let config = CoordinatorConfig::new(ReconstructionPolicy::default(), Duration::from_secs(3600));
        let coordinator = Coordinator::start(config, outputs);
        let tx = coordinator.sender();

        let k = key(3, 3);
        tx.send(Ingest::Fragment { fragment: fragment(k, 0, Some(3)), persist: true })
            .await
            .unwrap();
        tx.send(Ingest::Fragment { fragment: fragment(k, 1, None), persist: true })
            .await
            .unwrap();
        tx.send(Ingest::Fragment { fragment: fragment(k, 2, None), persist: false })
            .await
            .unwrap();
        drop(tx);
        coordinator.shutdown().await;
        worker.join_async().await;

        let records = JsonlStore::open(&path).unwrap().load().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.generation == 1));
        assert!(records[0].fragment.start_marker);
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let (coordinator, _events, _outputs) = start();
        let tx = coordinator.sender();
        for slot in 1..=4 {
            tx.send(Ingest::Fragment { fragment: fragment(key(1, slot), 0, Some(9)), persist: false })
                .await
                .unwrap();
        }
        tx.send(Ingest::Rejected {
            rejection: Rejection::MalformedHeader("short".into()),
            origin: StreamOrigin::Replay,
            at: Utc::now(),
        })
        .await
        .unwrap();

        let directory = coordinator.directory();
        assert!(coordinator.flush().await);
        let snapshots = directory.snapshots(Utc::now()).await;
        assert_eq!(snapshots.len(), 4);
        assert!(snapshots.iter().all(|s| s.generations_opened == 1));

        drop(tx);
        coordinator.shutdown().await;
        assert_eq!(directory.len().await, 0);
    }

    fn files_under(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                names.extend(files_under(&path));
            } else {
                names.push(path.file_name().unwrap().to_string_lossy().into_owned());
            }
        }
        names
    }

    #[tokio::test]
    async fn test_replayed_capture_without_housekeeping_requests_trailing_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("capture.bin");
        let ec = PacketBuilder::new(171).slot(2).time_tag(40);
        let mut bytes = ec.start(ImageType::Color, 3);
        bytes.extend(ec.data(ImageType::Color, 0, &[0xff, 0xd8, 0xff, 0xdb]));
        bytes.extend(ec.data(ImageType::Color, 2, &[0xff, 0xd9]));
        std::fs::write(&capture, bytes).unwrap();

        let aec_map = AecMap::new(vec![EcEntry::new(171, "EC_A4")]).unwrap();
        let bus = EventBus::new(256);
        let mut events = bus.subscribe();
        let stats = Arc::new(SessionStats::new());
        let ctx = SinkContext {
            bus: bus.clone(),
            stats: Arc::clone(&stats),
            shutdown: Shutdown::new(),
        };
        let images_dir = dir.path().join("images");
        let commands_dir = dir.path().join("commands");
        let (images, image_worker) = spawn_sink(
            ImageFileSink::new(&images_dir, aec_map.clone()),
            RetryPolicy::default(),
            ctx.clone(),
        )
        .unwrap();
        let (commands, command_worker) = spawn_sink(
            CommandStackSink::new(&commands_dir, aec_map.clone()),
            RetryPolicy::default(),
            ctx,
        )
        .unwrap();

        let mut outputs = Outputs::new(bus, Arc::clone(&stats));
        outputs.images = Some(images);
        outputs.commands = Some(commands);
        let config = CoordinatorConfig::new(ReconstructionPolicy::default(), Duration::from_secs(3600));
        let coordinator = Coordinator::start(config, outputs);

        let intake = PacketIntake::new(
            Arc::new(Classifier::new(aec_map)),
            Arc::clone(&stats),
            coordinator.sender(),
        );
        assert_eq!(replay_capture(&capture, &intake, &Shutdown::new()).await.unwrap(), 3);
        drop(intake);
        coordinator.shutdown().await;
        image_worker.join_async().await;
        command_worker.join_async().await;

        let mut request = None;
        let mut partial = None;
        while let Ok(event) = events.try_recv() {
            match event {
                IesEvent::Engine(EngineEvent::RetransmissionRequested(r)) => request = Some(r),
                IesEvent::Engine(EngineEvent::PartialImage(image)) => partial = Some(image),
                _ => {}
            }
        }
        let request = request.expect("retransmission request");
        assert_eq!(request.missing_packets().map(|(index, _)| index).collect::<Vec<_>>(), vec![1]);
        let partial = partial.expect("partial image");
        assert_eq!(partial.fragments_received, 2);
        assert_eq!(partial.completeness_percent(), 66);

        assert_eq!(files_under(&commands_dir).len(), 1);
        let images = files_under(&images_dir);
        assert_eq!(images.len(), 1);
        assert!(images[0].ends_with("_66.jpg"), "{images:?}");
        let snap = stats.snapshot();
        assert_eq!(snap.requests_issued, 1);
        assert_eq!(snap.partial_images, 1);
    }

    #[tokio::test]
    async fn test_resume_replays_abandonment_before_late_fragment() {
        let (coordinator, _events, outputs) = start();
        let k = key(1, 3);
        let t0 = Utc::now() - chrono::Duration::days(2);
        let at = |f: WapsFragment, offset: chrono::Duration| WapsFragment {
            received_at: t0 + offset,
            onboard_time: t0 + offset,
            ..f
        };
        let stored = |sequence, fragment| StoredFragment {
            sequence,
            generation: 1,
            fragment,
        };
        let records = vec![
            stored(1, at(fragment(k, 0, Some(3)), chrono::Duration::zero())),
            stored(2, at(fragment(k, 0, None), chrono::Duration::seconds(1))),
            stored(3, at(fragment(k, 2, None), chrono::Duration::minutes(601))),
        ];

        assert_eq!(resume_from_store(records, &coordinator.sender()).await.unwrap(), 3);
        assert!(coordinator.flush().await);

        let snapshot = coordinator.directory().snapshot(k, Utc::now()).await.unwrap();
        let current = snapshot.current.unwrap();
        assert_eq!(current.state, GenerationState::Abandoned);
        assert_eq!(current.accepted, 1);
        assert_eq!(snapshot.generations_opened, 1);
        let snap = outputs.stats.snapshot();
        assert_eq!(snap.generations_abandoned, 1);
        assert_eq!(snap.anomalies, 1);

        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_leave_one_open_generation() {
        let (coordinator, _events, outputs) = start();
        let k = key(2, 2);

        let senders: Vec<_> = (0..4u8)
            .map(|task| {
                let tx = coordinator.sender();
                tokio::spawn(async move {
                    for round in 0..25u8 {
                        let marker = WapsFragment {
                            time_tag: i32::from(task) * 100 + i32::from(round),
                            ..fragment(k, 0, Some(4))
                        };
                        tx.send(Ingest::Fragment { fragment: marker, persist: true })
                            .await
                            .unwrap();
                        for index in 0..4u16 {
                            let data = WapsFragment {
                                payload: vec![task, round, index as u8],
                                ..fragment(k, index, None)
                            };
                            tx.send(Ingest::Fragment { fragment: data, persist: true })
                                .await
                                .unwrap();
                        }
                    }
                })
            })
            .collect();
        for sender in futures::future::join_all(senders).await {
            sender.unwrap();
        }

        // a fresh image that cannot complete
        let last = WapsFragment {
            time_tag: -1,
            ..fragment(k, 0, Some(1_000))
        };
        coordinator
            .sender()
            .send(Ingest::Fragment { fragment: last, persist: true })
            .await
            .unwrap();
        assert!(coordinator.flush().await);

        let snapshot = coordinator.directory().snapshot(k, Utc::now()).await.unwrap();
        assert_eq!(snapshot.current.map(|g| g.state), Some(GenerationState::Open));
        assert!(!snapshot.history.is_empty());
        assert!(snapshot.history.iter().all(|g| g.state != GenerationState::Open));
        assert_eq!(
            u64::from(snapshot.generations_opened),
            outputs.stats.snapshot().generations_opened
        );

        coordinator.shutdown().await;
    }
}
