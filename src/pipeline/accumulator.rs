//! Frame accumulator.
//!
//! Counts frames against the active filter's requirement, ingests them on
//! a single worker thread in arrival order, and finalizes once the count
//! is met. With no filter selected a single frame passes straight through.
//!
//! ```text
//!  Deinit ──first frame──▶ Init ──frame 1──▶ Busy ──frame N / finalize──▶ Init
//!     ▲                                                                    │
//!     └──────────────────────────── set_filter ◀──────────────────────────┘
//! ```

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capture::{FrameGeometry, RawFrame};
use crate::context::PipelineContext;
use crate::encode::ImageEncoder;
use crate::error::Result;
use crate::filter::{Filter, FilterId, FilterRegistry, FrameExtra, ResultImage, Roi};
use crate::pipeline::permits::Permits;
use crate::pipeline::watchdog::Watchdog;
use crate::pipeline::worker::Worker;
use crate::utils;

/// Encoded output of one accumulation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedResult {
    pub bytes: Vec<u8>,
    pub format: &'static str,
    pub width: u32,
    pub height: u32,
    pub orientation: u32,
    pub roi: Roi,
    /// Timestamp of the first frame of the cycle
    pub timestamp: i64,
    pub filter: FilterId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The filter produced nothing for this cycle
    NoValidResult { filter: FilterId },
    Encode(String),
}

/// Non-fatal, user-visible conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The requested filter cannot run here; no filter is used instead
    FilterUnsupported { requested: FilterId },
}

/// Outbound side of the pipeline, typically a persistence layer
pub trait CaptureListener: Send + Sync {
    fn on_result(&self, result: EncodedResult);

    fn on_failure(&self, reason: FailureReason);

    fn on_notice(&self, notice: Notice) {
        let _ = notice;
    }
}

/// Everything a [`CaptureListener`] can observe, for channel consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Result(EncodedResult),
    Failure(FailureReason),
    Notice(Notice),
}

impl CaptureListener for flume::Sender<CaptureEvent> {
    fn on_result(&self, result: EncodedResult) {
        let _ = self.send(CaptureEvent::Result(result));
    }

    fn on_failure(&self, reason: FailureReason) {
        let _ = self.send(CaptureEvent::Failure(reason));
    }

    fn on_notice(&self, notice: Notice) {
        let _ = self.send(CaptureEvent::Notice(notice));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    /// Filter not yet primed with frame dimensions
    Deinit,
    /// Primed and idle
    Init,
    /// Between the first and last frame of an accumulation
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorStatus {
    pub state: AccumulatorState,
    pub filter: FilterId,
    pub ingested: usize,
    pub required: usize,
    pub closed: bool,
}

/// A filter instance plus whether it currently holds an `init`
struct FilterSlot {
    filter: Box<dyn Filter>,
    primed: bool,
}

impl FilterSlot {
    fn prime(&mut self, geometry: FrameGeometry) {
        if self.primed {
            self.filter.deinit();
        }
        self.filter.init(geometry);
        self.primed = true;
    }

    fn deinit(&mut self) {
        if std::mem::take(&mut self.primed) {
            self.filter.deinit();
        }
    }
}

type SharedFilter = Arc<Mutex<FilterSlot>>;

/// A filter taken out of the session, deinitialized when dropped
struct RetiredFilter(SharedFilter);

impl Drop for RetiredFilter {
    fn drop(&mut self) {
        self.0.lock().deinit();
    }
}

/// State of the selected filter; guarded by one lock
struct FilterSession {
    id: FilterId,
    filter: Option<SharedFilter>,
    required: usize,
    ingested: usize,
    state: AccumulatorState,
    geometry: Option<FrameGeometry>,
    /// Frames ingested this cycle, released at finalize
    retained: Vec<RawFrame>,
    /// Bumped on every filter swap so queued work from an older session
    /// can be recognised
    generation: u64,
    closed: bool,
}

/// What an accepted frame carries to the worker
struct Ingest {
    /// Set on the first frame after a swap or a resolution change
    prime: Option<FrameGeometry>,
    index: usize,
    last: bool,
    generation: u64,
    filter_id: FilterId,
    filter: Option<SharedFilter>,
}

/// Outcome of a filter swap, acted on once the session lock is dropped
struct Swap {
    effective: FilterId,
    notice: Option<Notice>,
    retired: Option<RetiredFilter>,
    released: Vec<RawFrame>,
}

enum Admission {
    Accept(Ingest),
    Drop(&'static str),
}

struct Shared {
    context: Arc<PipelineContext>,
    registry: FilterRegistry,
    session: Mutex<FilterSession>,
    permits: Arc<Permits>,
    worker: Worker,
    watchdog: Option<Watchdog>,
    encoder: Arc<dyn ImageEncoder>,
    listener: Arc<dyn CaptureListener>,
}

/// Accumulates frames for the active filter and emits one result per
/// cycle. Producer-facing calls never block on processing and never fail;
/// problems degrade to a dropped frame or a skipped cycle.
pub struct FrameAccumulator {
    shared: Arc<Shared>,
}

impl FrameAccumulator {
    pub fn new(
        context: Arc<PipelineContext>,
        registry: FilterRegistry,
        encoder: Arc<dyn ImageEncoder>,
        listener: Arc<dyn CaptureListener>,
    ) -> Result<Self> {
        let config = context.config();
        let worker = Worker::spawn("postcapture-worker", config.accumulator.pin_worker_core)?;
        let permits = Permits::new(config.accumulator.max_in_flight.max(1));

        let mut watchdog_err = None;
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let watchdog = Watchdog::spawn(&config.watchdog, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.bark();
                }
            })
            .map_err(|e| watchdog_err = Some(e))
            .ok();

            Shared {
                context,
                registry,
                session: Mutex::new(FilterSession {
                    id: FilterId::None,
                    filter: None,
                    required: 1,
                    ingested: 0,
                    state: AccumulatorState::Deinit,
                    geometry: None,
                    retained: Vec::with_capacity(1),
                    generation: 0,
                    closed: false,
                }),
                permits,
                worker,
                watchdog,
                encoder,
                listener,
            }
        });

        if let Some(err) = watchdog_err {
            shared.close();
            return Err(err);
        }
        Ok(Self { shared })
    }

    /// Producer callback: hand over one frame. Returns immediately.
    pub fn on_frame_available(&self, frame: RawFrame) {
        self.shared.on_frame_available(frame);
    }

    /// Swap the active filter. Returns the filter actually in effect, which
    /// is [`FilterId::None`] if the requested one is unsupported.
    pub fn set_filter(&self, id: FilterId) -> FilterId {
        self.shared.set_filter(id)
    }

    pub fn filter(&self) -> FilterId {
        self.shared.session.lock().id
    }

    pub fn status(&self) -> AccumulatorStatus {
        let session = self.shared.session.lock();
        AccumulatorStatus {
            state: session.state,
            filter: session.id,
            ingested: session.ingested,
            required: session.required,
            closed: session.closed,
        }
    }

    /// Stop the worker and watchdog and release everything retained.
    /// Frames arriving afterwards are released immediately.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for FrameAccumulator {
    fn drop(&mut self) {
        self.shared.close();
    }
}

fn release_all(frames: Vec<RawFrame>) {
    for frame in frames {
        frame.release();
    }
}

impl Shared {
    fn on_frame_available(self: &Arc<Self>, frame: RawFrame) {
        self.context.frame_received();
        let timestamp = frame.timestamp();

        let Some(permit) = self.permits.try_acquire() else {
            debug!(timestamp, "Worker saturated, releasing frame");
            self.context.frame_dropped("backpressure");
            frame.release();
            return;
        };

        let admission = self.admit(&frame);
        let ingest = match admission {
            Admission::Accept(ingest) => ingest,
            Admission::Drop(reason) => {
                debug!(timestamp, reason, "Frame not accepted");
                self.context.frame_dropped(reason);
                frame.release();
                return;
            }
        };

        let shared = Arc::clone(self);
        let submitted = self.worker.submit(move || {
            let _permit = permit;
            shared.ingest(frame, ingest);
        });
        if !submitted {
            // The rejected task released the frame when it was dropped
            debug!(timestamp, "Worker stopped, frame dropped");
            self.context.frame_dropped("teardown");
        }
    }

    /// Decide under the session lock whether a frame joins the current
    /// accumulation. No filter call happens here; priming rides along with
    /// the frame to the worker.
    fn admit(&self, frame: &RawFrame) -> Admission {
        let mut session = self.session.lock();
        if session.closed {
            return Admission::Drop("closed");
        }

        let geometry = frame.geometry();
        let reprime = match session.geometry {
            None => true,
            // Resolution changed between cycles
            Some(g) => g != geometry && session.ingested == 0,
        };
        let mut prime = None;
        if session.state == AccumulatorState::Deinit || reprime {
            prime = Some(geometry);
            session.geometry = Some(geometry);
            session.state = AccumulatorState::Init;
        } else if session.geometry != Some(geometry) {
            return Admission::Drop("geometry");
        }

        if session.ingested >= session.required {
            return Admission::Drop("overflow");
        }
        if session.ingested == 0 {
            session.state = AccumulatorState::Busy;
            if let Some(watchdog) = &self.watchdog {
                watchdog.start_monitor();
            }
        }

        let index = session.ingested;
        session.ingested += 1;
        debug!(
            index,
            required = session.required,
            timestamp = frame.timestamp(),
            "Frame accepted"
        );
        Admission::Accept(Ingest {
            prime,
            index,
            last: session.ingested == session.required,
            generation: session.generation,
            filter_id: session.id,
            filter: session.filter.clone(),
        })
    }

    /// Worker side: feed the filter, retain the frame, finalize on the last
    fn ingest(&self, frame: RawFrame, job: Ingest) {
        if self.session.lock().generation != job.generation {
            warn!(
                timestamp = frame.timestamp(),
                "Stale ingestion after filter reset, releasing frame"
            );
            self.context.frame_dropped("stale");
            frame.release();
            return;
        }

        if let Some(filter) = &job.filter {
            let mut slot = filter.lock();
            if let Some(geometry) = job.prime {
                slot.prime(geometry);
                info!(
                    filter = %job.filter_id,
                    width = geometry.width,
                    height = geometry.height,
                    "Filter primed"
                );
            }
            let extra = FrameExtra {
                timestamp: frame.timestamp(),
                orientation: frame.orientation(),
                format: frame.format(),
            };
            slot.filter
                .add_frame(&frame.luma().data, &frame.chroma().data, job.index, &extra);
        }
        self.context.frame_ingested();

        let stale = {
            let mut session = self.session.lock();
            if session.generation == job.generation {
                session.retained.push(frame);
                None
            } else {
                Some(frame)
            }
        };
        if let Some(frame) = stale {
            warn!(timestamp = frame.timestamp(), "Filter reset during ingestion");
            self.context.frame_dropped("stale");
            frame.release();
            return;
        }

        if job.last {
            self.finalize(job.generation, job.filter_id, job.filter);
        }
    }

    #[instrument(skip(self, filter), fields(filter = %filter_id))]
    fn finalize(&self, generation: u64, filter_id: FilterId, filter: Option<SharedFilter>) {
        let retained = {
            let mut session = self.session.lock();
            if session.generation != generation {
                warn!("Stale finalize after filter reset, skipping");
                return;
            }
            session.ingested = 0;
            session.state = AccumulatorState::Init;
            if let Some(watchdog) = &self.watchdog {
                watchdog.stop_monitor();
            }
            let required = session.required;
            std::mem::replace(&mut session.retained, Vec::with_capacity(required))
        };

        let result = match &filter {
            Some(filter) => filter.lock().filter.finalize(),
            None => retained.first().map(|frame| {
                utils::passthrough_image(
                    &frame.luma().data,
                    &frame.chroma().data,
                    frame.geometry(),
                    frame.format(),
                )
            }),
        };
        let orientation = retained.last().map_or(0, |f| f.orientation());
        let timestamp = retained.first().map_or(0, |f| f.timestamp());
        let frames = retained.len();
        release_all(retained);

        match result {
            Some(image) => self.deliver(image, orientation, timestamp, filter_id),
            None => {
                warn!(frames, "No valid result for this cycle");
                self.context.failure_emitted();
                self.listener
                    .on_failure(FailureReason::NoValidResult { filter: filter_id });
            }
        }
    }

    fn deliver(&self, image: ResultImage, orientation: u32, timestamp: i64, filter: FilterId) {
        match self.encoder.encode(&image, orientation) {
            Ok((bytes, roi)) => {
                info!(
                    bytes = bytes.len(),
                    width = image.width,
                    height = image.height,
                    "Result ready"
                );
                self.context.result_emitted();
                self.listener.on_result(EncodedResult {
                    bytes,
                    format: self.encoder.format(),
                    width: image.width,
                    height: image.height,
                    orientation,
                    roi,
                    timestamp,
                    filter,
                });
            }
            Err(e) => {
                warn!(error = %e, "Encoding failed");
                self.context.failure_emitted();
                self.listener.on_failure(FailureReason::Encode(e.to_string()));
            }
        }
    }

    fn set_filter(&self, id: FilterId) -> FilterId {
        let swap = {
            let mut session = self.session.lock();
            if session.closed {
                return session.id;
            }
            self.swap_filter(&mut session, id)
        };

        self.retire(swap.retired);
        release_all(swap.released);
        if let Some(notice) = swap.notice {
            self.listener.on_notice(notice);
        }
        swap.effective
    }

    /// Queue the deinit of a replaced filter behind whatever the worker
    /// still has for it. A rejected task deinits on the spot when dropped.
    fn retire(&self, retired: Option<RetiredFilter>) {
        if let Some(retired) = retired {
            if !self.worker.submit(move || drop(retired)) {
                debug!("Worker stopped, filter deinitialized inline");
            }
        }
    }

    /// Take the current filter out and select `id`, falling back to no
    /// filter if it cannot run. Only session state changes here; the old
    /// filter and the abandoned frames go back to the caller.
    fn swap_filter(&self, session: &mut FilterSession, id: FilterId) -> Swap {
        let retired = session.filter.take().map(RetiredFilter);

        let mut notice = None;
        let filter = match id {
            FilterId::None => None,
            id => match self.registry.create(id) {
                Some(filter) if filter.is_supported() => Some(filter),
                _ => {
                    warn!(filter = %id, "Filter unsupported, falling back to none");
                    notice = Some(Notice::FilterUnsupported { requested: id });
                    None
                }
            },
        };

        session.id = if filter.is_some() { id } else { FilterId::None };
        session.required = filter
            .as_ref()
            .map_or(1, |f| f.required_frame_count().max(1));
        session.filter = filter.map(|filter| {
            Arc::new(Mutex::new(FilterSlot {
                filter,
                primed: false,
            }))
        });
        session.ingested = 0;
        session.state = AccumulatorState::Deinit;
        session.geometry = None;
        session.generation += 1;
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop_monitor();
        }

        info!(filter = %session.id, required = session.required, "Filter selected");
        let released = std::mem::replace(
            &mut session.retained,
            Vec::with_capacity(session.required),
        );
        Swap {
            effective: session.id,
            notice,
            retired,
            released,
        }
    }

    /// Watchdog recovery: cycle through no filter back to the current one
    fn bark(&self) {
        let (reset, restored) = {
            let mut session = self.session.lock();
            if session.closed {
                return;
            }
            let previous = session.id;
            warn!(
                filter = %previous,
                ingested = session.ingested,
                required = session.required,
                "Watchdog reset"
            );
            let reset = self.swap_filter(&mut session, FilterId::None);
            let restored = self.swap_filter(&mut session, previous);
            (reset, restored)
        };

        self.context.watchdog_barked();
        self.retire(reset.retired);
        release_all(reset.released);
        if let Some(notice) = restored.notice {
            self.listener.on_notice(notice);
        }
    }

    fn close(&self) {
        {
            let mut session = self.session.lock();
            if session.closed {
                return;
            }
            session.closed = true;
        }

        // Never join while holding the session lock: queued tasks and the
        // watchdog both take it
        self.worker.shutdown();
        if let Some(watchdog) = &self.watchdog {
            watchdog.shutdown();
        }

        let (retired, released) = {
            let mut session = self.session.lock();
            let retired = session.filter.take().map(RetiredFilter);
            session.id = FilterId::None;
            session.required = 1;
            session.state = AccumulatorState::Deinit;
            session.ingested = 0;
            session.geometry = None;
            (retired, std::mem::take(&mut session.retained))
        };
        drop(retired);
        let count = released.len();
        release_all(released);
        info!(released = count, "Accumulator closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{PixelFormat, Plane};
    use crate::encode::RawEncoder;
    use crate::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Counts calls; finalizes to the last luma plane it saw
    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        inits: AtomicUsize,
        added: AtomicUsize,
        finalized: AtomicUsize,
        deinits: AtomicUsize,
        /// While set, `add_frame` blocks until this yields or disconnects
        hold: Mutex<Option<flume::Receiver<()>>>,
    }

    struct StubFilter {
        required: usize,
        counters: Arc<Counters>,
        geometry: Option<FrameGeometry>,
        last: Vec<u8>,
        chroma: Vec<u8>,
    }

    impl Filter for StubFilter {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn required_frame_count(&self) -> usize {
            self.required
        }

        fn init(&mut self, geometry: FrameGeometry) {
            self.geometry = Some(geometry);
            self.counters.inits.fetch_add(1, Ordering::SeqCst);
        }

        fn add_frame(&mut self, luma: &[u8], chroma: &[u8], _index: usize, _extra: &FrameExtra) {
            let hold = self.counters.hold.lock().clone();
            if let Some(hold) = hold {
                let _ = hold.recv_timeout(Duration::from_secs(2));
            }
            self.last = luma.to_vec();
            self.chroma = chroma.to_vec();
            self.counters.added.fetch_add(1, Ordering::SeqCst);
        }

        fn finalize(&mut self) -> Option<ResultImage> {
            self.counters.finalized.fetch_add(1, Ordering::SeqCst);
            let g = self.geometry?;
            Some(ResultImage::packed(
                self.last.clone(),
                &self.chroma,
                g.width,
                g.height,
                PixelFormat::Nv21,
            ))
        }

        fn deinit(&mut self) {
            self.counters.deinits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        accumulator: FrameAccumulator,
        events: flume::Receiver<CaptureEvent>,
        counters: Arc<Counters>,
        released: Arc<AtomicUsize>,
    }

    fn fixture(config: Config, required: usize) -> Fixture {
        let counters = Arc::new(Counters::default());
        let mut registry = FilterRegistry::empty();
        let c = counters.clone();
        registry.register(FilterId::Average, move || {
            c.created.fetch_add(1, Ordering::SeqCst);
            Box::new(StubFilter {
                required,
                counters: c.clone(),
                geometry: None,
                last: Vec::new(),
                chroma: Vec::new(),
            }) as Box<dyn Filter>
        });

        let (tx, events) = flume::unbounded();
        let accumulator = FrameAccumulator::new(
            PipelineContext::new(config),
            registry,
            Arc::new(RawEncoder),
            Arc::new(tx),
        )
        .unwrap();
        Fixture {
            accumulator,
            events,
            counters,
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    impl Fixture {
        fn frame(&self, ts: i64) -> RawFrame {
            let released = self.released.clone();
            RawFrame::new(
                4,
                2,
                PixelFormat::Nv21,
                Plane::new(vec![ts as u8; 8], 4),
                Plane::new(vec![128u8; 4], 4),
                ts,
            )
            .unwrap()
            .with_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            })
        }

        fn next_event(&self) -> CaptureEvent {
            self.events
                .recv_timeout(Duration::from_secs(2))
                .expect("no capture event")
        }

        fn wait_ingested(&self, frames: usize) {
            for _ in 0..400 {
                if self.counters.added.load(Ordering::SeqCst) >= frames {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            // The frame is retained just after the filter sees it
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn wait_until(done: impl Fn() -> bool) {
        for _ in 0..400 {
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn roomy() -> Config {
        let mut config = Config::default();
        config.accumulator.max_in_flight = 16;
        config
    }

    #[test]
    fn no_filter_passes_single_frame_through() {
        let f = fixture(roomy(), 1);
        f.accumulator.on_frame_available(f.frame(5));
        match f.next_event() {
            CaptureEvent::Result(result) => {
                assert_eq!(result.timestamp, 5);
                assert_eq!(result.filter, FilterId::None);
                assert_eq!(&result.bytes[..8], &[5u8; 8]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(f.released.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn filter_finalizes_after_required_frames() {
        let f = fixture(roomy(), 3);
        assert_eq!(f.accumulator.set_filter(FilterId::Average), FilterId::Average);
        assert_eq!(f.accumulator.status().state, AccumulatorState::Deinit);

        for ts in 100..103 {
            f.accumulator.on_frame_available(f.frame(ts));
        }
        match f.next_event() {
            CaptureEvent::Result(result) => {
                assert_eq!(result.timestamp, 100);
                assert_eq!(result.filter, FilterId::Average);
                assert_eq!(&result.bytes[..8], &[102u8; 8]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let status = f.accumulator.status();
        assert_eq!(status.state, AccumulatorState::Init);
        assert_eq!(status.ingested, 0);
        assert_eq!(f.counters.inits.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.added.load(Ordering::SeqCst), 3);
        assert_eq!(f.counters.finalized.load(Ordering::SeqCst), 1);
        assert_eq!(f.released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn frames_beyond_count_are_dropped() {
        let mut config = roomy();
        // Keep the watchdog out of the way
        config.watchdog.tick_ms = 1_000;
        let f = fixture(config, 2);
        f.accumulator.set_filter(FilterId::Average);

        // Hold the worker so all frames are admitted before any finalize
        let (gate_tx, gate_rx) = flume::bounded::<()>(0);
        assert!(f.accumulator.shared.worker.submit(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(2));
        }));
        for ts in 0..5 {
            f.accumulator.on_frame_available(f.frame(ts));
        }
        assert_eq!(f.released.load(Ordering::SeqCst), 3);
        assert_eq!(f.accumulator.status().ingested, 2);
        gate_tx.send(()).unwrap();

        assert!(matches!(f.next_event(), CaptureEvent::Result(_)));
        assert_eq!(f.counters.added.load(Ordering::SeqCst), 2);
        assert_eq!(f.accumulator.shared.context.metrics().frames_dropped, 3);
    }

    #[test]
    fn saturated_worker_drops_frames() {
        let mut config = Config::default();
        config.accumulator.max_in_flight = 1;
        let f = fixture(config, 4);
        f.accumulator.set_filter(FilterId::Average);

        let (gate_tx, gate_rx) = flume::bounded::<()>(0);
        assert!(f.accumulator.shared.worker.submit(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(2));
        }));
        f.accumulator.on_frame_available(f.frame(1));
        f.accumulator.on_frame_available(f.frame(2));
        assert_eq!(f.released.load(Ordering::SeqCst), 1);
        assert_eq!(f.accumulator.status().ingested, 1);
        gate_tx.send(()).unwrap();
    }

    #[test]
    fn unsupported_filter_falls_back_with_notice() {
        let f = fixture(roomy(), 1);
        assert_eq!(f.accumulator.set_filter(FilterId::Ubifocus), FilterId::None);
        assert_eq!(
            f.next_event(),
            CaptureEvent::Notice(Notice::FilterUnsupported {
                requested: FilterId::Ubifocus
            })
        );
        assert_eq!(f.accumulator.filter(), FilterId::None);
        assert_eq!(f.accumulator.status().required, 1);
    }

    #[test]
    fn set_filter_discards_partial_accumulation() {
        let mut config = roomy();
        config.watchdog.tick_ms = 1_000;
        let f = fixture(config, 3);
        f.accumulator.set_filter(FilterId::Average);
        f.accumulator.on_frame_available(f.frame(1));
        f.wait_ingested(1);

        f.accumulator.set_filter(FilterId::None);
        assert_eq!(f.released.load(Ordering::SeqCst), 1);
        // Deinit runs on the worker
        wait_until(|| f.counters.deinits.load(Ordering::SeqCst) == 1);
        assert_eq!(f.counters.deinits.load(Ordering::SeqCst), 1);
        let status = f.accumulator.status();
        assert_eq!(status.ingested, 0);
        assert_eq!(status.state, AccumulatorState::Deinit);
    }

    #[test]
    fn watchdog_resets_stalled_accumulation() {
        let mut config = roomy();
        config.watchdog.tick_ms = 5;
        config.watchdog.threshold_ticks = 4;
        let f = fixture(config, 3);
        f.accumulator.set_filter(FilterId::Average);
        f.accumulator.on_frame_available(f.frame(1));

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(f.counters.deinits.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(f.released.load(Ordering::SeqCst), 1);
        let status = f.accumulator.status();
        assert_eq!(status.filter, FilterId::Average);
        assert_eq!(status.ingested, 0);
        assert_eq!(f.accumulator.shared.context.metrics().watchdog_barks, 1);
    }

    #[test]
    fn queued_work_from_before_reset_is_discarded() {
        let mut config = roomy();
        config.watchdog.tick_ms = 1_000;
        let f = fixture(config, 2);
        f.accumulator.set_filter(FilterId::Average);

        let (gate_tx, gate_rx) = flume::bounded::<()>(0);
        assert!(f.accumulator.shared.worker.submit(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(2));
        }));
        f.accumulator.on_frame_available(f.frame(1));
        f.accumulator.on_frame_available(f.frame(2));
        assert_eq!(f.accumulator.status().ingested, 2);

        // Both ingest tasks and the finalize they would trigger are queued
        // behind the gate when the reset lands
        f.accumulator.shared.bark();
        gate_tx.send(()).unwrap();

        wait_until(|| f.released.load(Ordering::SeqCst) == 2);
        assert_eq!(f.released.load(Ordering::SeqCst), 2);
        assert!(f.events.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(f.counters.added.load(Ordering::SeqCst), 0);
        assert_eq!(f.counters.finalized.load(Ordering::SeqCst), 0);
        // The first instance was never primed, so nothing to undo
        assert_eq!(f.counters.inits.load(Ordering::SeqCst), 0);
        assert_eq!(f.counters.deinits.load(Ordering::SeqCst), 0);
        assert_eq!(f.accumulator.shared.context.metrics().frames_dropped, 2);

        // The restored instance starts a clean cycle
        f.accumulator.on_frame_available(f.frame(3));
        f.accumulator.on_frame_available(f.frame(4));
        match f.next_event() {
            CaptureEvent::Result(result) => {
                assert_eq!(result.timestamp, 3);
                assert_eq!(result.filter, FilterId::Average);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(f.counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(f.counters.inits.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.added.load(Ordering::SeqCst), 2);
        assert_eq!(f.counters.finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hung_filter_never_blocks_producer_or_swap() {
        let mut config = roomy();
        config.watchdog.tick_ms = 5;
        config.watchdog.threshold_ticks = 4;
        let f = fixture(config, 3);
        let (gate_tx, gate_rx) = flume::bounded::<()>(0);
        *f.counters.hold.lock() = Some(gate_rx);
        f.accumulator.set_filter(FilterId::Average);

        // The worker sits inside add_frame holding the filter lock
        f.accumulator.on_frame_available(f.frame(1));
        wait_until(|| f.accumulator.shared.context.metrics().watchdog_barks >= 1);
        assert!(f.accumulator.shared.context.metrics().watchdog_barks >= 1);

        let started = Instant::now();
        f.accumulator.on_frame_available(f.frame(2));
        assert_eq!(f.accumulator.set_filter(FilterId::None), FilterId::None);
        let status = f.accumulator.status();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(status.filter, FilterId::None);

        drop(gate_tx);
        wait_until(|| f.released.load(Ordering::SeqCst) == 2);
        assert_eq!(f.released.load(Ordering::SeqCst), 2);
        wait_until(|| f.counters.deinits.load(Ordering::SeqCst) == 1);
        assert_eq!(f.counters.deinits.load(Ordering::SeqCst), 1);

        // Worker is free again
        f.accumulator.on_frame_available(f.frame(3));
        match f.next_event() {
            CaptureEvent::Result(result) => assert_eq!(result.timestamp, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn close_releases_everything_once() {
        let mut config = roomy();
        config.watchdog.tick_ms = 1_000;
        let f = fixture(config, 4);
        f.accumulator.set_filter(FilterId::Average);
        for ts in 0..2 {
            f.accumulator.on_frame_available(f.frame(ts));
        }
        f.accumulator.close();
        f.accumulator.close();
        assert_eq!(f.released.load(Ordering::SeqCst), 2);
        assert!(f.accumulator.status().closed);

        f.accumulator.on_frame_available(f.frame(9));
        assert_eq!(f.released.load(Ordering::SeqCst), 3);
        assert_eq!(f.accumulator.set_filter(FilterId::Average), FilterId::None);
    }
}
