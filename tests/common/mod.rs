#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use postcapture::filter::FrameExtra;
use postcapture::{
    CaptureEvent, Config, Filter, FilterId, FilterRegistry, FrameGeometry, PipelineContext,
    PixelFormat, Plane, PostProcessor, RawEncoder, RawFrame, ResultImage,
};

/// Call counts shared between a [`CountingFilter`] factory and its test
#[derive(Default)]
pub struct Calls {
    pub created: AtomicUsize,
    pub added: AtomicUsize,
    pub finalized: AtomicUsize,
    pub deinits: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Emits the luma of the last frame it was given
pub struct CountingFilter {
    required: usize,
    calls: Arc<Calls>,
    geometry: Option<FrameGeometry>,
    luma: Vec<u8>,
    chroma: Vec<u8>,
}

impl Filter for CountingFilter {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn required_frame_count(&self) -> usize {
        self.required
    }

    fn init(&mut self, geometry: FrameGeometry) {
        self.geometry = Some(geometry);
    }

    fn add_frame(&mut self, luma: &[u8], chroma: &[u8], _index: usize, _extra: &FrameExtra) {
        self.luma = luma.to_vec();
        self.chroma = chroma.to_vec();
        self.calls.added.fetch_add(1, Ordering::SeqCst);
    }

    fn finalize(&mut self) -> Option<ResultImage> {
        self.calls.finalized.fetch_add(1, Ordering::SeqCst);
        let g = self.geometry?;
        Some(ResultImage::packed(
            self.luma.clone(),
            &self.chroma,
            g.width,
            g.height,
            PixelFormat::Nv21,
        ))
    }

    fn deinit(&mut self) {
        self.calls.deinits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Registry whose `Average` slot builds a [`CountingFilter`]
pub fn counting_registry(required: usize) -> (FilterRegistry, Arc<Calls>) {
    let calls = Arc::new(Calls::default());
    let mut registry = FilterRegistry::empty();
    let c = calls.clone();
    registry.register(FilterId::Average, move || {
        c.created.fetch_add(1, Ordering::SeqCst);
        Box::new(CountingFilter {
            required,
            calls: c.clone(),
            geometry: None,
            luma: Vec::new(),
            chroma: Vec::new(),
        }) as Box<dyn Filter>
    });
    (registry, calls)
}

pub struct Harness {
    pub processor: PostProcessor,
    pub context: Arc<PipelineContext>,
    pub events: flume::Receiver<CaptureEvent>,
}

pub fn harness(config: Config, registry: FilterRegistry) -> Harness {
    let context = PipelineContext::new(config);
    let (tx, events) = flume::unbounded();
    Harness {
        processor: PostProcessor::new(
            context.clone(),
            registry,
            Arc::new(RawEncoder),
            Arc::new(tx),
        ),
        context,
        events,
    }
}

impl Harness {
    pub fn next_event(&self) -> Option<CaptureEvent> {
        self.events.recv_timeout(Duration::from_secs(2)).ok()
    }
}

/// Config with room for every frame in flight and a watchdog that stays
/// quiet for the duration of a test
pub fn quiet_config() -> Config {
    let mut config = Config::default();
    config.accumulator.max_in_flight = 64;
    config.watchdog.tick_ms = 1_000;
    config.watchdog.threshold_ticks = 60;
    config
}

/// Tightly packed 4x2 NV21 frame whose luma is filled with `fill`
pub fn tiny_frame(ts: i64, fill: u8, released: &Arc<AtomicUsize>) -> RawFrame {
    let released = released.clone();
    RawFrame::new(
        4,
        2,
        PixelFormat::Nv21,
        Plane::new(vec![fill; 8], 4),
        Plane::new(vec![128u8; 4], 4),
        ts,
    )
    .expect("valid frame")
    .with_release(move || {
        released.fetch_add(1, Ordering::SeqCst);
    })
}

pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
