//! Post-capture pipeline demo driven by a synthetic camera

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use color_eyre::Result;
use tracing::{debug, info, warn};

use postcapture::capture::SyntheticSource;
use postcapture::{
    AeState, CaptureEvent, Config, FilterId, FilterRegistry, FrameSlot, JpegEncoder,
    PipelineContext, PostProcessor,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("postcapture=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Postcapture launching...");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    info!(?config, "Configuration loaded");

    let context = PipelineContext::new(config.clone());
    let registry = FilterRegistry::with_builtin(&config.filters);
    let (tx, rx) = flume::unbounded::<CaptureEvent>();
    let processor = PostProcessor::new(
        context.clone(),
        registry,
        Arc::new(JpegEncoder::new(&config.encoder)),
        Arc::new(tx),
    );
    let mut source = SyntheticSource::new(WIDTH, HEIGHT).with_padding(64);

    // Single shot served from the ZSL buffer
    processor.open(FilterId::None, false, false)?;
    stream(&processor, &mut source, 8)?;
    processor.take_picture()?;
    report(&rx);

    // Multi-frame filter, frames go straight to the accumulator
    let filter = processor.set_filter(FilterId::Average)?;
    info!(%filter, status = ?processor.status(), "Filter mode");
    stream(&processor, &mut source, config.filters.average_frames)?;
    report(&rx);

    processor.close();
    info!(
        outstanding = source.outstanding(),
        metrics = ?context.metrics(),
        "Postcapture shutting down"
    );
    Ok(())
}

/// Run `frames` captures through a single-slot hand-off, the way a camera
/// callback thread delivers to the pipeline
fn stream(processor: &PostProcessor, source: &mut SyntheticSource, frames: usize) -> Result<()> {
    let slot = FrameSlot::new();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| loop {
            match slot.take() {
                Some(frame) => processor.on_frame_available(frame),
                None if done.load(Ordering::Acquire) => {
                    if let Some(frame) = slot.take() {
                        processor.on_frame_available(frame);
                    }
                    break;
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        });

        let produced = (|| -> Result<()> {
            for _ in 0..frames {
                let (frame, metadata) = source.capture(AeState::Converged)?;
                processor.on_metadata_available(metadata);
                if slot.offer(frame) {
                    debug!("Delivery lagging, frame coalesced");
                }
                thread::sleep(Duration::from_millis(33));
            }
            Ok(())
        })();
        done.store(true, Ordering::Release);
        produced
    })
}

fn report(rx: &flume::Receiver<CaptureEvent>) {
    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(CaptureEvent::Result(result)) => info!(
            format = result.format,
            bytes = result.bytes.len(),
            width = result.width,
            height = result.height,
            filter = %result.filter,
            "Capture complete"
        ),
        Ok(CaptureEvent::Failure(reason)) => warn!(?reason, "Capture failed"),
        Ok(CaptureEvent::Notice(notice)) => info!(?notice, "Capture notice"),
        Err(_) => warn!("No capture result"),
    }
}
