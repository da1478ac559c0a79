use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory, FlowError};
use gstreamer_app::{AppSink, AppSinkCallbacks};
use sharecast_protocol::CaptureConfig;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::{CaptureEngine, CaptureStopSignal, EncodedFrame, FrameSource, PermissionGrant};

/// Encoded frames buffered between the appsink and the peer. Older frames
/// are dropped when the peer falls behind.
const FRAME_QUEUE: usize = 4;

const BUS_POLL: ClockTime = ClockTime::from_mseconds(100);
const START_TIMEOUT: ClockTime = ClockTime::from_seconds(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderType {
    Nvidia,
    VaApi,
    Software,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: u32,
    pub encoder: Option<String>,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(c: &CaptureConfig) -> Self {
        Self {
            width: c.width,
            height: c.height,
            framerate: c.framerate,
            bitrate: c.bitrate,
            encoder: c.encoder.clone(),
        }
    }
}

struct RunningPipeline {
    pipeline: gst::Pipeline,
    shutdown: Arc<AtomicBool>,
    bus_thread: Option<JoinHandle<()>>,
}

/// X11 screen capture through GStreamer:
/// `ximagesrc → videoscale → videoconvert → caps → H.264 encoder → h264parse → appsink`.
///
/// The permission grant names the X display to capture.
pub struct GstCaptureEngine {
    settings: CaptureSettings,
    running: Mutex<Option<RunningPipeline>>,
    grant: Mutex<Option<PermissionGrant>>,
}

impl GstCaptureEngine {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            running: Mutex::new(None),
            grant: Mutex::new(None),
        }
    }
}

impl CaptureEngine for GstCaptureEngine {
    fn start(
        &self,
        grant: &PermissionGrant,
        on_stop: CaptureStopSignal,
    ) -> anyhow::Result<FrameSource> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            bail!("Capture already running");
        }
        *self.grant.lock().unwrap_or_else(|e| e.into_inner()) = Some(grant.clone());

        let s = &self.settings;
        let (encoder_type, encoder_name) = detect_encoder(s.encoder.as_deref())?;
        info!(
            ?encoder_type,
            encoder_name,
            display = grant.token(),
            width = s.width,
            height = s.height,
            framerate = s.framerate,
            bitrate = s.bitrate,
            "Creating capture pipeline"
        );

        let (frame_tx, frames) = mpsc::channel(FRAME_QUEUE);
        let (pipeline, appsink) = build_pipeline(s, grant.token(), encoder_type, &encoder_name)?;

        let frame_duration = Duration::from_secs(1) / s.framerate.max(1);
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    let duration = buffer
                        .duration()
                        .map(|d| Duration::from_nanos(d.nseconds()))
                        .unwrap_or(frame_duration);
                    // Full queue or no consumer yet: drop the frame.
                    let _ = frame_tx.try_send(EncodedFrame {
                        data: Bytes::copy_from_slice(&map),
                        duration,
                    });
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        if let Err(e) = start_playing(&pipeline) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(e);
        }

        let keyframe_request = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));
        let bus = pipeline.bus().context("Failed to get pipeline bus")?;
        let bus_thread = std::thread::Builder::new()
            .name("capture-bus".into())
            .spawn({
                let shutdown = Arc::clone(&shutdown);
                let keyframe_request = Arc::clone(&keyframe_request);
                let sink: gst::Element = appsink.upcast();
                move || watch_bus(bus, sink, shutdown, keyframe_request, on_stop)
            })
            .context("Failed to spawn capture bus thread");
        let bus_thread = match bus_thread {
            Ok(handle) => handle,
            Err(e) => {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(e);
            }
        };

        *running = Some(RunningPipeline {
            pipeline,
            shutdown,
            bus_thread: Some(bus_thread),
        });
        info!("Capture pipeline playing");

        Ok(FrameSource {
            frames,
            keyframe_request,
            width: s.width,
            height: s.height,
            framerate: s.framerate,
        })
    }

    fn stop(&self) -> anyhow::Result<()> {
        let Some(mut running) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            debug!("Capture pipeline not running");
            return Ok(());
        };

        running.shutdown.store(true, Ordering::SeqCst);
        let result = running
            .pipeline
            .set_state(gst::State::Null)
            .map(|_| ())
            .context("Failed to set capture pipeline to Null");
        if let Some(handle) = running.bus_thread.take()
            && handle.join().is_err()
        {
            warn!("Capture bus thread panicked");
        }
        info!("Capture pipeline stopped");
        result
    }

    fn release_permission(&self) -> anyhow::Result<()> {
        if let Some(grant) = self.grant.lock().unwrap_or_else(|e| e.into_inner()).take() {
            info!(display = grant.token(), "Capture grant released");
        }
        Ok(())
    }
}

fn start_playing(pipeline: &gst::Pipeline) -> anyhow::Result<()> {
    pipeline
        .set_state(gst::State::Playing)
        .context("Failed to set capture pipeline to Playing")?;
    let (result, current, _) = pipeline.state(START_TIMEOUT);
    result.context("Capture pipeline failed to start")?;
    if current != gst::State::Playing {
        bail!("Capture pipeline stuck in {current:?}");
    }
    Ok(())
}

/// Caps between the scaler and the encoder. No colorimetry: it ends up in the
/// SPS VUI and browsers reject the stream.
fn raw_caps(s: &CaptureSettings) -> gst::Caps {
    gst::Caps::builder("video/x-raw")
        .field("width", s.width as i32)
        .field("height", s.height as i32)
        .field("framerate", gst::Fraction::new(s.framerate as i32, 1))
        .build()
}

fn build_pipeline(
    s: &CaptureSettings,
    display: &str,
    encoder_type: EncoderType,
    encoder_name: &str,
) -> anyhow::Result<(gst::Pipeline, AppSink)> {
    let pipeline = gst::Pipeline::new();

    let source = ElementFactory::make("ximagesrc")
        .property("display-name", display)
        .property("use-damage", false)
        .property("show-pointer", true)
        .build()
        .context("Failed to create ximagesrc")?;
    let scale = ElementFactory::make("videoscale")
        .build()
        .context("Failed to create videoscale")?;
    let convert = ElementFactory::make("videoconvert")
        .build()
        .context("Failed to create videoconvert")?;
    let raw_filter = ElementFactory::make("capsfilter")
        .property("caps", raw_caps(s))
        .build()
        .context("Failed to create raw capsfilter")?;

    let encoder = build_encoder_element(encoder_type, encoder_name, s.bitrate)?;

    // Constrained baseline to match the only profile the peer offers.
    let profile_caps = gst::Caps::builder("video/x-h264")
        .field("profile", "constrained-baseline")
        .build();
    let profile_filter = ElementFactory::make("capsfilter")
        .property("caps", &profile_caps)
        .build()
        .context("Failed to create profile capsfilter")?;

    // SPS/PPS with every keyframe, Annex B access units for the RTP packetizer.
    let parser = ElementFactory::make("h264parse")
        .property_from_str("config-interval", "-1")
        .build()
        .context("Failed to create h264parse")?;
    let parse_caps = gst::Caps::builder("video/x-h264")
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .build();
    let parse_filter = ElementFactory::make("capsfilter")
        .property("caps", &parse_caps)
        .build()
        .context("Failed to create h264parse output capsfilter")?;

    let appsink = ElementFactory::make("appsink")
        .name("sink")
        .property("sync", false)
        .property("emit-signals", true)
        .property("max-buffers", 1u32)
        .property("drop", true)
        .build()
        .context("Failed to create appsink")?
        .dynamic_cast::<AppSink>()
        .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

    let elements = [
        &source,
        &scale,
        &convert,
        &raw_filter,
        &encoder,
        &profile_filter,
        &parser,
        &parse_filter,
        appsink.upcast_ref(),
    ];
    pipeline
        .add_many(elements)
        .context("Failed to add elements to capture pipeline")?;
    gst::Element::link_many(elements).context("Failed to link capture pipeline")?;

    Ok((pipeline, appsink))
}

/// Poll the bus until shutdown. EOS and errors end the capture and are
/// reported once through `on_stop`; keyframe requests are forwarded upstream
/// to the encoder.
fn watch_bus(
    bus: gst::Bus,
    sink: gst::Element,
    shutdown: Arc<AtomicBool>,
    keyframe_request: Arc<AtomicBool>,
    on_stop: CaptureStopSignal,
) {
    while !shutdown.load(Ordering::SeqCst) {
        if keyframe_request.swap(false, Ordering::Relaxed) {
            let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            if sink.send_event(event) {
                debug!("Forced IDR keyframe");
            }
        }

        let Some(msg) = bus.timed_pop(BUS_POLL) else {
            continue;
        };
        use gst::MessageView;
        match msg.view() {
            MessageView::Eos(_) => {
                info!("Capture pipeline reached end of stream");
                on_stop.fire("end of stream");
                return;
            }
            MessageView::Error(err) => {
                error!(
                    source = ?err.src().map(|s| s.name().to_string()),
                    error = %err.error(),
                    debug = ?err.debug(),
                    "Capture pipeline error"
                );
                on_stop.fire(format!("pipeline error: {}", err.error()));
                return;
            }
            MessageView::Warning(w) => {
                warn!(
                    source = ?w.src().map(|s| s.name().to_string()),
                    warning = %w.error(),
                    "Capture pipeline warning"
                );
            }
            _ => {}
        }
    }
}

/// `ElementFactory::find()` only checks the plugin registry; the element may
/// still fail to build when the hardware driver is missing.
fn can_instantiate(name: &str) -> bool {
    match ElementFactory::make(name).build() {
        Ok(elem) => {
            let _ = elem.set_state(gst::State::Null);
            true
        }
        Err(_) => false,
    }
}

fn encoder_type_for(name: &str) -> Option<EncoderType> {
    match name {
        "nvh264enc" => Some(EncoderType::Nvidia),
        "vah264enc" => Some(EncoderType::VaApi),
        "x264enc" => Some(EncoderType::Software),
        _ => None,
    }
}

fn detect_encoder(preferred: Option<&str>) -> anyhow::Result<(EncoderType, String)> {
    if let Some(pref) = preferred {
        let Some(enc_type) = encoder_type_for(pref) else {
            bail!("Unknown encoder: {pref}. Use nvh264enc, vah264enc, or x264enc.");
        };
        if can_instantiate(pref) {
            info!(encoder = pref, "Using preferred encoder from config");
            return Ok((enc_type, pref.to_string()));
        }
        warn!(
            encoder = pref,
            "Preferred encoder not available, falling back to auto-detect"
        );
    }

    for name in ["nvh264enc", "vah264enc", "x264enc"] {
        if let Some(enc_type) = encoder_type_for(name)
            && can_instantiate(name)
        {
            info!(encoder = name, "Found working encoder");
            return Ok((enc_type, name.to_string()));
        }
        debug!(encoder = name, "Encoder not available, trying next");
    }

    bail!("No H.264 encoder found. Install gstreamer plugins (good/bad/ugly).")
}

fn build_encoder_element(
    encoder_type: EncoderType,
    name: &str,
    bitrate: u32,
) -> anyhow::Result<gst::Element> {
    let elem = match encoder_type {
        EncoderType::Nvidia => ElementFactory::make(name)
            .property_from_str("preset", "low-latency-hq")
            .property_from_str("rc-mode", "cbr")
            .property("bitrate", bitrate)
            .property("zerolatency", true)
            .property("bframes", 0u32)
            .build()
            .context("Failed to create nvh264enc")?,
        EncoderType::VaApi => ElementFactory::make(name)
            .property_from_str("rate-control", "cbr")
            .property("bitrate", bitrate)
            .property("key-int-max", 60u32)
            .build()
            .context("Failed to create vah264enc")?,
        EncoderType::Software => ElementFactory::make(name)
            .property_from_str("tune", "zerolatency")
            .property_from_str("speed-preset", "ultrafast")
            .property("bitrate", bitrate)
            .property("key-int-max", 30u32)
            .property("bframes", 0u32)
            .build()
            .context("Failed to create x264enc")?,
    };

    Ok(elem)
}
