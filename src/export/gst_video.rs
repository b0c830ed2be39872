//! H.264/MP4 video through GStreamer: an appsrc encode pipeline and appsink readers

use std::path::Path;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::Burst;
use crate::capture::frame::PixelFormat;
use crate::error::ExportError;

/// Constant x264 quantizer; low enough to be visually lossless on sensor data
pub const QUANTIZER: u32 = 16;

/// Seconds an appsink may stay silent before a reader gives up
const IDLE_LIMIT_SECS: u64 = 10;

fn pipeline_err(context: &str, err: impl std::fmt::Debug) -> ExportError {
    ExportError::Pipeline(format!("{context}: {err:?}"))
}

fn launch(description: &str) -> Result<gst::Pipeline, ExportError> {
    gst::init().map_err(|e| pipeline_err("init", e))?;
    debug!("Pipeline: {}", description);
    gst::parse::launch(description)
        .map_err(|e| pipeline_err("parse", e))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| ExportError::Pipeline("launch did not produce a pipeline".into()))
}

fn stop(pipeline: &gst::Pipeline) {
    if let Err(e) = pipeline.set_state(gst::State::Null) {
        warn!("failed to stop video pipeline: {e}");
    }
}

fn raw_format(format: PixelFormat) -> gst_video::VideoFormat {
    if format.channels() == 3 {
        gst_video::VideoFormat::Rgb
    } else {
        gst_video::VideoFormat::Gray8
    }
}

fn encode_description(path: &Path) -> String {
    format!(
        "appsrc name=src format=time block=true ! videoconvert ! video/x-raw,format=I420 ! \
         x264enc speed-preset=medium pass=quant quantizer={QUANTIZER} ! h264parse ! \
         mp4mux faststart=true ! filesink location=\"{}\"",
        path.display()
    )
}

/// Push every frame of `burst` through x264 and mux it into `path`
pub fn write_h264(burst: &Burst, path: &Path, playback_fps: u32) -> Result<(), ExportError> {
    let pipeline = launch(&encode_description(path))?;

    let (width, height) = (burst.snapshot.width, burst.snapshot.height);
    let format = raw_format(burst.snapshot.pixel_format);
    let video_info = gst_video::VideoInfo::builder(format, width, height)
        .fps(gst::Fraction::new(to_i32(playback_fps)?, 1))
        .build()
        .map_err(|e| pipeline_err("caps", e))?;
    let caps = video_info.to_caps().map_err(|e| pipeline_err("caps", e))?;

    let appsrc = pipeline
        .by_name("src")
        .and_then(|element| element.downcast::<gst_app::AppSrc>().ok())
        .ok_or_else(|| ExportError::Pipeline("appsrc missing".into()))?;
    appsrc.set_caps(Some(&caps));

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| pipeline_err("start", e))?;
    info!(width, height, fps = playback_fps, "encoding H.264");

    let result = push_frames(&pipeline, &appsrc, &video_info, burst, playback_fps);
    stop(&pipeline);
    result
}

fn push_frames(
    pipeline: &gst::Pipeline,
    appsrc: &gst_app::AppSrc,
    video_info: &gst_video::VideoInfo,
    burst: &Burst,
    playback_fps: u32,
) -> Result<(), ExportError> {
    let channels = usize::from(burst.snapshot.pixel_format.channels());
    let row_bytes = video_info.width() as usize * channels;
    let stride = plane_stride(video_info)?;
    let offset = video_info.offset().first().copied().unwrap_or(0);
    let frame_ns = 1_000_000_000 / u64::from(playback_fps.max(1));

    for (index, frame) in burst.frames.iter().enumerate() {
        let packed = pack_rows(&frame.image.data, row_bytes, stride, offset, video_info.size());
        let mut buffer = gst::Buffer::from_mut_slice(packed);
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds(index as u64 * frame_ns));
            buffer.set_duration(gst::ClockTime::from_nseconds(frame_ns));
        }
        appsrc
            .push_buffer(buffer)
            .map_err(|e| pipeline_err("push", e))?;
    }
    appsrc
        .end_of_stream()
        .map_err(|e| pipeline_err("eos", e))?;

    let bus = pipeline
        .bus()
        .ok_or_else(|| ExportError::Pipeline("pipeline has no bus".into()))?;
    for msg in bus.iter_timed(gst::ClockTime::NONE) {
        match msg.view() {
            gst::MessageView::Eos(..) => return Ok(()),
            gst::MessageView::Error(err) => {
                return Err(ExportError::Pipeline(format!(
                    "{} ({:?})",
                    err.error(),
                    err.debug()
                )));
            }
            _ => {}
        }
    }
    Err(ExportError::Pipeline("bus closed before end of stream".into()))
}

fn to_i32(value: u32) -> Result<i32, ExportError> {
    i32::try_from(value).map_err(|e| pipeline_err("fps", e))
}

fn plane_stride(video_info: &gst_video::VideoInfo) -> Result<usize, ExportError> {
    video_info
        .stride()
        .first()
        .and_then(|stride| usize::try_from(*stride).ok())
        .ok_or_else(|| ExportError::Pipeline("caps without a first plane stride".into()))
}

/// Lay tightly packed rows out at the plane stride the caps announce
fn pack_rows(src: &[u8], row_bytes: usize, stride: usize, offset: usize, size: usize) -> Vec<u8> {
    let mut packed = vec![0u8; size];
    for (row, line) in src.chunks_exact(row_bytes).enumerate() {
        let start = offset + row * stride;
        if let Some(dest) = packed.get_mut(start..start + row_bytes) {
            dest.copy_from_slice(line);
        }
    }
    packed
}

fn unpack_rows(plane: &[u8], row_bytes: usize, height: usize, stride: usize) -> Vec<u8> {
    let mut rows = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        if let Some(line) = plane.get(start..start + row_bytes) {
            rows.extend_from_slice(line);
        }
    }
    rows
}

/// Stream facts of an exported clip, read back from the container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mp4Summary {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames: usize,
    /// Independently decodable samples; fewer than `frames` for inter-frame coded video
    pub keyframes: usize,
}

/// Demux an H.264 MP4 and count its samples without decoding them
pub fn read_h264_mp4(path: &Path) -> Result<Mp4Summary, ExportError> {
    let description = format!(
        "filesrc location=\"{}\" ! qtdemux ! h264parse ! appsink name=sink sync=false",
        path.display()
    );
    let mut summary = Mp4Summary::default();
    pull_samples(&description, |sample| {
        if summary.frames == 0 {
            let caps = sample
                .caps()
                .ok_or_else(|| ExportError::Pipeline("sample without caps".into()))?;
            let structure = caps
                .structure(0)
                .ok_or_else(|| ExportError::Pipeline("empty caps".into()))?;
            let dimension = |name: &str| -> Result<u32, ExportError> {
                let value = structure.get::<i32>(name).map_err(|e| pipeline_err(name, e))?;
                u32::try_from(value).map_err(|e| pipeline_err(name, e))
            };
            summary.width = dimension("width")?;
            summary.height = dimension("height")?;
            let rate = structure
                .get::<gst::Fraction>("framerate")
                .map_err(|e| pipeline_err("framerate", e))?;
            summary.fps = f64::from(rate.numer()) / f64::from(rate.denom().max(1));
        }

        let buffer = sample
            .buffer()
            .ok_or_else(|| ExportError::Pipeline("sample without buffer".into()))?;
        summary.frames += 1;
        if !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT) {
            summary.keyframes += 1;
        }
        Ok(())
    })?;
    Ok(summary)
}

/// Decode an exported clip back to tightly packed 8-bit frames laid out like `format`
pub fn decode_mp4(path: &Path, format: PixelFormat) -> Result<Vec<Vec<u8>>, ExportError> {
    let raw = match raw_format(format) {
        gst_video::VideoFormat::Rgb => "RGB",
        _ => "GRAY8",
    };
    let description = format!(
        "filesrc location=\"{}\" ! decodebin ! videoconvert ! video/x-raw,format={raw} ! \
         appsink name=sink sync=false",
        path.display()
    );
    let channels = usize::from(format.channels());
    let mut frames = Vec::new();
    pull_samples(&description, |sample| {
        let caps = sample
            .caps()
            .ok_or_else(|| ExportError::Pipeline("sample without caps".into()))?;
        let video_info =
            gst_video::VideoInfo::from_caps(caps).map_err(|e| pipeline_err("caps", e))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| ExportError::Pipeline("sample without buffer".into()))?;
        let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &video_info)
            .map_err(|e| pipeline_err("map", e))?;
        let stride = frame
            .plane_stride()
            .first()
            .and_then(|stride| usize::try_from(*stride).ok())
            .ok_or_else(|| ExportError::Pipeline("frame without a first plane".into()))?;
        let plane = frame.plane_data(0).map_err(|e| pipeline_err("plane", e))?;
        frames.push(unpack_rows(
            plane,
            video_info.width() as usize * channels,
            video_info.height() as usize,
            stride,
        ));
        Ok(())
    })?;
    Ok(frames)
}

/// Run a pipeline ending in `appsink name=sink` to EOS, handing every sample to `on_sample`
fn pull_samples<F>(description: &str, mut on_sample: F) -> Result<(), ExportError>
where
    F: FnMut(&gst::Sample) -> Result<(), ExportError>,
{
    let pipeline = launch(description)?;
    let appsink = pipeline
        .by_name("sink")
        .and_then(|element| element.downcast::<gst_app::AppSink>().ok())
        .ok_or_else(|| ExportError::Pipeline("appsink missing".into()))?;
    if let Err(e) = pipeline.set_state(gst::State::Playing) {
        stop(&pipeline);
        return Err(pipeline_err("start", e));
    }

    let result = drain_sink(&pipeline, &appsink, &mut on_sample);
    stop(&pipeline);
    result
}

fn drain_sink<F>(
    pipeline: &gst::Pipeline,
    appsink: &gst_app::AppSink,
    on_sample: &mut F,
) -> Result<(), ExportError>
where
    F: FnMut(&gst::Sample) -> Result<(), ExportError>,
{
    let mut idle = 0;
    loop {
        if let Some(sample) = appsink.try_pull_sample(gst::ClockTime::from_seconds(1)) {
            idle = 0;
            on_sample(&sample)?;
            continue;
        }
        if appsink.is_eos() {
            return Ok(());
        }
        if let Some(msg) = pipeline
            .bus()
            .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]))
        {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(ExportError::Pipeline(format!(
                    "{} ({:?})",
                    err.error(),
                    err.debug()
                )));
            }
        }
        idle += 1;
        if idle >= IDLE_LIMIT_SECS {
            return Err(ExportError::Pipeline(format!(
                "no samples for {IDLE_LIMIT_SECS} s and no end of stream"
            )));
        }
    }
}
