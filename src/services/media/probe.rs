//! Audio duration probing.
//!
//! Reads just enough of the container to compute the media duration stored
//! on each task. Decoding happens engine-side; only the format headers are
//! inspected here.

use std::fs::File;
use std::path::Path;

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::probe::Hint;
use symphonia::default::get_probe;

use crate::error::WhisperdError;
use crate::Result;

/// Probe the duration of a media file in seconds.
///
/// # Errors
///
/// Fails when the container cannot be parsed, carries no audio track, or
/// does not declare enough timing information to compute a duration.
pub fn probe_duration(path: &Path) -> Result<f64> {
    let file = File::open(path).map_err(|e| {
        WhisperdError::audio_probe(format!("failed to open {}: {}", path.display(), e))
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = get_probe()
        .format(&hint, mss, &Default::default(), &Default::default())
        .map_err(|e| WhisperdError::audio_probe(format!("format probe error: {}", e)))?;

    let format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| WhisperdError::audio_probe("no audio track found"))?;

    let params = &track.codec_params;
    if let (Some(time_base), Some(n_frames)) = (params.time_base, params.n_frames) {
        let time = time_base.calc_time(n_frames);
        return Ok(time.seconds as f64 + time.frac);
    }
    if let (Some(n_frames), Some(sample_rate)) = (params.n_frames, params.sample_rate) {
        return Ok(n_frames as f64 / sample_rate as f64);
    }
    Err(WhisperdError::audio_probe(
        "container does not declare a duration",
    ))
}

/// Async wrapper; probing is blocking I/O and runs off the async threads.
pub async fn probe_duration_async(path: &Path) -> Result<f64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || probe_duration(&path))
        .await
        .map_err(|e| WhisperdError::audio_probe(format!("probe task failed: {}", e)))?
}
