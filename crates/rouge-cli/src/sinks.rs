//! Frame sinks for the `live` command.

use rouge_core::Frame;
use rouge_session::{FrameSink, SinkError};
use std::io::Write;
use std::path::PathBuf;

/// Writes every presented frame as `frame_NNNNNN.png` into a directory.
pub struct PngDirSink {
    dir: PathBuf,
    written: u64,
    limit: Option<u64>,
}

impl PngDirSink {
    pub fn create(dir: PathBuf, limit: Option<u64>) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            written: 0,
            limit,
        })
    }
}

impl FrameSink for PngDirSink {
    fn present(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.limit.is_some_and(|limit| self.written >= limit) {
            return Ok(());
        }
        let path = self.dir.join(format!("frame_{:06}.png", self.written));
        let img = frame
            .clone()
            .into_image()
            .ok_or_else(|| SinkError::Encode("frame buffer does not match its dimensions".into()))?;
        img.save(&path)
            .map_err(|e| SinkError::Encode(format!("{}: {e}", path.display())))?;
        self.written += 1;
        Ok(())
    }
}

impl Drop for PngDirSink {
    fn drop(&mut self) {
        tracing::info!(dir = %self.dir.display(), frames = self.written, "png sink closed");
    }
}

/// Streams raw RGBA bytes to stdout (e.g. piped into ffplay/ffmpeg).
pub struct RawStdoutSink {
    out: std::io::Stdout,
}

impl Default for RawStdoutSink {
    fn default() -> Self {
        Self { out: std::io::stdout() }
    }
}

impl FrameSink for RawStdoutSink {
    fn present(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let mut out = self.out.lock();
        match out.write_all(&frame.data).and_then(|()| out.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(SinkError::Closed),
            Err(e) => Err(e.into()),
        }
    }
}
