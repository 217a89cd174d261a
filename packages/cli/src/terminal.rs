// ABOUTME: Local terminal transport for interactive consoles
// ABOUTME: Turns stdin into inbound frames and writes decoded outbound frames to stdout

use boxcode_sandbox::bridge::decode_chunk;
use boxcode_sandbox::{Frame, SandboxError, TerminalSize};
use futures::{Sink, Stream, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Frames read from `reader`, followed by a close once it reaches end of file
pub fn input_frames<R>(reader: R) -> impl Stream<Item = io::Result<Frame>> + Send + Unpin + 'static
where
    R: AsyncRead + Send + Unpin + 'static,
{
    ReaderStream::new(reader)
        .map(|chunk| chunk.map(|bytes| Frame::Binary(bytes.to_vec())))
        .chain(futures::stream::iter([Ok(Frame::Close)]))
}

/// Sink that decodes output frames and writes the raw bytes to `writer`
pub fn output_sink<W>(writer: W) -> impl Sink<Frame, Error = SandboxError> + Send + Unpin + 'static
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Box::pin(futures::sink::unfold(
        writer,
        |mut writer, frame: Frame| async move {
            let bytes = match frame {
                Frame::Text(text) => decode_chunk(&text)?,
                Frame::Binary(bytes) => bytes,
                Frame::Close => {
                    debug!("Output transport closed");
                    return Ok(writer);
                }
            };
            writer
                .write_all(&bytes)
                .await
                .map_err(|e| SandboxError::Transport(e.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|e| SandboxError::Transport(e.to_string()))?;
            Ok::<_, SandboxError>(writer)
        },
    ))
}

/// Size of the controlling terminal, if there is one
pub fn current_size() -> Option<TerminalSize> {
    crossterm::terminal::size()
        .ok()
        .filter(|(cols, rows)| *cols > 0 && *rows > 0)
        .map(|(cols, rows)| TerminalSize::new(rows, cols))
}

/// Puts the local terminal in raw mode so keystrokes reach the sandbox's TTY
/// unprocessed. Restored on drop.
pub struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    pub fn enable() -> Self {
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Self { enabled: true },
            Err(e) => {
                debug!("Raw mode unavailable: {}", e);
                Self { enabled: false }
            }
        }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}
