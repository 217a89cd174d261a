// ABOUTME: Bidirectional I/O bridge between an attached process stream and a message transport
// ABOUTME: Inbound frames are written raw; outbound bytes are chunked and base64 encoded

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::runtime::AttachedStream;
use crate::settings::DEFAULT_OUTPUT_CHUNK_SIZE;

/// Transport-level message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Encode one chunk of process output for a text transport
pub fn encode_chunk(chunk: &[u8]) -> String {
    STANDARD.encode(chunk)
}

pub fn decode_chunk(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| SandboxError::Transport(format!("invalid output frame: {}", e)))
}

/// Runs at most once, whichever direction notices the transport closing first
pub struct CloseHook {
    fired: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl CloseHook {
    pub fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            callback: Box::new(callback),
        })
    }

    pub fn noop() -> Arc<Self> {
        Self::new(|| {})
    }

    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.callback)();
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// What a pump moved before it ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub messages: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct IoBridge {
    chunk_size: usize,
}

impl Default for IoBridge {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_CHUNK_SIZE)
    }
}

impl IoBridge {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Spawn the inbound and outbound pumps.
    ///
    /// `on_close` fires when the transport closes or fails in either
    /// direction. It does not fire when the process side ends.
    pub fn spawn<S, E, K>(
        &self,
        stream: AttachedStream,
        inbound: S,
        outbound: K,
        on_close: Arc<CloseHook>,
    ) -> BridgeHandle
    where
        S: Stream<Item = std::result::Result<Frame, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
        K: Sink<Frame> + Send + Unpin + 'static,
        K::Error: Display + Send,
    {
        let AttachedStream { output, input } = stream;

        let inbound = tokio::spawn(pump_inbound(inbound, input, on_close.clone()));
        let outbound = tokio::spawn(pump_outbound(output, outbound, self.chunk_size, on_close));

        BridgeHandle { inbound, outbound }
    }
}

/// Join handle over both pumps
pub struct BridgeHandle {
    inbound: JoinHandle<PumpStats>,
    outbound: JoinHandle<PumpStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub inbound: PumpStats,
    pub outbound: PumpStats,
}

impl BridgeHandle {
    /// Wait for both pumps to end on their own
    pub async fn join(self) -> BridgeStats {
        let inbound = join_pump("inbound", self.inbound).await;
        let outbound = join_pump("outbound", self.outbound).await;
        BridgeStats { inbound, outbound }
    }

    /// End the bridge after the process has exited.
    ///
    /// The outbound pump gets `grace` to drain the remaining output. The
    /// inbound pump would otherwise block on the transport, so it is aborted.
    pub async fn shutdown(self, grace: Duration) -> BridgeStats {
        let BridgeHandle {
            inbound,
            mut outbound,
        } = self;

        let outbound = match tokio::time::timeout(grace, &mut outbound).await {
            Ok(joined) => joined.unwrap_or_else(|e| {
                warn!("Outbound pump failed: {}", e);
                PumpStats::default()
            }),
            Err(_) => {
                debug!("Outbound pump still running after {:?}, aborting", grace);
                outbound.abort();
                join_pump("outbound", outbound).await
            }
        };

        inbound.abort();
        let inbound = join_pump("inbound", inbound).await;

        BridgeStats { inbound, outbound }
    }
}

async fn join_pump(direction: &str, handle: JoinHandle<PumpStats>) -> PumpStats {
    match handle.await {
        Ok(stats) => stats,
        Err(e) if e.is_cancelled() => PumpStats::default(),
        Err(e) => {
            warn!("{} pump failed: {}", direction, e);
            PumpStats::default()
        }
    }
}

/// Transport -> process. Ends silently on close, end of stream or any error.
async fn pump_inbound<S, E, W>(mut source: S, mut writer: W, on_close: Arc<CloseHook>) -> PumpStats
where
    S: Stream<Item = std::result::Result<Frame, E>> + Unpin,
    E: Display,
    W: AsyncWrite + Unpin,
{
    let mut stats = PumpStats::default();

    loop {
        let payload = match source.next().await {
            Some(Ok(Frame::Text(text))) => text.into_bytes(),
            Some(Ok(Frame::Binary(bytes))) => bytes,
            Some(Ok(Frame::Close)) | None => {
                debug!("Transport closed by peer");
                on_close.fire();
                break;
            }
            Some(Err(e)) => {
                debug!("Transport read failed: {}", e);
                on_close.fire();
                break;
            }
        };

        if let Err(e) = write_payload(&mut writer, &payload).await {
            debug!("Process stream write failed: {}", e);
            break;
        }
        stats.messages += 1;
        stats.bytes += payload.len() as u64;
    }

    let _ = writer.shutdown().await;
    stats
}

async fn write_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Process -> transport, one base64 text frame per read
async fn pump_outbound<R, K>(
    mut reader: R,
    mut sink: K,
    chunk_size: usize,
    on_close: Arc<CloseHook>,
) -> PumpStats
where
    R: AsyncRead + Unpin,
    K: Sink<Frame> + Unpin,
    K::Error: Display,
{
    let mut stats = PumpStats::default();
    let mut buf = vec![0u8; chunk_size];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Process stream reached end of output");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Process stream read failed: {}", e);
                break;
            }
        };

        if let Err(e) = sink.send(Frame::Text(encode_chunk(&buf[..n]))).await {
            debug!("Transport send failed: {}", e);
            on_close.fire();
            return stats;
        }
        stats.messages += 1;
        stats.bytes += n as u64;
    }

    if let Err(e) = sink.close().await {
        debug!("Transport close failed: {}", e);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    fn counting_hook() -> (Arc<CloseHook>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let hook = CloseHook::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hook, count)
    }

    #[test]
    fn test_chunk_codec() {
        let bytes: Vec<u8> = (0..=255).collect();
        assert_eq!(decode_chunk(&encode_chunk(&bytes)).unwrap(), bytes);
        assert!(matches!(
            decode_chunk("not base64!"),
            Err(SandboxError::Transport(_))
        ));
    }

    #[test]
    fn test_chunk_size_defaults_and_floor() {
        assert_eq!(IoBridge::default().chunk_size(), 1024);
        assert_eq!(IoBridge::new(0).chunk_size(), 1);
    }

    #[test]
    fn test_close_hook_fires_once() {
        let (hook, count) = counting_hook();
        hook.fire();
        hook.fire();
        assert!(hook.has_fired());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_writes_payloads_in_order() {
        let frames = futures::stream::iter(vec![
            Ok::<_, Infallible>(Frame::Text("echo hi\n".to_string())),
            Ok(Frame::Binary(vec![0x03])),
            Ok(Frame::Close),
            Ok(Frame::Text("never written".to_string())),
        ]);
        let writer = tokio_test::io::Builder::new()
            .write(b"echo hi\n")
            .write(&[0x03])
            .build();
        let (hook, count) = counting_hook();

        let stats = pump_inbound(frames, writer, hook).await;

        assert_eq!(stats.messages, 2);
        assert_eq!(stats.bytes, 9);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_error_ends_pump_and_fires_hook() {
        let frames = futures::stream::iter(vec![Err::<Frame, _>("reset by peer")]);
        let writer = tokio_test::io::Builder::new().build();
        let (hook, count) = counting_hook();

        let stats = pump_inbound(frames, writer, hook).await;
        assert_eq!(stats, PumpStats::default());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outbound_chunks_and_encodes() {
        let output: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let reader = tokio_test::io::Builder::new().read(&output).build();
        let (tx, rx) = mpsc::unbounded::<Frame>();
        let (hook, count) = counting_hook();

        let stats = pump_outbound(reader, tx, 1024, hook).await;
        let frames: Vec<Frame> = rx.collect().await;

        let mut decoded = Vec::new();
        for frame in &frames {
            let Frame::Text(text) = frame else {
                panic!("expected text frame, got {:?}", frame);
            };
            let chunk = decode_chunk(text).unwrap();
            assert!(!chunk.is_empty() && chunk.len() <= 1024);
            decoded.extend(chunk);
        }

        assert_eq!(decoded, output);
        assert_eq!(stats.bytes, 3000);
        assert_eq!(stats.messages, frames.len() as u64);
        assert!(frames.len() >= 3);
        // End of process output is not a transport close
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_outbound_send_failure_fires_hook() {
        let reader = tokio_test::io::Builder::new().read(b"hello").build();
        let (tx, rx) = mpsc::unbounded::<Frame>();
        drop(rx);
        let (hook, count) = counting_hook();

        let stats = pump_outbound(reader, tx, 1024, hook).await;
        assert_eq!(stats.messages, 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawned_bridge_round_trip() {
        // Process side: an echo loop over a duplex pipe
        let (client, mut process) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok(n) = process.read(&mut buf).await {
                if n == 0 || process.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        let (output, input) = tokio::io::split(client);
        let stream = AttachedStream {
            output: Box::pin(output),
            input: Box::pin(input),
        };

        let (in_tx, in_rx) = mpsc::unbounded::<std::result::Result<Frame, Infallible>>();
        let (out_tx, mut out_rx) = mpsc::unbounded::<Frame>();
        let (hook, count) = counting_hook();

        let handle = IoBridge::new(1024).spawn(stream, in_rx, out_tx, hook);

        in_tx.unbounded_send(Ok(Frame::Text("abc".into()))).unwrap();
        in_tx.unbounded_send(Ok(Frame::Text("def".into()))).unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < 6 {
            match out_rx.next().await {
                Some(Frame::Text(text)) => echoed.extend(decode_chunk(&text).unwrap()),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(echoed, b"abcdef");

        in_tx.unbounded_send(Ok(Frame::Close)).unwrap();
        let stats = handle.join().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(stats.inbound.bytes, 6);
        assert_eq!(stats.outbound.bytes, 6);
    }
}
