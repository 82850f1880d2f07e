//! Byte Pump
//!
//! One unidirectional copy loop between two stream endpoints.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::logsink::{hex_dump, LogSink};

/// Which way a pump copies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound client -> outbound target
    Upstream,
    /// Outbound target -> inbound client
    Downstream,
}

impl Direction {
    /// Label used on chunk log lines
    pub fn label(&self) -> &'static str {
        match self {
            Direction::Upstream => "Client",
            Direction::Downstream => "Server",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a pump ended
#[derive(Debug)]
pub struct PumpOutcome {
    pub direction: Direction,
    pub bytes_transferred: u64,
    /// `None` on clean end-of-stream
    pub error: Option<io::Error>,
}

impl PumpOutcome {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Copy `source` into `sink` chunk by chunk until end-of-stream or error.
///
/// Every chunk is reported to `log` as `"{direction}: {hex} ({n} bytes)"`,
/// added to `counter`, then written and flushed. The sink's write side is
/// shut down exactly once on the way out, whatever the reason.
pub async fn pump<R, W>(
    source: &mut R,
    sink: &mut W,
    direction: Direction,
    log: &dyn LogSink,
    buffer_size: usize,
    counter: &AtomicU64,
) -> PumpOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total: u64 = 0;

    let error = loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(e),
        };

        let chunk = &buf[..n];
        log.emit(format!("{}: {} ({} bytes)", direction, hex_dump(chunk), n));
        trace!(direction = %direction, bytes = n, "Relayed chunk");

        if let Err(e) = sink.write_all(chunk).await {
            break Some(e);
        }
        if let Err(e) = sink.flush().await {
            break Some(e);
        }

        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    };

    let _ = sink.shutdown().await;

    PumpOutcome {
        direction,
        bytes_transferred: total,
        error,
    }
}
