//! Capture source: feeds timestamped raw frames into the engine.
//!
//! Capture itself belongs to the OS. This module consumes what a capture
//! facility emits: a pcap byte stream, either from a file, from a spawned
//! capture command's stdout (e.g. `tcpdump -w -`), or from our own stdin.
//! The stream is parsed into `RawFrame`s and pushed into the aggregator's
//! channel; end of stream means the interface went away or capture stopped.

use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// One captured frame as handed over by the capture facility. `wire_len` is
/// the original on-the-wire length, which may exceed `data.len()` when the
/// capture was taken with a snap length.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub wire_len: u64,
    pub timestamp: DateTime<Utc>,
}

const MAGIC_MICROS: u32 = 0xA1B2_C3D4;
const MAGIC_NANOS: u32 = 0xA1B2_3C4D;
const LINKTYPE_ETHERNET: u32 = 1;

/// Guard against a corrupt stream claiming absurd record sizes.
const MAX_FRAME_LEN: u32 = 256 * 1024;

#[derive(Debug)]
pub enum CaptureError {
    Io(std::io::Error),
    BadMagic(u32),
    OversizedRecord(u32),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Io(e) => write!(f, "capture stream read failed: {}", e),
            CaptureError::BadMagic(m) => write!(f, "not a pcap stream (magic 0x{:08x})", m),
            CaptureError::OversizedRecord(n) => write!(f, "pcap record of {} bytes", n),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::Io(e)
    }
}

/// Incremental pcap stream parser over any async byte source.
pub struct PcapReader<R> {
    reader: R,
    swapped: bool,
    nanos: bool,
}

impl<R: AsyncRead + Unpin> PcapReader<R> {
    /// Reads and checks the 24-byte global header.
    pub async fn open(mut reader: R) -> Result<Self, CaptureError> {
        let mut header = [0u8; 24];
        reader.read_exact(&mut header).await?;

        let raw_magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let (swapped, nanos) = match raw_magic {
            MAGIC_MICROS => (false, false),
            MAGIC_NANOS => (false, true),
            m if m.swap_bytes() == MAGIC_MICROS => (true, false),
            m if m.swap_bytes() == MAGIC_NANOS => (true, true),
            m => return Err(CaptureError::BadMagic(m)),
        };

        let parser = PcapReader { reader, swapped, nanos };
        let linktype = parser.field(&header[20..24]);
        if linktype != LINKTYPE_ETHERNET {
            warn!("Capture linktype {} is not Ethernet; decode drops likely", linktype);
        }
        Ok(parser)
    }

    fn field(&self, bytes: &[u8]) -> u32 {
        let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if self.swapped {
            value.swap_bytes()
        } else {
            value
        }
    }

    /// Next frame, or None at a clean end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let mut record = [0u8; 16];
        match self.reader.read_exact(&mut record).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let ts_sec = self.field(&record[0..4]);
        let ts_frac = self.field(&record[4..8]);
        let incl_len = self.field(&record[8..12]);
        let orig_len = self.field(&record[12..16]);
        if incl_len > MAX_FRAME_LEN {
            return Err(CaptureError::OversizedRecord(incl_len));
        }

        let mut data = vec![0u8; incl_len as usize];
        self.reader.read_exact(&mut data).await?;

        let nanos = if self.nanos { ts_frac } else { ts_frac.saturating_mul(1000) };
        let timestamp = Utc
            .timestamp_opt(ts_sec as i64, nanos)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(Some(RawFrame {
            data,
            wire_len: orig_len as u64,
            timestamp,
        }))
    }
}

/// Pumps a pcap byte stream into the frame channel until EOF or a stream
/// error. Closing the channel on return is the end-of-capture signal the
/// aggregator acts on.
pub async fn pump<R: AsyncRead + Unpin>(
    reader: R,
    tx: mpsc::Sender<RawFrame>,
) -> Result<u64, CaptureError> {
    let mut parser = PcapReader::open(reader).await?;
    let mut frames = 0u64;
    while let Some(frame) = parser.next_frame().await? {
        frames += 1;
        if tx.send(frame).await.is_err() {
            // Aggregator went away first (shutdown); stop reading.
            break;
        }
    }
    info!("Capture stream ended after {} frame(s)", frames);
    Ok(frames)
}

/// Spawns the configured capture command and pumps its stdout.
pub async fn pump_command(
    command: &str,
    args: &[String],
    tx: mpsc::Sender<RawFrame>,
) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
    info!("Starting capture command: {} {}", command, args.join(" "));
    let mut child = tokio::process::Command::new(command)
        .args(args)
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or("capture command has no stdout")?;

    let frames = match pump(stdout, tx).await {
        Ok(frames) => frames,
        Err(e) => {
            // A bad stream must not leave the capture process running.
            let _ = child.kill().await;
            return Err(e.into());
        }
    };

    match child.try_wait() {
        Ok(Some(status)) if !status.success() => {
            warn!("Capture command exited with {}", status);
        }
        _ => {
            let _ = child.kill().await;
        }
    }
    Ok(frames)
}
