//! Wire framing for the TCP transport.
//!
//! One JSON object per line. Peers send `subscribe`, `unsubscribe` and
//! `publish` frames; the server answers with `message` frames for every
//! envelope delivered on a subject the peer subscribed to.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::bus::Envelope;
use crate::error::{BusError, BusResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Subscribe {
        subject: String,
    },
    Unsubscribe {
        subject: String,
    },
    Publish {
        subject: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    Message {
        subject: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
}

impl Frame {
    pub fn message(envelope: Envelope) -> Self {
        Frame::Message {
            subject: envelope.subject,
            payload: envelope.payload,
            reply_to: envelope.reply_to,
        }
    }
}

/// Reads frames line by line. Blank lines are skipped.
pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next frame, or `None` at end of stream.
    ///
    /// A line that is not a valid frame yields [`BusError::Frame`]; the
    /// reader stays usable for the following lines. Cancel safe.
    pub async fn next_frame(&mut self) -> BusResult<Option<Frame>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line).map(Some).map_err(BusError::Frame);
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> BusResult<()> {
    let mut line = serde_json::to_vec(frame).map_err(BusError::Frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}
