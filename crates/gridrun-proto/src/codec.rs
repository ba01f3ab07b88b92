//! Newline-delimited JSON framing for envelopes.

use crate::envelope::{Envelope, WireError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};

/// Upper bound on a single frame. A frame is one JSON-encoded envelope; the
/// largest routine payload is a capability snapshot, far below this.
const MAX_FRAME_LEN: usize = 1 << 20;

fn map_lines_err(err: LinesCodecError) -> WireError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => WireError::FrameTooLong,
        LinesCodecError::Io(e) => WireError::Io(e),
    }
}

/// Codec turning a byte stream into a stream of envelopes, one JSON object
/// per line.
pub struct EnvelopeCodec {
    inner: LinesCodec,
}

impl EnvelopeCodec {
    /// Create a codec with the default frame limit.
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_FRAME_LEN),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        match self.inner.decode(src).map_err(map_lines_err)? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        match self.inner.decode_eof(src).map_err(map_lines_err)? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = WireError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), WireError> {
        let line = serde_json::to_string(&item)?;
        self.inner.encode(line, dst).map_err(map_lines_err)
    }
}

/// A duplex byte stream framed into envelopes.
pub type FramedEnvelope<T> = Framed<T, EnvelopeCodec>;

/// Frame a duplex byte stream (e.g. a TCP socket) into envelopes.
pub fn frame<T: AsyncRead + AsyncWrite>(io: T) -> FramedEnvelope<T> {
    Framed::new(io, EnvelopeCodec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{JobAccept, JobStatusUpdate};
    use futures::SinkExt;
    use gridrun_core::{JobId, JobStatus, Priority};
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = frame(a);
        let mut rx = frame(b);

        let env = Envelope::encode(
            Priority::NORMAL,
            &JobStatusUpdate {
                job_id: JobId::new("j-1"),
                status: JobStatus::Running,
                detail: None,
            },
        )
        .unwrap();

        tx.send(env.clone()).await.unwrap();
        let got = rx.next().await.unwrap().unwrap();
        assert_eq!(got.kind, env.kind);
        let update: JobStatusUpdate = got.decode().unwrap();
        assert_eq!(update.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_multiple_frames_preserve_order() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = frame(a);
        let mut rx = frame(b);

        for i in 0..3 {
            let env = Envelope::encode(
                Priority::HIGH,
                &JobAccept {
                    job_id: JobId::new(format!("j-{i}")),
                },
            )
            .unwrap();
            tx.send(env).await.unwrap();
        }

        for i in 0..3 {
            let got = rx.next().await.unwrap().unwrap();
            let accept: JobAccept = got.decode().unwrap();
            assert_eq!(accept.job_id, JobId::new(format!("j-{i}")));
        }
    }
}
