use bytes::Bytes;

/// Transport-neutral frame.
///
/// Transports convert their native representation into/from `Frame`; the
/// session only ever sees this type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

impl Frame {
    #[inline]
    pub fn close(code: u16, reason: Bytes) -> Self {
        Self::Close(Some(CloseFrame { code, reason }))
    }
}

/// Borrow the payload bytes of a frame without allocation.
#[inline]
pub fn frame_bytes(frame: &Frame) -> Option<&[u8]> {
    match frame {
        Frame::Text(bytes) | Frame::Binary(bytes) | Frame::Ping(bytes) | Frame::Pong(bytes) => {
            Some(bytes.as_ref())
        }
        Frame::Close(_) => None,
    }
}

/// Wrap an encoded protocol frame for the wire, honoring the codec's frame type.
#[inline]
pub fn payload_frame<B>(bytes: B, binary: bool) -> Frame
where
    B: Into<Bytes>,
{
    let payload = bytes.into();
    if binary {
        Frame::Binary(payload)
    } else {
        Frame::Text(payload)
    }
}
