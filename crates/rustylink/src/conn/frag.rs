//! ACL fragmentation and reassembly
//!
//! Outbound PDUs larger than the link MTU are cut into frames flagged
//! START, CONTINUE... END. Every frame but the last is copied into a buffer
//! from the fragment pool, the last one is the tail of the original buffer.
//!
//! Inbound frames are glued back together until the L2CAP basic header says
//! the PDU is complete. Malformed sequences are logged and dropped here,
//! they never reach the upper layer.

use crate::buf::{BufPool, NetBuf};
use crate::error::{ConnError, ConnResult};
use crate::hci::constants::L2CAP_HDR_SIZE;
use crate::hci::data::{Boundary, L2capHeader};
use log::{debug, warn};

/// One outbound link layer frame
#[derive(Debug)]
pub struct Fragment {
    pub boundary: Boundary,
    pub buf: NetBuf,
}

/// Splits one PDU into frames, one at a time
///
/// Frames are produced lazily so a sender can stop after the first failure
/// without having copied the rest.
#[derive(Debug)]
pub struct Fragmenter {
    remaining: Option<NetBuf>,
    mtu: usize,
    started: bool,
}

impl Fragmenter {
    pub fn new(buf: NetBuf, mtu: usize) -> Self {
        Self {
            remaining: Some(buf),
            mtu: mtu.max(1),
            started: false,
        }
    }

    /// Number of frames a PDU of `len` bytes needs
    pub fn frame_count(len: usize, mtu: usize) -> usize {
        let mtu = mtu.max(1);
        len.div_ceil(mtu).max(1)
    }

    pub fn is_done(&self) -> bool {
        self.remaining.is_none()
    }

    /// Produce the next frame, or `None` once the PDU is exhausted
    ///
    /// Fails with `OutOfBuffers` when the fragment pool is empty. The
    /// remaining data is left untouched in that case.
    pub fn next_fragment(&mut self, pool: &BufPool) -> ConnResult<Option<Fragment>> {
        let fits = match &self.remaining {
            None => return Ok(None),
            Some(buf) => buf.len() <= self.mtu,
        };

        if fits {
            let Some(buf) = self.remaining.take() else {
                return Ok(None);
            };
            let boundary = if self.started {
                Boundary::End
            } else {
                Boundary::Single
            };
            return Ok(Some(Fragment { boundary, buf }));
        }

        let Some(buf) = self.remaining.as_mut() else {
            return Ok(None);
        };
        let front = buf
            .split_front(self.mtu, pool)
            .ok_or(ConnError::OutOfBuffers)?;
        let boundary = if self.started {
            Boundary::Continue
        } else {
            Boundary::Start
        };
        self.started = true;
        Ok(Some(Fragment {
            boundary,
            buf: front,
        }))
    }
}

/// Split `buf` into all of its frames at once
pub fn fragment(buf: NetBuf, mtu: usize, pool: &BufPool) -> ConnResult<Vec<Fragment>> {
    let mut fragmenter = Fragmenter::new(buf, mtu);
    let mut frames = Vec::new();
    while let Some(frame) = fragmenter.next_fragment(pool)? {
        frames.push(frame);
    }
    Ok(frames)
}

/// Result of feeding one frame to a [`Reassembler`]
#[derive(Debug)]
pub enum RxOutcome {
    /// More frames are needed
    Pending,
    /// A complete PDU, L2CAP header included
    Complete(NetBuf),
    /// The frame or the PDU in progress was dropped
    Discarded,
}

/// Per-connection inbound reassembly state
#[derive(Debug, Default)]
pub struct Reassembler {
    rx: Option<NetBuf>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self { rx: None }
    }

    pub fn in_progress(&self) -> bool {
        self.rx.is_some()
    }

    /// Drop any partial PDU
    pub fn reset(&mut self) {
        self.rx = None;
    }

    /// Feed one ACL frame payload
    ///
    /// `start` is true for a first fragment (PB flag START or
    /// START_NO_FLUSH). Reassembly buffers come from `pool`.
    pub fn push(&mut self, start: bool, payload: &[u8], pool: &BufPool) -> RxOutcome {
        if start {
            if self.rx.is_some() {
                warn!("Unexpected first L2CAP frame, dropping partial PDU");
                self.reset();
            }
            let Some(mut buf) = pool.try_alloc() else {
                warn!("No buffer for incoming PDU ({} bytes)", payload.len());
                return RxOutcome::Discarded;
            };
            if !buf.extend(payload) {
                warn!("Incoming frame too large ({} bytes)", payload.len());
                return RxOutcome::Discarded;
            }
            self.rx = Some(buf);
        } else {
            let Some(rx) = self.rx.as_mut() else {
                warn!("Unexpected L2CAP continuation ({} bytes)", payload.len());
                return RxOutcome::Discarded;
            };
            if payload.is_empty() {
                debug!("Ignoring empty L2CAP continuation");
                return RxOutcome::Pending;
            }
            if let Some(header) = L2capHeader::parse(rx.as_slice()) {
                if rx.len() + payload.len() > header.pdu_len() {
                    warn!(
                        "L2CAP continuation overflows PDU ({} + {} > {})",
                        rx.len(),
                        payload.len(),
                        header.pdu_len()
                    );
                    self.reset();
                    return RxOutcome::Discarded;
                }
            }
            if !rx.extend(payload) {
                warn!("Not enough buffer space for L2CAP data");
                self.reset();
                return RxOutcome::Discarded;
            }
        }

        self.check_complete()
    }

    fn check_complete(&mut self) -> RxOutcome {
        let Some(rx) = self.rx.as_ref() else {
            return RxOutcome::Pending;
        };
        if rx.len() < L2CAP_HDR_SIZE {
            return RxOutcome::Pending;
        }
        let Some(header) = L2capHeader::parse(rx.as_slice()) else {
            return RxOutcome::Pending;
        };
        let expected = header.pdu_len();
        if rx.len() < expected {
            return RxOutcome::Pending;
        }
        if rx.len() > expected {
            warn!("ACL len mismatch ({} > {})", rx.len(), expected);
            self.reset();
            return RxOutcome::Discarded;
        }
        match self.rx.take() {
            Some(pdu) => RxOutcome::Complete(pdu),
            None => RxOutcome::Pending,
        }
    }
}
