//! Fragmentation bookkeeping for both directions
//!
//! [`FragmentTracker`] validates incoming data frames: a fragmented message
//! opens with a TEXT or BINARY frame with `fin = false`, continues with
//! CONTINUATION frames, and nothing else may be interleaved except control
//! frames, which never touch this state.
//!
//! [`OutgoingFragments`] does the mirror job for the write path: the first
//! frame of a multi-frame message keeps its opcode, every later frame is
//! rewritten as CONTINUATION, and the terminal one carries `fin = true`.

use crate::error::{Error, Result};
use crate::frame::{Frame, OpCode, RSV1, RSV2, RSV3};

/// Incoming fragmentation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentState {
    /// No fragmented message in progress
    #[default]
    Idle,
    /// Inside a fragmented message of the given type
    InFragment(OpCode),
}

/// Where a data frame sits in its logical message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrameInfo {
    /// Message type (TEXT or BINARY) the frame belongs to
    pub message_type: OpCode,
    /// First frame of the message
    pub first: bool,
    /// Last frame of the message
    pub last: bool,
}

/// Reject RSV bits that no negotiated extension reserved
#[inline]
pub fn check_rsv(frame: &Frame, reserved: u8) -> Result<()> {
    let unexpected = frame.rsv_bits() & !reserved;
    if unexpected == 0 {
        return Ok(());
    }
    Err(if unexpected & RSV1 != 0 {
        Error::Protocol("RSV1 set without a negotiated extension")
    } else if unexpected & RSV2 != 0 {
        Error::Protocol("RSV2 set without a negotiated extension")
    } else {
        debug_assert!(unexpected & RSV3 != 0);
        Error::Protocol("RSV3 set without a negotiated extension")
    })
}

/// Incoming fragmentation state machine
#[derive(Debug, Default)]
pub struct FragmentTracker {
    state: FragmentState,
}

impl FragmentTracker {
    /// Create an idle tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> FragmentState {
        self.state
    }

    /// Whether a fragmented message is in progress
    #[inline]
    pub fn in_fragment(&self) -> bool {
        matches!(self.state, FragmentState::InFragment(_))
    }

    /// Account for one incoming frame
    ///
    /// Control frames bypass the state machine and return `Ok(None)`.
    pub fn track(&mut self, frame: &Frame) -> Result<Option<DataFrameInfo>> {
        let opcode = frame.opcode();
        if opcode.is_control() {
            return Ok(None);
        }

        let continuation = opcode == OpCode::Continuation;
        let info = match (self.state, continuation) {
            (FragmentState::Idle, true) => {
                return Err(Error::Protocol("unexpected continuation frame"));
            }
            (FragmentState::InFragment(_), false) => {
                return Err(Error::Protocol("fragment invalid opcode"));
            }
            (FragmentState::Idle, false) => DataFrameInfo {
                message_type: opcode,
                first: true,
                last: frame.fin(),
            },
            (FragmentState::InFragment(kind), true) => DataFrameInfo {
                message_type: kind,
                first: false,
                last: frame.fin(),
            },
        };

        self.state = if info.last {
            FragmentState::Idle
        } else {
            FragmentState::InFragment(info.message_type)
        };
        Ok(Some(info))
    }
}

/// Outgoing fragmentation bookkeeping
#[derive(Debug, Default)]
pub struct OutgoingFragments {
    in_progress: Option<OpCode>,
}

impl OutgoingFragments {
    /// Create with no fragmented send in progress
    pub fn new() -> Self {
        Self::default()
    }

    /// Type of the fragmented message currently being sent
    #[inline]
    pub fn in_progress(&self) -> Option<OpCode> {
        self.in_progress
    }

    /// Rewrite fin and opcode for the wire
    ///
    /// Control frames always go out with `fin = true`. A data frame that
    /// continues a fragmented send must be CONTINUATION or repeat the
    /// message type; anything else is a protocol violation.
    pub fn prepare(&mut self, frame: Frame) -> Result<Frame> {
        let opcode = frame.opcode();
        if opcode.is_control() {
            if frame.fin() {
                return Ok(frame);
            }
            return Ok(frame.to_builder().fin(true).build());
        }

        match self.in_progress {
            Some(kind) => {
                if opcode != OpCode::Continuation && opcode != kind {
                    return Err(Error::Protocol(
                        "data frame of another type sent during a fragmented message",
                    ));
                }
                if frame.fin() {
                    self.in_progress = None;
                }
                if opcode == OpCode::Continuation {
                    Ok(frame)
                } else {
                    Ok(frame.to_builder().opcode(OpCode::Continuation).build())
                }
            }
            None => {
                if opcode == OpCode::Continuation {
                    return Err(Error::Protocol("continuation without a fragmented message"));
                }
                if !frame.fin() {
                    self.in_progress = Some(opcode);
                }
                Ok(frame)
            }
        }
    }
}
