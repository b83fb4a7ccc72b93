//! Probe/Commit stream negotiation
//!
//! One [`StreamNegotiator`] drives the state machine for one stream:
//!
//! ```text
//! Idle --probe_and_commit--> Probed --> Committed --mark_streaming--> Streaming
//!   ^                                                                    |
//!   +------------------------------- reset -----------------------------+
//! ```
//!
//! The exchange on the wire is GET_MAX (probe), SET_CUR (probe), GET_CUR
//! (probe) and SET_CUR (commit). The block read back by GET_CUR is the
//! device's answer and is what gets committed and streamed with.

use crate::control::ControlChannel;
use crate::error::{CameraError, Result};
use protocol::{
    ControlBlockLength, ControlInterface, DeviceDescriptors, HINT_FRAME_INTERVAL, ProfileMatch,
    RequestCode, StreamControlBlock, StreamProfile, VsControlSelector, find_profile,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Probed,
    Committed,
    Streaming,
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub profile_match: ProfileMatch,
    /// Block as committed, i.e. as last reported by the device
    pub control: StreamControlBlock,
}

pub struct StreamNegotiator {
    length: ControlBlockLength,
    clock_frequency: u32,
    state: NegotiationState,
    negotiated: Option<Negotiated>,
}

impl StreamNegotiator {
    pub fn new(control: &ControlInterface) -> Self {
        Self {
            length: ControlBlockLength::for_version(control.bcd_uvc),
            clock_frequency: control.clock_frequency,
            state: NegotiationState::Idle,
            negotiated: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn block_length(&self) -> ControlBlockLength {
        self.length
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Agree on `profile` with the device
    ///
    /// Fails with [`CameraError::FormatNotSupported`] before touching the
    /// device if the descriptors hold no exact match. Any other failure
    /// leaves the negotiator `Idle`.
    pub fn probe_and_commit(
        &mut self,
        control: &ControlChannel,
        descriptors: &DeviceDescriptors,
        profile: &StreamProfile,
    ) -> Result<Negotiated> {
        if self.state == NegotiationState::Streaming {
            return Err(CameraError::AlreadyStreaming(*profile));
        }

        let Some(profile_match) = find_profile(descriptors, profile) else {
            debug!("No descriptor entry for {}", profile);
            return Err(CameraError::FormatNotSupported(*profile));
        };

        self.state = NegotiationState::Idle;
        self.negotiated = None;

        match self.negotiate(control, &profile_match) {
            Ok(block) => {
                info!(
                    "Committed {} on interface {} (frame size {}, payload size {})",
                    profile,
                    profile_match.interface_number,
                    block.max_video_frame_size,
                    block.max_payload_transfer_size
                );
                let negotiated = Negotiated {
                    profile_match,
                    control: block,
                };
                self.negotiated = Some(negotiated.clone());
                Ok(negotiated)
            }
            Err(e) => {
                error!("Negotiation of {} failed: {}", profile, e);
                self.state = NegotiationState::Idle;
                Err(e)
            }
        }
    }

    fn negotiate(&mut self, control: &ControlChannel, target: &ProfileMatch) -> Result<StreamControlBlock> {
        let index = target.interface_number as u16;
        let probe = VsControlSelector::Probe.w_value();
        let commit = VsControlSelector::Commit.w_value();
        let len = self.length.len();

        let mut block = match control.get(RequestCode::GetMax, probe, index, len) {
            Ok(raw) => StreamControlBlock::decode(&raw, self.length, self.clock_frequency)?,
            Err(CameraError::DeviceDisconnected) => return Err(CameraError::DeviceDisconnected),
            Err(e) => {
                warn!("GET_MAX on probe failed ({}), negotiating from defaults", e);
                StreamControlBlock::default()
            }
        };

        block.hint = HINT_FRAME_INTERVAL;
        block.format_index = target.format_index;
        block.frame_index = target.frame_index;
        block.frame_interval = target.frame_interval;

        control.set(probe, index, &block.for_probe().encode(self.length))?;
        let raw = control.get(RequestCode::GetCur, probe, index, len)?;
        let accepted = StreamControlBlock::decode(&raw, self.length, self.clock_frequency)?;
        self.state = NegotiationState::Probed;

        if accepted.frame_interval != target.frame_interval {
            warn!(
                "Device adjusted frame interval from {} to {}",
                target.frame_interval, accepted.frame_interval
            );
        }

        control.set(commit, index, &accepted.encode(self.length))?;
        self.state = NegotiationState::Committed;

        Ok(accepted)
    }

    /// Record that frames are flowing; only valid once committed
    pub fn mark_streaming(&mut self) -> Result<()> {
        match self.state {
            NegotiationState::Committed => {
                self.state = NegotiationState::Streaming;
                Ok(())
            }
            NegotiationState::Streaming => Ok(()),
            _ => Err(CameraError::NotConfigured),
        }
    }

    /// Forget the session; a fresh negotiation is needed to stream again
    pub fn reset(&mut self) {
        self.state = NegotiationState::Idle;
        self.negotiated = None;
    }
}
