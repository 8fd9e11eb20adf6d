//! Segmented transfer reliability: outbound retransmission state and inbound
//! reassembly contexts.
//!
//! Both halves are plain state objects. The engine drives them with
//! `tokio::time` timers and feeds them acknowledgments and segments as they
//! arrive.

use bytes::Bytes;
use mesh_wire::{seq_auth, LowerTransportPdu, SegmentAck, SegmentBuffer, SegmentInfo};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;

/// Lifecycle of one outbound segmented message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// Segments not yet handed to the bearer
    Sending,
    /// Waiting for a Segment Acknowledgment
    AwaitingAck,
    /// Resending unacknowledged segments; holds the attempt number
    Retrying(u32),
    /// Every segment acknowledged, or all group repeats sent
    Complete,
    /// Retransmission limit reached
    TimedOut,
}

/// Send state of one segmented message
#[derive(Debug)]
pub struct SegmentedSend {
    seq_zero: u16,
    segments: Vec<LowerTransportPdu>,
    acked: u32,
    full: u32,
    state: OutgoingState,
    attempts: u32,
    retransmit_limit: u32,
    interval: Duration,
    group: bool,
    repeats: u32,
}

impl SegmentedSend {
    /// Track `segments`, all sharing `seq_zero`, sent with `ttl` to a unicast
    /// or group destination
    pub fn new(
        segments: Vec<LowerTransportPdu>,
        seq_zero: u16,
        group: bool,
        ttl: u8,
        config: &EngineConfig,
    ) -> Self {
        let full = mesh_wire::full_mask(segments.len().saturating_sub(1) as u8);
        Self {
            seq_zero,
            segments,
            acked: 0,
            full,
            state: OutgoingState::Sending,
            attempts: 0,
            retransmit_limit: config.segment_retransmit_limit,
            interval: config.segment_interval(ttl),
            group,
            repeats: config.group_segment_repeats,
        }
    }

    /// SeqZero shared by all segments
    pub fn seq_zero(&self) -> u16 {
        self.seq_zero
    }

    /// Current state
    pub fn state(&self) -> OutgoingState {
        self.state
    }

    /// Segments to transmit now: every unacknowledged segment, repeated for
    /// group destinations. Moves the send out of `Sending`/`Retrying`.
    pub fn pending_segments(&mut self) -> Vec<LowerTransportPdu> {
        let unacked: Vec<LowerTransportPdu> = self
            .segments
            .iter()
            .enumerate()
            .filter(|(i, _)| self.acked & (1 << i) == 0)
            .map(|(_, seg)| seg.clone())
            .collect();

        if self.group {
            // Nobody acknowledges a group message
            self.state = OutgoingState::Complete;
            let mut out = Vec::with_capacity(unacked.len() * self.repeats as usize);
            for _ in 0..self.repeats {
                out.extend(unacked.iter().cloned());
            }
            return out;
        }

        self.state = OutgoingState::AwaitingAck;
        unacked
    }

    /// Time to wait for an acknowledgment; doubles with every retry
    pub fn retransmit_interval(&self) -> Duration {
        self.interval * 2u32.saturating_pow(self.attempts)
    }

    /// Apply a Segment Acknowledgment. Returns `true` once complete.
    pub fn on_ack(&mut self, ack: &SegmentAck) -> bool {
        if ack.seq_zero != self.seq_zero {
            trace!(
                expected = self.seq_zero,
                got = ack.seq_zero,
                "Ignoring ack for another message"
            );
            return self.state == OutgoingState::Complete;
        }
        if ack.block_ack == 0 {
            // Receiver busy; keep the timer running
            debug!(seq_zero = self.seq_zero, "Ignoring empty block ack");
            return self.state == OutgoingState::Complete;
        }

        self.acked |= ack.block_ack & self.full;
        if self.acked == self.full {
            self.state = OutgoingState::Complete;
            return true;
        }
        false
    }

    /// The retransmission timer fired
    pub fn on_timeout(&mut self) -> OutgoingState {
        self.attempts += 1;
        self.state = if self.attempts > self.retransmit_limit {
            warn!(
                seq_zero = self.seq_zero,
                attempts = self.attempts,
                "Segmented send timed out"
            );
            OutgoingState::TimedOut
        } else {
            OutgoingState::Retrying(self.attempts)
        };
        self.state
    }
}

/// Result of feeding one segment to the reassembly table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// More segments needed
    Incomplete,
    /// Every segment arrived
    Complete(CompletedMessage),
    /// Segment of an exchange that was already delivered
    Duplicate {
        /// BlockAck to send again
        block_ack: u32,
    },
    /// Segment rejected (stale SeqAuth, inconsistent SegN or bad size)
    Rejected,
}

/// A reassembled upper transport PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    /// Application key flag
    pub akf: bool,
    /// Application key identifier
    pub aid: u8,
    /// TransMIC is 64 bits
    pub szmic: bool,
    /// IV index and sequence number of the first segment
    pub seq_auth: u64,
    /// BlockAck with every segment set
    pub block_ack: u32,
    /// Upper transport PDU
    pub upper_pdu: Bytes,
}

impl CompletedMessage {
    /// Sequence number used in the upper transport nonce
    pub fn seq_origin(&self) -> u32 {
        (self.seq_auth & 0x00FF_FFFF) as u32
    }

    /// IV index used in the upper transport nonce
    pub fn iv_index(&self) -> u32 {
        (self.seq_auth >> 24) as u32
    }
}

/// Fields of one received access segment
#[derive(Debug, Clone)]
pub struct IncomingSegment {
    /// Source element
    pub src: u16,
    /// Network sequence number of this segment
    pub seq: u32,
    /// IV index it was received with
    pub iv_index: u32,
    /// Application key flag
    pub akf: bool,
    /// Application key identifier
    pub aid: u8,
    /// Segmentation fields
    pub info: SegmentInfo,
    /// Segment payload
    pub segment: Bytes,
}

#[derive(Debug)]
struct ReassemblyContext {
    seq_auth: u64,
    akf: bool,
    aid: u8,
    szmic: bool,
    buffer: SegmentBuffer,
    last_activity: Instant,
}

#[derive(Debug)]
struct CompletedEntry {
    seq_auth: u64,
    block_ack: u32,
    completed_at: Instant,
}

/// Inbound reassembly contexts keyed by (source, SeqZero)
#[derive(Debug)]
pub struct ReassemblyTable {
    active: HashMap<(u16, u16), ReassemblyContext>,
    completed: HashMap<(u16, u16), CompletedEntry>,
    timeout: Duration,
}

impl ReassemblyTable {
    /// Contexts idle longer than `timeout` are discarded by [`sweep`](Self::sweep)
    pub fn new(timeout: Duration) -> Self {
        Self {
            active: HashMap::new(),
            completed: HashMap::new(),
            timeout,
        }
    }

    /// Exchanges still collecting segments
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// No exchange is collecting segments
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Delivered exchanges remembered for re-acknowledgment
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Feed one segment
    pub fn insert(&mut self, seg: IncomingSegment, now: Instant) -> SegmentOutcome {
        let key = (seg.src, seg.info.seq_zero);
        let auth = seq_auth(seg.iv_index, seg.seq, seg.info.seq_zero);

        if let Some(done) = self.completed.get(&key) {
            if done.seq_auth == auth {
                trace!(src = seg.src, seq_zero = seg.info.seq_zero, "Segment of delivered message");
                return SegmentOutcome::Duplicate {
                    block_ack: done.block_ack,
                };
            }
            if auth < done.seq_auth {
                return SegmentOutcome::Rejected;
            }
            self.completed.remove(&key);
        }

        if let Some(ctx) = self.active.get(&key) {
            if auth < ctx.seq_auth {
                debug!(src = seg.src, "Dropping segment with stale SeqAuth");
                return SegmentOutcome::Rejected;
            }
            if auth > ctx.seq_auth {
                debug!(src = seg.src, "Newer message replaces partial reassembly");
                self.active.remove(&key);
            }
        }

        let ctx = match self.active.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let buffer = match SegmentBuffer::new(seg.info.seg_n) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        debug!("Rejecting segment: {}", e);
                        return SegmentOutcome::Rejected;
                    }
                };
                entry.insert(ReassemblyContext {
                    seq_auth: auth,
                    akf: seg.akf,
                    aid: seg.aid,
                    szmic: seg.info.szmic,
                    buffer,
                    last_activity: now,
                })
            }
        };

        if ctx.buffer.seg_n() != seg.info.seg_n || ctx.akf != seg.akf || ctx.aid != seg.aid {
            debug!(src = seg.src, "Segment inconsistent with its exchange");
            return SegmentOutcome::Rejected;
        }
        if let Err(e) = ctx.buffer.insert(seg.info.seg_o, seg.segment) {
            debug!("Rejecting segment: {}", e);
            return SegmentOutcome::Rejected;
        }
        ctx.last_activity = now;

        if !ctx.buffer.is_complete() {
            return SegmentOutcome::Incomplete;
        }

        let ctx = match self.active.remove(&key) {
            Some(ctx) => ctx,
            None => return SegmentOutcome::Incomplete,
        };
        let upper_pdu = match ctx.buffer.assemble() {
            Some(pdu) => pdu,
            None => return SegmentOutcome::Rejected,
        };
        let block_ack = ctx.buffer.block_ack();
        self.completed.insert(
            key,
            CompletedEntry {
                seq_auth: ctx.seq_auth,
                block_ack,
                completed_at: now,
            },
        );

        SegmentOutcome::Complete(CompletedMessage {
            akf: ctx.akf,
            aid: ctx.aid,
            szmic: ctx.szmic,
            seq_auth: ctx.seq_auth,
            block_ack,
            upper_pdu,
        })
    }

    /// Drop contexts idle for longer than the timeout. Returns how many
    /// partial exchanges were discarded.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.active.len();
        self.active
            .retain(|_, ctx| now.duration_since(ctx.last_activity) < timeout);
        self.completed
            .retain(|_, done| now.duration_since(done.completed_at) < timeout);

        let dropped = before - self.active.len();
        if dropped > 0 {
            debug!("Discarded {} idle reassembly contexts", dropped);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::Segmenter;

    fn segments_of(payload: &[u8], seq_zero: u16) -> Vec<LowerTransportPdu> {
        Segmenter::new()
            .segment_access(true, 0x26, false, seq_zero, &Bytes::copy_from_slice(payload))
            .unwrap()
    }

    fn incoming(pdu: &LowerTransportPdu, src: u16, seq: u32) -> IncomingSegment {
        match pdu {
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                info,
                segment,
            } => IncomingSegment {
                src,
                seq,
                iv_index: 0,
                akf: *akf,
                aid: *aid,
                info: *info,
                segment: segment.clone(),
            },
            other => panic!("not a segment: {:?}", other),
        }
    }

    #[test]
    fn test_unicast_send_completes_on_full_ack() {
        let config = EngineConfig::default();
        let mut send = SegmentedSend::new(segments_of(&[7u8; 30], 100), 100, false, 5, &config);

        assert_eq!(send.pending_segments().len(), 3);
        assert_eq!(send.state(), OutgoingState::AwaitingAck);

        // Partial ack: only segment 1 is resent
        assert!(!send.on_ack(&SegmentAck {
            obo: false,
            seq_zero: 100,
            block_ack: 0b101,
        }));
        assert_eq!(send.on_timeout(), OutgoingState::Retrying(1));
        assert_eq!(send.pending_segments().len(), 1);

        assert!(send.on_ack(&SegmentAck {
            obo: false,
            seq_zero: 100,
            block_ack: 0b111,
        }));
        assert_eq!(send.state(), OutgoingState::Complete);
    }

    #[test]
    fn test_ignores_empty_and_foreign_acks() {
        let config = EngineConfig::default();
        let mut send = SegmentedSend::new(segments_of(&[7u8; 20], 5), 5, false, 0, &config);
        send.pending_segments();

        assert!(!send.on_ack(&SegmentAck {
            obo: false,
            seq_zero: 5,
            block_ack: 0,
        }));
        assert!(!send.on_ack(&SegmentAck {
            obo: false,
            seq_zero: 6,
            block_ack: 0b11,
        }));
        assert_eq!(send.pending_segments().len(), 2);
    }

    #[test]
    fn test_backoff_and_timeout() {
        let config = EngineConfig {
            segment_ack_base: Duration::from_millis(200),
            segment_retransmit_limit: 2,
            ..Default::default()
        };
        let mut send = SegmentedSend::new(segments_of(&[1u8; 13], 9), 9, false, 2, &config);
        send.pending_segments();

        assert_eq!(send.retransmit_interval(), Duration::from_millis(300));
        assert_eq!(send.on_timeout(), OutgoingState::Retrying(1));
        assert_eq!(send.retransmit_interval(), Duration::from_millis(600));
        assert_eq!(send.on_timeout(), OutgoingState::Retrying(2));
        assert_eq!(send.on_timeout(), OutgoingState::TimedOut);
    }

    #[test]
    fn test_group_send_repeats_and_completes() {
        let config = EngineConfig {
            group_segment_repeats: 3,
            ..Default::default()
        };
        let mut send = SegmentedSend::new(segments_of(&[1u8; 24], 1), 1, true, 5, &config);
        assert_eq!(send.pending_segments().len(), 6);
        assert_eq!(send.state(), OutgoingState::Complete);
    }

    #[test]
    fn test_out_of_order_reassembly_matches_in_order() {
        let payload: Vec<u8> = (0..40u8).collect();
        let segments = segments_of(&payload, 0x0200);
        let now = Instant::now();

        let mut in_order = ReassemblyTable::new(Duration::from_secs(10));
        let mut result_in_order = None;
        for (i, seg) in segments.iter().enumerate() {
            if let SegmentOutcome::Complete(done) =
                in_order.insert(incoming(seg, 0x0005, 0x0200 + i as u32), now)
            {
                result_in_order = Some(done);
            }
        }

        let mut shuffled = ReassemblyTable::new(Duration::from_secs(10));
        let mut result_shuffled = None;
        for i in [3usize, 0, 2, 1] {
            if let SegmentOutcome::Complete(done) =
                shuffled.insert(incoming(&segments[i], 0x0005, 0x0200 + i as u32), now)
            {
                result_shuffled = Some(done);
            }
        }

        let a = result_in_order.unwrap();
        let b = result_shuffled.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.upper_pdu.as_ref(), payload.as_slice());
        assert_eq!(a.seq_origin(), 0x0200);
        assert_eq!(a.block_ack, 0b1111);
    }

    #[test]
    fn test_duplicate_after_completion_is_reacknowledged() {
        let segments = segments_of(&[9u8; 20], 0x10);
        let now = Instant::now();
        let mut table = ReassemblyTable::new(Duration::from_secs(10));

        assert_eq!(
            table.insert(incoming(&segments[0], 0x0005, 0x10), now),
            SegmentOutcome::Incomplete
        );
        assert!(matches!(
            table.insert(incoming(&segments[1], 0x0005, 0x11), now),
            SegmentOutcome::Complete(_)
        ));
        assert_eq!(
            table.insert(incoming(&segments[1], 0x0005, 0x12), now),
            SegmentOutcome::Duplicate { block_ack: 0b11 }
        );
        assert!(table.is_empty());
        assert_eq!(table.completed_len(), 1);
    }

    #[test]
    fn test_sweep_discards_idle_contexts() {
        let start = Instant::now();
        let mut table = ReassemblyTable::new(Duration::from_secs(10));

        for n in 0..50u16 {
            let segments = segments_of(&[n as u8; 30], n);
            table.insert(incoming(&segments[0], 0x0100 + n, n as u32), start);
        }
        assert_eq!(table.len(), 50);

        assert_eq!(table.sweep(start + Duration::from_secs(5)), 0);
        let done = segments_of(&[7u8; 5], 0x60);
        assert!(matches!(
            table.insert(incoming(&done[0], 0x0200, 0x60), start),
            SegmentOutcome::Complete(_)
        ));
        assert_eq!(table.completed_len(), 1);

        assert_eq!(table.sweep(start + Duration::from_secs(11)), 50);
        assert!(table.is_empty());
        assert_eq!(table.completed_len(), 0);
    }
}
