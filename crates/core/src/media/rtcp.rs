//! RTCP sender-report parsing and receiver-report production (RFC 3550 §6.4).

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use super::rtp::{RtpHeader, compare_seq};
use crate::error::{Error, ProtocolErrorKind, Result};

pub const RTCP_HEADER_LENGTH: usize = 4;
pub const RTCP_PACKET_TYPE_SR: u8 = 200;
pub const RTCP_PACKET_TYPE_RR: u8 = 201;

const SR_LENGTH: usize = 28;
const RR_LENGTH: usize = 32;

/// Common RTCP header.
///
/// ```text
///  0                   1                   2                   3
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|    RC   |      PT       |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub version: u8,
    pub padding: bool,
    pub count_or_format: u8,
    pub packet_type: u8,
    /// Length in 32-bit words minus one.
    pub length: u16,
}

impl RtcpHeader {
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < RTCP_HEADER_LENGTH {
            return Err(Error::short(RTCP_HEADER_LENGTH, b.len()));
        }
        Ok(Self {
            version: b[0] >> 6,
            padding: b[0] & 0x20 != 0,
            count_or_format: b[0] & 0x1F,
            packet_type: b[1],
            length: u16::from_be_bytes([b[2], b[3]]),
        })
    }

    /// Total packet size in bytes, header included.
    pub fn packet_len(&self) -> usize {
        (self.length as usize + 1) * 4
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderReport {
    pub sender_ssrc: u32,
    pub ntp_msw: u32,
    pub ntp_lsw: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn parse(b: &[u8]) -> Result<Self> {
        let h = RtcpHeader::parse(b)?;
        if h.packet_type != RTCP_PACKET_TYPE_SR {
            return Err(Error::invalid(ProtocolErrorKind::InvalidRtcp));
        }
        if b.len() < SR_LENGTH {
            return Err(Error::short(SR_LENGTH, b.len()));
        }
        let word = |i: usize| u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        Ok(Self {
            sender_ssrc: word(4),
            ntp_msw: word(8),
            ntp_lsw: word(12),
            rtp_timestamp: word(16),
            packet_count: word(20),
            octet_count: word(24),
        })
    }

    /// Middle 32 bits of the NTP timestamp; echoed back as LSR.
    pub fn middle_ntp(&self) -> u32 {
        (self.ntp_msw << 16) | (self.ntp_lsw >> 16)
    }

    /// Serialize without report blocks.
    pub fn pack(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(SR_LENGTH);
        b.put_u8(0x80);
        b.put_u8(RTCP_PACKET_TYPE_SR);
        b.put_u16((SR_LENGTH / 4 - 1) as u16);
        for w in [
            self.sender_ssrc,
            self.ntp_msw,
            self.ntp_lsw,
            self.rtp_timestamp,
            self.packet_count,
            self.octet_count,
        ] {
            b.put_u32(w);
        }
        b.freeze()
    }
}

/// Receiver report with a single report block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverReport {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative loss.
    pub cumulative_lost: u32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub lsr: u32,
    pub dlsr: u32,
}

impl ReceiverReport {
    pub fn pack(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(RR_LENGTH);
        b.put_u8(0x80 | 1);
        b.put_u8(RTCP_PACKET_TYPE_RR);
        b.put_u16((RR_LENGTH / 4 - 1) as u16);
        b.put_u32(self.sender_ssrc);
        b.put_u32(self.media_ssrc);
        b.put_u32((u32::from(self.fraction_lost) << 24) | (self.cumulative_lost & 0x00FF_FFFF));
        b.put_u32(self.extended_highest_seq);
        b.put_u32(self.jitter);
        b.put_u32(self.lsr);
        b.put_u32(self.dlsr);
        b.freeze()
    }

    pub fn parse(b: &[u8]) -> Result<Self> {
        let h = RtcpHeader::parse(b)?;
        if h.packet_type != RTCP_PACKET_TYPE_RR || h.count_or_format < 1 {
            return Err(Error::invalid(ProtocolErrorKind::InvalidRtcp));
        }
        if b.len() < RR_LENGTH {
            return Err(Error::short(RR_LENGTH, b.len()));
        }
        let word = |i: usize| u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        Ok(Self {
            sender_ssrc: word(4),
            media_ssrc: word(8),
            fraction_lost: b[12],
            cumulative_lost: word(12) & 0x00FF_FFFF,
            extended_highest_seq: word(16),
            jitter: word(20),
            lsr: word(24),
            dlsr: word(28),
        })
    }
}

/// Tracks one incoming RTP stream and produces receiver reports for it.
///
/// Loss accounting and the interarrival jitter estimator follow
/// RFC 3550 A.3 and A.8.
#[derive(Debug)]
pub struct RrProducer {
    sender_ssrc: u32,
    clock_rate: u32,
    epoch: Instant,
    started: bool,
    base_seq: u16,
    max_seq: u16,
    cycles: u32,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
    transit: Option<i64>,
    /// Scaled by 16.
    jitter: i64,
}

impl RrProducer {
    pub fn new(clock_rate: u32) -> Self {
        Self::with_sender_ssrc(rand::random::<u32>(), clock_rate)
    }

    pub fn with_sender_ssrc(sender_ssrc: u32, clock_rate: u32) -> Self {
        Self {
            sender_ssrc,
            clock_rate,
            epoch: Instant::now(),
            started: false,
            base_seq: 0,
            max_seq: 0,
            cycles: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            transit: None,
            jitter: 0,
        }
    }

    pub fn feed_rtp(&mut self, header: &RtpHeader) {
        let arrival = self.epoch.elapsed().as_secs_f64() * f64::from(self.clock_rate);
        self.feed_rtp_at(header, arrival as u64 as u32);
    }

    /// `arrival` is the arrival time expressed in RTP clock units.
    pub fn feed_rtp_at(&mut self, header: &RtpHeader, arrival: u32) {
        self.received += 1;
        if !self.started {
            self.started = true;
            self.base_seq = header.seq;
            self.max_seq = header.seq;
        } else if compare_seq(header.seq, self.max_seq) > 0 {
            if header.seq < self.max_seq {
                self.cycles += 1;
            }
            self.max_seq = header.seq;
        }

        let transit = i64::from(arrival.wrapping_sub(header.timestamp) as i32);
        if let Some(prev) = self.transit {
            let d = (transit - prev).abs();
            self.jitter += d - ((self.jitter + 8) >> 4);
        }
        self.transit = Some(transit);
    }

    pub fn extended_highest_seq(&self) -> u32 {
        (self.cycles << 16) | u32::from(self.max_seq)
    }

    pub fn jitter(&self) -> u32 {
        (self.jitter >> 4) as u32
    }

    /// Build the report answering `sr`, and advance the interval counters
    /// used for the fraction-lost field.
    pub fn report(&mut self, sr: &SenderReport) -> ReceiverReport {
        let extended = u64::from(self.extended_highest_seq());
        let expected = (extended + 1).saturating_sub(u64::from(self.base_seq));
        let lost = (expected as i64 - self.received as i64).clamp(0, 0x7F_FFFF) as u32;

        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;
        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        };

        ReceiverReport {
            sender_ssrc: self.sender_ssrc,
            media_ssrc: sr.sender_ssrc,
            fraction_lost,
            cumulative_lost: lost,
            extended_highest_seq: extended as u32,
            jitter: self.jitter(),
            lsr: sr.middle_ntp(),
            dlsr: 0,
        }
    }

    pub fn build_rr(&mut self, sr: &SenderReport) -> Bytes {
        self.report(sr).pack()
    }
}
