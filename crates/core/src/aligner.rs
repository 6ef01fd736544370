//! Re-bases and interleaves the audio and video packets of one session so
//! downstream muxers see a single non-decreasing timeline.

use std::collections::VecDeque;

use crate::avpacket::AvPacket;

#[derive(Debug, Default)]
struct MediumQueue {
    base: Option<i64>,
    queue: VecDeque<AvPacket>,
}

impl MediumQueue {
    fn reset(&mut self) {
        self.base = None;
        self.queue.clear();
    }
}

/// Audio/video merge queue.
///
/// Each medium's first timestamp becomes its zero. Packets are released in
/// timestamp order once both media have one queued (video first on ties);
/// a medium whose queue reaches capacity is flushed alone, since the other
/// one is presumably absent.
#[derive(Debug)]
pub struct AvPacketQueue {
    audio: MediumQueue,
    video: MediumQueue,
    capacity: usize,
    rebase_on_backward_jump: bool,
    last_output_ts: i64,
}

impl AvPacketQueue {
    pub fn new(capacity: usize, rebase_on_backward_jump: bool) -> Self {
        Self {
            audio: MediumQueue::default(),
            video: MediumQueue::default(),
            capacity: capacity.max(1),
            rebase_on_backward_jump,
            last_output_ts: 0,
        }
    }

    /// Feed one packet; returns whatever is now releasable, in order.
    pub fn feed(&mut self, mut pkt: AvPacket) -> Vec<AvPacket> {
        let is_video = pkt.is_video();
        let base = {
            let medium = if is_video { &self.video } else { &self.audio };
            medium.base
        };

        match base {
            Some(b) if pkt.timestamp < b && self.rebase_on_backward_jump => {
                tracing::warn!(
                    ts = pkt.timestamp,
                    base = b,
                    video = is_video,
                    "timestamp jumped backwards, rebasing"
                );
                self.audio.reset();
                self.video.reset();
                self.last_output_ts = 0;
            }
            _ => {}
        }

        let medium = if is_video {
            &mut self.video
        } else {
            &mut self.audio
        };
        let base = *medium.base.get_or_insert(pkt.timestamp);
        let offset = pkt.pts - pkt.timestamp;
        pkt.timestamp -= base;
        pkt.pts = pkt.timestamp + offset;
        medium.queue.push_back(pkt);

        let mut out = Vec::new();
        loop {
            let next = match (self.audio.queue.front(), self.video.queue.front()) {
                (Some(a), Some(v)) => {
                    if v.timestamp <= a.timestamp {
                        self.video.queue.pop_front()
                    } else {
                        self.audio.queue.pop_front()
                    }
                }
                _ => None,
            };
            match next {
                Some(p) => self.emit(p, &mut out),
                None => break,
            }
        }

        if self.audio.queue.len() >= self.capacity {
            while let Some(p) = self.audio.queue.pop_front() {
                self.emit(p, &mut out);
            }
        }
        if self.video.queue.len() >= self.capacity {
            while let Some(p) = self.video.queue.pop_front() {
                self.emit(p, &mut out);
            }
        }
        out
    }

    fn emit(&mut self, mut pkt: AvPacket, out: &mut Vec<AvPacket>) {
        if pkt.timestamp < self.last_output_ts {
            let offset = pkt.pts - pkt.timestamp;
            pkt.timestamp = self.last_output_ts;
            pkt.pts = pkt.timestamp + offset;
        }
        self.last_output_ts = pkt.timestamp;
        out.push(pkt);
    }

    pub fn queued(&self) -> (usize, usize) {
        (self.audio.queue.len(), self.video.queue.len())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::avpacket::AvPacketPt;

    fn audio(ts: i64) -> AvPacket {
        AvPacket::new(AvPacketPt::Aac, ts, Bytes::from_static(b"a"))
    }

    fn video(ts: i64) -> AvPacket {
        AvPacket::new(AvPacketPt::Avc, ts, Bytes::from_static(b"v"))
    }

    fn timestamps(out: &[AvPacket]) -> Vec<(bool, i64)> {
        out.iter().map(|p| (p.is_video(), p.timestamp)).collect()
    }

    #[test]
    fn random_interleaving_is_monotonic() {
        for _ in 0..50 {
            let mut q = AvPacketQueue::new(16, true);
            let (mut a, mut v) = (rand::random::<u16>() as i64, rand::random::<u16>() as i64);
            let mut out = Vec::new();
            for _ in 0..400 {
                // Media advance at their own pace, arriving in bursts.
                if rand::random::<bool>() {
                    a += 15 + i64::from(rand::random::<u8>() % 16);
                    out.extend(q.feed(audio(a)));
                } else {
                    v += 30 + i64::from(rand::random::<u8>() % 20);
                    out.extend(q.feed(video(v)));
                }
            }
            let ts: Vec<i64> = out.iter().map(|p| p.timestamp).collect();
            assert!(!ts.is_empty());
            assert!(ts.windows(2).all(|w| w[0] <= w[1]), "{ts:?}");
        }
    }

    #[test]
    fn rebases_each_medium_to_zero() {
        let mut q = AvPacketQueue::new(128, true);
        assert!(q.feed(audio(1_000_000)).is_empty());
        let out = q.feed(video(2_000_000));
        assert_eq!(timestamps(&out), vec![(true, 0)]);
        let out = q.feed(video(2_000_040));
        assert_eq!(timestamps(&out), vec![(false, 0)]);
    }

    #[test]
    fn merges_in_timestamp_order() {
        let mut q = AvPacketQueue::new(128, true);
        let mut out = Vec::new();
        for p in [video(0), audio(0), audio(23), video(40), audio(46), audio(69), video(80)] {
            out.extend(q.feed(p));
        }
        let ts: Vec<i64> = out.iter().map(|p| p.timestamp).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]), "{ts:?}");
        assert_eq!(timestamps(&out)[..2], [(true, 0), (false, 0)]);
    }

    #[test]
    fn single_medium_drains_at_capacity() {
        let mut q = AvPacketQueue::new(4, true);
        for ts in 0..3 {
            assert!(q.feed(audio(ts * 23)).is_empty());
        }
        let out = q.feed(audio(69));
        assert_eq!(out.len(), 4);
        assert_eq!(q.queued(), (0, 0));
    }

    #[test]
    fn backward_jump_rebases() {
        let mut q = AvPacketQueue::new(2, true);
        q.feed(audio(5000));
        q.feed(audio(5023));
        assert!(q.feed(audio(100)).is_empty());
        assert_eq!(q.queued(), (1, 0));
        let out = q.feed(audio(123));
        assert_eq!(timestamps(&out), vec![(false, 0), (false, 23)]);
    }

    #[test]
    fn tolerated_backward_jump_stays_monotonic() {
        let mut q = AvPacketQueue::new(1, false);
        q.feed(video(1000));
        q.feed(video(1040));
        let out = q.feed(video(900));
        assert_eq!(timestamps(&out), vec![(true, 40)]);
    }

    #[test]
    fn pts_offset_is_preserved() {
        let mut q = AvPacketQueue::new(1, true);
        let mut p = video(1000);
        p.pts = 1080;
        let out = q.feed(p);
        assert_eq!((out[0].timestamp, out[0].pts), (0, 80));
    }
}
