//! Minimal RTCP parsing and building for the packets the conference consumes or produces itself

use bytes::{BufMut, Bytes, BytesMut};

pub(crate) const PT_SR: u8 = 200;
pub(crate) const PT_RR: u8 = 201;
/// Transport layer feedback
pub(crate) const PT_RTPFB: u8 = 205;
/// Payload specific feedback
pub(crate) const PT_PSFB: u8 = 206;

/// Picture loss indication
pub(crate) const FMT_PLI: u8 = 1;
/// TFRC feedback report
pub(crate) const FMT_TFRC: u8 = 2;

/// A single packet of a compound RTCP packet
#[derive(Debug, Clone, Copy)]
pub(crate) struct RtcpPacket<'a> {
    /// Report count or feedback message type
    pub(crate) count: u8,
    pub(crate) pt: u8,
    /// Length in 32 bit words minus one, as found in the header
    pub(crate) length: u16,
    /// The whole packet including its header
    pub(crate) data: &'a [u8],
}

impl RtcpPacket<'_> {
    fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// SSRC of the packet's sender, present in all packet types this crate looks at
    pub(crate) fn sender_ssrc(&self) -> Option<u32> {
        self.read_u32(4)
    }

    /// Media source SSRC of a feedback message
    pub(crate) fn media_ssrc(&self) -> Option<u32> {
        matches!(self.pt, PT_RTPFB | PT_PSFB)
            .then(|| self.read_u32(8))
            .flatten()
    }

    /// Feedback control information of a feedback message
    pub(crate) fn fci(&self) -> &[u8] {
        self.data.get(12..).unwrap_or_default()
    }
}

/// Iterate the packets of a compound RTCP packet, stops at the first malformed one
pub(crate) fn packets(mut data: &[u8]) -> impl Iterator<Item = RtcpPacket<'_>> {
    std::iter::from_fn(move || {
        let &[b0, pt, l0, l1, ..] = data else {
            return None;
        };

        if b0 >> 6 != 2 {
            return None;
        }

        let length = u16::from_be_bytes([l0, l1]);
        let len = (usize::from(length) + 1) * 4;

        if data.len() < len {
            return None;
        }

        let packet = RtcpPacket {
            count: b0 & 0x1F,
            pt,
            length,
            data: &data[..len],
        };

        data = &data[len..];

        Some(packet)
    })
}

/// SSRC of the sender of the first sender or receiver report
pub(crate) fn report_sender_ssrc(data: &[u8]) -> Option<u32> {
    packets(data)
        .find(|packet| matches!(packet.pt, PT_SR | PT_RR))
        .and_then(|packet| packet.sender_ssrc())
}

/// Returns if the data looks like RTCP rather than RTP (RFC 5761 section 4)
pub(crate) fn is_rtcp(data: &[u8]) -> bool {
    data.get(1).is_some_and(|pt| (192..=223).contains(pt))
}

/// Build a feedback message with the given FCI
pub(crate) fn feedback(pt: u8, fmt: u8, sender_ssrc: u32, media_ssrc: u32, fci: &[u8]) -> Bytes {
    debug_assert!(fci.len() % 4 == 0);

    let len = 12 + fci.len();
    let mut buf = BytesMut::with_capacity(len);

    buf.put_u8(0x80 | (fmt & 0x1F));
    buf.put_u8(pt);
    buf.put_u16((len / 4 - 1) as u16);
    buf.put_u32(sender_ssrc);
    buf.put_u32(media_ssrc);
    buf.put_slice(fci);

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_iteration() {
        let pli = feedback(PT_PSFB, FMT_PLI, 1, 2, &[]);
        let tfrc = feedback(PT_RTPFB, FMT_TFRC, 3, 4, &[0; 16]);

        let mut compound = pli.to_vec();
        compound.extend_from_slice(&tfrc);

        let packets: Vec<_> = packets(&compound).collect();

        assert_eq!(packets.len(), 2);
        assert_eq!((packets[0].pt, packets[0].count, packets[0].length), (PT_PSFB, FMT_PLI, 2));
        assert_eq!(packets[0].media_ssrc(), Some(2));
        assert_eq!((packets[1].pt, packets[1].count, packets[1].length), (PT_RTPFB, FMT_TFRC, 6));
        assert_eq!(packets[1].sender_ssrc(), Some(3));
        assert_eq!(packets[1].fci().len(), 16);
    }

    #[test]
    fn truncated_packets_stop_iteration() {
        let tfrc = feedback(PT_RTPFB, FMT_TFRC, 3, 4, &[0; 16]);

        assert_eq!(packets(&tfrc[..20]).count(), 0);
        assert_eq!(packets(&[0x00, 200, 0, 0]).count(), 0);
    }

    #[test]
    fn receiver_report_ssrc() {
        let rr = [0x80, PT_RR, 0, 1, 0xDE, 0xAD, 0xBE, 0xEF];

        assert!(is_rtcp(&rr));
        assert_eq!(report_sender_ssrc(&rr), Some(0xDEADBEEF));
        assert!(!is_rtcp(&[0x80, 0x60, 0, 1]));
    }
}
