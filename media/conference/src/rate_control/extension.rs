//! RTP header extension elements (RFC 8285) and splicing them into packets

use bytes::{BufMut, Bytes, BytesMut};

const ONE_BYTE_PROFILE: u16 = 0xBEDE;
const TWO_BYTE_PROFILE: u16 = 0x1000;

/// Iterate the elements of a header extension block
pub(crate) fn elements(profile: u16, data: &[u8]) -> Box<dyn Iterator<Item = (u8, &[u8])> + '_> {
    if profile == ONE_BYTE_PROFILE {
        Box::new(one_byte_elements(data))
    } else if profile & 0xFFF0 == TWO_BYTE_PROFILE {
        Box::new(two_byte_elements(data))
    } else {
        Box::new(std::iter::empty())
    }
}

fn one_byte_elements(mut data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    std::iter::from_fn(move || {
        loop {
            let &[b, ref rest @ ..] = data else {
                return None;
            };

            // Padding
            if b == 0 {
                data = rest;
                continue;
            }

            let id = b >> 4;

            if id == 15 {
                return None;
            }

            let len = usize::from(b & 0x0F) + 1;

            if rest.len() < len {
                return None;
            }

            data = &rest[len..];
            return Some((id, &rest[..len]));
        }
    })
}

fn two_byte_elements(mut data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    std::iter::from_fn(move || {
        loop {
            let &[id, ref rest @ ..] = data else {
                return None;
            };

            if id == 0 {
                data = rest;
                continue;
            }

            let &[len, ref rest @ ..] = rest else {
                return None;
            };

            let len = usize::from(len);

            if rest.len() < len {
                return None;
            }

            data = &rest[len..];
            return Some((id, &rest[..len]));
        }
    })
}

/// Serializes header extension elements into a block padded to 32 bits
pub(crate) struct ElementWriter {
    buf: BytesMut,
    two_byte: bool,
}

impl ElementWriter {
    pub(crate) fn new(two_byte: bool) -> Self {
        Self {
            buf: BytesMut::new(),
            two_byte,
        }
    }

    /// Returns false if the element can't be represented with the chosen header format
    pub(crate) fn write(&mut self, id: u8, data: &[u8]) -> bool {
        if self.two_byte {
            let Ok(len) = u8::try_from(data.len()) else {
                return false;
            };

            if id == 0 {
                return false;
            }

            self.buf.put_u8(id);
            self.buf.put_u8(len);
        } else {
            if !(1..=14).contains(&id) || data.is_empty() || data.len() > 16 {
                return false;
            }

            self.buf.put_u8((id << 4) | (data.len() - 1) as u8);
        }

        self.buf.put_slice(data);
        true
    }

    pub(crate) fn finish(mut self) -> (u16, BytesMut) {
        let profile = if self.two_byte { TWO_BYTE_PROFILE } else { ONE_BYTE_PROFILE };

        let padding = (4 - self.buf.len() % 4) % 4;
        self.buf.put_bytes(0, padding);

        (profile, self.buf)
    }
}

/// Replace the header extension element `id` of an RTP packet
///
/// Other elements are preserved, the block is converted to two-byte headers if required. Returns `None` if the
/// packet is malformed or the element can't be written.
pub(crate) fn set_element(packet: &[u8], id: u8, two_byte: bool, value: &[u8]) -> Option<Bytes> {
    let &[b0, ..] = packet else {
        return None;
    };

    let header_len = 12 + usize::from(b0 & 0x0F) * 4;
    let has_extension = b0 & 0x10 != 0;

    let (existing_profile, existing, payload_offset) = if has_extension {
        let ext = packet.get(header_len..header_len + 4)?;
        let profile = u16::from_be_bytes([ext[0], ext[1]]);
        let len = usize::from(u16::from_be_bytes([ext[2], ext[3]])) * 4;
        let data = packet.get(header_len + 4..header_len + 4 + len)?;

        (profile, data, header_len + 4 + len)
    } else {
        packet.get(..header_len)?;
        (0, &[][..], header_len)
    };

    let existing: Vec<_> = elements(existing_profile, existing)
        .filter(|(existing_id, _)| *existing_id != id)
        .collect();

    let two_byte = two_byte
        || existing_profile & 0xFFF0 == TWO_BYTE_PROFILE
        || existing.iter().any(|(id, data)| *id > 14 || data.len() > 16 || data.is_empty());

    let mut writer = ElementWriter::new(two_byte);

    for (existing_id, data) in existing {
        if !writer.write(existing_id, data) {
            return None;
        }
    }

    if !writer.write(id, value) {
        return None;
    }

    let (profile, block) = writer.finish();
    let words = u16::try_from(block.len() / 4).ok()?;

    let mut out = BytesMut::with_capacity(packet.len() + block.len() + 4);
    out.put_u8(b0 | 0x10);
    out.put_slice(&packet[1..header_len]);
    out.put_u16(profile);
    out.put_u16(words);
    out.put_slice(&block);
    out.put_slice(&packet[payload_offset..]);

    Some(out.freeze())
}
