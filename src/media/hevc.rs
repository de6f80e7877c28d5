//! H.265/HEVC RTP payloading (RFC 7798)
//!
//! The `rtp` crate ships an H.264 payloader but the H.265 side only covers
//! depacketization, so the fragmentation path lives here. NAL units that
//! fit the MTU go out as single-NAL packets; larger ones are split into
//! FU packets (type 49) carrying the original type in the FU header.

use bytes::{BufMut, Bytes, BytesMut};

use super::nal::{h265_nal_type, split_nal_units};

const NAL_AUD: u8 = 35;
const NAL_FILLER: u8 = 38;
const NAL_FU: u8 = 49;

/// Two-byte H.265 NAL header plus the one-byte FU header.
const FU_OVERHEAD: usize = 3;

/// Stateless HEVC payloader over Annex-B input.
#[derive(Debug, Default, Clone)]
pub struct HevcPayloader;

impl HevcPayloader {
    pub fn new() -> Self {
        Self
    }

    /// Split an Annex-B buffer into RTP payloads no larger than `mtu`.
    pub fn payload(&mut self, mtu: usize, data: &[u8]) -> Vec<Bytes> {
        let mut payloads = Vec::new();
        if mtu <= FU_OVERHEAD {
            return payloads;
        }

        for nal in split_nal_units(data) {
            if nal.len() < 2 {
                continue;
            }
            match h265_nal_type(nal) {
                Some(NAL_AUD) | Some(NAL_FILLER) => continue,
                _ => {}
            }

            if nal.len() <= mtu {
                payloads.push(Bytes::copy_from_slice(nal));
            } else {
                fragment(nal, mtu, &mut payloads);
            }
        }

        payloads
    }
}

fn fragment(nal: &[u8], mtu: usize, payloads: &mut Vec<Bytes>) {
    let nal_type = (nal[0] >> 1) & 0x3f;
    // F bit and LayerId MSB survive from the original header; type becomes FU.
    let hdr0 = (nal[0] & 0b1000_0001) | (NAL_FU << 1);
    let hdr1 = nal[1];

    let body = &nal[2..];
    let chunk = mtu - FU_OVERHEAD;
    let mut offset = 0usize;

    while offset < body.len() {
        let take = chunk.min(body.len() - offset);
        let mut pkt = BytesMut::with_capacity(FU_OVERHEAD + take);
        pkt.put_u8(hdr0);
        pkt.put_u8(hdr1);

        let mut fu_header = nal_type;
        if offset == 0 {
            fu_header |= 0x80; // S bit
        }
        if offset + take >= body.len() {
            fu_header |= 0x40; // E bit
        }
        pkt.put_u8(fu_header);
        pkt.put_slice(&body[offset..offset + take]);

        payloads.push(pkt.freeze());
        offset += take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb(nal: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x00, 0x00, 0x00, 0x01];
        buf.extend_from_slice(nal);
        buf
    }

    #[test]
    fn small_nal_is_single_packet() {
        let mut p = HevcPayloader::new();
        let nal = [0x26, 0x01, 0xaa, 0xbb];
        let out = p.payload(1200, &annexb(&nal));
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &nal[..]);
    }

    #[test]
    fn large_nal_fragments_with_s_and_e_bits() {
        let mut p = HevcPayloader::new();
        let mut nal = vec![0x26, 0x01];
        nal.extend(vec![0xcc; 3000]);
        let out = p.payload(1200, &annexb(&nal));
        assert!(out.len() > 1);

        for (i, pkt) in out.iter().enumerate() {
            assert!(pkt.len() <= 1200);
            assert_eq!((pkt[0] >> 1) & 0x3f, 49);
            assert_eq!(pkt[2] & 0x3f, 19); // original type in FU header
            assert_eq!(pkt[2] & 0x80 != 0, i == 0);
            assert_eq!(pkt[2] & 0x40 != 0, i == out.len() - 1);
        }

        // Reassembled FU payloads equal the original NAL body.
        let body: Vec<u8> = out.iter().flat_map(|p| p[3..].to_vec()).collect();
        assert_eq!(body, nal[2..].to_vec());
    }

    #[test]
    fn aud_and_filler_are_dropped() {
        let mut p = HevcPayloader::new();
        // AUD (type 35): header byte 0x46
        let mut buf = annexb(&[0x46, 0x01, 0x50]);
        buf.extend(annexb(&[0x26, 0x01, 0x99]));
        let out = p.payload(1200, &buf);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][0], 0x26);
    }
}
