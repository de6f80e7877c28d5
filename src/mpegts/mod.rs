//! MPEG transport stream muxing
//!
//! Minimal single-program TS writer used by the SRT sink and the HLS
//! segment transmux. PAT/PMT are re-emitted ahead of every keyframe access
//! unit so a receiver can join at any segment boundary. PIDs: PAT 0,
//! PMT 0x1000, elementary streams 256 + track index; the PCR rides the
//! first video track.

use std::io::Write;

use crate::error::{Result, SinkError};
use crate::media::MimeType;

const TS_PACKET_SIZE: usize = 188;
const PMT_PID: u16 = 0x1000;
const FIRST_ES_PID: u16 = 256;

/// Codec identity of one elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsCodec {
    H264,
    H265,
    AacAdts,
    Opus,
}

impl TsCodec {
    pub fn from_mime(mime: MimeType) -> Result<Self> {
        match mime {
            MimeType::VideoH264 => Ok(Self::H264),
            MimeType::VideoH265 => Ok(Self::H265),
            MimeType::AudioAac => Ok(Self::AacAdts),
            MimeType::AudioOpus => Ok(Self::Opus),
            other => Err(SinkError::Codec(format!(
                "{} cannot be carried in MPEG-TS",
                other.as_str()
            ))),
        }
    }

    fn stream_type(self) -> u8 {
        match self {
            Self::H264 => 0x1b,
            Self::H265 => 0x24,
            Self::AacAdts => 0x0f,
            // Private data with an Opus registration descriptor in the PMT.
            Self::Opus => 0x06,
        }
    }

    fn is_video(self) -> bool {
        matches!(self, Self::H264 | Self::H265)
    }

    fn pes_stream_id(self) -> u8 {
        if self.is_video() {
            0xe0
        } else {
            0xc0
        }
    }
}

struct TsTrack {
    pid: u16,
    codec: TsCodec,
    continuity: u8,
}

/// Transport stream writer over any byte sink.
pub struct TsWriter<W: Write> {
    out: W,
    tracks: Vec<TsTrack>,
    pcr_pid: u16,
    pat_continuity: u8,
    pmt_continuity: u8,
    tables_written: bool,
}

impl<W: Write> TsWriter<W> {
    pub fn new(out: W, codecs: &[TsCodec]) -> Self {
        let tracks: Vec<TsTrack> = codecs
            .iter()
            .enumerate()
            .map(|(i, codec)| TsTrack {
                pid: FIRST_ES_PID + i as u16,
                codec: *codec,
                continuity: 0,
            })
            .collect();
        let pcr_pid = tracks
            .iter()
            .find(|t| t.codec.is_video())
            .map(|t| t.pid)
            .unwrap_or(FIRST_ES_PID);
        Self {
            out,
            tracks,
            pcr_pid,
            pat_continuity: 0,
            pmt_continuity: 0,
            tables_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Access the underlying byte sink, e.g. to drain an in-memory buffer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }

    /// Write one H.26x access unit from its NAL units (no start codes).
    pub fn write_h26x(
        &mut self,
        track: usize,
        pts_90k: i64,
        keyframe: bool,
        nalus: &[&[u8]],
    ) -> Result<()> {
        let mut es = Vec::with_capacity(nalus.iter().map(|n| n.len() + 4).sum());
        for nal in nalus {
            es.extend_from_slice(&[0, 0, 0, 1]);
            es.extend_from_slice(nal);
        }
        self.write_access_unit(track, pts_90k, keyframe, &es)
    }

    /// Write one audio access unit (ADTS frame or Opus packet).
    pub fn write_audio(&mut self, track: usize, pts_90k: i64, data: &[u8]) -> Result<()> {
        self.write_access_unit(track, pts_90k, false, data)
    }

    fn write_access_unit(
        &mut self,
        track: usize,
        pts_90k: i64,
        random_access: bool,
        es: &[u8],
    ) -> Result<()> {
        if track >= self.tracks.len() {
            return Err(SinkError::State(format!("invalid track index {}", track)));
        }

        if random_access || !self.tables_written {
            self.write_tables()?;
            self.tables_written = true;
        }

        let codec = self.tracks[track].codec;
        let pes = build_pes(codec.pes_stream_id(), pts_90k, es, codec.is_video());
        let pid = self.tracks[track].pid;
        let pcr = (pid == self.pcr_pid).then_some((pts_90k as u64) & ((1 << 33) - 1));
        self.write_pid_payload(track, &pes, random_access, pcr)
    }

    fn write_tables(&mut self) -> Result<()> {
        let pat = build_pat();
        let cc = self.pat_continuity;
        self.pat_continuity = (cc + 1) & 0x0f;
        self.write_section(0, cc, &pat)?;

        let pmt = build_pmt(self.pcr_pid, &self.tracks);
        let cc = self.pmt_continuity;
        self.pmt_continuity = (cc + 1) & 0x0f;
        self.write_section(PMT_PID, cc, &pmt)
    }

    fn write_section(&mut self, pid: u16, continuity: u8, section: &[u8]) -> Result<()> {
        let mut packet = [0xffu8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1f);
        packet[2] = pid as u8;
        packet[3] = 0x10 | continuity;
        packet[4] = 0; // pointer_field
        packet[5..5 + section.len()].copy_from_slice(section);
        self.out
            .write_all(&packet)
            .map_err(|e| SinkError::TransportWrite(format!("ts write: {}", e)))?;
        Ok(())
    }

    fn write_pid_payload(
        &mut self,
        track: usize,
        payload: &[u8],
        random_access: bool,
        pcr: Option<u64>,
    ) -> Result<()> {
        let pid = self.tracks[track].pid;
        let mut offset = 0usize;
        let mut first = true;

        while offset < payload.len() {
            let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
            let remaining = payload.len() - offset;

            packet.push(0x47);
            packet.push(if first { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1f));
            packet.push(pid as u8);

            let continuity = self.tracks[track].continuity;
            self.tracks[track].continuity = (continuity + 1) & 0x0f;

            let needs_af = (first && (random_access || pcr.is_some())) || remaining < 184;
            if needs_af {
                packet.push(0x30 | continuity);

                let mut af = Vec::new();
                let mut af_flags = 0u8;
                if first && random_access {
                    af_flags |= 0x40;
                }
                if first && pcr.is_some() {
                    af_flags |= 0x10;
                }
                af.push(af_flags);
                if let Some(base) = if first { pcr } else { None } {
                    af.push((base >> 25) as u8);
                    af.push((base >> 17) as u8);
                    af.push((base >> 9) as u8);
                    af.push((base >> 1) as u8);
                    af.push((((base & 1) as u8) << 7) | 0x7e);
                    af.push(0);
                }

                // Pad the adaptation field so payload fills the packet.
                let take = remaining.min(184 - 1 - af.len());
                let af_len = 184 - 1 - take;
                packet.push(af_len as u8);
                packet.extend_from_slice(&af);
                packet.resize(TS_PACKET_SIZE - take, 0xff);
                packet.extend_from_slice(&payload[offset..offset + take]);
                offset += take;
            } else {
                packet.push(0x10 | continuity);
                packet.extend_from_slice(&payload[offset..offset + 184]);
                offset += 184;
            }

            debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
            self.out
                .write_all(&packet)
                .map_err(|e| SinkError::TransportWrite(format!("ts write: {}", e)))?;
            first = false;
        }

        Ok(())
    }
}

fn build_pes(stream_id: u8, pts_90k: i64, es: &[u8], unbounded: bool) -> Vec<u8> {
    let mut pes = Vec::with_capacity(es.len() + 14);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);

    // Header extension: PTS only (5 bytes).
    let packet_len = if unbounded {
        0
    } else {
        (3 + 5 + es.len()).min(0xffff) as u16
    };
    pes.extend_from_slice(&packet_len.to_be_bytes());
    pes.push(0x80); // marker bits
    pes.push(0x80); // PTS_DTS_flags = '10'
    pes.push(5); // PES_header_data_length

    let pts = (pts_90k as u64) & ((1 << 33) - 1);
    pes.push(0x20 | (((pts >> 30) as u8 & 0x07) << 1) | 1);
    pes.push((pts >> 22) as u8);
    pes.push((((pts >> 15) as u8 & 0x7f) << 1) | 1);
    pes.push((pts >> 7) as u8);
    pes.push(((pts as u8 & 0x7f) << 1) | 1);

    pes.extend_from_slice(es);
    pes
}

fn build_pat() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes()); // transport_stream_id
    body.push(0xc1); // version 0, current
    body.push(0); // section_number
    body.push(0); // last_section_number
    body.extend_from_slice(&1u16.to_be_bytes()); // program_number
    body.extend_from_slice(&(0xe000 | PMT_PID).to_be_bytes());
    finish_section(0x00, body)
}

fn build_pmt(pcr_pid: u16, tracks: &[TsTrack]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes()); // program_number
    body.push(0xc1);
    body.push(0);
    body.push(0);
    body.extend_from_slice(&(0xe000 | pcr_pid).to_be_bytes());
    body.extend_from_slice(&0xf000u16.to_be_bytes()); // program_info_length = 0

    for track in tracks {
        body.push(track.codec.stream_type());
        body.extend_from_slice(&(0xe000 | track.pid).to_be_bytes());
        if track.codec == TsCodec::Opus {
            // registration descriptor "Opus"
            body.extend_from_slice(&0xf006u16.to_be_bytes());
            body.extend_from_slice(&[0x05, 0x04, b'O', b'p', b'u', b's']);
        } else {
            body.extend_from_slice(&0xf000u16.to_be_bytes());
        }
    }

    finish_section(0x02, body)
}

fn finish_section(table_id: u8, body: Vec<u8>) -> Vec<u8> {
    let mut section = Vec::with_capacity(body.len() + 8);
    section.push(table_id);
    let length = (body.len() + 4) as u16; // body + CRC
    section.extend_from_slice(&(0xb000 | length).to_be_bytes());
    section.extend_from_slice(&body);
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pids(stream: &[u8]) -> Vec<u16> {
        stream
            .chunks(TS_PACKET_SIZE)
            .map(|p| ((p[1] as u16 & 0x1f) << 8) | p[2] as u16)
            .collect()
    }

    #[test]
    fn output_is_packet_aligned_with_sync_bytes() {
        let mut w = TsWriter::new(Vec::new(), &[TsCodec::H264]);
        w.write_h26x(0, 90_000, true, &[&[0x65, 0x88, 0x84]]).unwrap();
        let out = w.into_inner();

        assert!(!out.is_empty());
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        for packet in out.chunks(TS_PACKET_SIZE) {
            assert_eq!(packet[0], 0x47);
        }
    }

    #[test]
    fn tables_precede_first_payload() {
        let mut w = TsWriter::new(Vec::new(), &[TsCodec::H264, TsCodec::Opus]);
        w.write_h26x(0, 0, true, &[&[0x65, 0x01]]).unwrap();
        let out = w.into_inner();

        let pids = pids(&out);
        assert_eq!(pids[0], 0); // PAT
        assert_eq!(pids[1], PMT_PID);
        assert_eq!(pids[2], FIRST_ES_PID);
    }

    #[test]
    fn audio_rides_its_own_pid() {
        let mut w = TsWriter::new(Vec::new(), &[TsCodec::H264, TsCodec::Opus]);
        w.write_h26x(0, 0, true, &[&[0x65, 0x01]]).unwrap();
        w.write_audio(1, 960, b"opus-packet").unwrap();
        let out = w.into_inner();
        assert!(pids(&out).contains(&(FIRST_ES_PID + 1)));
    }

    #[test]
    fn pes_carries_encoded_pts() {
        let pes = build_pes(0xe0, 90_000, &[0xab], true);
        assert_eq!(&pes[0..4], &[0x00, 0x00, 0x01, 0xe0]);
        // Decode the 33-bit PTS back out of the 5-byte field.
        let b = &pes[9..14];
        let pts = (((b[0] as u64 >> 1) & 0x07) << 30)
            | ((b[1] as u64) << 22)
            | (((b[2] as u64 >> 1) & 0x7f) << 15)
            | ((b[3] as u64) << 7)
            | ((b[4] as u64 >> 1) & 0x7f);
        assert_eq!(pts, 90_000);
    }

    #[test]
    fn invalid_track_is_a_state_error() {
        let mut w = TsWriter::new(Vec::new(), &[TsCodec::H264]);
        assert!(w.write_audio(5, 0, b"x").is_err());
    }

    #[test]
    fn crc_matches_known_vector() {
        // CRC-32/MPEG-2 of "123456789" is 0x0376e6e7.
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_e6e7);
    }
}
