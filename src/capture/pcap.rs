//! Legacy pcap file packet source
//!
//! Reads a pcap trace and yields TCP segments with their flow keys and
//! capture timestamps. Link-layer handling covers Ethernet (with one VLAN
//! tag), BSD loopback, and raw IP captures; everything that is not TCP over
//! IPv4/IPv6 is skipped.

use crate::capture::{CaptureInfo, FlowKey, PacketSource, TcpSegment};
use crate::error::{ReplayError, Result};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, Linktype, PcapBlockOwned, PcapError};
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// Packet source backed by a legacy pcap file
pub struct PcapFileSource {
    reader: LegacyPcapReader<File>,
    linktype: Linktype,
}

impl PcapFileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = LegacyPcapReader::new(65536, file)
            .map_err(|e| ReplayError::capture(format!("open {}: {}", path.display(), e)))?;
        Ok(Self {
            reader,
            linktype: Linktype::ETHERNET,
        })
    }
}

impl PacketSource for PcapFileSource {
    fn next_packet(&mut self) -> Result<Option<(FlowKey, TcpSegment, CaptureInfo)>> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let parsed = match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            self.linktype = header.network;
                            None
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            let ts = packet.ts_sec as i64 * 1000 + packet.ts_usec as i64 / 1000;
                            decode_frame(self.linktype, packet.data)
                                .map(|(flow, segment)| (flow, segment, CaptureInfo { ts }))
                        }
                        PcapBlockOwned::NG(_) => None,
                    };
                    self.reader.consume(offset);
                    if parsed.is_some() {
                        return Ok(parsed);
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    self.reader
                        .refill()
                        .map_err(|e| ReplayError::capture(format!("refill: {}", e)))?;
                }
                Err(e) => return Err(ReplayError::capture(format!("read pcap: {}", e))),
            }
        }
    }
}

fn decode_frame(linktype: Linktype, data: &[u8]) -> Option<(FlowKey, TcpSegment)> {
    if linktype == Linktype::ETHERNET {
        decode_ethernet(data)
    } else if linktype == Linktype::NULL || linktype == Linktype::LOOP {
        decode_ip(data.get(4..)?)
    } else if linktype == Linktype::RAW || linktype.0 == 228 || linktype.0 == 229 {
        // LINKTYPE_RAW and the explicit IPv4/IPv6 capture types
        decode_ip(data)
    } else {
        None
    }
}

fn decode_ethernet(data: &[u8]) -> Option<(FlowKey, TcpSegment)> {
    let mut ethertype = u16::from_be_bytes([*data.get(12)?, *data.get(13)?]);
    let mut at = 14;
    if ethertype == ETHERTYPE_VLAN {
        ethertype = u16::from_be_bytes([*data.get(16)?, *data.get(17)?]);
        at = 18;
    }
    match ethertype {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => decode_ip(data.get(at..)?),
        _ => None,
    }
}

fn decode_ip(data: &[u8]) -> Option<(FlowKey, TcpSegment)> {
    match data.first()? >> 4 {
        4 => decode_ipv4(data),
        6 => decode_ipv6(data),
        _ => None,
    }
}

fn decode_ipv4(data: &[u8]) -> Option<(FlowKey, TcpSegment)> {
    let header_len = ((data.first()? & 0x0f) as usize) * 4;
    if header_len < 20 || data.len() < header_len {
        return None;
    }
    if data[9] != 6 {
        return None;
    }
    // Non-first fragments carry no TCP header.
    let frag = u16::from_be_bytes([data[6], data[7]]);
    if frag & 0x1fff != 0 {
        return None;
    }
    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = total_len.clamp(header_len, data.len());
    let src = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));
    decode_tcp(src, dst, &data[header_len..end])
}

fn decode_ipv6(data: &[u8]) -> Option<(FlowKey, TcpSegment)> {
    if data.len() < 40 || data[6] != 6 {
        return None;
    }
    let mut src = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&data[24..40]);
    let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let end = (40 + payload_len).min(data.len());
    decode_tcp(
        IpAddr::V6(Ipv6Addr::from(src)),
        IpAddr::V6(Ipv6Addr::from(dst)),
        &data[40..end],
    )
}

fn decode_tcp(src: IpAddr, dst: IpAddr, data: &[u8]) -> Option<(FlowKey, TcpSegment)> {
    if data.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let header_len = ((data[12] >> 4) as usize) * 4;
    if header_len < 20 || data.len() < header_len {
        return None;
    }
    let flags = data[13];
    let flow = FlowKey {
        src: SocketAddr::new(src, src_port),
        dst: SocketAddr::new(dst, dst_port),
    };
    let segment = TcpSegment {
        seq,
        syn: flags & 0x02 != 0,
        ack: flags & 0x10 != 0,
        fin: flags & 0x01 != 0,
        rst: flags & 0x04 != 0,
        payload: data[header_len..].to_vec(),
    };
    Some((flow, segment))
}
