//! TCP checksum over the IPv4 pseudo-header.

use std::net::Ipv4Addr;

/// IP protocol number for TCP.
pub const PROTOCOL_TCP: u8 = 6;

/// Build the 12-byte pseudo-header: source, destination, zero, protocol,
/// and the 16-bit segment length.
pub fn pseudo_header(source: Ipv4Addr, destination: Ipv4Addr, segment_len: usize) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&source.octets());
    header[4..8].copy_from_slice(&destination.octets());
    header[8] = 0;
    header[9] = PROTOCOL_TCP;
    header[10..12].copy_from_slice(&(segment_len as u16).to_be_bytes());
    header
}

/// Sum `chunks` as one contiguous run of big-endian 16-bit words and fold the
/// carries back in twice. A trailing odd byte is the high half of a word.
pub fn ones_complement_sum(chunks: &[&[u8]]) -> u16 {
    let data: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect();

    let mut sum: u32 = data
        .chunks(2)
        .map(|word| match word {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    // End-around carry, then the carry produced by adding it
    sum = (sum >> 16) + (sum & 0xffff);
    sum += sum >> 16;
    sum as u16
}

/// Checksum for `segment` sent from `source` to `destination`. The checksum
/// field inside `segment` must be zero.
pub fn checksum(segment: &[u8], source: Ipv4Addr, destination: Ipv4Addr) -> u16 {
    let pseudo = pseudo_header(source, destination, segment.len());
    !ones_complement_sum(&[&pseudo, segment])
}
