//! RST synthesis for handshakes the application refused.
//!
//! A deferred inbound connection that is closed before any I/O never gets an
//! endpoint, so the reset is forged directly from the parked SYN: addresses
//! and ports swapped, seq 0, ack = SYN seq + 1.

/// Build an RST|ACK IPv4 frame answering `syn`, a raw IPv4 frame carrying a
/// TCP SYN. Returns `None` if the frame is too short to be one.
pub(crate) fn build_rst_from_syn(syn: &[u8]) -> Option<Vec<u8>> {
    if syn.len() < 40 {
        return None;
    }

    let ihl = usize::from(syn[0] & 0x0f) * 4;
    if ihl < 20 || syn.len() < ihl + 20 {
        return None;
    }

    let src_ip: [u8; 4] = syn[12..16].try_into().ok()?;
    let dst_ip: [u8; 4] = syn[16..20].try_into().ok()?;
    let src_port = u16::from_be_bytes([syn[ihl], syn[ihl + 1]]);
    let dst_port = u16::from_be_bytes([syn[ihl + 2], syn[ihl + 3]]);
    let syn_seq =
        u32::from_be_bytes([syn[ihl + 4], syn[ihl + 5], syn[ihl + 6], syn[ihl + 7]]);

    // IP(20) + TCP(20), responding as the "server" side.
    let mut frame = vec![0u8; 40];

    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&40u16.to_be_bytes());
    frame[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
    frame[8] = 64; // TTL
    frame[9] = 6; // TCP
    frame[12..16].copy_from_slice(&dst_ip);
    frame[16..20].copy_from_slice(&src_ip);
    let ip_cksum = ipv4_header_checksum(&frame[..20]);
    frame[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    let tcp = 20;
    frame[tcp..tcp + 2].copy_from_slice(&dst_port.to_be_bytes());
    frame[tcp + 2..tcp + 4].copy_from_slice(&src_port.to_be_bytes());
    // seq 0, ack = syn_seq + 1
    frame[tcp + 8..tcp + 12].copy_from_slice(&syn_seq.wrapping_add(1).to_be_bytes());
    frame[tcp + 12] = 0x50; // data offset 5
    frame[tcp + 13] = 0x14; // RST|ACK
    let tcp_cksum = tcp_checksum(dst_ip, src_ip, &frame[tcp..tcp + 20]);
    frame[tcp + 16..tcp + 18].copy_from_slice(&tcp_cksum.to_be_bytes());

    Some(frame)
}

fn ipv4_header_checksum(header: &[u8]) -> u16 {
    finish(sum_words(header, 0))
}

fn tcp_checksum(src: [u8; 4], dst: [u8; 4], segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum_words(&src, sum);
    sum = sum_words(&dst, sum);
    sum += 6; // protocol
    sum += segment.len() as u32;
    sum = sum_words(segment, sum);
    finish(sum)
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal IPv4+TCP SYN: 1.2.3.4:1000 → 5.6.7.8:80, seq 99.
    fn sample_syn() -> Vec<u8> {
        let mut frame = vec![0u8; 40];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&40u16.to_be_bytes());
        frame[8] = 64;
        frame[9] = 6;
        frame[12..16].copy_from_slice(&[1, 2, 3, 4]);
        frame[16..20].copy_from_slice(&[5, 6, 7, 8]);
        frame[20..22].copy_from_slice(&1000u16.to_be_bytes());
        frame[22..24].copy_from_slice(&80u16.to_be_bytes());
        frame[24..28].copy_from_slice(&99u32.to_be_bytes());
        frame[32] = 0x50;
        frame[33] = 0x02; // SYN
        frame
    }

    #[test]
    fn rst_swaps_endpoints_and_acks_the_syn() {
        let rst = build_rst_from_syn(&sample_syn()).unwrap();

        assert_eq!(&rst[12..16], &[5, 6, 7, 8]); // src = original dst
        assert_eq!(&rst[16..20], &[1, 2, 3, 4]); // dst = original src
        assert_eq!(u16::from_be_bytes([rst[20], rst[21]]), 80);
        assert_eq!(u16::from_be_bytes([rst[22], rst[23]]), 1000);
        assert_eq!(u32::from_be_bytes([rst[24], rst[25], rst[26], rst[27]]), 0);
        assert_eq!(u32::from_be_bytes([rst[28], rst[29], rst[30], rst[31]]), 100);
        assert_eq!(rst[33], 0x14); // RST|ACK
    }

    #[test]
    fn rst_checksums_verify() {
        let rst = build_rst_from_syn(&sample_syn()).unwrap();

        // Both checksum fields must make their covered region sum to zero.
        assert_eq!(finish(sum_words(&rst[..20], 0)), 0);

        let src: [u8; 4] = rst[12..16].try_into().unwrap();
        let dst: [u8; 4] = rst[16..20].try_into().unwrap();
        let mut sum = 0u32;
        sum = sum_words(&src, sum);
        sum = sum_words(&dst, sum);
        sum += 6;
        sum += 20;
        sum = sum_words(&rst[20..40], sum);
        assert_eq!(finish(sum), 0);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(build_rst_from_syn(&[0u8; 20]).is_none());
    }
}
