//! Single MPTCP probe: craft a SYN carrying MP_CAPABLE, send it over a raw
//! socket, and classify the first response that belongs to it.
//!
//! The listener socket is opened and bound before the SYN leaves, so a reply
//! that arrives immediately is already queued for it. Listening happens on a
//! blocking thread whose every read carries the remaining deadline; the probe
//! joins that thread before returning.

use std::io;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use crate::checksum::checksum;
use crate::models::MptcpResult;
use crate::tcp::{flags, MptcpCapable, Segment, TcpOption, TCP_HEADER_LEN};
use crate::utils;

/// Source port used while probes run one at a time
pub const DEFAULT_SOURCE_PORT: u16 = 0xaa47;
/// Window advertised in the probe SYN
pub const PROBE_WINDOW: u16 = 0xaaaa;
/// Default response window
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that stop a probe before it can be classified.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to open raw socket (requires root privileges): {0}")]
    SocketOpen(#[source] io::Error),

    #[error("Failed to bind raw socket to {addr}: {source}")]
    Bind { addr: Ipv4Addr, source: io::Error },

    #[error("Failed to send probe to {addr}: {source}")]
    Write { addr: Ipv4Addr, source: io::Error },

    #[error("Short write to {addr}: wrote {written}/{expected} bytes")]
    ShortWrite { addr: Ipv4Addr, written: usize, expected: usize },

    #[error("Failed to receive response: {0}")]
    Receive(#[source] io::Error),

    #[error("Listener task failed: {0}")]
    Listener(String),
}

/// The TCP portion of a received IPv4 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub source: Ipv4Addr,
    pub segment: Vec<u8>,
}

/// Stream of raw TCP packets addressed to the local host.
pub trait PacketSource {
    /// Wait at most `timeout` for the next packet. `Ok(None)` means the wait
    /// elapsed without one.
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<ReceivedPacket>>;
}

/// Raw IPv4/TCP transport used by the prober.
pub trait RawChannel: Send + Sync {
    type Listener: PacketSource + Send + 'static;

    /// Open a listener bound to `local`. Packets arriving after this returns
    /// are delivered to it.
    fn open_listener(&self, local: Ipv4Addr) -> Result<Self::Listener, ProbeError>;

    /// Send one complete TCP segment from `local` to `remote`.
    fn transmit(&self, local: Ipv4Addr, remote: Ipv4Addr, segment: &[u8]) -> Result<(), ProbeError>;
}

/// One (local, remote, port, version) probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    pub local: Ipv4Addr,
    pub remote: Ipv4Addr,
    pub port: u16,
    pub version: u8,
    pub source_port: u16,
}

/// Classified result plus the measured round trip. `elapsed` is `None` when
/// the probe timed out.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub elapsed: Option<Duration>,
    pub result: MptcpResult,
}

/// Identifies packets that can only be a reply to one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFilter {
    pub remote: Ipv4Addr,
    pub remote_port: u16,
    pub local_port: u16,
}

impl ResponseFilter {
    pub fn for_request(request: &ProbeRequest) -> Self {
        Self { remote: request.remote, remote_port: request.port, local_port: request.source_port }
    }

    fn ports_match(&self, segment: &Segment) -> bool {
        segment.source == self.remote_port && segment.destination == self.local_port
    }
}

/// First response that passed the filter
#[derive(Debug, Clone)]
pub struct Response {
    pub segment: Segment,
    pub received_at: Instant,
}

/// Build the SYN for a probe: SYN only, one MP_CAPABLE option with flags
/// A and H set and no receiver key. The checksum is left at zero.
pub fn build_syn(source_port: u16, port: u16, version: u8, sender_key: u64, seq_num: u32) -> Segment {
    let option = MptcpCapable {
        subtype: 0,
        version,
        a: true,
        b: false,
        c: false,
        h: true,
        sender_key,
        receiver_key: None,
    };
    let header_len = TCP_HEADER_LEN + option.length() as usize;

    Segment {
        source: source_port,
        destination: port,
        seq_num,
        ack_num: 0,
        data_offset: (header_len / 4) as u8,
        reserved: 0,
        ecn: 0,
        ctrl: flags::SYN,
        window: PROBE_WINDOW,
        checksum: 0,
        urgent: 0,
        options: vec![TcpOption::MptcpCapable(option)],
    }
}

/// Read packets until one passes `filter` and decodes, or `timeout` elapses.
///
/// Packets from other hosts, with another port pair, or that fail to decode
/// are dropped. The deadline is handed to every read, so an idle source
/// cannot hold the listener past it.
pub fn listen<S: PacketSource>(
    source: &mut S,
    filter: &ResponseFilter,
    timeout: Duration,
) -> Result<Option<Response>, ProbeError> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        let packet = match source.recv(remaining) {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProbeError::Receive(e)),
        };

        if packet.source != filter.remote {
            continue;
        }

        let segment = match Segment::decode(&packet.segment) {
            Ok(segment) => segment,
            Err(e) => {
                debug!("Discarding undecodable packet from {}: {}", packet.source, e);
                continue;
            }
        };

        if !filter.ports_match(&segment) {
            continue;
        }

        return Ok(Some(Response { segment, received_at: Instant::now() }));
    }
}

/// Classify a response to a probe sent with `sender_key` and `version`.
///
/// Option checks apply in order: missing kind-30 option, echoed sender key,
/// then a version above the one requested. A kind-30 option of any other
/// shape counts as present but has no key or version to check. SYN-ACK and
/// RST are recorded independently of them.
pub fn classify(segment: &Segment, sender_key: u64, version: u8) -> MptcpResult {
    let mut result = MptcpResult::new(version);
    result.flags = segment.ctrl;

    match segment.mptcp_capable() {
        None if segment.has_mptcp_option() => {}
        None => result.no_mptcp_option = true,
        Some(option) => {
            result.receiver_version = option.version;
            // The first key of the reply is the peer's own; it must not be ours
            if option.sender_key == sender_key {
                result.wrong_receiver_key = true;
            } else if option.version > version {
                result.wrong_version = true;
            }
        }
    }

    result.syn_ack = segment.has_flag(flags::SYN) && segment.has_flag(flags::ACK);
    result.rst = segment.has_flag(flags::RST);
    result
}

/// Runs probes over a [`RawChannel`].
pub struct Prober<C> {
    channel: C,
    timeout: Duration,
}

impl<C: RawChannel> Prober<C> {
    pub fn new(channel: C, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[cfg(test)]
    pub(crate) fn channel(&self) -> &C {
        &self.channel
    }

    /// Send one probe and wait for its classification.
    ///
    /// Each probe is sent exactly once. A missing reply is a timeout
    /// outcome, not an error; errors are reserved for the raw socket itself.
    pub async fn probe(&self, request: ProbeRequest) -> Result<ProbeOutcome, ProbeError> {
        let tag = format!("[MPTCP:{}:{}:v{}]", request.remote, request.port, request.version);

        let sender_key = utils::random_sender_key();
        let seq_num = utils::random_tcp_seq();
        let mut segment = build_syn(request.source_port, request.port, request.version, sender_key, seq_num);

        let filter = ResponseFilter::for_request(&request);
        let timeout = self.timeout;
        let mut listener = self.channel.open_listener(request.local)?;

        segment.checksum = checksum(&segment.encode(), request.local, request.remote);
        let bytes = segment.encode();

        // Replies queue on the listener from here on; a failed send drops it here
        let sent_at = Instant::now();
        self.channel.transmit(request.local, request.remote, &bytes)?;
        debug!(
            "{} > Source:{}, Dest:{}, Options:[Kind:30, Version:{}, SenderKey:{}]",
            tag, request.source_port, request.port, request.version, sender_key
        );

        let listening = tokio::task::spawn_blocking(move || listen(&mut listener, &filter, timeout));

        let response = listening
            .await
            .map_err(|e| ProbeError::Listener(e.to_string()))??;

        let Some(response) = response else {
            debug!("{} No response within {:?}", tag, timeout);
            let mut result = MptcpResult::new(request.version);
            result.timeout = true;
            return Ok(ProbeOutcome { elapsed: None, result });
        };

        let elapsed = response.received_at.saturating_duration_since(sent_at);
        debug!(
            "{} < Flags:{}, Options:{}",
            tag,
            describe_flags(response.segment.ctrl),
            describe_options(&response.segment)
        );

        let mut result = classify(&response.segment, sender_key, request.version);
        result.set_latency(elapsed);
        if result.wrong_receiver_key {
            warn!("{} Peer echoed our sender key", tag);
        }
        Ok(ProbeOutcome { elapsed: Some(elapsed), result })
    }
}

fn describe_flags(ctrl: u8) -> String {
    const NAMES: [(u8, &str); 6] = [
        (flags::URG, "URG"),
        (flags::ACK, "ACK"),
        (flags::PSH, "PSH"),
        (flags::RST, "RST"),
        (flags::SYN, "SYN"),
        (flags::FIN, "FIN"),
    ];

    let names: Vec<&str> = NAMES.iter().filter(|(bit, _)| ctrl & bit != 0).map(|(_, name)| *name).collect();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join("|")
    }
}

fn describe_options(segment: &Segment) -> String {
    segment
        .options
        .iter()
        .map(|option| match option {
            TcpOption::MptcpCapable(mptcp) => format!(
                "[Kind:{}, Length:{}, Version:{}, Key:{}]",
                option.kind(),
                option.length(),
                mptcp.version,
                mptcp.sender_key
            ),
            TcpOption::Generic { .. } => format!("[Kind:{}, Length:{}]", option.kind(), option.length()),
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::checksum::{ones_complement_sum, pseudo_header};
    use crate::tcp::MPTCP_KIND;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn request(version: u8) -> ProbeRequest {
        ProbeRequest { local: LOCAL, remote: REMOTE, port: 443, version, source_port: DEFAULT_SOURCE_PORT }
    }

    fn response(ctrl: u8, options: Vec<TcpOption>) -> Segment {
        let probe = build_syn(DEFAULT_SOURCE_PORT, 443, 1, 7, 1);
        Segment::decode(&reply(REMOTE, &probe, ctrl, options).segment).unwrap()
    }

    #[test]
    fn syn_probe_layout() {
        let segment = build_syn(DEFAULT_SOURCE_PORT, 80, 1, 0x1122_3344_5566_7788, 42);
        let bytes = segment.encode();

        assert_eq!(bytes.len(), 32);
        assert_eq!(segment.data_offset, 8);
        assert_eq!(segment.ctrl, flags::SYN);
        assert_eq!(segment.window, PROBE_WINDOW);
        assert_eq!(&bytes[20..24], &[30, 12, 0x01, 0x81]);
    }

    #[test]
    fn classification_table() {
        const KEY: u64 = 0xabcd;
        const REQUESTED: u8 = 0;

        for bits in 0u8..32 {
            let option_present = bits & 1 != 0;
            let key_echoed = bits & 2 != 0;
            let version_higher = bits & 4 != 0;
            let syn_ack = bits & 8 != 0;
            let rst = bits & 16 != 0;

            let mut ctrl = 0;
            if syn_ack {
                ctrl |= flags::SYN | flags::ACK;
            }
            if rst {
                ctrl |= flags::RST;
            }
            let peer_version = if version_higher { REQUESTED + 1 } else { REQUESTED };
            let peer_key = if key_echoed { KEY } else { KEY + 1 };
            let options = if option_present { vec![mptcp_option(peer_version, peer_key)] } else { Vec::new() };

            let result = classify(&response(ctrl, options), KEY, REQUESTED);

            assert_eq!(result.no_mptcp_option, !option_present, "case {bits:05b}");
            assert_eq!(result.wrong_receiver_key, option_present && key_echoed, "case {bits:05b}");
            assert_eq!(
                result.wrong_version,
                option_present && !key_echoed && version_higher,
                "case {bits:05b}"
            );
            assert_eq!(result.syn_ack, syn_ack, "case {bits:05b}");
            assert_eq!(result.rst, rst, "case {bits:05b}");
            assert!(!result.timeout, "case {bits:05b}");
            assert_eq!(result.flags, ctrl, "case {bits:05b}");
            assert_eq!(result.sender_version, REQUESTED);
            assert_eq!(result.receiver_version, if option_present { peer_version } else { 0 });
        }
    }

    #[test]
    fn syn_alone_is_not_syn_ack() {
        let result = classify(&response(flags::SYN, Vec::new()), 1, 0);
        assert!(!result.syn_ack);
        let result = classify(&response(flags::ACK, Vec::new()), 1, 0);
        assert!(!result.syn_ack);
    }

    #[test]
    fn opaque_kind_30_option_counts_as_present() {
        // A kind-30 option that is not a 12 or 20 byte MP_CAPABLE
        let opaque = TcpOption::Generic { kind: MPTCP_KIND, length: 8, data: vec![0x11, 0x81, 0, 0, 0, 7] };
        let segment = response(flags::SYN | flags::ACK, vec![opaque]);
        assert!(segment.mptcp_capable().is_none());

        let result = classify(&segment, 7, 0);
        assert!(!result.no_mptcp_option);
        assert!(!result.wrong_receiver_key);
        assert!(!result.wrong_version);
        assert_eq!(result.receiver_version, 0);
        assert!(result.syn_ack);
    }

    #[test]
    fn flags_are_named_for_logging() {
        assert_eq!(describe_flags(flags::SYN | flags::ACK), "ACK|SYN");
        assert_eq!(describe_flags(flags::RST | flags::ACK | flags::FIN | flags::PSH | flags::URG), "URG|ACK|PSH|RST|FIN");
        assert_eq!(describe_flags(0), "none");
    }

    #[test]
    fn listen_skips_foreign_packets() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut source = ScriptedListener::new(rx);
        let probe = build_syn(DEFAULT_SOURCE_PORT, 443, 0, 5, 1);

        let mut wrong_ports = reply(REMOTE, &probe, flags::RST, Vec::new());
        wrong_ports.segment[2..4].copy_from_slice(&1234u16.to_be_bytes());
        tx.send(reply(Ipv4Addr::new(10, 0, 0, 9), &probe, flags::RST, Vec::new())).unwrap();
        tx.send(wrong_ports).unwrap();
        tx.send(ReceivedPacket { source: REMOTE, segment: vec![0u8; 10] }).unwrap();
        tx.send(reply(REMOTE, &probe, flags::SYN | flags::ACK, vec![mptcp_option(0, 99)])).unwrap();

        let filter = ResponseFilter::for_request(&request(0));
        let response = listen(&mut source, &filter, Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(response.segment.ctrl, flags::SYN | flags::ACK);
        assert_eq!(response.segment.mptcp_capable().unwrap().sender_key, 99);
    }

    #[test]
    fn listen_gives_up_at_the_deadline() {
        let (_tx, rx) = std::sync::mpsc::channel();
        let mut source = ScriptedListener::new(rx);
        let filter = ResponseFilter::for_request(&request(0));

        let started = Instant::now();
        let response = listen(&mut source, &filter, Duration::from_millis(50)).unwrap();
        assert!(response.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn listen_surfaces_receive_errors() {
        let (tx, rx) = std::sync::mpsc::channel::<ReceivedPacket>();
        drop(tx);
        let mut source = ScriptedListener::new(rx);
        let filter = ResponseFilter::for_request(&request(0));
        assert!(matches!(listen(&mut source, &filter, Duration::from_secs(1)), Err(ProbeError::Receive(_))));
    }

    #[tokio::test]
    async fn probe_classifies_syn_ack_with_fresh_key() {
        let channel = ScriptedChannel::new(|remote, probe| {
            vec![reply(remote, probe, flags::SYN | flags::ACK, vec![mptcp_option(1, 0x5555)])]
        });
        let prober = Prober::new(channel, Duration::from_secs(2));

        let outcome = prober.probe(request(1)).await.unwrap();
        assert!(outcome.elapsed.is_some());
        assert!(outcome.result.is_mptcp_capable());
        assert_eq!(outcome.result.receiver_version, 1);
        assert_eq!(outcome.result.flags, flags::SYN | flags::ACK);
        assert!(outcome.result.latency_ms.is_some());
    }

    #[tokio::test]
    async fn probe_detects_echoed_key() {
        let channel = ScriptedChannel::new(|remote, probe| {
            vec![reply(remote, probe, flags::SYN | flags::ACK, vec![mptcp_option(0, probe_key(probe))])]
        });
        let prober = Prober::new(channel, Duration::from_secs(2));

        let result = prober.probe(request(0)).await.unwrap().result;
        assert!(result.wrong_receiver_key);
        assert!(!result.wrong_version);
        assert!(result.syn_ack);
    }

    #[tokio::test]
    async fn probe_reports_rst_without_option() {
        let channel = ScriptedChannel::new(|remote, probe| vec![reply(remote, probe, flags::RST | flags::ACK, Vec::new())]);
        let prober = Prober::new(channel, Duration::from_secs(2));

        let result = prober.probe(request(0)).await.unwrap().result;
        assert!(result.rst);
        assert!(result.no_mptcp_option);
        assert!(!result.syn_ack);
    }

    #[tokio::test]
    async fn probe_times_out_with_every_other_classifier_clear() {
        let prober = Prober::new(ScriptedChannel::silent(), Duration::from_millis(50));

        let outcome = prober.probe(request(1)).await.unwrap();
        assert_eq!(outcome.elapsed, None);
        let result = outcome.result;
        assert!(result.timeout);
        assert!(!result.no_mptcp_option);
        assert!(!result.wrong_version);
        assert!(!result.wrong_receiver_key);
        assert!(!result.rst);
        assert!(!result.syn_ack);
        assert_eq!(result.sender_version, 1);
        assert_eq!(result.latency_ms, None);
    }

    #[tokio::test]
    async fn probe_uses_the_matching_packet_only() {
        let channel = ScriptedChannel::new(|remote, probe| {
            vec![
                reply(Ipv4Addr::new(8, 8, 8, 8), probe, flags::RST, Vec::new()),
                reply(remote, probe, flags::SYN | flags::ACK, vec![mptcp_option(3, 1)]),
            ]
        });
        let prober = Prober::new(channel, Duration::from_secs(2));

        let result = prober.probe(request(1)).await.unwrap().result;
        assert!(!result.rst);
        assert!(result.syn_ack);
        assert!(result.wrong_version);
        assert_eq!(result.receiver_version, 3);
    }

    #[tokio::test]
    async fn failed_send_releases_the_listener_before_returning() {
        let prober = Prober::new(ScriptedChannel::failing(Failure::ShortWrite), Duration::from_secs(5));

        let started = Instant::now();
        let err = prober.probe(request(0)).await.unwrap_err();
        assert!(matches!(err, ProbeError::ShortWrite { written: 16, expected: 32, .. }));
        assert_eq!(prober.channel.opened(), 1);
        assert_eq!(prober.channel.closed(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn listener_open_failure_sends_nothing() {
        let prober = Prober::new(ScriptedChannel::failing(Failure::OpenListener), Duration::from_secs(2));

        let err = prober.probe(request(0)).await.unwrap_err();
        assert!(matches!(err, ProbeError::SocketOpen(_)));
        assert!(prober.channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn listener_is_released_after_a_reply() {
        let channel = ScriptedChannel::new(|remote, probe| vec![reply(remote, probe, flags::RST, Vec::new())]);
        let prober = Prober::new(channel, Duration::from_secs(2));

        prober.probe(request(0)).await.unwrap();
        assert_eq!(prober.channel.closed(), 1);
    }

    #[tokio::test]
    async fn transmitted_segment_carries_a_valid_checksum() {
        let prober = Prober::new(ScriptedChannel::silent(), Duration::from_millis(10));
        prober.probe(request(0)).await.unwrap();

        let sent = prober.channel.sent.lock();
        let (local, remote, bytes) = &sent[0];
        assert_eq!(bytes.len(), 32);
        let pseudo = pseudo_header(*local, *remote, bytes.len());
        assert_eq!(ones_complement_sum(&[&pseudo, bytes]), 0xffff);

        let segment = Segment::decode(bytes).unwrap();
        assert_eq!(segment.source, DEFAULT_SOURCE_PORT);
        assert_eq!(segment.destination, 443);
        assert_eq!(segment.ctrl, flags::SYN);
    }
}
