// Author: Lukas Bower
// Purpose: Outbound requests and inbound packets exchanged with the host stack.

//! Send requests and received packets.

use alloc::vec::Vec;

use crate::buffer::PacketBuffer;
use crate::flow::TxqKind;

/// Next-hop identity used to keep per-destination ordering on a send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination(pub u32);

/// Ethernet frame bound for the data send queue.
#[derive(Debug)]
pub struct TxPacket {
    buf: PacketBuffer,
    dest: Destination,
    vlan: Option<u16>,
    csum_offload: bool,
    tso_mss: Option<u16>,
}

impl TxPacket {
    /// Wraps a frame with checksum offload enabled and no VLAN insertion.
    #[must_use]
    pub fn new(buf: PacketBuffer, dest: Destination) -> Self {
        Self {
            buf,
            dest,
            vlan: None,
            csum_offload: true,
            tso_mss: None,
        }
    }

    /// Requests hardware VLAN tag insertion.
    #[must_use]
    pub fn with_vlan(mut self, tag: u16) -> Self {
        self.vlan = Some(tag);
        self
    }

    /// Enables or disables IP and L4 checksum insertion.
    #[must_use]
    pub fn with_checksum_offload(mut self, enabled: bool) -> Self {
        self.csum_offload = enabled;
        self
    }

    /// Requests TCP segmentation offload with the given MSS.
    #[must_use]
    pub fn with_tso(mut self, mss: u16) -> Self {
        self.tso_mss = Some(mss);
        self
    }

    /// Frame bytes.
    #[must_use]
    pub fn buffer(&self) -> &PacketBuffer {
        &self.buf
    }

    /// Releases the frame buffer.
    #[must_use]
    pub fn into_buffer(self) -> PacketBuffer {
        self.buf
    }

    /// Frame length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Ordering key.
    #[must_use]
    pub const fn dest(&self) -> Destination {
        self.dest
    }

    /// VLAN tag to insert.
    #[must_use]
    pub const fn vlan(&self) -> Option<u16> {
        self.vlan
    }

    /// Whether checksum insertion is requested.
    #[must_use]
    pub const fn checksum_offload(&self) -> bool {
        self.csum_offload
    }

    /// Segmentation MSS when TSO is requested.
    #[must_use]
    pub const fn tso_mss(&self) -> Option<u16> {
        self.tso_mss
    }
}

/// Offload-class work request: a caller-built prefix plus optional payload.
///
/// The prefix starts with the work-request header flit; the engine rewrites
/// only its generation, length and completion fields.
#[derive(Debug)]
pub struct OffloadRequest {
    prefix: Vec<u8>,
    payload: Option<PacketBuffer>,
}

impl OffloadRequest {
    /// Builds a header-only request.
    #[must_use]
    pub fn new(prefix: Vec<u8>) -> Self {
        Self {
            prefix,
            payload: None,
        }
    }

    /// Attaches a payload sent through an SGL behind the prefix.
    #[must_use]
    pub fn with_payload(mut self, payload: PacketBuffer) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Work-request prefix bytes.
    #[must_use]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Payload, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&PacketBuffer> {
        self.payload.as_ref()
    }
}

/// Control-class work request written entirely as immediate data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    wr: Vec<u8>,
}

impl ControlRequest {
    /// Wraps a complete work request; the first flit is its header.
    #[must_use]
    pub fn new(wr: Vec<u8>) -> Self {
        Self { wr }
    }

    /// Work-request bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.wr
    }
}

/// Anything that can be submitted to a queue set. The variant selects the
/// send queue.
#[derive(Debug)]
pub enum TxRequest {
    /// Ethernet frame for the data queue.
    Data(TxPacket),
    /// Offload work request.
    Offload(OffloadRequest),
    /// Control work request.
    Control(ControlRequest),
}

impl TxRequest {
    /// Send queue serving this request.
    #[must_use]
    pub const fn kind(&self) -> TxqKind {
        match self {
            Self::Data(_) => TxqKind::Eth,
            Self::Offload(_) => TxqKind::Offload,
            Self::Control(_) => TxqKind::Control,
        }
    }

    /// Ordering key, for requests that carry one.
    #[must_use]
    pub const fn dest(&self) -> Option<Destination> {
        match self {
            Self::Data(pkt) => Some(pkt.dest()),
            Self::Offload(_) | Self::Control(_) => None,
        }
    }

    /// Bytes carried by the request.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Data(pkt) => pkt.len(),
            Self::Offload(req) => req.prefix.len() + req.payload.as_ref().map_or(0, PacketBuffer::len),
            Self::Control(req) => req.wr.len(),
        }
    }

    /// Whether the request carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer the engine would map for DMA, if any.
    pub(crate) fn dma_buffer(&self) -> Option<&PacketBuffer> {
        match self {
            Self::Data(pkt) => Some(pkt.buffer()),
            Self::Offload(req) => req.payload(),
            Self::Control(_) => None,
        }
    }

    /// Releases every buffer the request owns.
    pub(crate) fn into_buffers(self) -> Option<PacketBuffer> {
        match self {
            Self::Data(pkt) => Some(pkt.into_buffer()),
            Self::Offload(req) => req.payload,
            Self::Control(_) => None,
        }
    }
}

impl From<TxPacket> for TxRequest {
    fn from(pkt: TxPacket) -> Self {
        Self::Data(pkt)
    }
}

impl From<OffloadRequest> for TxRequest {
    fn from(req: OffloadRequest) -> Self {
        Self::Offload(req)
    }
}

impl From<ControlRequest> for TxRequest {
    fn from(req: ControlRequest) -> Self {
        Self::Control(req)
    }
}

/// How a received packet should be handled upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxClass {
    /// Ethernet frame with the CPL header already stripped.
    Ethernet,
    /// Offload-class message starting with its CPL header.
    Offload {
        /// CPL opcode from the RSS header.
        opcode: u8,
    },
    /// Out-of-band notification synthesized from the record itself.
    AsyncNotification,
}

/// Hardware verdict attached to a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    /// Delivered intact.
    Ok,
    /// Hardware flagged an error on the record. Not retried.
    HardwareError,
}

/// Metadata recovered from the response record and CPL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxMeta {
    /// Ingress interface.
    pub iff: u8,
    /// Hardware verified the checksum.
    pub checksum_ok: bool,
    /// VLAN tag stripped by hardware.
    pub vlan: Option<u16>,
    /// RSS hash, when hardware computed one.
    pub rss_hash: Option<u32>,
}

/// Received packet handed to the delivery sink.
///
/// A packet spans one or more buffers; `offset` bytes at the front of the
/// first buffer are hardware framing and are not part of the payload.
#[derive(Debug)]
pub struct RxPacket {
    frags: Vec<PacketBuffer>,
    offset: usize,
    class: RxClass,
    status: RxStatus,
    meta: RxMeta,
}

impl RxPacket {
    pub(crate) fn new(first: PacketBuffer, class: RxClass) -> Self {
        let mut frags = Vec::with_capacity(1);
        frags.push(first);
        Self {
            frags,
            offset: 0,
            class,
            status: RxStatus::Ok,
            meta: RxMeta::default(),
        }
    }

    pub(crate) fn push_fragment(&mut self, buf: PacketBuffer) {
        self.frags.push(buf);
    }

    pub(crate) fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub(crate) fn set_status(&mut self, status: RxStatus) {
        self.status = status;
    }

    pub(crate) fn set_meta(&mut self, meta: RxMeta) {
        self.meta = meta;
    }

    /// Classification.
    #[must_use]
    pub const fn class(&self) -> RxClass {
        self.class
    }

    /// Hardware verdict.
    #[must_use]
    pub const fn status(&self) -> RxStatus {
        self.status
    }

    /// Metadata.
    #[must_use]
    pub const fn meta(&self) -> RxMeta {
        self.meta
    }

    /// Buffers backing the packet, in order.
    #[must_use]
    pub fn fragments(&self) -> &[PacketBuffer] {
        &self.frags
    }

    /// Bytes of framing skipped at the front of the first buffer.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        let total: usize = self.frags.iter().map(PacketBuffer::len).sum();
        total.saturating_sub(self.offset)
    }

    /// Whether the packet carries no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the payload into one contiguous vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        let mut skip = self.offset;
        for frag in &self.frags {
            let bytes = frag.as_slice();
            let start = skip.min(bytes.len());
            skip -= start;
            out.extend_from_slice(&bytes[start..]);
        }
        out
    }

    /// Releases the backing buffers so the host can return them to storage.
    #[must_use]
    pub fn into_fragments(self) -> Vec<PacketBuffer> {
        self.frags
    }
}
