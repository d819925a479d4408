// Author: Lukas Bower
// Purpose: Crate root for the Cohesix scatter/gather queue engine.

#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Scatter/gather queue engine for Chelsio-style NICs.
//!
//! A [`QueueSet`] owns three send queues (Ethernet, offload, control), two
//! receive free lists (small and jumbo buffers) and the response queue the
//! device uses to report received traffic and send completions. Everything
//! the engine needs from its surroundings comes through the traits in
//! [`hal`]: DMA mapping, register access, buffer storage and packet delivery.
//!
//! Descriptor layouts and register encodings live in the
//! `cohesix-sge-wire` crate.

extern crate alloc;

pub mod buffer;
pub mod config;
pub mod error;
pub mod flow;
mod freelist;
pub mod hal;
pub mod lso;
pub mod packet;
mod qset;
pub mod ring;
mod rspq;
pub mod timer;
mod txq;
pub mod wr;

#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod test_support;

pub use buffer::{BufferId, DmaMapping, DmaSegment, PacketBuffer, RingMapping, SizeClass};
pub use config::SgeConfig;
pub use error::{ConfigError, MalformedReason, MapError, QsetError, SendError};
pub use flow::{StoppedQueues, TxqKind, TxqState};
pub use freelist::FlSnapshot;
pub use hal::{
    BufferAllocator, DeliverySink, DmaMapper, Platform, RegisterAccess, RxBundle, RX_BUNDLE_SIZE,
};
pub use packet::{
    ControlRequest, Destination, OffloadRequest, RxClass, RxMeta, RxPacket, RxStatus, TxPacket,
    TxRequest,
};
pub use qset::QueueSet;
pub use rspq::{RecordKind, RspqSnapshot, RspqStats, NOMEM_INTR_DELAY};
pub use timer::TimerReport;
pub use txq::{Admission, TxqSnapshot, TxqStats};
