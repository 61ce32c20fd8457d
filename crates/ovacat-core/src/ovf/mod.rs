//! OVF descriptor model, parser and emitter.
//!
//! [`parse_envelope`] reads any OVF 1.x/2.x descriptor into an [`Envelope`];
//! [`emit_envelope`] writes one back out deterministically. Re-parsing the
//! emitter's output and emitting again yields identical bytes.

pub mod emit;
pub mod guest;
pub mod model;
pub mod parse;

pub use emit::{emit_envelope, XML_HEADER};
pub use guest::{guest_os, GuestOs};
pub use model::{
    Config, Disk, DiskSection, Envelope, File, Item, Network, NetworkSection,
    OperatingSystemSection, ResourceKind, System, VirtualHardwareSection, VirtualSystem,
};
pub use parse::parse_envelope;
