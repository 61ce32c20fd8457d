//! OVA Catalog Core Library
//!
//! This crate provides the appliance pipeline behind the catalog service:
//! discovering OVA/OVF appliances on disk, parsing their descriptors,
//! assigning stable identifiers and projecting inventory records.
//!
//! # Overview
//!
//! A catalog pass runs [`Scanner::scan`] over the catalog root, which opens
//! each appliance through [`ova::Appliance`] and yields parsed
//! [`ovf::Envelope`] values. [`inventory`] flattens those into VM, disk and
//! network records, using the [`IdMaps`] to keep identifiers stable.
//!
//! The Hyper-V tooling uses [`vhdx::virtual_size`] and [`hyperv::write_ovf`]
//! to produce an OVF descriptor for VHDX disks.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`ova`] - OVA archive and loose OVF access
//! - [`ovf`] - OVF model, parser, emitter and guest OS table
//! - [`vhdx`] - VHDX virtual size reader
//! - [`hyperv`] - OVF generation for Hyper-V VMs
//! - [`idmap`] - Content-derived identifier maps
//! - [`scan`] - Catalog walking with in-flight copy detection
//! - [`inventory`] - VM / disk / network projection and source guessing
//!
//! # Quick Start
//!
//! ```no_run
//! use ovacat_core::{inventory, IdMaps, Scanner};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! let scanner = Scanner::new();
//! let ids = IdMaps::new();
//! let appliances = scanner.scan(Path::new("/ova"), &CancellationToken::new()).unwrap();
//! for vm in inventory::project_vms(&appliances, &ids).unwrap() {
//!     println!("{} {}", vm.uuid, vm.name);
//! }
//! ```

pub mod error;
pub mod hyperv;
pub mod idmap;
pub mod inventory;
pub mod ova;
pub mod ovf;
pub mod scan;
pub mod vhdx;

pub use error::{Error, Result};

pub use idmap::{IdMap, IdMaps};
pub use inventory::{guess_source, Vm, VmDisk, VmNetwork};
pub use ova::{read_envelope, Appliance};
pub use ovf::{emit_envelope, parse_envelope, Envelope};
pub use scan::{ScannedAppliance, Scanner};
