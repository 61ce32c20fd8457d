//! Inventory projection.
//!
//! Flattens parsed envelopes into the VM, disk and network records served
//! to the migration control plane. Field names follow the consumer's JSON
//! model (`UUID`, `NICs`, `MemoryMB`, ...).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::idmap::{stable_encoding, IdMaps};
use crate::ovf::{Config, Envelope, Item, ResourceKind, VirtualSystem};
use crate::scan::ScannedAppliance;

/// Source tag for appliances exported by VMware tooling.
pub const SOURCE_VMWARE: &str = "vmware";
/// Source tag for appliances exported by oVirt / RHV.
pub const SOURCE_RHV: &str = "rhv";
/// Source tag when no producer could be recognized.
pub const SOURCE_UNKNOWN: &str = "unknown";

const BYTES_PER_MB: u128 = 1 << 20;

/// A virtual machine as seen by inventory consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Vm {
    pub name: String,
    pub ova_path: String,
    pub ova_source: String,
    pub os_type: String,
    pub revision_validated: i64,
    pub policy_version: i32,
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub firmware: String,
    pub secure_boot: bool,
    pub cpu_affinity: Vec<i32>,
    pub cpu_hot_add_enabled: bool,
    pub cpu_hot_remove_enabled: bool,
    pub memory_hot_add_enabled: bool,
    pub fault_tolerance_enabled: bool,
    pub cpu_count: u64,
    pub cores_per_socket: u32,
    #[serde(rename = "MemoryMB")]
    pub memory_mb: u64,
    pub memory_units: String,
    pub cpu_units: String,
    pub ballooned_memory: i32,
    pub ip_address: String,
    pub numa_node_affinity: Vec<String>,
    pub storage_used: u64,
    pub change_tracking_enabled: bool,
    pub devices: Vec<Device>,
    #[serde(rename = "NICs")]
    pub nics: Vec<Nic>,
    pub disks: Vec<VmDisk>,
    pub networks: Vec<VmNetwork>,
}

/// A hardware item with no dedicated record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "kind")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NicConfig {
    pub key: String,
    pub value: String,
}

/// A virtual network adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "mac")]
    pub mac: String,
    #[serde(rename = "Network")]
    pub network: String,
    #[serde(rename = "Config")]
    pub config: Vec<NicConfig>,
}

/// A virtual disk and where its backing file lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VmDisk {
    #[serde(rename = "ID")]
    pub id: String,
    /// The referenced file's `href`.
    pub name: String,
    /// Directory holding the appliance, so `FilePath/Name` locates the disk
    /// for loose OVFs.
    pub file_path: String,
    pub capacity: u64,
    pub capacity_allocation_units: String,
    pub disk_id: String,
    pub file_ref: String,
    pub format: String,
    pub populated_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VmNetwork {
    pub name: String,
    pub description: String,
    #[serde(rename = "ID")]
    pub id: String,
}

/// Identity tuple hashed for VMs whose descriptor id is not a UUID.
#[derive(Serialize)]
struct VmKey<'a> {
    path: &'a str,
    name: &'a str,
    cpu_count: u64,
    memory_mb: u64,
    disk_ids: Vec<&'a str>,
    nic_macs: Vec<&'a str>,
}

/// Guess which tool produced an envelope.
///
/// oVirt declares its own namespace; VMware exports use the `vmw`
/// namespace, a `vmx-*` system type, or characteristic extra-config keys.
pub fn guess_source(envelope: &Envelope) -> &'static str {
    if envelope.declares_namespace("ovirt.org") {
        return SOURCE_RHV;
    }
    if envelope.declares_namespace("vmware.com") {
        return SOURCE_VMWARE;
    }
    let vmware_hardware = envelope.virtual_systems.iter().any(|vs| {
        let hw = &vs.hardware;
        hw.system
            .as_ref()
            .is_some_and(|s| s.virtual_system_type.starts_with("vmx-"))
            || hw.extra_config.iter().any(|c| is_vmware_key(&c.key))
    });
    if vmware_hardware {
        SOURCE_VMWARE
    } else {
        SOURCE_UNKNOWN
    }
}

fn is_vmware_key(key: &str) -> bool {
    const PREFIXES: [&str; 5] = ["tools.", "svga.", "nvram", "virtualHW.", "vmware."];
    PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Human-readable device kind for an item.
pub fn device_kind(item: &Item) -> String {
    let trimmed = item
        .element_name
        .trim_end_matches(|c: char| c.is_ascii_digit() || c.is_whitespace());
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    match item.description.as_deref().map(str::trim) {
        Some(description) if !description.is_empty() => description.to_string(),
        _ => "Unknown".to_string(),
    }
}

/// Bytes per allocation unit for an OVF units expression such as
/// `byte * 2^20`. Unrecognized expressions are taken as megabytes.
pub fn allocation_unit_bytes(units: &str) -> u128 {
    let compact: String = units
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    match compact.as_str() {
        "byte" | "bytes" => return 1,
        "kilobytes" | "kb" => return 1 << 10,
        "megabytes" | "mb" => return BYTES_PER_MB,
        "gigabytes" | "gb" => return 1 << 30,
        _ => {}
    }
    compact
        .strip_prefix("byte*")
        .and_then(|rest| {
            match rest.split_once('^') {
                Some((base, exp)) => {
                    let base: u128 = base.parse().ok()?;
                    let exp: u32 = exp.parse().ok()?;
                    base.checked_pow(exp)
                }
                None => rest.parse().ok(),
            }
        })
        .unwrap_or(BYTES_PER_MB)
}

fn memory_in_mb(quantity: u64, units: Option<&str>) -> u64 {
    let unit = units.map(allocation_unit_bytes).unwrap_or(BYTES_PER_MB);
    let mb = quantity as u128 * unit / BYTES_PER_MB;
    u64::try_from(mb).unwrap_or(u64::MAX)
}

fn parse_cores(raw: &str) -> u32 {
    match raw.trim().parse::<u32>() {
        Ok(cores) if cores > 0 => cores,
        _ => 1,
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1")
}

fn apply_config(vm: &mut Vm, config: &Config) {
    match config.key.as_str() {
        "firmware" => vm.firmware = config.value.clone(),
        "memoryHotAddEnabled" => vm.memory_hot_add_enabled = parse_flag(&config.value),
        "cpuHotAddEnabled" => vm.cpu_hot_add_enabled = parse_flag(&config.value),
        "cpuHotRemoveEnabled" => vm.cpu_hot_remove_enabled = parse_flag(&config.value),
        "uefi.secureBoot.enabled" => vm.secure_boot = parse_flag(&config.value),
        _ => {}
    }
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn containing_dir(path: &Path) -> String {
    path.parent().map(display_path).unwrap_or_default()
}

/// Disk id named by a `HostResource` such as `ovf:/disk/vmdisk1`.
fn host_resource_disk(host_resource: &str) -> &str {
    host_resource.rsplit('/').next().unwrap_or(host_resource)
}

/// Disks of an envelope paired with their files by position.
fn envelope_disks(envelope: &Envelope, path: &Path, ids: &IdMaps) -> Result<Vec<VmDisk>> {
    let disks = &envelope.disk_section.disks;
    let files = &envelope.references;
    if disks.len() != files.len() {
        warn!(
            path = %path.display(),
            disks = disks.len(),
            files = files.len(),
            "disk and file counts differ, pairing the shorter list"
        );
    }

    let appliance = display_path(path);
    let file_path = containing_dir(path);
    disks
        .iter()
        .zip(files)
        .map(|(disk, file)| {
            let mut record = VmDisk {
                id: String::new(),
                name: file.href.clone(),
                file_path: file_path.clone(),
                capacity: disk.capacity,
                capacity_allocation_units: disk.capacity_allocation_units.clone(),
                disk_id: disk.disk_id.clone(),
                file_ref: disk.file_ref.clone(),
                format: disk.format.clone(),
                populated_size: disk.populated_size,
            };
            let key = format!("{}/{}", appliance, file.href);
            record.id = ids.disks.id_for(&key, &record)?;
            Ok(record)
        })
        .collect()
}

fn envelope_networks(envelope: &Envelope, ids: &IdMaps) -> Result<Vec<VmNetwork>> {
    envelope
        .network_section
        .networks
        .iter()
        .map(|network| {
            Ok(VmNetwork {
                name: network.name.clone(),
                description: network.description.clone(),
                id: ids.networks.id_for(&network.name, &network.name)?,
            })
        })
        .collect()
}

/// Order disks by the hard-disk items that attach them.
///
/// Disks no item refers to keep their section order after attached ones.
fn order_by_attachment(disks: &mut [VmDisk], items: &[Item]) {
    let attached: Vec<&str> = items
        .iter()
        .filter(|item| item.kind() == ResourceKind::HardDisk)
        .filter_map(|item| item.host_resource.as_deref())
        .map(host_resource_disk)
        .collect();
    disks.sort_by_key(|disk| {
        attached
            .iter()
            .position(|id| *id == disk.disk_id)
            .unwrap_or(usize::MAX)
    });
}

/// Project one virtual system of an appliance into a VM record.
pub fn project_vm(
    appliance: &ScannedAppliance,
    system: &VirtualSystem,
    ids: &IdMaps,
) -> Result<Vm> {
    let envelope = &appliance.envelope;
    let ova_path = display_path(&appliance.path);
    let hardware = &system.hardware;

    let mut vm = Vm {
        name: system.name.clone(),
        ova_path: ova_path.clone(),
        ova_source: guess_source(envelope).to_string(),
        os_type: system.operating_system.os_type.clone(),
        cores_per_socket: 1,
        ..Default::default()
    };

    if let Some(cores) = hardware.items.iter().find_map(|i| i.cores_per_socket.as_deref()) {
        vm.cores_per_socket = parse_cores(cores);
    }

    for item in &hardware.items {
        match item.kind() {
            ResourceKind::Cpu => {
                vm.cpu_count = item.virtual_quantity.unwrap_or_default();
                vm.cpu_units = item.allocation_units.clone().unwrap_or_default();
            }
            ResourceKind::Memory => {
                vm.memory_mb = memory_in_mb(
                    item.virtual_quantity.unwrap_or_default(),
                    item.allocation_units.as_deref(),
                );
                vm.memory_units = item.allocation_units.clone().unwrap_or_default();
            }
            ResourceKind::Ethernet => vm.nics.push(Nic {
                name: item.element_name.clone(),
                mac: item.address.clone().unwrap_or_default(),
                network: item.connection.clone().unwrap_or_default(),
                config: item
                    .configs
                    .iter()
                    .map(|c| NicConfig {
                        key: c.key.clone(),
                        value: c.value.clone(),
                    })
                    .collect(),
            }),
            _ => vm.devices.push(Device {
                kind: device_kind(item),
            }),
        }
    }

    vm.disks = envelope_disks(envelope, &appliance.path, ids)?;
    order_by_attachment(&mut vm.disks, &hardware.items);
    vm.storage_used = vm.disks.iter().map(|d| d.populated_size).sum();
    vm.networks = envelope_networks(envelope, ids)?;

    for config in hardware.configs.iter().chain(&hardware.extra_config) {
        apply_config(&mut vm, config);
    }

    vm.uuid = if Uuid::parse_str(&system.id).is_ok() {
        system.id.clone()
    } else {
        let key = VmKey {
            path: &ova_path,
            name: &vm.name,
            cpu_count: vm.cpu_count,
            memory_mb: vm.memory_mb,
            disk_ids: vm.disks.iter().map(|d| d.id.as_str()).collect(),
            nic_macs: vm.nics.iter().map(|n| n.mac.as_str()).collect(),
        };
        let encoded = stable_encoding(&key)?;
        let key_text = String::from_utf8_lossy(&encoded).into_owned();
        ids.vms.id_for(&key_text, &key)?
    };

    Ok(vm)
}

/// VM records for every virtual system of every appliance, in scan order.
pub fn project_vms(appliances: &[ScannedAppliance], ids: &IdMaps) -> Result<Vec<Vm>> {
    let mut vms = Vec::new();
    for appliance in appliances {
        for system in &appliance.envelope.virtual_systems {
            vms.push(project_vm(appliance, system, ids)?);
        }
    }
    Ok(vms)
}

/// All disks across appliances, first occurrence of each id kept.
pub fn project_disks(appliances: &[ScannedAppliance], ids: &IdMaps) -> Result<Vec<VmDisk>> {
    let mut disks: Vec<VmDisk> = Vec::new();
    for appliance in appliances {
        for disk in envelope_disks(&appliance.envelope, &appliance.path, ids)? {
            if !disks.iter().any(|d| d.id == disk.id) {
                disks.push(disk);
            }
        }
    }
    Ok(disks)
}

/// All networks across appliances, first occurrence of each id kept.
pub fn project_networks(appliances: &[ScannedAppliance], ids: &IdMaps) -> Result<Vec<VmNetwork>> {
    let mut networks: Vec<VmNetwork> = Vec::new();
    for appliance in appliances {
        for network in envelope_networks(&appliance.envelope, ids)? {
            if !networks.iter().any(|n| n.id == network.id) {
                networks.push(network);
            }
        }
    }
    Ok(networks)
}
