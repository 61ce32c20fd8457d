//! OVF generation for Hyper-V virtual machines.
//!
//! A [`VmDescriptor`] exported from Hyper-V is combined with the VHDX files
//! of its disks into an [`Envelope`], which is written next to the first
//! disk as `<disk stem>.ovf`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ovf::{
    emit_envelope, guest_os, Disk, Envelope, File, Item, Network, OperatingSystemSection,
    ResourceKind, System, VirtualHardwareSection, VirtualSystem,
};
use crate::vhdx;

/// Disk format URI for VHDX images.
pub const VHDX_FORMAT: &str = "http://technet.microsoft.com/en-us/library/dd979539.aspx#VHDX";

/// Storage bus a disk is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ControllerType {
    #[serde(rename = "IDE", alias = "Ide", alias = "ide")]
    Ide,
    #[serde(rename = "SCSI", alias = "Scsi", alias = "scsi")]
    Scsi,
}

impl ControllerType {
    fn resource_kind(self) -> ResourceKind {
        match self {
            ControllerType::Ide => ResourceKind::IdeController,
            ControllerType::Scsi => ResourceKind::ScsiController,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ControllerType::Ide => "IDE",
            ControllerType::Scsi => "SCSI",
        }
    }
}

/// Where a disk sits on its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskPlacement {
    pub controller_type: ControllerType,
    #[serde(default)]
    pub controller_number: u32,
    #[serde(default)]
    pub controller_location: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicDescriptor {
    #[serde(default)]
    pub network_name: String,
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestOsInfo {
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub architecture: String,
}

/// A Hyper-V virtual machine as exported for conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDescriptor {
    pub name: String,
    #[serde(default = "default_cpu_count")]
    pub cpu_count: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub disks: Vec<DiskPlacement>,
    #[serde(default)]
    pub nics: Vec<NicDescriptor>,
    #[serde(default)]
    pub guest_os: GuestOsInfo,
}

fn default_cpu_count() -> u64 {
    1
}

fn default_memory_mb() -> u64 {
    1024
}

/// A descriptor disk paired with its image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperVDisk {
    pub path: PathBuf,
    pub placement: DiskPlacement,
}

/// Pair the descriptor's disks with image paths, in order.
///
/// # Errors
///
/// Returns [`Error::Ovf`] when fewer paths than disks are given.
pub fn attach_disks(vm: &VmDescriptor, paths: &[PathBuf]) -> Result<Vec<HyperVDisk>> {
    if paths.len() < vm.disks.len() {
        return Err(Error::ovf(format!(
            "VM has {} hard drives but only {} disk paths provided",
            vm.disks.len(),
            paths.len()
        )));
    }
    Ok(vm
        .disks
        .iter()
        .zip(paths)
        .map(|(placement, path)| HyperVDisk {
            path: path.clone(),
            placement: *placement,
        })
        .collect())
}

/// Path of the OVF written for a disk: same directory and stem, `.ovf`.
pub fn ovf_path_for(disk: &Path) -> PathBuf {
    disk.with_extension("ovf")
}

/// Capacity and on-disk length of a disk image.
fn disk_sizes(path: &Path) -> Result<(u64, u64)> {
    let on_disk = std::fs::metadata(path)
        .map_err(|e| Error::io(e, path))?
        .len();
    let capacity = match vhdx::virtual_size(path) {
        Ok(size) => size,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "could not read VHDX virtual size, using file size"
            );
            on_disk
        }
    };
    Ok((capacity, on_disk))
}

struct InstanceIds(u32);

impl InstanceIds {
    fn next(&mut self) -> String {
        let id = self.0;
        self.0 += 1;
        id.to_string()
    }
}

/// Build the envelope describing `vm` with its attached disks.
pub fn build_envelope(vm: &VmDescriptor, disks: &[HyperVDisk]) -> Result<Envelope> {
    let mut ids = InstanceIds(1);
    let mut items = Vec::new();

    items.push(Item {
        resource_type: ResourceKind::Cpu.code(),
        instance_id: ids.next(),
        element_name: format!("{} virtual CPU(s)", vm.cpu_count),
        description: Some("Number of virtual CPUs".to_string()),
        allocation_units: Some("hertz * 10^6".to_string()),
        virtual_quantity: Some(vm.cpu_count),
        ..Default::default()
    });

    items.push(Item {
        resource_type: ResourceKind::Memory.code(),
        instance_id: ids.next(),
        element_name: format!("{}MB of memory", vm.memory_mb),
        description: Some("Memory Size".to_string()),
        allocation_units: Some("byte * 2^20".to_string()),
        virtual_quantity: Some(vm.memory_mb),
        ..Default::default()
    });

    let controllers: BTreeSet<(ControllerType, u32)> = disks
        .iter()
        .map(|d| (d.placement.controller_type, d.placement.controller_number))
        .collect();
    let mut controller_ids = Vec::with_capacity(controllers.len());
    for (kind, number) in controllers {
        let instance_id = ids.next();
        items.push(Item {
            resource_type: kind.resource_kind().code(),
            instance_id: instance_id.clone(),
            element_name: format!("Virtual{}Controller {}", kind.label(), number),
            description: Some(format!("{} Controller", kind.label())),
            address: Some(number.to_string()),
            resource_sub_type: (kind == ControllerType::Scsi).then(|| "lsilogic".to_string()),
            ..Default::default()
        });
        controller_ids.push(((kind, number), instance_id));
    }

    let mut references = Vec::with_capacity(disks.len());
    let mut disk_entries = Vec::with_capacity(disks.len());
    for (index, disk) in disks.iter().enumerate() {
        let n = index + 1;
        let file_id = format!("file{}", n);
        let disk_id = format!("vmdisk{}", n);
        let href = disk
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::ovf(format!("disk path '{}' has no file name", disk.path.display()))
            })?;
        let (capacity, on_disk) = disk_sizes(&disk.path)?;

        references.push(File {
            id: file_id.clone(),
            href,
            size: on_disk,
        });
        disk_entries.push(Disk {
            disk_id: disk_id.clone(),
            file_ref: file_id,
            capacity,
            capacity_allocation_units: "byte".to_string(),
            populated_size: 0,
            format: VHDX_FORMAT.to_string(),
        });

        let key = (disk.placement.controller_type, disk.placement.controller_number);
        let parent = controller_ids
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, id)| id.clone());
        items.push(Item {
            resource_type: ResourceKind::HardDisk.code(),
            instance_id: ids.next(),
            element_name: format!("Hard Disk {}", n),
            description: Some("Hard Disk".to_string()),
            host_resource: Some(format!("ovf:/disk/{}", disk_id)),
            parent,
            address_on_parent: Some(disk.placement.controller_location.to_string()),
            ..Default::default()
        });
    }

    let mut networks: Vec<Network> = Vec::new();
    for (index, nic) in vm.nics.iter().enumerate() {
        let n = index + 1;
        let network_name = if nic.network_name.trim().is_empty() {
            format!("VM Network {}", n)
        } else {
            nic.network_name.clone()
        };
        if !networks.iter().any(|net| net.name == network_name) {
            networks.push(Network {
                name: network_name.clone(),
                description: format!("Network interface {}", n),
            });
        }
        items.push(Item {
            resource_type: ResourceKind::Ethernet.code(),
            instance_id: ids.next(),
            element_name: format!("Ethernet {}", n),
            description: Some(format!("E1000 ethernet adapter on \"{}\"", network_name)),
            address: nic.mac.clone().filter(|mac| !mac.is_empty()),
            connection: Some(network_name),
            resource_sub_type: Some("E1000".to_string()),
            automatic_allocation: Some(true),
            ..Default::default()
        });
    }

    let guest = guest_os(&vm.guest_os.caption, &vm.guest_os.architecture);
    let mut envelope = Envelope {
        references,
        ..Default::default()
    };
    envelope.disk_section.info = "List of the virtual disks".to_string();
    envelope.disk_section.disks = disk_entries;
    envelope.network_section.info = "The list of logical networks".to_string();
    envelope.network_section.networks = networks;
    envelope.virtual_systems.push(VirtualSystem {
        id: vm.name.clone(),
        info: "A Virtual system".to_string(),
        name: vm.name.clone(),
        operating_system: OperatingSystemSection {
            id: Some(guest.id),
            os_type: guest.os_type.to_string(),
            info: "The operating system installed".to_string(),
            description: format!("{} ({})", vm.guest_os.caption, vm.guest_os.architecture),
        },
        hardware: VirtualHardwareSection {
            info: "Virtual hardware requirements".to_string(),
            system: Some(System {
                element_name: "Virtual Hardware Family".to_string(),
                instance_id: "0".to_string(),
                virtual_system_identifier: vm.name.clone(),
                virtual_system_type: "vmx-07".to_string(),
            }),
            items,
            configs: Vec::new(),
            extra_config: Vec::new(),
        },
    });

    Ok(envelope)
}

/// Generate the OVF for `vm` and write it next to the first disk.
///
/// Without disks the descriptor is written to `<name>.ovf` in `fallback_dir`.
///
/// # Returns
///
/// The path of the written descriptor.
pub fn write_ovf(vm: &VmDescriptor, disks: &[HyperVDisk], fallback_dir: &Path) -> Result<PathBuf> {
    let envelope = build_envelope(vm, disks)?;
    let bytes = emit_envelope(&envelope)?;

    let ovf_path = match disks.first() {
        Some(disk) => ovf_path_for(&disk.path),
        None => fallback_dir.join(format!("{}.ovf", vm.name)),
    };
    std::fs::write(&ovf_path, bytes).map_err(|e| Error::io(e, &ovf_path))?;
    info!(path = %ovf_path.display(), vm = %vm.name, "wrote OVF descriptor");
    Ok(ovf_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> VmDescriptor {
        serde_json::from_str(
            r#"{
                "name": "web01",
                "cpuCount": 4,
                "memoryMb": 8192,
                "disks": [
                    {"controllerType": "SCSI", "controllerNumber": 0, "controllerLocation": 1},
                    {"controllerType": "IDE", "controllerNumber": 0, "controllerLocation": 0}
                ],
                "nics": [{"networkName": "LAN", "mac": "00:15:5d:01:02:03"}],
                "guestOs": {"caption": "Microsoft Windows Server 2019 Standard", "architecture": "64-bit"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_descriptor_defaults() {
        let vm: VmDescriptor = serde_json::from_str(r#"{"name": "tiny"}"#).unwrap();
        assert_eq!(vm.cpu_count, 1);
        assert_eq!(vm.memory_mb, 1024);
        assert!(vm.disks.is_empty());
    }

    #[test]
    fn test_attach_disks_requires_enough_paths() {
        let vm = descriptor();
        let err = attach_disks(&vm, &[PathBuf::from("a.vhdx")]).unwrap_err();
        assert!(err.to_string().contains("2 hard drives"));

        let disks = attach_disks(&vm, &[PathBuf::from("a.vhdx"), PathBuf::from("b.vhdx")]).unwrap();
        assert_eq!(disks[1].placement.controller_type, ControllerType::Ide);
    }

    #[test]
    fn test_ovf_path_for() {
        assert_eq!(
            ovf_path_for(Path::new("/vms/web01/disk.vhdx")),
            PathBuf::from("/vms/web01/disk.ovf")
        );
    }

    #[test]
    fn test_instance_ids_without_disks() {
        let mut vm = descriptor();
        vm.disks.clear();
        let envelope = build_envelope(&vm, &[]).unwrap();
        let items = &envelope.virtual_systems[0].hardware.items;
        let ids: Vec<&str> = items.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(items[2].connection.as_deref(), Some("LAN"));
        assert_eq!(items[2].address.as_deref(), Some("00:15:5d:01:02:03"));
        assert_eq!(
            envelope.virtual_systems[0].operating_system.os_type,
            "windows2019srv_64Guest"
        );
    }
}
