//! Fixture builders shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use ovacat_core::vhdx::{METADATA_REGION, VIRTUAL_DISK_SIZE};
use uuid::uuid;

/// One VM, one 10 GiB disk, one NIC.
pub const SMALL_OVF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData"
          xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData"
          xmlns:vmw="http://www.vmware.com/schema/ovf">
  <References>
    <File ovf:href="disk1.vmdk" ovf:id="file1" ovf:size="2097152"/>
  </References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    <Disk ovf:capacity="10737418240" ovf:capacityAllocationUnits="byte" ovf:diskId="vmdisk1" ovf:fileRef="file1" ovf:format="http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized" ovf:populatedSize="1048576"/>
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="VM Network">
      <Description>The VM Network network</Description>
    </Network>
  </NetworkSection>
  <VirtualSystem ovf:id="vm1">
    <Info>A virtual machine</Info>
    <Name>vm1</Name>
    <OperatingSystemSection ovf:id="94" vmw:osType="ubuntu64Guest">
      <Info>The kind of installed guest operating system</Info>
    </OperatingSystemSection>
    <VirtualHardwareSection>
      <Info>Virtual hardware requirements</Info>
      <System>
        <vssd:ElementName>Virtual Hardware Family</vssd:ElementName>
        <vssd:InstanceID>0</vssd:InstanceID>
        <vssd:VirtualSystemIdentifier>vm1</vssd:VirtualSystemIdentifier>
        <vssd:VirtualSystemType>vmx-13</vssd:VirtualSystemType>
      </System>
      <Item>
        <rasd:AllocationUnits>hertz * 10^6</rasd:AllocationUnits>
        <rasd:Description>Number of Virtual CPUs</rasd:Description>
        <rasd:ElementName>2 virtual CPU(s)</rasd:ElementName>
        <rasd:InstanceID>1</rasd:InstanceID>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>2</rasd:VirtualQuantity>
        <vmw:CoresPerSocket ovf:required="false">2</vmw:CoresPerSocket>
      </Item>
      <Item>
        <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
        <rasd:Description>Memory Size</rasd:Description>
        <rasd:ElementName>4096MB of memory</rasd:ElementName>
        <rasd:InstanceID>2</rasd:InstanceID>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>4096</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:Address>0</rasd:Address>
        <rasd:Description>SCSI Controller</rasd:Description>
        <rasd:ElementName>SCSI Controller 0</rasd:ElementName>
        <rasd:InstanceID>3</rasd:InstanceID>
        <rasd:ResourceSubType>lsilogic</rasd:ResourceSubType>
        <rasd:ResourceType>6</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:AddressOnParent>0</rasd:AddressOnParent>
        <rasd:ElementName>Hard Disk 1</rasd:ElementName>
        <rasd:HostResource>ovf:/disk/vmdisk1</rasd:HostResource>
        <rasd:InstanceID>4</rasd:InstanceID>
        <rasd:Parent>3</rasd:Parent>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:Address>00:50:56:aa:bb:01</rasd:Address>
        <rasd:AutomaticAllocation>true</rasd:AutomaticAllocation>
        <rasd:Connection>VM Network</rasd:Connection>
        <rasd:ElementName>Network adapter 1</rasd:ElementName>
        <rasd:InstanceID>5</rasd:InstanceID>
        <rasd:ResourceSubType>VmxNet3</rasd:ResourceSubType>
        <rasd:ResourceType>10</rasd:ResourceType>
      </Item>
      <vmw:Config ovf:required="false" vmw:key="firmware" vmw:value="efi"/>
      <vmw:Config ovf:required="false" vmw:key="cpuHotAddEnabled" vmw:value="true"/>
      <vmw:ExtraConfig ovf:required="false" vmw:key="uefi.secureBoot.enabled" vmw:value="TRUE"/>
    </VirtualHardwareSection>
  </VirtualSystem>
</Envelope>
"#;

/// Assemble a ustar archive from `(name, contents)` pairs, in order.
pub fn build_ova(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Assemble a pre-POSIX archive whose regular files carry a NUL typeflag.
pub fn build_old_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_old();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_entry_type(tar::EntryType::new(0));
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Backdate a file's mtime so the scanner no longer quarantines it.
pub fn age(path: &Path, secs: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(secs))
        .unwrap();
}

/// Write `bytes` to `path` and backdate it past the quarantine window.
pub fn write_settled(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
    age(path, 3600);
}

pub const METADATA_OFFSET: usize = 0x50000;
pub const METADATA_LENGTH: usize = 0x10000;
pub const SIZE_ITEM_OFFSET: usize = 0x1000;

fn put_guid(image: &mut [u8], at: usize, guid: uuid::Uuid) {
    image[at..at + 16].copy_from_slice(&guid.to_bytes_le());
}

fn put_u16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(image: &mut [u8], at: usize, value: u64) {
    image[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_region_table(image: &mut [u8], at: usize) {
    image[at..at + 4].copy_from_slice(b"regi");
    put_u32(image, at + 8, 2);

    // BAT region first so the metadata entry is not at index 0.
    let bat = at + 16;
    put_guid(image, bat, uuid!("2DC27766-F623-4200-9D64-115E9BFD4A08"));
    put_u64(image, bat + 16, 0x60000);
    put_u32(image, bat + 24, 0x1000);
    put_u32(image, bat + 28, 1);

    let meta = at + 48;
    put_guid(image, meta, METADATA_REGION);
    put_u64(image, meta + 16, METADATA_OFFSET as u64);
    put_u32(image, meta + 24, METADATA_LENGTH as u32);
    put_u32(image, meta + 28, 1);
}

/// Craft a minimal VHDX advertising `virtual_size` bytes.
pub fn build_vhdx(virtual_size: u64) -> Vec<u8> {
    let mut image = vec![0u8; METADATA_OFFSET + METADATA_LENGTH];
    image[..8].copy_from_slice(b"vhdxfile");
    put_region_table(&mut image, 0x30000);
    put_region_table(&mut image, 0x40000);

    let table = METADATA_OFFSET;
    image[table..table + 8].copy_from_slice(b"metadata");
    put_u16(&mut image, table + 10, 2);

    let params = table + 32;
    put_guid(&mut image, params, uuid!("CAA16737-FA36-4D43-B3B6-33F0AA44E76B"));
    put_u32(&mut image, params + 16, SIZE_ITEM_OFFSET as u32 + 8);
    put_u32(&mut image, params + 20, 8);

    let size = table + 64;
    put_guid(&mut image, size, VIRTUAL_DISK_SIZE);
    put_u32(&mut image, size + 16, SIZE_ITEM_OFFSET as u32);
    put_u32(&mut image, size + 20, 8);

    put_u64(&mut image, METADATA_OFFSET + SIZE_ITEM_OFFSET, virtual_size);
    image
}
