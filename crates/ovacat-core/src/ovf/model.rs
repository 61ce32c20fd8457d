//! Normalized in-memory form of an OVF descriptor.

/// OVF envelope namespace.
pub const NS_OVF: &str = "http://schemas.dmtf.org/ovf/envelope/1";
/// CIM common namespace.
pub const NS_CIM: &str = "http://schemas.dmtf.org/wbem/wscim/1/common";
/// Resource allocation setting data namespace.
pub const NS_RASD: &str =
    "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData";
/// Virtual system setting data namespace.
pub const NS_VSSD: &str =
    "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData";
/// VMware extension namespace.
pub const NS_VMW: &str = "http://www.vmware.com/schema/ovf";
/// XML schema instance namespace.
pub const NS_XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Hardware class of a resource allocation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Cpu,
    Memory,
    IdeController,
    ScsiController,
    Ethernet,
    HardDisk,
    Other(u32),
}

impl ResourceKind {
    /// CIM resource type number.
    pub fn code(self) -> u32 {
        match self {
            ResourceKind::Cpu => 3,
            ResourceKind::Memory => 4,
            ResourceKind::IdeController => 5,
            ResourceKind::ScsiController => 6,
            ResourceKind::Ethernet => 10,
            ResourceKind::HardDisk => 17,
            ResourceKind::Other(code) => code,
        }
    }
}

impl From<u32> for ResourceKind {
    fn from(code: u32) -> Self {
        match code {
            3 => ResourceKind::Cpu,
            4 => ResourceKind::Memory,
            5 => ResourceKind::IdeController,
            6 => ResourceKind::ScsiController,
            10 => ResourceKind::Ethernet,
            17 => ResourceKind::HardDisk,
            other => ResourceKind::Other(other),
        }
    }
}

/// A file referenced by the envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct File {
    pub id: String,
    /// Filename relative to the OVA or the OVF's directory.
    pub href: String,
    pub size: u64,
}

/// A virtual disk from the disk section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disk {
    pub disk_id: String,
    pub file_ref: String,
    pub capacity: u64,
    /// Allocation units expression, kept verbatim (e.g. `byte * 2^30`).
    pub capacity_allocation_units: String,
    pub populated_size: u64,
    pub format: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskSection {
    pub info: String,
    pub disks: Vec<Disk>,
}

/// A logical network, identified within the envelope by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSection {
    pub info: String,
    pub networks: Vec<Network>,
}

/// A key/value configuration entry (`vmw:Config` / `vmw:ExtraConfig`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub key: String,
    pub value: String,
    pub required: Option<bool>,
}

/// One resource allocation item from a virtual hardware section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub resource_type: u32,
    pub instance_id: String,
    pub element_name: String,
    pub description: Option<String>,
    pub allocation_units: Option<String>,
    pub virtual_quantity: Option<u64>,
    /// MAC address for network adapters.
    pub address: Option<String>,
    pub address_on_parent: Option<String>,
    pub automatic_allocation: Option<bool>,
    /// Network name for network adapters.
    pub connection: Option<String>,
    /// `ovf:/disk/<diskId>` for hard disks.
    pub host_resource: Option<String>,
    pub parent: Option<String>,
    pub resource_sub_type: Option<String>,
    pub cores_per_socket: Option<String>,
    pub configs: Vec<Config>,
}

impl Item {
    pub fn kind(&self) -> ResourceKind {
        ResourceKind::from(self.resource_type)
    }
}

/// The `System` block describing the virtual hardware family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct System {
    pub element_name: String,
    pub instance_id: String,
    pub virtual_system_identifier: String,
    pub virtual_system_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualHardwareSection {
    pub info: String,
    pub system: Option<System>,
    pub items: Vec<Item>,
    pub configs: Vec<Config>,
    pub extra_config: Vec<Config>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatingSystemSection {
    pub id: Option<u32>,
    pub os_type: String,
    pub info: String,
    pub description: String,
}

/// One virtual machine described by the envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualSystem {
    pub id: String,
    pub info: String,
    pub name: String,
    pub operating_system: OperatingSystemSection,
    pub hardware: VirtualHardwareSection,
}

/// A parsed OVF descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Namespace declarations on the root element as `(prefix, uri)`; the
    /// default namespace has an empty prefix.
    pub namespaces: Vec<(String, String)>,
    pub references: Vec<File>,
    pub disk_section: DiskSection,
    pub network_section: NetworkSection,
    pub virtual_systems: Vec<VirtualSystem>,
}

impl Envelope {
    /// Whether any namespace declared on the root contains `needle`.
    pub fn declares_namespace(&self, needle: &str) -> bool {
        self.namespaces.iter().any(|(_, uri)| uri.contains(needle))
    }
}
