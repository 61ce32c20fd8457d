//! Guest OS caption mapping.
//!
//! Hyper-V reports the guest as a free-form caption such as
//! `Microsoft Windows Server 2019 Datacenter`. OVF consumers expect a
//! `vmw:osType` tag plus a CIM operating system id.

/// Guest OS identification written to the `OperatingSystemSection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestOs {
    /// The `vmw:osType` tag.
    pub os_type: &'static str,
    /// CIM operating system id.
    pub id: u32,
}

/// Tag used for captions the table does not recognize.
pub const OTHER_GUEST: GuestOs = GuestOs {
    os_type: "otherGuest",
    id: 1,
};

struct GuestEntry {
    needle: &'static str,
    x64: GuestOs,
    x86: GuestOs,
}

const fn entry(needle: &'static str, x64: (&'static str, u32), x86: (&'static str, u32)) -> GuestEntry {
    GuestEntry {
        needle,
        x64: GuestOs {
            os_type: x64.0,
            id: x64.1,
        },
        x86: GuestOs {
            os_type: x86.0,
            id: x86.1,
        },
    }
}

// First match wins, so specific releases precede their family.
const GUEST_TABLE: &[GuestEntry] = &[
    entry("windows server 2022", ("windows2019srvNext_64Guest", 113), ("windows2019srvNext_64Guest", 113)),
    entry("windows server 2019", ("windows2019srv_64Guest", 113), ("windows2019srv_64Guest", 113)),
    entry("windows server 2016", ("windows9Server64Guest", 113), ("windows9Server64Guest", 113)),
    entry("windows server 2012", ("windows8Server64Guest", 113), ("windows8Server64Guest", 113)),
    entry("windows server 2008 r2", ("windows7Server64Guest", 76), ("windows7Server64Guest", 76)),
    entry("windows server", ("windows9Server64Guest", 113), ("windows9Server64Guest", 113)),
    entry("windows 11", ("windows11_64Guest", 105), ("windows11_64Guest", 105)),
    entry("windows 10", ("windows9_64Guest", 105), ("windows9Guest", 105)),
    entry("windows 8", ("windows8_64Guest", 114), ("windows8Guest", 114)),
    entry("windows 7", ("windows7_64Guest", 105), ("windows7Guest", 105)),
    entry("red hat", ("rhel8_64Guest", 80), ("rhel8Guest", 79)),
    entry("rhel", ("rhel8_64Guest", 80), ("rhel8Guest", 79)),
    entry("centos", ("centos64Guest", 107), ("centosGuest", 106)),
    entry("oracle linux", ("oracleLinux64Guest", 109), ("oracleLinuxGuest", 108)),
    entry("ubuntu", ("ubuntu64Guest", 94), ("ubuntuGuest", 93)),
    entry("debian", ("debian10_64Guest", 96), ("debian10Guest", 95)),
    entry("suse", ("sles15_64Guest", 85), ("slesGuest", 84)),
    entry("fedora", ("fedora64Guest", 102), ("fedoraGuest", 36)),
    entry("linux", ("otherLinux64Guest", 101), ("otherLinuxGuest", 36)),
];

/// Map a guest caption and architecture to an OVF guest identification.
///
/// Matching is case-insensitive on substrings of the caption. An
/// architecture mentioning `64` (or an empty one) selects the 64-bit tag.
pub fn guest_os(caption: &str, architecture: &str) -> GuestOs {
    let caption = caption.to_ascii_lowercase();
    let is_64 = architecture.trim().is_empty() || architecture.contains("64");

    GUEST_TABLE
        .iter()
        .find(|e| caption.contains(e.needle))
        .map(|e| if is_64 { e.x64 } else { e.x86 })
        .unwrap_or(OTHER_GUEST)
}
