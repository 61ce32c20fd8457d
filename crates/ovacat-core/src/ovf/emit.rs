//! Deterministic OVF serialization.
//!
//! Output depends only on the [`Envelope`] value: namespaces are fixed,
//! attributes and `rasd:` elements are written in a stable order, and
//! optional fields are omitted when absent.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::model::{
    Config, Envelope, Item, VirtualSystem, NS_CIM, NS_OVF, NS_RASD, NS_VMW, NS_VSSD, NS_XSI,
};
use crate::error::{Error, Result};

/// Leading XML declaration written before the envelope.
pub const XML_HEADER: &str = "<?xml version='1.0' encoding='UTF-8'?>\n";

/// Serialize an envelope to OVF bytes.
pub fn emit_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut out = OvfWriter::new();

    out.start(
        "Envelope",
        &[
            ("xmlns", NS_OVF),
            ("xmlns:cim", NS_CIM),
            ("xmlns:ovf", NS_OVF),
            ("xmlns:rasd", NS_RASD),
            ("xmlns:vmw", NS_VMW),
            ("xmlns:vssd", NS_VSSD),
            ("xmlns:xsi", NS_XSI),
        ],
    )?;

    out.start("References", &[])?;
    for file in &envelope.references {
        let size = file.size.to_string();
        out.empty(
            "File",
            &[("href", &file.href), ("id", &file.id), ("size", &size)],
        )?;
    }
    out.end("References")?;

    out.start("DiskSection", &[])?;
    out.leaf("Info", &envelope.disk_section.info)?;
    for disk in &envelope.disk_section.disks {
        let capacity = disk.capacity.to_string();
        let populated = disk.populated_size.to_string();
        let mut attrs = vec![
            ("capacity", capacity.as_str()),
            ("capacityAllocationUnits", disk.capacity_allocation_units.as_str()),
            ("diskId", disk.disk_id.as_str()),
            ("fileRef", disk.file_ref.as_str()),
            ("format", disk.format.as_str()),
        ];
        if disk.populated_size > 0 {
            attrs.push(("populatedSize", populated.as_str()));
        }
        out.empty("Disk", &attrs)?;
    }
    out.end("DiskSection")?;

    out.start("NetworkSection", &[])?;
    out.leaf("Info", &envelope.network_section.info)?;
    for network in &envelope.network_section.networks {
        out.start("Network", &[("name", &network.name)])?;
        out.leaf("Description", &network.description)?;
        out.end("Network")?;
    }
    out.end("NetworkSection")?;

    for system in &envelope.virtual_systems {
        write_virtual_system(&mut out, system)?;
    }

    out.end("Envelope")?;
    Ok(out.finish())
}

fn write_virtual_system(out: &mut OvfWriter, system: &VirtualSystem) -> Result<()> {
    out.start("VirtualSystem", &[("id", &system.id)])?;
    out.leaf("Info", &system.info)?;
    out.leaf("Name", &system.name)?;

    let os = &system.operating_system;
    let os_id = os.id.map(|id| id.to_string());
    let mut os_attrs = Vec::new();
    if let Some(id) = os_id.as_deref() {
        os_attrs.push(("id", id));
    }
    os_attrs.push(("vmw:osType", os.os_type.as_str()));
    out.start("OperatingSystemSection", &os_attrs)?;
    out.leaf("Info", &os.info)?;
    out.leaf("Description", &os.description)?;
    out.end("OperatingSystemSection")?;

    let hardware = &system.hardware;
    out.start("VirtualHardwareSection", &[])?;
    out.leaf("Info", &hardware.info)?;
    if let Some(sys) = &hardware.system {
        out.start("System", &[])?;
        out.leaf("vssd:ElementName", &sys.element_name)?;
        out.leaf("vssd:InstanceID", &sys.instance_id)?;
        out.leaf("vssd:VirtualSystemIdentifier", &sys.virtual_system_identifier)?;
        out.leaf("vssd:VirtualSystemType", &sys.virtual_system_type)?;
        out.end("System")?;
    }
    for item in &hardware.items {
        write_item(out, item)?;
    }
    for config in &hardware.configs {
        write_config(out, "vmw:Config", config)?;
    }
    for config in &hardware.extra_config {
        write_config(out, "vmw:ExtraConfig", config)?;
    }
    out.end("VirtualHardwareSection")?;

    out.end("VirtualSystem")
}

fn write_item(out: &mut OvfWriter, item: &Item) -> Result<()> {
    out.start("Item", &[])?;
    out.optional("rasd:Address", item.address.as_deref())?;
    out.optional("rasd:AddressOnParent", item.address_on_parent.as_deref())?;
    out.optional("rasd:AllocationUnits", item.allocation_units.as_deref())?;
    if let Some(auto) = item.automatic_allocation {
        out.leaf("rasd:AutomaticAllocation", if auto { "true" } else { "false" })?;
    }
    out.optional("rasd:Connection", item.connection.as_deref())?;
    out.optional("rasd:Description", item.description.as_deref())?;
    out.leaf("rasd:ElementName", &item.element_name)?;
    out.optional("rasd:HostResource", item.host_resource.as_deref())?;
    out.leaf("rasd:InstanceID", &item.instance_id)?;
    out.optional("rasd:Parent", item.parent.as_deref())?;
    out.optional("rasd:ResourceSubType", item.resource_sub_type.as_deref())?;
    out.leaf("rasd:ResourceType", &item.resource_type.to_string())?;
    if let Some(quantity) = item.virtual_quantity {
        out.leaf("rasd:VirtualQuantity", &quantity.to_string())?;
    }
    out.optional("vmw:CoresPerSocket", item.cores_per_socket.as_deref())?;
    for config in &item.configs {
        write_config(out, "vmw:Config", config)?;
    }
    out.end("Item")
}

fn write_config(out: &mut OvfWriter, element: &str, config: &Config) -> Result<()> {
    let mut attrs = Vec::new();
    if let Some(required) = config.required {
        attrs.push(("ovf:required", if required { "true" } else { "false" }));
    }
    attrs.push(("vmw:key", config.key.as_str()));
    attrs.push(("vmw:value", config.value.as_str()));
    out.empty(element, &attrs)
}

fn xml_error(e: impl std::fmt::Display) -> Error {
    Error::ovf(format!("failed to write XML: {}", e))
}

/// Thin indenting wrapper over the quick-xml writer.
struct OvfWriter {
    inner: Writer<Vec<u8>>,
}

impl OvfWriter {
    fn new() -> Self {
        let buffer = XML_HEADER.as_bytes().to_vec();
        Self {
            inner: Writer::new_with_indent(buffer, b' ', 2),
        }
    }

    fn element<'a>(name: &'a str, attrs: &[(&str, &str)]) -> BytesStart<'a> {
        let mut element = BytesStart::new(name);
        for attr in attrs {
            element.push_attribute(*attr);
        }
        element
    }

    fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.inner
            .write_event(Event::Start(Self::element(name, attrs)))
            .map_err(xml_error)
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.inner
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(xml_error)
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.inner
            .write_event(Event::Empty(Self::element(name, attrs)))
            .map_err(xml_error)
    }

    /// Write `<name>text</name>`, or `<name/>` when the text is empty.
    fn leaf(&mut self, name: &str, text: &str) -> Result<()> {
        if text.is_empty() {
            return self.empty(name, &[]);
        }
        self.start(name, &[])?;
        self.inner
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(xml_error)?;
        self.end(name)
    }

    fn optional(&mut self, name: &str, text: Option<&str>) -> Result<()> {
        match text {
            Some(text) => self.leaf(name, text),
            None => Ok(()),
        }
    }

    fn finish(self) -> Vec<u8> {
        let mut bytes = self.inner.into_inner();
        bytes.push(b'\n');
        bytes
    }
}
