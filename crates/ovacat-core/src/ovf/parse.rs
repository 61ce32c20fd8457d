//! Schema-tolerant OVF descriptor parsing.
//!
//! The reader matches elements and attributes by local name only, so the
//! namespace prefixes chosen by the producing tool do not matter. Elements
//! and attributes that the model has no place for are skipped.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::PrefixDeclaration;
use quick_xml::Reader;
use tracing::debug;

use super::model::{Config, Disk, Envelope, File, Item, Network, System, VirtualSystem};
use crate::error::{Error, Result};

/// Parse an OVF descriptor from its raw bytes.
///
/// # Errors
///
/// Returns [`Error::MalformedXml`] when the document is not well-formed or
/// its root is not an `Envelope`, and [`Error::Truncated`] when the document
/// ends before its elements are closed.
pub fn parse_envelope(data: &[u8]) -> Result<Envelope> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut parser = EnvelopeParser::default();
    let mut buf = Vec::new();
    loop {
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(quick_xml::Error::Syntax(e)) if ends_early(&e) => {
                return Err(Error::truncated(format!("descriptor ended early: {}", e)));
            }
            Err(e) => {
                let position = reader.buffer_position();
                return Err(Error::malformed(format!("at byte {}: {}", position, e)));
            }
        };
        match event {
            Event::Start(e) => parser.open(&e)?,
            Event::Empty(e) => {
                parser.open(&e)?;
                parser.close();
            }
            Event::End(_) => parser.close(),
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::malformed(format!("bad text content: {}", e)))?;
                parser.text(&text);
            }
            Event::CData(c) => {
                let raw = c.into_inner();
                parser.text(&String::from_utf8_lossy(&raw));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    parser.finish()
}

fn ends_early(e: &SyntaxError) -> bool {
    matches!(
        e,
        SyntaxError::UnclosedTag
            | SyntaxError::UnclosedCData
            | SyntaxError::UnclosedComment
            | SyntaxError::UnclosedDoctype
            | SyntaxError::UnclosedPIOrXmlDecl
    )
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Element attributes keyed by local name.
struct Attributes {
    values: Vec<(String, String)>,
    namespaces: Vec<(String, String)>,
}

impl Attributes {
    fn read(element: &BytesStart<'_>) -> Result<Self> {
        let mut values = Vec::new();
        let mut namespaces = Vec::new();
        for attr in element.attributes() {
            let attr = attr.map_err(|e| Error::malformed(format!("bad attribute: {}", e)))?;
            let value = attr
                .unescape_value()
                .map_err(|e| Error::malformed(format!("bad attribute value: {}", e)))?
                .into_owned();
            match attr.key.as_namespace_binding() {
                Some(PrefixDeclaration::Default) => namespaces.push((String::new(), value)),
                Some(PrefixDeclaration::Named(prefix)) => namespaces.push((lossy(prefix), value)),
                None => values.push((lossy(attr.key.local_name().as_ref()), value)),
            }
        }
        Ok(Self { values, namespaces })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn string(&self, name: &str) -> String {
        self.get(name).unwrap_or_default().to_string()
    }

    fn count(&self, name: &str) -> u64 {
        self.get(name).map(|v| parse_count(name, v)).unwrap_or(0)
    }

    fn config(&self) -> Config {
        Config {
            key: self.string("key"),
            value: self.string("value"),
            required: self.get("required").and_then(parse_bool),
        }
    }
}

/// Parse a non-negative decimal count, clamping negatives to zero.
fn parse_count(field: &str, raw: &str) -> u64 {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<u64>() {
        return value;
    }
    match raw.parse::<i64>() {
        Ok(value) => {
            debug!(field, value, "clamping negative value to zero");
            0
        }
        Err(_) => {
            debug!(field, raw, "ignoring non-numeric value");
            0
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn is_item(name: &str) -> bool {
    matches!(name, "Item" | "StorageItem" | "EthernetPortItem")
}

#[derive(Default)]
struct EnvelopeParser {
    envelope: Envelope,
    seen_root: bool,
    stack: Vec<String>,
    text: String,
}

impl EnvelopeParser {
    fn parent(&self) -> &str {
        self.stack.last().map(String::as_str).unwrap_or_default()
    }

    fn system(&mut self) -> Option<&mut VirtualSystem> {
        self.envelope.virtual_systems.last_mut()
    }

    fn item(&mut self) -> Option<&mut Item> {
        self.system().and_then(|vs| vs.hardware.items.last_mut())
    }

    fn open(&mut self, element: &BytesStart<'_>) -> Result<()> {
        let name = lossy(element.local_name().as_ref());
        let attrs = Attributes::read(element)?;

        if self.stack.is_empty() {
            if self.seen_root || name != "Envelope" {
                return Err(Error::malformed(format!(
                    "unexpected root element <{}>, expected <Envelope>",
                    name
                )));
            }
            self.seen_root = true;
            self.envelope.namespaces = attrs.namespaces.clone();
        }

        let parent = self.parent().to_string();
        match (parent.as_str(), name.as_str()) {
            ("References", "File") => self.envelope.references.push(File {
                id: attrs.string("id"),
                href: attrs.string("href"),
                size: attrs.count("size"),
            }),
            ("DiskSection", "Disk") => self.envelope.disk_section.disks.push(Disk {
                disk_id: attrs.string("diskId"),
                file_ref: attrs.string("fileRef"),
                capacity: attrs.count("capacity"),
                capacity_allocation_units: attrs.string("capacityAllocationUnits"),
                populated_size: attrs.count("populatedSize"),
                format: attrs.string("format"),
            }),
            ("NetworkSection", "Network") => self.envelope.network_section.networks.push(Network {
                name: attrs.string("name"),
                description: String::new(),
            }),
            (_, "VirtualSystem") => self.envelope.virtual_systems.push(VirtualSystem {
                id: attrs.string("id"),
                ..Default::default()
            }),
            ("VirtualSystem", "OperatingSystemSection") => {
                if let Some(vs) = self.system() {
                    vs.operating_system.id = attrs.get("id").and_then(|v| v.trim().parse().ok());
                    vs.operating_system.os_type = attrs.string("osType");
                }
            }
            ("VirtualHardwareSection", "System") => {
                if let Some(vs) = self.system() {
                    vs.hardware.system = Some(System::default());
                }
            }
            ("VirtualHardwareSection", item) if is_item(item) => {
                if let Some(vs) = self.system() {
                    vs.hardware.items.push(Item::default());
                }
            }
            ("VirtualHardwareSection", "Config") => {
                if let Some(vs) = self.system() {
                    vs.hardware.configs.push(attrs.config());
                }
            }
            ("VirtualHardwareSection", "ExtraConfig") => {
                if let Some(vs) = self.system() {
                    vs.hardware.extra_config.push(attrs.config());
                }
            }
            (item, "Config") if is_item(item) => {
                if let Some(item) = self.item() {
                    item.configs.push(attrs.config());
                }
            }
            _ => {}
        }

        self.stack.push(name);
        self.text.clear();
        Ok(())
    }

    fn text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    fn close(&mut self) {
        let Some(name) = self.stack.pop() else {
            return;
        };
        let text = std::mem::take(&mut self.text);
        let parent = self.parent().to_string();

        match (parent.as_str(), name.as_str()) {
            ("DiskSection", "Info") => self.envelope.disk_section.info = text,
            ("NetworkSection", "Info") => self.envelope.network_section.info = text,
            ("Network", "Description") => {
                if let Some(network) = self.envelope.network_section.networks.last_mut() {
                    network.description = text;
                }
            }
            ("VirtualSystem", "Info") => {
                if let Some(vs) = self.system() {
                    vs.info = text;
                }
            }
            ("VirtualSystem", "Name") => {
                if let Some(vs) = self.system() {
                    vs.name = text;
                }
            }
            ("OperatingSystemSection", "Info") => {
                if let Some(vs) = self.system() {
                    vs.operating_system.info = text;
                }
            }
            ("OperatingSystemSection", "Description") => {
                if let Some(vs) = self.system() {
                    vs.operating_system.description = text;
                }
            }
            ("VirtualHardwareSection", "Info") => {
                if let Some(vs) = self.system() {
                    vs.hardware.info = text;
                }
            }
            ("System", field) => {
                if let Some(system) = self.system().and_then(|vs| vs.hardware.system.as_mut()) {
                    match field {
                        "ElementName" => system.element_name = text,
                        "InstanceID" => system.instance_id = text,
                        "VirtualSystemIdentifier" => system.virtual_system_identifier = text,
                        "VirtualSystemType" => system.virtual_system_type = text,
                        _ => {}
                    }
                }
            }
            (item, field) if is_item(item) => {
                if let Some(item) = self.item() {
                    apply_item_field(item, field, text);
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Result<Envelope> {
        if !self.seen_root {
            return Err(Error::malformed("no <Envelope> element found"));
        }
        if let Some(open) = self.stack.last() {
            return Err(Error::truncated(format!(
                "descriptor ended inside <{}>",
                open
            )));
        }
        Ok(self.envelope)
    }
}

fn apply_item_field(item: &mut Item, field: &str, text: String) {
    match field {
        "ResourceType" => {
            item.resource_type = text.trim().parse().unwrap_or_else(|_| {
                debug!(raw = %text, "ignoring non-numeric resource type");
                0
            })
        }
        "InstanceID" => item.instance_id = text,
        "ElementName" => item.element_name = text,
        "Description" => item.description = Some(text),
        "AllocationUnits" => item.allocation_units = Some(text),
        "VirtualQuantity" => item.virtual_quantity = Some(parse_count(field, &text)),
        "Address" => item.address = Some(text),
        "AddressOnParent" => item.address_on_parent = Some(text),
        "AutomaticAllocation" => item.automatic_allocation = parse_bool(&text),
        "Connection" => item.connection = Some(text),
        "HostResource" => item.host_resource = Some(text),
        "Parent" => item.parent = Some(text),
        "ResourceSubType" => item.resource_sub_type = Some(text),
        "CoresPerSocket" => item.cores_per_socket = Some(text),
        _ => {}
    }
}
