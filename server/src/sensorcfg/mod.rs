// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Static sensor catalog loaded from the UniSet2 XML configure file.
//!
//! The catalog is parsed once at startup and immutable afterwards. Sensor ids
//! missing from the file are synthesized with MurmurHash2 of the sensor name
//! (seed 0), matching the upstream hash32() function bit for bit.

use std::collections::HashMap;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

use crate::error::{Error, Result};

/// MurmurHash2, Austin Appleby's 32-bit variant.
pub fn murmur2(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = seed ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// MurmurHash2 of a name with seed 0, as used for sensor id synthesis.
pub fn hash32(name: &str) -> u32 {
    murmur2(name.as_bytes(), 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IoType {
    #[serde(rename = "DI")]
    Di,
    #[serde(rename = "DO")]
    Do,
    #[serde(rename = "AI")]
    Ai,
    #[serde(rename = "AO")]
    Ao,
    #[serde(rename = "")]
    Unknown,
}

impl IoType {
    pub fn parse(s: &str) -> IoType {
        match s.to_ascii_uppercase().as_str() {
            "DI" => IoType::Di,
            "DO" => IoType::Do,
            "AI" => IoType::Ai,
            "AO" => IoType::Ao,
            _ => IoType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IoType::Di => "DI",
            IoType::Do => "DO",
            IoType::Ai => "AI",
            IoType::Ao => "AO",
            IoType::Unknown => "",
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, IoType::Di | IoType::Do)
    }

    pub fn is_analog(&self) -> bool {
        matches!(self, IoType::Ai | IoType::Ao)
    }

    pub fn is_input(&self) -> bool {
        matches!(self, IoType::Di | IoType::Ai)
    }

    pub fn is_output(&self) -> bool {
        matches!(self, IoType::Do | IoType::Ao)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Sensor {
    pub id: i64,
    pub name: String,
    pub iotype: IoType,
    pub textname: String,
}

/// JSON-friendly projection for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct SensorInfo {
    pub id: i64,
    pub name: String,
    pub iotype: &'static str,
    pub textname: String,
    #[serde(rename = "isDiscrete")]
    pub is_discrete: bool,
    #[serde(rename = "isInput")]
    pub is_input: bool,
}

impl Sensor {
    pub fn to_info(&self) -> SensorInfo {
        SensorInfo {
            id: self.id,
            name: self.name.clone(),
            iotype: self.iotype.as_str(),
            textname: self.textname.clone(),
            is_discrete: self.iotype.is_discrete(),
            is_input: self.iotype.is_input(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogObject {
    pub id: i64,
    pub name: String,
}

/// Immutable name-keyed sensor registry.
#[derive(Debug)]
pub struct SensorCatalog {
    by_name: HashMap<String, usize>,
    sensors: Vec<Sensor>,
    objects: HashMap<String, CatalogObject>,
    services: HashMap<String, CatalogObject>,
}

/// Which container an `<item>` was found in during the scan.
#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Sensors,
    Objects,
    Services,
}

#[derive(Default)]
struct RawItem {
    id: Option<i64>,
    name: String,
    iotype: String,
    textname: String,
}

impl SensorCatalog {
    pub fn load(path: &Path) -> Result<SensorCatalog> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    /// Parse the configure XML. The root element name is ignored; sensors may
    /// appear directly under the root or inside `<ObjectsMap>`, which also
    /// carries the `idfromfile` attribute and the objects/services lists.
    pub fn parse(xml: &str) -> Result<SensorCatalog> {
        let mut reader = Reader::from_str(xml);

        let mut id_from_file = false;
        let mut section = Section::None;
        let mut in_objects_map = false;
        let mut sensor_items: Vec<RawItem> = Vec::new();
        let mut object_items: Vec<RawItem> = Vec::new();
        let mut service_items: Vec<RawItem> = Vec::new();

        loop {
            match reader
                .read_event()
                .map_err(|e| Error::InvalidInput(format!("parse xml: {e}")))?
            {
                Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                    b"ObjectsMap" => {
                        in_objects_map = true;
                        if let Some(v) = attr(&e, b"idfromfile")? {
                            id_from_file = v == "1";
                        }
                    }
                    b"sensors" => section = Section::Sensors,
                    b"objects" if in_objects_map => section = Section::Objects,
                    b"services" if in_objects_map => section = Section::Services,
                    b"item" => {
                        let item = read_item(&e)?;
                        match section {
                            Section::Sensors => sensor_items.push(item),
                            Section::Objects => object_items.push(item),
                            Section::Services => service_items.push(item),
                            Section::None => {}
                        }
                    }
                    _ => {}
                },
                Event::End(e) => match e.name().as_ref() {
                    b"ObjectsMap" => in_objects_map = false,
                    b"sensors" | b"objects" | b"services" => section = Section::None,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        let mut catalog = SensorCatalog {
            by_name: HashMap::new(),
            sensors: Vec::with_capacity(sensor_items.len()),
            objects: HashMap::new(),
            services: HashMap::new(),
        };

        for item in sensor_items {
            let id = resolve_id(&item, id_from_file)?;
            let sensor = Sensor {
                id,
                iotype: IoType::parse(&item.iotype),
                textname: item.textname,
                name: item.name,
            };
            catalog.by_name.insert(sensor.name.clone(), catalog.sensors.len());
            catalog.sensors.push(sensor);
        }
        for item in object_items {
            let id = resolve_id(&item, id_from_file)?;
            catalog.objects.insert(item.name.clone(), CatalogObject { id, name: item.name });
        }
        for item in service_items {
            let id = resolve_id(&item, id_from_file)?;
            catalog.services.insert(item.name.clone(), CatalogObject { id, name: item.name });
        }

        Ok(catalog)
    }

    pub fn by_name(&self, name: &str) -> Option<&Sensor> {
        self.by_name.get(name).map(|&i| &self.sensors[i])
    }

    pub fn all(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn discrete(&self) -> Vec<&Sensor> {
        self.sensors.iter().filter(|s| s.iotype.is_discrete()).collect()
    }

    pub fn analog(&self) -> Vec<&Sensor> {
        self.sensors.iter().filter(|s| s.iotype.is_analog()).collect()
    }

    pub fn count(&self) -> usize {
        self.sensors.len()
    }

    pub fn has_object_or_service(&self, name: &str) -> bool {
        self.objects.contains_key(name) || self.services.contains_key(name)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn all_info(&self) -> Vec<SensorInfo> {
        self.sensors.iter().map(Sensor::to_info).collect()
    }
}

fn resolve_id(item: &RawItem, id_from_file: bool) -> Result<i64> {
    match item.id {
        Some(id) if id != 0 => Ok(id),
        _ if id_from_file => Err(Error::InvalidInput(format!(
            "sensor {:?} has no id attribute but idfromfile=\"1\"",
            item.name
        ))),
        _ => Ok(hash32(&item.name) as i64),
    }
}

fn read_item(e: &BytesStart<'_>) -> Result<RawItem> {
    let mut item = RawItem::default();
    for a in e.attributes() {
        let a = a.map_err(|e| Error::InvalidInput(format!("xml attribute: {e}")))?;
        let value = a
            .unescape_value()
            .map_err(|e| Error::InvalidInput(format!("xml attribute value: {e}")))?
            .into_owned();
        match a.key.as_ref() {
            b"id" => {
                item.id = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| Error::InvalidInput(format!("bad sensor id {value:?}")))?,
                )
            }
            b"name" => item.name = value,
            b"iotype" => item.iotype = value,
            b"textname" => item.textname = value,
            _ => {}
        }
    }
    if item.name.is_empty() {
        return Err(Error::InvalidInput("item without name attribute".into()));
    }
    Ok(item)
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|e| Error::InvalidInput(format!("xml attribute: {e}")))?;
        if a.key.as_ref() == key {
            let value = a
                .unescape_value()
                .map_err(|e| Error::InvalidInput(format!("xml attribute value: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash32_reference_vector() {
        assert_eq!(hash32("SES.AMC1_OPCUA_EM1"), 1_534_986_534);
    }

    #[test]
    fn hash32_is_deterministic() {
        let input = "Some.Long.Sensor_Name_123";
        assert_eq!(hash32(input), hash32(input));
    }

    #[test]
    fn murmur2_seed_changes_result() {
        assert_ne!(murmur2(b"sensor", 0), murmur2(b"sensor", 1));
    }

    #[test]
    fn parse_direct_sensors() {
        let xml = r#"<UNISETPLC>
            <sensors>
                <item id="42" name="Sensor1" iotype="ai" textname="First"/>
                <item name="Sensor2" iotype="DI" textname="Second"/>
            </sensors>
        </UNISETPLC>"#;
        let catalog = SensorCatalog::parse(xml).unwrap();
        assert_eq!(catalog.count(), 2);

        let s1 = catalog.by_name("Sensor1").unwrap();
        assert_eq!(s1.id, 42);
        assert_eq!(s1.iotype, IoType::Ai);

        let s2 = catalog.by_name("Sensor2").unwrap();
        assert_eq!(s2.id, hash32("Sensor2") as i64);
        assert!(s2.iotype.is_discrete());
        assert!(s2.iotype.is_input());
    }

    #[test]
    fn parse_objects_map() {
        let xml = r#"<Configure>
            <ObjectsMap idfromfile="0">
                <sensors>
                    <item name="SES.AMC1_OPCUA_EM1" iotype="DI" textname="EM1"/>
                </sensors>
                <objects>
                    <item name="TestProc"/>
                </objects>
                <services>
                    <item name="SharedMemory"/>
                </services>
            </ObjectsMap>
        </Configure>"#;
        let catalog = SensorCatalog::parse(xml).unwrap();
        assert_eq!(catalog.count(), 1);
        assert_eq!(
            catalog.by_name("SES.AMC1_OPCUA_EM1").unwrap().id,
            1_534_986_534
        );
        assert!(catalog.has_object_or_service("TestProc"));
        assert!(catalog.has_object_or_service("SharedMemory"));
        assert!(!catalog.has_object_or_service("Nothing"));
        assert_eq!(catalog.object_count(), 1);
        assert_eq!(catalog.service_count(), 1);
    }

    #[test]
    fn idfromfile_requires_ids() {
        let xml = r#"<Configure>
            <ObjectsMap idfromfile="1">
                <sensors>
                    <item name="NoId" iotype="AI" textname="x"/>
                </sensors>
            </ObjectsMap>
        </Configure>"#;
        let err = SensorCatalog::parse(xml).unwrap_err();
        assert!(err.to_string().contains("idfromfile"));
    }

    #[test]
    fn sensor_info_projection() {
        let xml = r#"<R><sensors><item id="7" name="S" iotype="do" textname="t"/></sensors></R>"#;
        let catalog = SensorCatalog::parse(xml).unwrap();
        let info = &catalog.all_info()[0];
        assert_eq!(info.iotype, "DO");
        assert!(info.is_discrete);
        assert!(!info.is_input);
    }
}
