use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use super::{PlcConnector, PlcTransport, TransportError};
use twinsync_core::{PlanItem, PlcConfig, PlcValue};

/// Shared tag memory of a simulated PLC.
///
/// Scalar tags live in a flat path map (array elements are stored under
/// their indexed path, `Line.Temps[3]`); UDT-typed tags carry their
/// member map so an `expand = "udt"` item can be resolved without a
/// separate type registry. A simulation driver mutates the bank while
/// sessions read through [`SimPlcTransport`].
#[derive(Default)]
pub struct SimPlcBank {
    tags: StdMutex<HashMap<String, PlcValue>>,
    udts: StdMutex<HashMap<String, BTreeMap<String, PlcValue>>>,
}

impl SimPlcBank {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bank preloaded with the tag space the simulation scenarios use:
    /// the `Program:MainProgram.*` scalars, a `Station1Status` UDT and
    /// a small temperature array.
    pub fn seeded() -> Arc<Self> {
        let bank = Self::default();
        {
            let mut tags = bank.tags.lock().unwrap();
            tags.insert(
                "Program:MainProgram.MotorRunning".into(),
                PlcValue::Bool(true),
            );
            tags.insert("Program:MainProgram.PartCount".into(), PlcValue::Int32(0));
            for i in 0..8 {
                tags.insert(format!("Line.Temps[{i}]"), PlcValue::Double(20.0 + i as f64));
            }
        }
        {
            let mut udts = bank.udts.lock().unwrap();
            let mut members = BTreeMap::new();
            members.insert("Run".into(), PlcValue::Bool(true));
            members.insert("Faulted".into(), PlcValue::Bool(false));
            members.insert("FaultCode".into(), PlcValue::Int32(0));
            members.insert("Speed".into(), PlcValue::Double(1450.0));
            members.insert("Temp0".into(), PlcValue::Double(36.2));
            members.insert("Temp1".into(), PlcValue::Double(41.8));
            udts.insert("Station1Status".into(), members);
        }
        Arc::new(bank)
    }

    pub fn set_tag(&self, path: impl Into<String>, value: PlcValue) {
        self.tags.lock().unwrap().insert(path.into(), value);
    }

    pub fn set_udt(&self, path: impl Into<String>, members: BTreeMap<String, PlcValue>) {
        self.udts.lock().unwrap().insert(path.into(), members);
    }

    fn scalar(&self, path: &str) -> PlcValue {
        self.tags
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or(PlcValue::Null)
    }

    fn udt(&self, path: &str) -> Option<BTreeMap<String, PlcValue>> {
        self.udts.lock().unwrap().get(path).cloned()
    }
}

/// Splits `Base[a..b]` into its base path and inclusive index range.
fn parse_range(path: &str) -> Option<(&str, usize, usize)> {
    let open = path.find('[')?;
    let inner = path[open + 1..].strip_suffix(']')?;
    let (a, b) = inner.split_once("..")?;
    let a: usize = a.trim().parse().ok()?;
    let b: usize = b.trim().parse().ok()?;
    if b < a {
        return None;
    }
    Some((&path[..open], a, b))
}

/// Tag reader over a [`SimPlcBank`], honoring the per-config caps on
/// array elements and struct fields.
pub struct SimPlcTransport {
    bank: Arc<SimPlcBank>,
    max_array_elements: usize,
    max_struct_fields: usize,
}

#[async_trait]
impl PlcTransport for SimPlcTransport {
    async fn read(
        &mut self,
        items: &[PlanItem],
    ) -> Result<BTreeMap<String, PlcValue>, TransportError> {
        let mut values = BTreeMap::new();
        for item in items {
            let value = if item.expand.as_deref() == Some("udt") {
                match self.bank.udt(&item.path) {
                    Some(members) => PlcValue::Struct(
                        members.into_iter().take(self.max_struct_fields).collect(),
                    ),
                    None => PlcValue::Null,
                }
            } else if let Some((base, a, b)) = parse_range(&item.path) {
                let count = (b - a + 1).min(self.max_array_elements);
                PlcValue::Array(
                    (a..a + count)
                        .map(|i| self.bank.scalar(&format!("{base}[{i}]")))
                        .collect(),
                )
            } else {
                self.bank.scalar(&item.path)
            };
            values.insert(item.path.clone(), value);
        }
        Ok(values)
    }

    async fn close(&mut self) {}
}

/// Hands out readers over one shared [`SimPlcBank`].
pub struct SimPlcConnector {
    bank: Arc<SimPlcBank>,
    max_array_elements: usize,
    max_struct_fields: usize,
}

impl SimPlcConnector {
    pub fn new(bank: Arc<SimPlcBank>, cfg: &PlcConfig) -> Self {
        Self {
            bank,
            max_array_elements: cfg.max_array_elements,
            max_struct_fields: cfg.max_struct_fields,
        }
    }

    pub fn bank(&self) -> Arc<SimPlcBank> {
        self.bank.clone()
    }
}

#[async_trait]
impl PlcConnector for SimPlcConnector {
    async fn connect(&self) -> Result<Box<dyn PlcTransport>, TransportError> {
        Ok(Box::new(SimPlcTransport {
            bank: self.bank.clone(),
            max_array_elements: self.max_array_elements,
            max_struct_fields: self.max_struct_fields,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SimPlcTransport {
        SimPlcTransport {
            bank: SimPlcBank::seeded(),
            max_array_elements: 4,
            max_struct_fields: 64,
        }
    }

    #[tokio::test]
    async fn udt_expand_resolves_member_struct() {
        let mut t = transport();
        let items = [PlanItem::expanded("Station1Status", "udt")];
        let values = t.read(&items).await.unwrap();
        match &values["Station1Status"] {
            PlcValue::Struct(members) => {
                let names: Vec<&str> = members.keys().map(String::as_str).collect();
                assert_eq!(
                    names,
                    ["FaultCode", "Faulted", "Run", "Speed", "Temp0", "Temp1"]
                );
            }
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn range_path_reads_capped_array() {
        let mut t = transport();
        let items = [PlanItem::new("Line.Temps[0..7]")];
        let values = t.read(&items).await.unwrap();
        match &values["Line.Temps[0..7]"] {
            // 8 requested, capped at 4
            PlcValue::Array(elems) => {
                assert_eq!(elems.len(), 4);
                assert_eq!(elems[0], PlcValue::Double(20.0));
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tag_reads_null() {
        let mut t = transport();
        let values = t.read(&[PlanItem::new("Nope")]).await.unwrap();
        assert_eq!(values["Nope"], PlcValue::Null);
    }

    #[test]
    fn range_parse_rejects_malformed_suffixes() {
        assert_eq!(parse_range("Tag[3..1]"), None);
        assert_eq!(parse_range("Tag[3]"), None);
        assert_eq!(parse_range("Tag"), None);
        assert_eq!(parse_range("Tag[0..2]"), Some(("Tag", 0, 2)));
    }
}
