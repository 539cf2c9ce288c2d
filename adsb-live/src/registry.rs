//! Aircraft registry loaded from a JSON file, served through the detail
//! fetcher.
//!
//! File format: an object keyed by ICAO hex address.
//!
//! ```json
//! { "4840D6": { "registration": "PH-BXA", "aircraft_type": "B738", "operator": "KLM" } }
//! ```

use std::collections::HashMap;
use std::path::Path;

use adsb_live_core::{icao_from_hex, AdsbError, AircraftDetail, DetailSource, Icao, Result};

pub struct RegistrySource {
    entries: HashMap<Icao, AircraftDetail>,
}

impl RegistrySource {
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: HashMap<String, AircraftDetail> =
            serde_json::from_str(text).map_err(|e| AdsbError::Config(format!("registry: {e}")))?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (hex, detail) in raw {
            let icao = icao_from_hex(&hex)
                .ok_or_else(|| AdsbError::Config(format!("registry: bad ICAO address {hex}")))?;
            entries.insert(icao, detail);
        }
        Ok(RegistrySource { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl DetailSource for RegistrySource {
    type Key = Icao;
    type Hint = Option<String>;
    type Detail = AircraftDetail;

    fn fetch_one(&self, key: &Icao, _callsign: &Option<String>) -> Option<AircraftDetail> {
        self.entries.get(key).cloned()
    }

    fn fetch_batch(
        &self,
        requests: &[(Icao, Option<String>)],
    ) -> Option<Vec<(Icao, Option<AircraftDetail>)>> {
        Some(
            requests
                .iter()
                .map(|(icao, _)| (*icao, self.entries.get(icao).cloned()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registry() {
        let source = RegistrySource::from_json(
            r#"{ "4840d6": { "registration": "PH-BXA", "is_military": false } }"#,
        )
        .unwrap();
        assert_eq!(source.entries.len(), 1);
        let detail = source.fetch_one(&[0x48, 0x40, 0xD6], &None).unwrap();
        assert_eq!(detail.registration.as_deref(), Some("PH-BXA"));
        assert_eq!(detail.is_military, Some(false));
        assert!(source.fetch_one(&[0, 0, 1], &None).is_none());
    }

    #[test]
    fn test_bad_address_rejected() {
        assert!(matches!(
            RegistrySource::from_json(r#"{ "nothex": {} }"#),
            Err(AdsbError::Config(_))
        ));
    }
}
