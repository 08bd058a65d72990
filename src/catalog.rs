//! Versioned collection of device schemas, looked up by model id or
//! manufacturer name.

use crate::convert::ConverterRegistry;
use crate::error::SchemaError;
use crate::schema::DeviceDpSchema;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;

const BUILTIN_SCHEMAS: &[(&str, &str)] = &[
    ("pir_occupancy", include_str!("../schemas/pir_occupancy.json")),
    ("temp_humidity", include_str!("../schemas/temp_humidity.json")),
    ("pet_feeder", include_str!("../schemas/pet_feeder.json")),
    ("irrigation_valve", include_str!("../schemas/irrigation_valve.json")),
];

/// Schema tables keyed by model id, every version kept.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    models: BTreeMap<String, BTreeMap<u32, Arc<DeviceDpSchema>>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the schemas bundled with the crate.
    pub fn builtin(registry: &ConverterRegistry) -> Result<Self, SchemaError> {
        let mut catalog = Self::new();
        for (name, json) in BUILTIN_SCHEMAS {
            debug!("Loading bundled schema {}", name);
            catalog.load_json(json, registry)?;
        }
        info!("Schema catalog ready with {} model(s)", catalog.models.len());
        Ok(catalog)
    }

    /// Add a schema; a schema with the same model and version is replaced.
    pub fn insert(&mut self, schema: DeviceDpSchema) -> Arc<DeviceDpSchema> {
        let schema = Arc::new(schema);
        self.models
            .entry(schema.model().to_string())
            .or_default()
            .insert(schema.version(), schema.clone());
        schema
    }

    pub fn load_json(
        &mut self,
        json: &str,
        registry: &ConverterRegistry,
    ) -> Result<Arc<DeviceDpSchema>, SchemaError> {
        let schema = DeviceDpSchema::from_json(json, registry)?;
        Ok(self.insert(schema))
    }

    /// Latest schema whose model id or manufacturer list matches `key`.
    pub fn find(&self, key: &str) -> Option<Arc<DeviceDpSchema>> {
        if let Some(latest) = self.models.get(key).and_then(|v| v.values().next_back()) {
            return Some(latest.clone());
        }
        self.models
            .values()
            .filter_map(|versions| versions.values().next_back())
            .filter(|schema| schema.manufacturers().iter().any(|m| m == key))
            .max_by_key(|schema| schema.version())
            .cloned()
    }

    /// Like [`find`](Self::find), failing with `UnknownModel` on a miss.
    pub fn require(&self, key: &str) -> Result<Arc<DeviceDpSchema>, SchemaError> {
        self.find(key)
            .ok_or_else(|| SchemaError::UnknownModel(key.to_string()))
    }

    /// A specific version of a model.
    pub fn get(&self, model: &str, version: u32) -> Option<Arc<DeviceDpSchema>> {
        self.models.get(model)?.get(&version).cloned()
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DpType;
    use crate::schema::DeviceDpSchemaEntry;
    use crate::transaction::AckMode;

    fn builtin() -> SchemaCatalog {
        SchemaCatalog::builtin(&ConverterRegistry::builtin()).unwrap()
    }

    #[test]
    fn bundled_schemas_load() {
        let catalog = builtin();
        let models: Vec<&str> = catalog.models().collect();
        assert_eq!(models.len(), 4);
        assert!(models.contains(&"TS0601_pet_feeder"));

        let feeder = catalog.find("TS0601_pet_feeder").unwrap();
        assert_eq!(feeder.lookup(18).unwrap().field, "alarm_food_level");
        assert_eq!(feeder.ack_mode(), Some(AckMode::TransactionId));

        let sensor = catalog.find("TS0601_temp_humidity").unwrap();
        assert_eq!(sensor.ack_mode(), Some(AckMode::None));

        let valve = catalog.find("TS0601_irrigation_valve").unwrap();
        assert_eq!(valve.lookup(101).unwrap().wire_type(), DpType::Raw);
    }

    #[test]
    fn finds_by_manufacturer() {
        let catalog = builtin();
        let schema = catalog.find("_TZE200_wfxuhoea").unwrap();
        assert_eq!(schema.model(), "TS0601_pet_feeder");
        assert!(catalog.find("_TZE200_unknown").is_none());
        assert_eq!(
            catalog.require("_TZE200_unknown").unwrap_err(),
            SchemaError::UnknownModel("_TZE200_unknown".into())
        );
    }

    #[test]
    fn highest_version_wins() {
        let mut catalog = SchemaCatalog::new();
        for version in [1, 3, 2] {
            let schema = DeviceDpSchema::builder("m")
                .version(version)
                .manufacturer("_TZ_m")
                .entry(DeviceDpSchemaEntry::new(1, format!("field_v{version}"), DpType::Bool))
                .build()
                .unwrap();
            catalog.insert(schema);
        }
        assert_eq!(catalog.find("m").unwrap().version(), 3);
        assert_eq!(catalog.find("_TZ_m").unwrap().version(), 3);
        assert_eq!(catalog.get("m", 1).unwrap().lookup(1).unwrap().field, "field_v1");
        assert!(catalog.get("m", 9).is_none());
    }
}
