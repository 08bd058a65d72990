//! Per-model datapoint tables.
//!
//! A [`DeviceDpSchema`] maps numeric dp ids onto named fields with a wire type
//! and a converter. Schemas are built once (from JSON or with
//! [`SchemaBuilder`]) and shared read-only by every component of a device.

use crate::convert::{
    Converter, ConverterRef, ConverterRegistry, TypedValue, element_width, to_semantic,
    to_semantic_list, to_wire, to_wire_list,
};
use crate::error::{CommandError, ConvertError, SchemaError};
use crate::protocol::{DatapointFrame, DpType};
use crate::transaction::AckMode;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Whether a dp carries one value or a packed list of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    #[default]
    Single,
    /// Raw frame holding concatenated fixed-width elements
    Array,
}

/// One row of a device schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDpSchemaEntry {
    pub dp_id: u8,
    pub field: String,
    /// Declared type; for arrays this is the element type.
    pub dp_type: DpType,
    pub converter: Converter,
    pub multiplicity: Multiplicity,
}

impl DeviceDpSchemaEntry {
    pub fn new<S: Into<String>>(dp_id: u8, field: S, dp_type: DpType) -> Self {
        Self {
            dp_id,
            field: field.into(),
            dp_type,
            converter: Converter::Identity,
            multiplicity: Multiplicity::Single,
        }
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = converter;
        self
    }

    pub fn array(mut self) -> Self {
        self.multiplicity = Multiplicity::Array;
        self
    }

    /// Type tag used on the wire for this dp.
    pub fn wire_type(&self) -> DpType {
        match self.multiplicity {
            Multiplicity::Single => self.dp_type,
            Multiplicity::Array => DpType::Raw,
        }
    }

    fn validate(&self) -> Result<(), SchemaError> {
        self.converter
            .check(self.dp_type)
            .map_err(|source| SchemaError::Converter {
                field: self.field.clone(),
                source,
            })?;
        if self.multiplicity == Multiplicity::Array && element_width(self.dp_type).is_err() {
            return Err(SchemaError::InvalidArray(self.field.clone()));
        }
        Ok(())
    }

    /// Convert an inbound frame for this dp into its semantic value.
    ///
    /// A frame reported with a different fixed-width type is still accepted
    /// when its payload width is valid for the declared type (firmware is
    /// known to swap Bool and Enum).
    pub fn decode(&self, frame: &DatapointFrame) -> Result<TypedValue, ConvertError> {
        let found = frame.dp_type();
        let payload = frame.payload();

        if self.multiplicity == Multiplicity::Array {
            if found != DpType::Raw {
                return Err(ConvertError::TypeMismatch {
                    expected: DpType::Raw,
                    found,
                });
            }
            return to_semantic_list(self.dp_type, payload, &self.converter);
        }

        if found != self.dp_type {
            let tolerated = found.fixed_width().is_some()
                && self.dp_type.fixed_width().is_some()
                && self.dp_type.accepts_width(payload.len());
            if !tolerated {
                return Err(ConvertError::TypeMismatch {
                    expected: self.dp_type,
                    found,
                });
            }
            debug!(
                "dp {} ({}) reported as {:?}, decoding as {:?}",
                self.dp_id, self.field, found, self.dp_type
            );
        }
        to_semantic(self.dp_type, payload, &self.converter)
    }

    /// Build the outbound frame carrying `value` for this dp.
    pub fn encode(&self, value: &TypedValue) -> Result<DatapointFrame, CommandError> {
        let payload = match self.multiplicity {
            Multiplicity::Single => to_wire(self.dp_type, value, &self.converter)?,
            Multiplicity::Array => to_wire_list(self.dp_type, value, &self.converter)?,
        };
        Ok(DatapointFrame::new(self.dp_id, self.wire_type(), payload)?)
    }
}

/// Read-only dp table for one device model.
#[derive(Debug, Clone)]
pub struct DeviceDpSchema {
    model: String,
    version: u32,
    manufacturers: Vec<String>,
    ack_mode: Option<AckMode>,
    entries: BTreeMap<u8, DeviceDpSchemaEntry>,
    fields: HashMap<String, u8>,
}

impl DeviceDpSchema {
    pub fn builder<S: Into<String>>(model: S) -> SchemaBuilder {
        SchemaBuilder {
            model: model.into(),
            version: 1,
            manufacturers: Vec::new(),
            ack_mode: None,
            entries: Vec::new(),
        }
    }

    /// Parse a schema document, resolving named converters against `registry`.
    pub fn from_json(json: &str, registry: &ConverterRegistry) -> Result<Self, SchemaError> {
        let file: SchemaFile = serde_json::from_str(json)?;
        let mut builder = Self::builder(file.model)
            .version(file.version)
            .manufacturers(file.manufacturers);
        if let Some(mode) = file.ack_mode {
            builder = builder.ack_mode(mode);
        }
        for dp in file.datapoints {
            let converter = registry.resolve(&dp.converter)?;
            builder = builder.entry(DeviceDpSchemaEntry {
                dp_id: dp.dp,
                field: dp.field,
                dp_type: dp.dp_type,
                converter,
                multiplicity: dp.multiplicity,
            });
        }
        builder.build()
    }

    pub fn lookup(&self, dp_id: u8) -> Option<&DeviceDpSchemaEntry> {
        self.entries.get(&dp_id)
    }

    pub fn lookup_field(&self, field: &str) -> Option<&DeviceDpSchemaEntry> {
        self.fields.get(field).and_then(|dp_id| self.entries.get(dp_id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &DeviceDpSchemaEntry> {
        self.entries.values()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn manufacturers(&self) -> &[String] {
        &self.manufacturers
    }

    /// Ack mode the model is known to use, if the schema declares one.
    pub fn ack_mode(&self) -> Option<AckMode> {
        self.ack_mode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder for [`DeviceDpSchema`]; validation happens in [`SchemaBuilder::build`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    model: String,
    version: u32,
    manufacturers: Vec<String>,
    ack_mode: Option<AckMode>,
    entries: Vec<DeviceDpSchemaEntry>,
}

impl SchemaBuilder {
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn manufacturer<S: Into<String>>(mut self, name: S) -> Self {
        self.manufacturers.push(name.into());
        self
    }

    pub fn manufacturers(mut self, names: Vec<String>) -> Self {
        self.manufacturers.extend(names);
        self
    }

    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = Some(mode);
        self
    }

    pub fn entry(mut self, entry: DeviceDpSchemaEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn build(self) -> Result<DeviceDpSchema, SchemaError> {
        let mut entries = BTreeMap::new();
        let mut fields = HashMap::new();
        for entry in self.entries {
            entry.validate()?;
            if entries.contains_key(&entry.dp_id) {
                return Err(SchemaError::DuplicateDp(entry.dp_id));
            }
            if fields.insert(entry.field.clone(), entry.dp_id).is_some() {
                return Err(SchemaError::DuplicateField(entry.field));
            }
            entries.insert(entry.dp_id, entry);
        }
        Ok(DeviceDpSchema {
            model: self.model,
            version: self.version,
            manufacturers: self.manufacturers,
            ack_mode: self.ack_mode,
            entries,
            fields,
        })
    }
}

#[derive(Deserialize)]
struct SchemaFile {
    model: String,
    #[serde(default = "first_version")]
    version: u32,
    #[serde(default)]
    manufacturers: Vec<String>,
    #[serde(default)]
    ack_mode: Option<AckMode>,
    datapoints: Vec<EntryFile>,
}

fn first_version() -> u32 {
    1
}

#[derive(Deserialize)]
struct EntryFile {
    dp: u8,
    field: String,
    #[serde(rename = "type")]
    dp_type: DpType,
    #[serde(default)]
    converter: ConverterRef,
    #[serde(default)]
    multiplicity: Multiplicity,
}
