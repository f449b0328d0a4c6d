//! Model schema definition and validation.
//!
//! A schema maps a named entity to its storage location, primary key,
//! indexed and encrypted fields, and version. Records are validated against
//! it at the storage boundary.

use crate::{error::Result, predicate::Predicate, Error, Record, StoreName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Namespace used when a schema does not declare one.
pub const DEFAULT_NAMESPACE: &str = "user";

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required on insert
    #[serde(default)]
    pub required: bool,
    /// Primary key flag
    #[serde(default)]
    pub primary: bool,
    /// Whether the field should be indexed by the adapter
    #[serde(default)]
    pub index: bool,
    /// Whether the adapter should encrypt the field at rest
    #[serde(default)]
    pub encrypted: bool,
    /// Remote field name, if different from `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl FieldDef {
    fn with(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
            primary: false,
            index: false,
            encrypted: false,
            key: None,
        }
    }

    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::with(name, field_type, true)
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::with(name, field_type, false)
    }

    /// Create a primary key field.
    pub fn primary(name: impl Into<String>) -> Self {
        let mut def = Self::with(name, FieldType::String, false);
        def.primary = true;
        def
    }

    /// Mark the field as indexed.
    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    /// Mark the field as encrypted.
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Set the remote field name.
    pub fn remote_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Remote field name used when building remote operations.
    pub fn remote_name(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Validated, immutable schema of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    name: String,
    namespace: String,
    version: u32,
    primary_key: String,
    indexes: BTreeSet<String>,
    encrypted: BTreeSet<String>,
    fields: Vec<FieldDef>,
}

impl ModelSchema {
    /// Start building a schema for the named model.
    pub fn builder(name: impl Into<String>) -> ModelSchemaBuilder {
        ModelSchemaBuilder {
            name: name.into(),
            namespace: None,
            version: 0,
            primary_key: None,
            indexes: None,
            encrypted: None,
            fields: Vec::new(),
        }
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Store name: `{namespace}_{name}`.
    pub fn store_name(&self) -> StoreName {
        format!("{}_{}", self.namespace, self.name)
    }

    /// Model version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Primary key field name.
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Indexed field names.
    pub fn indexes(&self) -> &BTreeSet<String> {
        &self.indexes
    }

    /// Encrypted field names.
    pub fn encrypted_fields(&self) -> &BTreeSet<String> {
        &self.encrypted
    }

    /// All field definitions in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Look up a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a record against the schema.
    ///
    /// Unknown field names are rejected. With `partial` set, required
    /// fields may be absent (patch semantics).
    pub fn validate_record(&self, record: &Record, partial: bool) -> Result<()> {
        for key in record.keys() {
            if self.field(key).is_none() {
                return Err(Error::UnknownField {
                    store: self.store_name(),
                    field: key.clone(),
                });
            }
        }

        for field in &self.fields {
            match record.get(&field.name) {
                None if partial => {}
                value => field.validate(value)?,
            }
        }

        Ok(())
    }

    /// Keep only the fields declared by the schema.
    pub fn project(&self, record: &Record) -> Record {
        record
            .iter()
            .filter(|(key, _)| self.field(key).is_some())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Predicate matching the record with the same primary key.
    pub fn primary_key_predicate(&self, record: &Record) -> Result<Predicate> {
        let value = record
            .get(&self.primary_key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                Error::InvalidPredicate(format!(
                    "record has no value for primary key '{}'",
                    self.primary_key
                ))
            })?;
        Ok(Predicate::field(&self.primary_key).eq(value.clone()))
    }
}

/// Builder for [`ModelSchema`].
#[derive(Debug, Clone)]
pub struct ModelSchemaBuilder {
    name: String,
    namespace: Option<String>,
    version: u32,
    primary_key: Option<String>,
    indexes: Option<Vec<String>>,
    encrypted: Option<Vec<String>>,
    fields: Vec<FieldDef>,
}

impl ModelSchemaBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Explicit primary key; overrides the per-field `primary` flag.
    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = Some(field.into());
        self
    }

    /// Explicit index list; overrides the per-field `index` flags.
    pub fn indexes<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Explicit encrypted field list; overrides the per-field flags.
    pub fn encrypted<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.encrypted = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Validate and build the schema.
    pub fn build(self) -> Result<ModelSchema> {
        if self.name.is_empty() {
            return Err(Error::InvalidSchema("model name cannot be empty".into()));
        }
        if self.fields.is_empty() {
            return Err(Error::InvalidSchema(format!(
                "model {} declares no fields",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "field '{}' declared twice in {}",
                    field.name, self.name
                )));
            }
        }

        let has_field = |name: &str| self.fields.iter().any(|f| f.name == name);

        let primary_key = match self.primary_key {
            Some(pk) if has_field(&pk) => pk,
            Some(pk) => {
                return Err(Error::InvalidSchema(format!(
                    "primary key '{}' is not a field of {}",
                    pk, self.name
                )))
            }
            None => {
                let mut flagged = self.fields.iter().filter(|f| f.primary);
                match (flagged.next(), flagged.next()) {
                    (Some(field), None) => field.name.clone(),
                    (Some(_), Some(_)) => {
                        return Err(Error::InvalidSchema(format!(
                            "{} declares more than one primary key",
                            self.name
                        )))
                    }
                    (None, _) => {
                        return Err(Error::InvalidSchema(format!(
                            "no primary key provided for {}",
                            self.name
                        )))
                    }
                }
            }
        };

        let indexes = resolve_field_list(
            &self.name,
            "indexes",
            self.indexes,
            &self.fields,
            |f| f.index,
        )?;
        let encrypted = resolve_field_list(
            &self.name,
            "encrypted",
            self.encrypted,
            &self.fields,
            |f| f.encrypted,
        )?;

        let fields = self
            .fields
            .into_iter()
            .map(|mut f| {
                f.primary = f.name == primary_key;
                f
            })
            .collect();

        Ok(ModelSchema {
            name: self.name,
            namespace: self
                .namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            version: self.version,
            primary_key,
            indexes,
            encrypted,
            fields,
        })
    }
}

fn resolve_field_list(
    model: &str,
    list_name: &str,
    explicit: Option<Vec<String>>,
    fields: &[FieldDef],
    flagged: impl Fn(&FieldDef) -> bool,
) -> Result<BTreeSet<String>> {
    match explicit {
        Some(names) => {
            for name in &names {
                if !fields.iter().any(|f| &f.name == name) {
                    return Err(Error::InvalidSchema(format!(
                        "'{}' in the {} list is missing from the fields of {}",
                        name, list_name, model
                    )));
                }
            }
            Ok(names.into_iter().collect())
        }
        None => Ok(fields
            .iter()
            .filter(|f| flagged(f))
            .map(|f| f.name.clone())
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::into_record;
    use serde_json::json;

    fn note_schema() -> ModelSchema {
        ModelSchema::builder("Note")
            .version(1)
            .field(FieldDef::primary("id"))
            .field(FieldDef::required("title", FieldType::String).indexed())
            .field(FieldDef::optional("description", FieldType::String))
            .field(FieldDef::optional("version", FieldType::Int))
            .build()
            .unwrap()
    }

    #[test]
    fn store_name_uses_default_namespace() {
        let schema = note_schema();
        assert_eq!(schema.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(schema.store_name(), "user_Note");
        assert_eq!(schema.primary_key(), "id");
        assert!(schema.indexes().contains("title"));
        assert!(schema.encrypted_fields().is_empty());
    }

    #[test]
    fn explicit_primary_key_must_exist() {
        let result = ModelSchema::builder("Note")
            .field(FieldDef::optional("title", FieldType::String))
            .primary_key("id")
            .build();
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn primary_key_is_required() {
        let result = ModelSchema::builder("Note")
            .field(FieldDef::optional("title", FieldType::String))
            .build();
        assert!(matches!(result, Err(Error::InvalidSchema(msg)) if msg.contains("no primary key")));
    }

    #[test]
    fn two_primary_flags_rejected() {
        let result = ModelSchema::builder("Note")
            .field(FieldDef::primary("id"))
            .field(FieldDef::primary("uuid"))
            .build();
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn explicit_lists_override_flags() {
        let schema = ModelSchema::builder("Secret")
            .namespace("vault")
            .field(FieldDef::primary("id"))
            .field(FieldDef::optional("body", FieldType::String).encrypted())
            .field(FieldDef::optional("tag", FieldType::String).indexed())
            .indexes(["body"])
            .encrypted(Vec::<String>::new())
            .build()
            .unwrap();

        assert_eq!(schema.store_name(), "vault_Secret");
        assert!(schema.indexes().contains("body"));
        assert!(!schema.indexes().contains("tag"));
        assert!(schema.encrypted_fields().is_empty());
    }

    #[test]
    fn unknown_index_rejected() {
        let result = ModelSchema::builder("Note")
            .field(FieldDef::primary("id"))
            .indexes(["missing"])
            .build();
        assert!(matches!(result, Err(Error::InvalidSchema(msg)) if msg.contains("missing")));
    }

    #[test]
    fn validate_unknown_field() {
        let schema = note_schema();
        let record = into_record(json!({"id": "1", "title": "a", "color": "red"})).unwrap();
        let result = schema.validate_record(&record, false);
        assert!(matches!(result, Err(Error::UnknownField { field, .. }) if field == "color"));
    }

    #[test]
    fn validate_required_and_partial() {
        let schema = note_schema();
        let record = into_record(json!({"id": "1", "description": "x"})).unwrap();

        assert!(matches!(
            schema.validate_record(&record, false),
            Err(Error::MissingRequiredField(f)) if f == "title"
        ));
        assert!(schema.validate_record(&record, true).is_ok());
    }

    #[test]
    fn validate_wrong_type() {
        let schema = note_schema();
        let record = into_record(json!({"id": "1", "title": 5})).unwrap();
        let result = schema.validate_record(&record, false);
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "title"));
    }

    #[test]
    fn project_drops_undeclared_fields() {
        let schema = note_schema();
        let record =
            into_record(json!({"id": "1", "title": "a", "__typename": "Note", "_deleted": false}))
                .unwrap();
        let projected = schema.project(&record);
        assert_eq!(projected.len(), 2);
        assert!(projected.contains_key("title"));
    }

    #[test]
    fn primary_key_predicate_matches_record() {
        let schema = note_schema();
        let record = into_record(json!({"id": "1", "title": "a"})).unwrap();
        let predicate = schema.primary_key_predicate(&record).unwrap();
        assert!(predicate.evaluate(&record));

        let no_key = into_record(json!({"title": "a"})).unwrap();
        assert!(schema.primary_key_predicate(&no_key).is_err());
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Int.to_string(), "Int");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn remote_name_defaults_to_field_name() {
        let plain = FieldDef::optional("title", FieldType::String);
        let renamed = FieldDef::optional("title", FieldType::String).remote_key("noteTitle");
        assert_eq!(plain.remote_name(), "title");
        assert_eq!(renamed.remote_name(), "noteTitle");
    }
}
