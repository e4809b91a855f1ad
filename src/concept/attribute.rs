//! Attribute values, data types and attribute instances
//!
//! An attribute is unique per (type, value) within a transaction's view:
//! putting the same value twice returns the same concept. Duplicates written
//! by concurrent transactions are merged after commit by the deduplicator.

use super::events::ConceptEvent;
use super::manager::ConceptManager;
use super::schema::{attribute_index, edge_property, vertex_property, EdgeLabel, ImplicitType};
use super::{Concept, ConceptKind};
use crate::error::{ConceptError, ConceptResult, TransactionError};
use crate::graph::{Direction, PropertyValue};
use chrono::NaiveDateTime;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Data type of an attribute type's values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Long,
    Double,
    Boolean,
    Date,
}

impl DataType {
    pub const ALL: [DataType; 5] = [Self::String, Self::Long, Self::Double, Self::Boolean, Self::Date];

    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Long => "long",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Date => "date",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.name() == name)
    }

    /// Vertex property holding values of this type
    pub fn value_property(&self) -> &'static str {
        match self {
            Self::String => vertex_property::VALUE_STRING,
            Self::Long => vertex_property::VALUE_LONG,
            Self::Double => vertex_property::VALUE_DOUBLE,
            Self::Boolean => vertex_property::VALUE_BOOLEAN,
            Self::Date => vertex_property::VALUE_DATE,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(NaiveDateTime),
}

impl AttributeValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::String(_) => DataType::String,
            Self::Long(_) => DataType::Long,
            Self::Double(_) => DataType::Double,
            Self::Boolean(_) => DataType::Boolean,
            Self::Date(_) => DataType::Date,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn to_property(&self) -> PropertyValue {
        match self {
            Self::String(s) => PropertyValue::String(s.clone()),
            Self::Long(v) => PropertyValue::Long(*v),
            Self::Double(v) => PropertyValue::Double(*v),
            Self::Boolean(v) => PropertyValue::Boolean(*v),
            Self::Date(v) => PropertyValue::Date(*v),
        }
    }

    pub(crate) fn from_property(property: PropertyValue) -> Self {
        match property {
            PropertyValue::String(s) => Self::String(s),
            PropertyValue::Long(v) => Self::Long(v),
            PropertyValue::Double(v) => Self::Double(v),
            PropertyValue::Boolean(v) => Self::Boolean(v),
            PropertyValue::Date(v) => Self::Date(v),
        }
    }

    /// Parse a value given as text, e.g. from the command line
    pub fn parse(data_type: DataType, raw: &str) -> Option<Self> {
        match data_type {
            DataType::String => Some(Self::String(raw.to_string())),
            DataType::Long => raw.parse().ok().map(Self::Long),
            DataType::Double => raw.parse().ok().map(Self::Double),
            DataType::Boolean => raw.parse().ok().map(Self::Boolean),
            DataType::Date => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(Self::Date),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Long(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S%.3f")),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<NaiveDateTime> for AttributeValue {
    fn from(v: NaiveDateTime) -> Self {
        Self::Date(v)
    }
}

fn compile_regex(regex: &str) -> ConceptResult<Regex> {
    Regex::new(&format!("^(?:{})$", regex)).map_err(|e| {
        TransactionError::InvalidRegex {
            regex: regex.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn is_attribute_type(kind: ConceptKind) -> bool {
    kind == ConceptKind::AttributeType
}

fn is_attribute(kind: ConceptKind) -> bool {
    kind == ConceptKind::Attribute
}

impl ConceptManager {
    /// The attribute of `attribute_type` holding `value`, created if this
    /// transaction cannot see one yet
    pub fn put_attribute(&mut self, attribute_type: &Concept, value: impl Into<AttributeValue>) -> ConceptResult<Concept> {
        self.put_attribute_with(attribute_type, value.into(), false)
    }

    pub fn put_attribute_inferred(&mut self, attribute_type: &Concept, value: impl Into<AttributeValue>) -> ConceptResult<Concept> {
        self.put_attribute_with(attribute_type, value.into(), true)
    }

    fn put_attribute_with(&mut self, attribute_type: &Concept, value: AttributeValue, inferred: bool) -> ConceptResult<Concept> {
        self.check_writable()?;
        self.check_kind(attribute_type, is_attribute_type, "attribute type")?;
        let data_type = self.data_type(attribute_type)?;
        if data_type != Some(value.data_type()) {
            return Err(TransactionError::InvalidValue {
                value: value.to_string(),
                data_type: data_type.map_or("none", |d| d.name()).to_string(),
            }
            .into());
        }
        self.check_regex(attribute_type, &value)?;

        let label = self.label(attribute_type)?;
        let index = attribute_index(label.as_str(), &value);
        if let Some(existing) = self.find_attribute(&index)? {
            return Ok(existing);
        }

        let attribute = self.create_instance(attribute_type, inferred)?;
        let v = self.vertex_of(&attribute)?;
        self.set_vertex_prop(v, value.data_type().value_property(), value.to_property())?;
        self.set_vertex_prop(v, vertex_property::INDEX, index.as_str())?;
        self.emit(ConceptEvent::AttributeCreated {
            index: index.clone(),
            attribute: attribute.id(),
        });
        debug!(%index, attribute = %attribute.id(), "attribute.created");
        Ok(attribute)
    }

    /// Lowest-id attribute carrying the index, checking this transaction's writes first
    fn find_attribute(&mut self, index: &str) -> ConceptResult<Option<Concept>> {
        if let Some(id) = self.cache.attributes.get(index).copied() {
            match self.get_concept(id)? {
                Some(concept) => return Ok(Some(concept)),
                None => {
                    self.cache.attributes.remove(index);
                }
            }
        }
        let found = self
            .graph
            .vertex_by_property(vertex_property::INDEX, &PropertyValue::String(index.to_string()));
        let Some(v) = found else {
            return Ok(None);
        };
        let attribute = self.build_vertex(v)?;
        self.cache.attributes.insert(index.to_string(), attribute.id());
        Ok(Some(attribute))
    }

    pub fn get_attribute(&mut self, attribute_type: &Concept, value: impl Into<AttributeValue>) -> ConceptResult<Option<Concept>> {
        self.check_open()?;
        self.check_kind(attribute_type, is_attribute_type, "attribute type")?;
        let label = self.label(attribute_type)?;
        self.find_attribute(&attribute_index(label.as_str(), &value.into()))
    }

    /// Attributes of any type holding the value
    pub fn get_attributes_by_value(&mut self, value: impl Into<AttributeValue>) -> ConceptResult<Vec<Concept>> {
        self.check_open()?;
        let value = value.into();
        let vertices = self
            .graph
            .vertices_by_property(value.data_type().value_property(), &value.to_property());
        let mut attributes = Vec::new();
        for v in vertices {
            let concept = self.build_vertex(v)?;
            if concept.kind() == ConceptKind::Attribute {
                attributes.push(concept);
            }
        }
        Ok(attributes)
    }

    pub fn value(&mut self, attribute: &Concept) -> ConceptResult<AttributeValue> {
        self.check_kind(attribute, is_attribute, "attribute")?;
        let v = self.vertex_of(attribute)?;
        DataType::ALL
            .into_iter()
            .find_map(|d| self.vertex_prop(v, d.value_property()))
            .map(AttributeValue::from_property)
            .ok_or_else(|| ConceptError::UnknownConcept(format!("{} has no value", attribute.id())))
    }

    /// Uniqueness index of an attribute, written through if the vertex predates it
    pub(crate) fn index_of(&mut self, attribute: &Concept) -> ConceptResult<String> {
        let v = self.vertex_of(attribute)?;
        let value = self.value(attribute)?;
        let attribute_type = self.thing_type(attribute)?;
        let label = self.label(&attribute_type)?;
        let index = self.persistent_prop(v, vertex_property::INDEX, |_| {
            Ok(PropertyValue::String(attribute_index(label.as_str(), &value)))
        })?;
        index
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConceptError::UnknownConcept(format!("{} has a malformed index", attribute.id())))
    }

    pub fn data_type(&mut self, attribute_type: &Concept) -> ConceptResult<Option<DataType>> {
        self.check_kind(attribute_type, is_attribute_type, "attribute type")?;
        let v = self.vertex_of(attribute_type)?;
        self.schema_fact(attribute_type.id(), |f| &mut f.data_type, |m| {
            Ok(m.vertex_prop(v, vertex_property::DATA_TYPE)
                .and_then(|p| p.as_str().and_then(DataType::from_name)))
        })
    }

    pub fn regex(&mut self, attribute_type: &Concept) -> ConceptResult<Option<String>> {
        self.check_kind(attribute_type, is_attribute_type, "attribute type")?;
        let v = self.vertex_of(attribute_type)?;
        self.schema_fact(attribute_type.id(), |f| &mut f.regex, |m| {
            Ok(m.vertex_prop(v, vertex_property::REGEX)
                .and_then(|p| p.as_str().map(str::to_string)))
        })
    }

    /// Constrain string values of the type; `None` lifts the constraint.
    ///
    /// Existing instances must already match.
    pub fn set_regex(&mut self, attribute_type: &Concept, regex: Option<&str>) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(attribute_type, is_attribute_type, "attribute type")?;
        self.check_not_meta(attribute_type)?;
        let v = self.vertex_of(attribute_type)?;
        match regex {
            Some(regex) => {
                if self.data_type(attribute_type)? != Some(DataType::String) {
                    return Err(TransactionError::InvalidRegex {
                        regex: regex.to_string(),
                        reason: "regex requires a string data type".to_string(),
                    }
                    .into());
                }
                let compiled = compile_regex(regex)?;
                let label = self.label(attribute_type)?;
                for instance in self.instances(attribute_type)? {
                    let value = self.value(&instance)?;
                    if !value.as_str().is_some_and(|s| compiled.is_match(s)) {
                        return Err(TransactionError::RegexViolation {
                            attribute_type: label.to_string(),
                            regex: regex.to_string(),
                            value: value.to_string(),
                        }
                        .into());
                    }
                }
                self.set_vertex_prop(v, vertex_property::REGEX, regex)?;
            }
            None => self.clear_vertex_prop(v, vertex_property::REGEX)?,
        }
        self.set_fact(attribute_type.id(), |f| &mut f.regex, regex.map(str::to_string));
        Ok(())
    }

    /// A value must satisfy the regex of its type and of every super
    fn check_regex(&mut self, attribute_type: &Concept, value: &AttributeValue) -> ConceptResult<()> {
        let Some(text) = value.as_str() else {
            return Ok(());
        };
        for sup in self.sups(attribute_type)? {
            if sup.kind() != ConceptKind::AttributeType {
                continue;
            }
            if let Some(regex) = self.regex(&sup)? {
                if !compile_regex(&regex)?.is_match(text) {
                    return Err(TransactionError::RegexViolation {
                        attribute_type: self.label(&sup)?.to_string(),
                        regex,
                        value: text.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Things owning the attribute, through edge-form or reified has/key relations
    pub fn owners(&mut self, attribute: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(attribute, is_attribute, "attribute")?;
        let v = self.vertex_of(attribute)?;
        let mut owners = BTreeSet::new();
        for edge in self.edges(v, Direction::In, EdgeLabel::Attribute) {
            owners.insert(self.build_vertex(edge.source)?);
        }
        for casting in self.edges(v, Direction::In, EdgeLabel::RolePlayer) {
            let Some(role) = self.role_of_edge(&casting, edge_property::ROLE_LABEL_ID)? else {
                continue;
            };
            if !ImplicitType::is_value_role(self.label(&role)?.as_str()) {
                continue;
            }
            for other in self.edges(casting.source, Direction::Out, EdgeLabel::RolePlayer) {
                let Some(role) = self.role_of_edge(&other, edge_property::ROLE_LABEL_ID)? else {
                    continue;
                };
                if ImplicitType::is_owner_role(self.label(&role)?.as_str()) {
                    owners.insert(self.build_vertex(other.target)?);
                }
            }
        }
        Ok(owners.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn data_type_names_round_trip() {
        for data_type in DataType::ALL {
            assert_eq!(DataType::from_name(data_type.name()), Some(data_type));
        }
        assert_eq!(DataType::from_name("decimal"), None);
    }

    #[test]
    fn values_know_their_data_type() {
        assert_eq!(AttributeValue::from("x").data_type(), DataType::String);
        assert_eq!(AttributeValue::from(3i64).data_type(), DataType::Long);
        assert_eq!(AttributeValue::from(0.5).data_type(), DataType::Double);
        assert_eq!(AttributeValue::from(true).data_type(), DataType::Boolean);
    }

    #[test]
    fn parse_respects_data_type() {
        assert_eq!(AttributeValue::parse(DataType::Long, "42"), Some(AttributeValue::Long(42)));
        assert_eq!(AttributeValue::parse(DataType::Long, "forty"), None);
        let date = NaiveDate::from_ymd_opt(2020, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(
            AttributeValue::parse(DataType::Date, "2020-01-02T03:04:05"),
            Some(AttributeValue::Date(date))
        );
    }

    #[test]
    fn regex_must_match_whole_value() {
        let re = compile_regex("[a-z]+").unwrap();
        assert!(re.is_match("abc"));
        assert!(!re.is_match("abc1"));
        assert!(compile_regex("(").is_err());
    }
}
