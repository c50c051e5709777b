// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Value providers: the pluggable sources a hosted name resolves against.
//!
//! Three sources are consulted in priority order:
//! 1. registered **objects** — a [`RecordProvider`] exported under a name
//!    prefix, its fields addressable as `PREFIX.field`
//! 2. registered **properties** — a single name bound to get/set closures
//! 3. the in-memory PV table (names created by `Server::put`)
//!
//! A name that resolves to a record container (not a value) yields
//! [`Lookup::Record`]; on the wire that surfaces as the synthetic string
//! `"<record: field1, field2, …>"`, which is how clients discover the
//! field list of an exported object.

use crate::protocol::PvValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Result of resolving a name against a provider.
pub enum Lookup {
    /// The name is a readable value.
    Value(PvValue),
    /// The name is a record container with the given field names.
    Record(Vec<String>),
}

impl Lookup {
    /// The wire-visible value: records become their synthetic marker
    /// string.
    pub fn into_value(self) -> PvValue {
        match self {
            Lookup::Value(value) => value,
            Lookup::Record(fields) => {
                PvValue::Str(format!("<record: {}>", fields.join(", ")))
            }
        }
    }
}

/// An object exported under a name prefix.
///
/// `read("")` resolves the bare prefix and conventionally returns
/// `Lookup::Record(self.fields())`.
pub trait RecordProvider: Send + Sync {
    /// Field names, reported to clients browsing the record.
    fn fields(&self) -> Vec<String>;
    /// Resolve one field (or the bare prefix with an empty field name).
    fn read(&self, field: &str) -> Option<Lookup>;
    /// Store one field. An `Err` is reported to the writing client as a
    /// failed WRITE_NOTIFY.
    fn write(&self, field: &str, value: PvValue) -> std::result::Result<(), String>;
}

/// A single name bound to get/set closures.
pub struct PvProperty {
    get: Box<dyn Fn() -> PvValue + Send + Sync>,
    set: Option<Box<dyn Fn(PvValue) -> std::result::Result<(), String> + Send + Sync>>,
}

impl PvProperty {
    /// Read-only property.
    pub fn readonly(get: impl Fn() -> PvValue + Send + Sync + 'static) -> Self {
        Self {
            get: Box::new(get),
            set: None,
        }
    }

    /// Readable and writable property.
    pub fn read_write(
        get: impl Fn() -> PvValue + Send + Sync + 'static,
        set: impl Fn(PvValue) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            get: Box::new(get),
            set: Some(Box::new(set)),
        }
    }

    pub fn read(&self) -> PvValue {
        (self.get)()
    }

    pub fn write(&self, value: PvValue) -> std::result::Result<(), String> {
        match &self.set {
            Some(set) => set(value),
            None => Err("property is read-only".to_string()),
        }
    }
}

/// Priority-ordered provider registry.
#[derive(Default)]
pub struct ProviderRegistry {
    /// `(prefix, provider)` in registration order.
    objects: Vec<(String, Arc<dyn RecordProvider>)>,
    properties: HashMap<String, PvProperty>,
}

impl ProviderRegistry {
    /// Export `provider` under `prefix`, replacing any previous
    /// registration of the same prefix.
    pub fn register_object(&mut self, prefix: &str, provider: Arc<dyn RecordProvider>) {
        self.unregister_object(prefix);
        self.objects.push((prefix.to_string(), provider));
    }

    pub fn unregister_object(&mut self, prefix: &str) {
        self.objects.retain(|(p, _)| p != prefix);
    }

    pub fn register_property(&mut self, name: &str, property: PvProperty) {
        self.properties.insert(name.to_string(), property);
    }

    pub fn unregister_property(&mut self, name: &str) {
        self.properties.remove(name);
    }

    /// Resolve a name: objects first, then properties. `None` when no
    /// provider claims the name (the PV table is the caller's fallback).
    pub fn read(&self, name: &str) -> Option<Lookup> {
        for (prefix, provider) in &self.objects {
            if let Some(field) = field_of(name, prefix) {
                if let Some(lookup) = provider.read(field) {
                    return Some(lookup);
                }
            }
        }
        self.properties.get(name).map(|p| Lookup::Value(p.read()))
    }

    /// Route a write to the claiming provider. Outer `None` when no
    /// provider claims the name.
    pub fn write(
        &self,
        name: &str,
        value: &PvValue,
    ) -> Option<std::result::Result<(), String>> {
        for (prefix, provider) in &self.objects {
            if let Some(field) = field_of(name, prefix) {
                return Some(provider.write(field, value.clone()));
            }
        }
        self.properties
            .get(name)
            .map(|p| p.write(value.clone()))
    }

    /// Names this registry would answer a prefix-delete for.
    pub fn property_names(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }
}

/// The field part of `name` under `prefix`: `"P:REC.T"` under `"P:REC"`
/// is `"T"`, the bare prefix is `""`. `None` when the prefix does not
/// match.
fn field_of<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = name.strip_prefix(prefix)?;
    Some(rest.strip_prefix('.').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Thermostat {
        setpoint: Mutex<f64>,
    }

    impl RecordProvider for Thermostat {
        fn fields(&self) -> Vec<String> {
            vec!["setpoint".to_string(), "actual".to_string()]
        }

        fn read(&self, field: &str) -> Option<Lookup> {
            match field {
                "" => Some(Lookup::Record(self.fields())),
                "setpoint" => Some(Lookup::Value(PvValue::Double(*self.setpoint.lock()))),
                "actual" => Some(Lookup::Value(PvValue::Double(21.5))),
                _ => None,
            }
        }

        fn write(&self, field: &str, value: PvValue) -> std::result::Result<(), String> {
            match field {
                "setpoint" => {
                    *self.setpoint.lock() = value.numeric_elements()[0];
                    Ok(())
                }
                "actual" => Err("sensor is read-only".to_string()),
                other => Err(format!("no such field: {}", other)),
            }
        }
    }

    fn registry() -> ProviderRegistry {
        let mut registry = ProviderRegistry::default();
        registry.register_object(
            "LAB:TC",
            Arc::new(Thermostat {
                setpoint: Mutex::new(20.0),
            }),
        );
        registry.register_property(
            "LAB:VERSION",
            PvProperty::readonly(|| PvValue::Str("1.0".into())),
        );
        registry
    }

    #[test]
    fn test_field_of() {
        assert_eq!(field_of("LAB:TC.T", "LAB:TC"), Some("T"));
        assert_eq!(field_of("LAB:TC", "LAB:TC"), Some(""));
        assert_eq!(field_of("LAB:TCX", "LAB:TC"), Some("X"));
        assert_eq!(field_of("OTHER", "LAB:TC"), None);
    }

    #[test]
    fn test_record_marker() {
        let registry = registry();
        let looked_up = registry.read("LAB:TC").expect("bare prefix resolves");
        assert_eq!(
            looked_up.into_value(),
            PvValue::Str("<record: setpoint, actual>".into())
        );
    }

    #[test]
    fn test_object_field_read_write() {
        let registry = registry();
        let value = registry.read("LAB:TC.setpoint").expect("field resolves");
        assert_eq!(value.into_value(), PvValue::Double(20.0));

        registry
            .write("LAB:TC.setpoint", &PvValue::Double(22.0))
            .expect("object claims the name")
            .expect("setter accepts");
        let value = registry.read("LAB:TC.setpoint").expect("field resolves");
        assert_eq!(value.into_value(), PvValue::Double(22.0));
    }

    #[test]
    fn test_rejected_write_surfaces_reason() {
        let registry = registry();
        let result = registry
            .write("LAB:TC.actual", &PvValue::Double(0.0))
            .expect("object claims the name");
        assert_eq!(result.unwrap_err(), "sensor is read-only");
    }

    #[test]
    fn test_property_lookup_and_readonly_write() {
        let registry = registry();
        let value = registry.read("LAB:VERSION").expect("property resolves");
        assert_eq!(value.into_value(), PvValue::Str("1.0".into()));

        let result = registry
            .write("LAB:VERSION", &PvValue::Str("2.0".into()))
            .expect("property claims the name");
        assert!(result.is_err());
    }

    #[test]
    fn test_unclaimed_name() {
        let registry = registry();
        assert!(registry.read("NOT:REGISTERED").is_none());
        assert!(registry.write("NOT:REGISTERED", &PvValue::Long(1)).is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut registry = registry();
        registry.register_object(
            "LAB:TC",
            Arc::new(Thermostat {
                setpoint: Mutex::new(5.0),
            }),
        );
        let value = registry.read("LAB:TC.setpoint").expect("field resolves");
        assert_eq!(value.into_value(), PvValue::Double(5.0));
        // Still exactly one object registered for the prefix.
        assert_eq!(registry.objects.len(), 1);
    }
}
