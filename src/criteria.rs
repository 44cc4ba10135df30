//! Matching criteria and query construction
//!
//! A [`MatchingCriteria`] narrows a monitoring session to specific device
//! identity; [`MatchingQuery`] is the class-scoped filter a registry backend
//! actually evaluates. Criteria values that are absent mean "match every
//! device of the class".

use std::collections::BTreeMap;

/// Registry class monitored by this crate
pub const USB_DEVICE_CLASS: &str = "usb-device";

/// Immutable identity filter supplied when starting a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingCriteria {
    /// USB vendor ID (exact match)
    pub vendor_id: u16,
    /// USB product ID (exact match)
    pub product_id: u16,
    /// Product name (exact match when present)
    pub product_name: Option<String>,
    /// Manufacturer name (exact match when present)
    pub manufacturer_name: Option<String>,
    /// Serial number (exact match when present)
    pub serial_number: Option<String>,
}

impl MatchingCriteria {
    /// Create criteria for a vendor/product pair, optionally narrowed
    /// further by product name, manufacturer name, and serial number.
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        product_name: Option<String>,
        manufacturer_name: Option<String>,
        serial_number: Option<String>,
    ) -> Self {
        Self {
            vendor_id,
            product_id,
            product_name,
            manufacturer_name,
            serial_number,
        }
    }
}

/// Filterable registry properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropertyKey {
    VendorId,
    ProductId,
    ProductName,
    ManufacturerName,
    SerialNumber,
}

/// Constraint value attached to a [`PropertyKey`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Number(u64),
    Text(String),
}

/// Property bag describing one registry entry
///
/// Backends populate this from whatever the platform exposes; queries are
/// evaluated against it with exact-match semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_name: Option<String>,
    pub manufacturer_name: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceProperties {
    fn value(&self, key: PropertyKey) -> Option<PropertyValue> {
        match key {
            PropertyKey::VendorId => Some(PropertyValue::Number(u64::from(self.vendor_id))),
            PropertyKey::ProductId => Some(PropertyValue::Number(u64::from(self.product_id))),
            PropertyKey::ProductName => self.product_name.clone().map(PropertyValue::Text),
            PropertyKey::ManufacturerName => {
                self.manufacturer_name.clone().map(PropertyValue::Text)
            }
            PropertyKey::SerialNumber => self.serial_number.clone().map(PropertyValue::Text),
        }
    }
}

/// Class-scoped matching query consumed by a registry backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingQuery {
    class: String,
    constraints: BTreeMap<PropertyKey, PropertyValue>,
}

impl MatchingQuery {
    /// Build a query matching every device of `class`.
    ///
    /// Returns `None` for an empty class name — there is no registry class
    /// to scope the query to.
    pub fn for_class(class: &str) -> Option<Self> {
        if class.is_empty() {
            return None;
        }
        Some(Self {
            class: class.to_owned(),
            constraints: BTreeMap::new(),
        })
    }

    /// Narrow the query by a criteria value: exact vendor/product ids plus
    /// an exact-match constraint for each optional string that is present.
    pub fn narrowed(mut self, criteria: &MatchingCriteria) -> Self {
        self.constraints.insert(
            PropertyKey::VendorId,
            PropertyValue::Number(u64::from(criteria.vendor_id)),
        );
        self.constraints.insert(
            PropertyKey::ProductId,
            PropertyValue::Number(u64::from(criteria.product_id)),
        );
        if let Some(name) = &criteria.product_name {
            self.constraints
                .insert(PropertyKey::ProductName, PropertyValue::Text(name.clone()));
        }
        if let Some(name) = &criteria.manufacturer_name {
            self.constraints.insert(
                PropertyKey::ManufacturerName,
                PropertyValue::Text(name.clone()),
            );
        }
        if let Some(serial) = &criteria.serial_number {
            self.constraints.insert(
                PropertyKey::SerialNumber,
                PropertyValue::Text(serial.clone()),
            );
        }
        self
    }

    /// Registry class this query is scoped to.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Look up one constraint, if the query carries it.
    pub fn constraint(&self, key: PropertyKey) -> Option<&PropertyValue> {
        self.constraints.get(&key)
    }

    /// Evaluate the query against one entry's properties.
    ///
    /// Every constraint must match exactly; a constrained property the
    /// entry does not expose is a mismatch.
    pub fn matches(&self, props: &DeviceProperties) -> bool {
        self.constraints
            .iter()
            .all(|(key, expected)| props.value(*key).as_ref() == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(vid: u16, pid: u16) -> DeviceProperties {
        DeviceProperties {
            vendor_id: vid,
            product_id: pid,
            ..Default::default()
        }
    }

    #[test]
    fn class_query_matches_everything() {
        let query = MatchingQuery::for_class(USB_DEVICE_CLASS).unwrap();
        assert!(query.matches(&props(0x05AC, 0x024F)));
        assert!(query.matches(&props(0x3151, 0x5030)));
    }

    #[test]
    fn empty_class_is_rejected() {
        assert!(MatchingQuery::for_class("").is_none());
    }

    #[test]
    fn narrowed_query_filters_vendor_product() {
        let criteria = MatchingCriteria::new(0x05AC, 0x024F, None, None, None);
        let query = MatchingQuery::for_class(USB_DEVICE_CLASS)
            .unwrap()
            .narrowed(&criteria);

        assert!(query.matches(&props(0x05AC, 0x024F)));
        assert!(!query.matches(&props(0x05AC, 0x0250)));
        assert!(!query.matches(&props(0x3151, 0x024F)));
    }

    #[test]
    fn string_constraints_require_exact_match() {
        let criteria = MatchingCriteria::new(
            0x05AC,
            0x024F,
            Some("Keyboard".into()),
            None,
            Some("SN-001".into()),
        );
        let query = MatchingQuery::for_class(USB_DEVICE_CLASS)
            .unwrap()
            .narrowed(&criteria);

        let mut entry = props(0x05AC, 0x024F);
        // Constrained properties missing from the entry do not match
        assert!(!query.matches(&entry));

        entry.product_name = Some("Keyboard".into());
        entry.serial_number = Some("SN-001".into());
        assert!(query.matches(&entry));

        entry.serial_number = Some("SN-002".into());
        assert!(!query.matches(&entry));
    }

    #[test]
    fn absent_criteria_strings_are_not_constrained() {
        let criteria = MatchingCriteria::new(0x05AC, 0x024F, None, None, None);
        let query = MatchingQuery::for_class(USB_DEVICE_CLASS)
            .unwrap()
            .narrowed(&criteria);
        assert!(query.constraint(PropertyKey::ProductName).is_none());

        let mut entry = props(0x05AC, 0x024F);
        entry.manufacturer_name = Some("Anyone".into());
        assert!(query.matches(&entry));
    }
}
