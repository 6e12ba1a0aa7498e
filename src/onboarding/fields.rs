//! Field allow-lists per task, checked at the API boundary.
//!
//! The store itself is schema-agnostic; only the manager consults these.

use super::graph::TaskKey;
use super::model::TaskData;
use crate::error::ValidationError;

const BRAND_FIELDS: &[&str] = &[
    "logo",
    "cover_image",
    "primary_color",
    "secondary_color",
    "font_family",
    "tagline",
    "description",
];

const VENUE_FIELDS: &[&str] = &[
    "venue_name",
    "address",
    "timezone",
    "outlets",
    "rooms",
    "floor_plan",
    "opening_hours",
];

const POS_FIELDS: &[&str] = &[
    "provider",
    "location_id",
    "connection_status",
    "menu_export",
    "revenue_centers",
    "notes",
];

const DEVICE_FIELDS: &[&str] = &[
    "devices",
    "quantity",
    "shipping_address",
    "shipping_contact",
    "notes",
];

const LEGAL_FIELDS: &[&str] = &[
    "signer_name",
    "signer_title",
    "signer_email",
    "signature",
    "signed_at",
    "agreement_version",
    "agreement_document",
];

/// Fields a task accepts.
pub fn allowed_fields(key: TaskKey) -> &'static [&'static str] {
    match key {
        TaskKey::Brand => BRAND_FIELDS,
        TaskKey::Venue => VENUE_FIELDS,
        TaskKey::Pos => POS_FIELDS,
        TaskKey::Devices => DEVICE_FIELDS,
        TaskKey::Legal => LEGAL_FIELDS,
    }
}

/// Reject any field name the task does not accept.
pub fn validate_field(key: TaskKey, field: &str) -> Result<(), ValidationError> {
    if field.trim().is_empty() {
        return Err(ValidationError::EmptyFieldName);
    }
    if allowed_fields(key).contains(&field) {
        Ok(())
    } else {
        Err(ValidationError::UnknownField {
            task: key.to_string(),
            field: field.to_string(),
        })
    }
}

/// Validate every key of a merge map and every removal.
pub fn validate_update(
    key: TaskKey,
    merge: &TaskData,
    remove: &[String],
) -> Result<(), ValidationError> {
    merge
        .keys()
        .map(String::as_str)
        .chain(remove.iter().map(String::as_str))
        .try_for_each(|field| validate_field(key, field))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_listed_fields() {
        assert!(validate_field(TaskKey::Brand, "logo").is_ok());
        assert!(validate_field(TaskKey::Legal, "signer_name").is_ok());
    }

    #[test]
    fn rejects_fields_of_other_tasks() {
        let err = validate_field(TaskKey::Brand, "signer_name").unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownField {
                task: "brand".into(),
                field: "signer_name".into()
            }
        );
    }

    #[test]
    fn rejects_blank_names() {
        assert_eq!(
            validate_field(TaskKey::Venue, "  "),
            Err(ValidationError::EmptyFieldName)
        );
    }

    #[test]
    fn update_checks_merge_and_remove_keys() {
        let mut merge = TaskData::new();
        merge.insert("provider".into(), json!("toast"));
        assert!(validate_update(TaskKey::Pos, &merge, &["notes".into()]).is_ok());
        assert!(validate_update(TaskKey::Pos, &merge, &["logo".into()]).is_err());
    }

    #[test]
    fn every_task_has_fields() {
        for key in TaskKey::ALL {
            assert!(!allowed_fields(key).is_empty(), "{key} has no fields");
        }
    }
}
