//! Structural validation of incoming updates.
//!
//! A payload is valid when every required field for its category is present
//! as a key. Values are not inspected.

use chrono::{DateTime, Utc};

use updaterelay_shared::{Category, Payload, Result, UpdateRecord, UpdateRelayError};

/// Required payload fields for `category`.
pub fn required_fields(category: Category) -> &'static [&'static str] {
    match category {
        Category::Job => &["title", "company", "location", "description"],
        Category::Event => &["title", "date", "location", "description"],
        Category::Mentorship => &["mentor_name", "expertise", "availability"],
        Category::Resource => &["title", "type", "url"],
        Category::Profile => &["user_id", "name", "email"],
    }
}

/// Required fields absent from `payload`, in declaration order.
pub fn missing_fields(category: Category, payload: &Payload) -> Vec<&'static str> {
    required_fields(category)
        .iter()
        .copied()
        .filter(|field| !payload.contains_key(*field))
        .collect()
}

/// Whether `payload` carries every required field for `category`. Never fails.
pub fn validate(category: Category, payload: &Payload) -> bool {
    missing_fields(category, payload).is_empty()
}

/// Parse a category name; unknown names are a validation error.
pub fn parse_category(name: &str) -> Result<Category> {
    name.parse()
}

/// Full admission check: required fields plus the future-skew rule.
pub fn validate_record(record: &UpdateRecord, received_at: DateTime<Utc>) -> Result<()> {
    let missing = missing_fields(record.category(), record.payload());
    if !missing.is_empty() {
        return Err(UpdateRelayError::validation(format!(
            "{} update missing required fields: {}",
            record.category(),
            missing.join(", ")
        )));
    }
    record.check_timestamp(received_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn complete_job_is_valid() {
        let p = payload(json!({
            "title": "Engineer",
            "company": "Acme",
            "location": "Remote",
            "description": "Build things",
            "salary": "competitive",
        }));
        assert!(validate(Category::Job, &p));
    }

    #[test]
    fn missing_fields_reported_in_order() {
        let p = payload(json!({ "title": "Meetup", "location": "Berlin" }));
        assert!(!validate(Category::Event, &p));
        assert_eq!(missing_fields(Category::Event, &p), ["date", "description"]);
    }

    #[test]
    fn null_value_counts_as_present() {
        let p = payload(json!({ "title": "Guide", "type": null, "url": "https://x.dev" }));
        assert!(validate(Category::Resource, &p));
    }

    #[test]
    fn every_category_has_required_fields() {
        for category in Category::ALL {
            assert!(!required_fields(category).is_empty());
            assert!(!validate(category, &Payload::new()));
        }
    }

    #[test]
    fn unknown_category_rejected() {
        assert_eq!(parse_category("mentorship").unwrap(), Category::Mentorship);
        let err = parse_category("newsletter").unwrap_err();
        assert!(matches!(err, UpdateRelayError::Validation { .. }));
    }

    #[test]
    fn record_checks_fields_and_skew() {
        let now = Utc::now();
        let p = payload(json!({ "user_id": "u1", "name": "Asha", "email": "a@example.com" }));

        let ok = UpdateRecord::new(Category::Profile, p.clone(), "crm", "1")
            .with_timestamp(now + TimeDelta::seconds(299));
        assert!(validate_record(&ok, now).is_ok());

        let skewed = UpdateRecord::new(Category::Profile, p, "crm", "1")
            .with_timestamp(now + TimeDelta::seconds(301));
        assert!(validate_record(&skewed, now).is_err());

        let incomplete = UpdateRecord::new(Category::Profile, Payload::new(), "crm", "1");
        let err = validate_record(&incomplete, now).unwrap_err();
        assert!(err.to_string().contains("user_id, name, email"));
    }
}
